use wasmparser::BinaryReaderError;

/// Errors raised while loading a module.
///
/// Decode errors come from the binary reader and carry the byte offset of
/// the malformed input. Validation errors are raised while type-checking
/// and lowering code; they have no meaningful byte offset.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LoadError {
    #[error("{message} (at offset {offset})")]
    Decode { offset: usize, message: String },
    #[error("{0}")]
    Invalid(String),
}

impl LoadError {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        LoadError::Invalid(message.into())
    }

    /// The input byte offset of a decode error, if there is one.
    pub fn offset(&self) -> Option<usize> {
        match self {
            LoadError::Decode { offset, .. } => Some(*offset),
            LoadError::Invalid(_) => None,
        }
    }
}

impl From<BinaryReaderError> for LoadError {
    fn from(err: BinaryReaderError) -> Self {
        LoadError::Decode {
            offset: err.offset(),
            message: err.message().to_string(),
        }
    }
}
