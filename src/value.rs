use std::fmt;

use crate::error::LoadError;

/// An operand type on the validator's abstract stack.
///
/// `Any` never appears in a signature. It marks the operand stack as
/// unreachable: once `Any` is on top, type checks succeed vacuously until
/// the enclosing label is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    I32,
    I64,
    F32,
    F64,
    Any,
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueType::I32 => "i32",
            ValueType::I64 => "i64",
            ValueType::F32 => "f32",
            ValueType::F64 => "f64",
            ValueType::Any => "any",
        };
        f.write_str(name)
    }
}

/// Convert a decoded value type, rejecting anything outside the MVP set.
pub(crate) fn value_type(ty: wasmparser::ValType) -> Result<ValueType, LoadError> {
    match ty {
        wasmparser::ValType::I32 => Ok(ValueType::I32),
        wasmparser::ValType::I64 => Ok(ValueType::I64),
        wasmparser::ValType::F32 => Ok(ValueType::F32),
        wasmparser::ValType::F64 => Ok(ValueType::F64),
        _ => Err(LoadError::invalid(format!("unsupported value type {ty:?}"))),
    }
}

/// A runtime value, as stored in globals and produced by initializer
/// expressions.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
}

impl Value {
    pub fn ty(&self) -> ValueType {
        match self {
            Value::I32(_) => ValueType::I32,
            Value::I64(_) => ValueType::I64,
            Value::F32(_) => ValueType::F32,
            Value::F64(_) => ValueType::F64,
        }
    }

    /// The zero value of `ty`. Used for globals before their initializer
    /// runs and by host delegates that only care about the type.
    pub fn zero(ty: ValueType) -> Value {
        match ty {
            ValueType::I32 => Value::I32(0),
            ValueType::I64 => Value::I64(0),
            ValueType::F32 => Value::F32(0.0),
            ValueType::F64 => Value::F64(0.0),
            ValueType::Any => unreachable!("no zero value for the unreachable marker"),
        }
    }
}
