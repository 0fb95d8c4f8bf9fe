//! Single-pass streaming validator and lowerer for WebAssembly binaries.
//!
//! [`read_binary_interpreter`] consumes a binary module and, while
//! consuming it, type-checks every instruction, links the module's
//! imports against a shared [`Environment`], and emits a flat,
//! position-independent instruction stream that a stack-based VM can
//! execute directly. On failure the environment is rolled back, so a bad
//! module is never partially committed.

mod env;
mod error;
mod istream;
mod loader;
mod opcode;
mod value;

pub use env::{
    DefinedFunc, DefinedModule, Environment, EnvironmentMark, Export, ExternalKind, Func, Global,
    HostCallback, HostFunc, HostImportDelegate, HostModule, Import, Limits, Memory, Module,
    ModuleIndex, ModuleKind, Signature, Table, PAGE_SIZE,
};
pub use error::LoadError;
pub use istream::{Istream, BR_TABLE_ENTRY_SIZE, INVALID_INDEX, INVALID_OFFSET};
pub use loader::read_binary_interpreter;
pub use opcode::Opcode;
pub use value::{Value, ValueType};
