//! The shared environment: ordered tables of signatures, functions,
//! globals, memories, tables and modules, plus the istream they execute
//! from. Modules loaded into the same environment can link against each
//! other's exports; host modules resolve imports through a delegate.

use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use crate::istream::Istream;
use crate::value::{Value, ValueType};

/// Size of one linear-memory page in bytes.
pub const PAGE_SIZE: u32 = 65536;

/// Index of a module within its environment.
pub type ModuleIndex = usize;

/// A host function bound by an import delegate. Receives the arguments
/// in declaration order and returns the results.
pub type HostCallback = Rc<dyn Fn(&[Value]) -> Result<Vec<Value>, String>>;

/// A function signature. Result count is at most one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Signature {
    pub params: Vec<ValueType>,
    pub results: Vec<ValueType>,
}

/// Resource limits for a table or memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub initial: u64,
    pub max: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExternalKind {
    Func,
    Table,
    Memory,
    Global,
}

impl fmt::Display for ExternalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExternalKind::Func => "func",
            ExternalKind::Table => "table",
            ExternalKind::Memory => "memory",
            ExternalKind::Global => "global",
        };
        f.write_str(name)
    }
}

/// A declared import, as recorded on the importing module.
#[derive(Debug, Clone)]
pub struct Import {
    pub module_name: String,
    pub field_name: String,
    pub kind: ExternalKind,
}

/// A named export. `index` is an environment index (funcs, globals) or
/// the module's single table/memory environment index.
#[derive(Debug, Clone)]
pub struct Export {
    pub name: String,
    pub kind: ExternalKind,
    pub index: u32,
}

/// A function known to the environment: either bound host code or a
/// defined function lowered into the istream.
pub enum Func {
    Host(HostFunc),
    Defined(DefinedFunc),
}

pub struct HostFunc {
    pub module_name: String,
    pub field_name: String,
    pub sig_index: u32,
    pub callback: HostCallback,
}

#[derive(Debug, Clone)]
pub struct DefinedFunc {
    pub sig_index: u32,
    /// Istream offset of the function body; `INVALID_OFFSET` until the
    /// body has been lowered.
    pub offset: u32,
    pub local_decl_count: u32,
    pub local_count: u32,
    /// Parameter types followed by local types, in declaration order.
    pub param_and_local_types: Vec<ValueType>,
}

impl Func {
    pub fn sig_index(&self) -> u32 {
        match self {
            Func::Host(f) => f.sig_index,
            Func::Defined(f) => f.sig_index,
        }
    }

    pub fn is_host(&self) -> bool {
        matches!(self, Func::Host(_))
    }
}

impl fmt::Debug for Func {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Func::Host(host) => f
                .debug_struct("HostFunc")
                .field("module_name", &host.module_name)
                .field("field_name", &host.field_name)
                .field("sig_index", &host.sig_index)
                .finish_non_exhaustive(),
            Func::Defined(defined) => fmt::Debug::fmt(defined, f),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Global {
    pub value: Value,
    pub mutable: bool,
}

#[derive(Debug)]
pub struct Memory {
    pub page_limits: Limits,
    pub data: Vec<u8>,
}

#[derive(Debug)]
pub struct Table {
    pub limits: Limits,
    /// Environment function indices; unassigned slots hold
    /// [`INVALID_INDEX`](crate::istream::INVALID_INDEX).
    pub func_indexes: Vec<u32>,
}

/// Resolver for imports from a host module. Each method must fully
/// populate its target entry before returning success; errors abort the
/// load with the returned message.
pub trait HostImportDelegate {
    fn import_func(&mut self, import: &Import, sig: &Signature) -> Result<HostCallback, String>;
    fn import_table(&mut self, import: &Import, table: &mut Table) -> Result<(), String>;
    fn import_memory(&mut self, import: &Import, memory: &mut Memory) -> Result<(), String>;
    fn import_global(&mut self, import: &Import, global: &mut Global) -> Result<(), String>;
}

pub struct HostModule {
    pub(crate) delegate: Box<dyn HostImportDelegate>,
}

impl fmt::Debug for HostModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostModule").finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Default)]
pub struct DefinedModule {
    pub imports: Vec<Import>,
    /// Environment index of the start function, if any.
    pub start_func_index: Option<u32>,
    pub istream_start: u32,
    pub istream_end: u32,
}

#[derive(Debug)]
pub enum ModuleKind {
    Defined(DefinedModule),
    Host(HostModule),
}

#[derive(Debug)]
pub struct Module {
    /// Environment index of the module's single table, if it has one.
    pub table_index: Option<u32>,
    /// Environment index of the module's single memory, if it has one.
    pub memory_index: Option<u32>,
    pub exports: Vec<Export>,
    pub(crate) export_bindings: HashMap<String, usize>,
    pub kind: ModuleKind,
}

impl Module {
    pub(crate) fn defined(istream_start: u32) -> Module {
        Module {
            table_index: None,
            memory_index: None,
            exports: Vec::new(),
            export_bindings: HashMap::new(),
            kind: ModuleKind::Defined(DefinedModule {
                istream_start,
                istream_end: istream_start,
                ..DefinedModule::default()
            }),
        }
    }

    pub fn is_host(&self) -> bool {
        matches!(self.kind, ModuleKind::Host(_))
    }

    /// Look up an export by name.
    pub fn export(&self, name: &str) -> Option<&Export> {
        self.export_bindings.get(name).map(|&i| &self.exports[i])
    }

    pub fn as_defined(&self) -> Option<&DefinedModule> {
        match &self.kind {
            ModuleKind::Defined(defined) => Some(defined),
            ModuleKind::Host(_) => None,
        }
    }
}

/// Snapshot of the environment's table sizes, taken before a load so a
/// failed parse can be rolled back without observable effect.
#[derive(Debug, Clone, Copy)]
pub struct EnvironmentMark {
    sigs: usize,
    funcs: usize,
    globals: usize,
    memories: usize,
    tables: usize,
    modules: usize,
    istream: usize,
}

#[derive(Debug, Default)]
pub struct Environment {
    pub sigs: Vec<Signature>,
    pub funcs: Vec<Func>,
    pub globals: Vec<Global>,
    pub memories: Vec<Memory>,
    pub tables: Vec<Table>,
    pub modules: Vec<Module>,
    pub istream: Istream,
    registered_modules: HashMap<String, ModuleIndex>,
}

impl Environment {
    pub fn new() -> Environment {
        Environment::default()
    }

    /// Bind `name` so later modules can import from `index`'s exports.
    pub fn register_module(&mut self, name: &str, index: ModuleIndex) {
        self.registered_modules.insert(name.to_string(), index);
    }

    pub fn registered_module(&self, name: &str) -> Option<ModuleIndex> {
        self.registered_modules.get(name).copied()
    }

    /// Append a host module resolved through `delegate` and register it
    /// under `name`.
    pub fn append_host_module(
        &mut self,
        name: &str,
        delegate: Box<dyn HostImportDelegate>,
    ) -> ModuleIndex {
        let index = self.modules.len();
        self.modules.push(Module {
            table_index: None,
            memory_index: None,
            exports: Vec::new(),
            export_bindings: HashMap::new(),
            kind: ModuleKind::Host(HostModule { delegate }),
        });
        self.register_module(name, index);
        index
    }

    pub fn mark(&self) -> EnvironmentMark {
        EnvironmentMark {
            sigs: self.sigs.len(),
            funcs: self.funcs.len(),
            globals: self.globals.len(),
            memories: self.memories.len(),
            tables: self.tables.len(),
            modules: self.modules.len(),
            istream: self.istream.as_slice().len(),
        }
    }

    /// Discard everything appended since `mark` was taken.
    pub fn reset_to_mark(&mut self, mark: EnvironmentMark) {
        self.sigs.truncate(mark.sigs);
        self.funcs.truncate(mark.funcs);
        self.globals.truncate(mark.globals);
        self.memories.truncate(mark.memories);
        self.tables.truncate(mark.tables);
        self.modules.truncate(mark.modules);
        self.istream.truncate(mark.istream);
    }

    /// Deep structural signature equality, used for `call_indirect`.
    pub fn sigs_equal(&self, a: u32, b: u32) -> bool {
        a == b || self.sigs[a as usize] == self.sigs[b as usize]
    }
}
