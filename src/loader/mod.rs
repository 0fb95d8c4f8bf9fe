//! Module loading: walks the binary's sections in order, installs them
//! into the environment, and lowers every function body into the istream
//! while type-checking it.
//!
//! The binary is read twice. The first pass installs declarations,
//! validates element/data segments and lowers all code; the second pass
//! re-reads only the segments and applies them. A late error can
//! therefore never leave a table or memory partially written.

mod code;
mod init_expr;
mod link;
#[cfg(test)]
mod tests;

use wasmparser::{
    Data, DataKind, Element, ElementItems, ElementKind, FunctionBody, Parser, Payload, RefType,
    TableInit,
};

use crate::env::{
    DefinedFunc, DefinedModule, Environment, Export, ExternalKind, Func, Global, Limits, Memory,
    Module, ModuleIndex, ModuleKind, Signature, Table, PAGE_SIZE,
};
use crate::error::LoadError;
use crate::istream::{INVALID_INDEX, INVALID_OFFSET};
use crate::value::{value_type, Value, ValueType};

use code::Label;

/// Read a binary module into `env`: validate it, link its imports, and
/// lower its code into the environment's istream.
///
/// On success the new module's index is returned and its code occupies
/// `[istream_start, istream_end)` of the environment istream. On failure
/// every environment append is rolled back and `env` is observably
/// unchanged.
pub fn read_binary_interpreter(
    env: &mut Environment,
    bytes: &[u8],
) -> Result<ModuleIndex, LoadError> {
    let mark = env.mark();
    let module_index = env.modules.len();
    env.modules.push(Module::defined(env.istream.len()));

    let result = Context::new(env, module_index).run(bytes);
    match result {
        Ok(()) => {
            let istream_end = env.istream.len();
            if let ModuleKind::Defined(defined) = &mut env.modules[module_index].kind {
                defined.istream_end = istream_end;
            }
            Ok(module_index)
        }
        Err(err) => {
            env.reset_to_mark(mark);
            Err(err)
        }
    }
}

/// Map from module-local indices (imports followed by definitions) to
/// environment indices.
#[derive(Debug, Default)]
struct IndexMap(Vec<u32>);

impl IndexMap {
    fn push(&mut self, env_index: u32) {
        self.0.push(env_index);
    }

    fn len(&self) -> u32 {
        self.0.len() as u32
    }

    fn get(&self, module_index: u32) -> Option<u32> {
        self.0.get(module_index as usize).copied()
    }
}

/// Per-load state: the lowering cursor and the type checker. Constructed
/// for one `read_binary_interpreter` call and dropped when it returns.
struct Context<'env> {
    env: &'env mut Environment,
    module_index: ModuleIndex,

    sig_map: IndexMap,
    func_map: IndexMap,
    global_map: IndexMap,
    num_func_imports: u32,
    num_global_imports: u32,

    /// Pending direct-call slots, keyed by defined-function index,
    /// patched when that function's body begins.
    func_fixups: Vec<Vec<u32>>,
    /// Number of code entries seen so far.
    code_index: u32,

    /// Environment index of the function whose body is being lowered.
    current_func: Option<u32>,
    /// Parameter and local types of the current function.
    locals: Vec<ValueType>,
    type_stack: Vec<ValueType>,
    label_stack: Vec<Label>,
    /// Pending forward-branch slots, keyed by absolute label index,
    /// patched when that label's `end` is reached.
    depth_fixups: Vec<Vec<u32>>,
}

impl<'env> Context<'env> {
    fn new(env: &'env mut Environment, module_index: ModuleIndex) -> Context<'env> {
        Context {
            env,
            module_index,
            sig_map: IndexMap::default(),
            func_map: IndexMap::default(),
            global_map: IndexMap::default(),
            num_func_imports: 0,
            num_global_imports: 0,
            func_fixups: Vec::new(),
            code_index: 0,
            current_func: None,
            locals: Vec::new(),
            type_stack: Vec::new(),
            label_stack: Vec::new(),
            depth_fixups: Vec::new(),
        }
    }

    fn run(&mut self, bytes: &[u8]) -> Result<(), LoadError> {
        self.run_code_pass(bytes)?;
        self.run_segment_pass(bytes)
    }

    /// First pass: declarations, imports, exports, code. Element and
    /// data segments are validated but not applied.
    fn run_code_pass(&mut self, bytes: &[u8]) -> Result<(), LoadError> {
        for payload in Parser::new(0).parse_all(bytes) {
            match payload? {
                Payload::TypeSection(reader) => self.on_signatures(reader)?,
                Payload::ImportSection(reader) => {
                    for import in reader {
                        self.link_import(import?)?;
                    }
                }
                Payload::FunctionSection(reader) => self.on_function_signatures(reader)?,
                Payload::TableSection(reader) => {
                    for table in reader {
                        self.on_table(table?)?;
                    }
                }
                Payload::MemorySection(reader) => {
                    for memory in reader {
                        self.on_memory(memory?)?;
                    }
                }
                Payload::GlobalSection(reader) => self.on_globals(reader)?,
                Payload::ExportSection(reader) => {
                    for export in reader {
                        self.on_export(export?)?;
                    }
                }
                Payload::StartSection { func, .. } => self.on_start_function(func)?,
                Payload::ElementSection(reader) => {
                    for elem in reader {
                        self.validate_elem_segment(elem?)?;
                    }
                }
                Payload::CodeSectionEntry(body) => self.on_code_entry(body)?,
                Payload::DataSection(reader) => {
                    for data in reader {
                        self.validate_data_segment(data?)?;
                    }
                }
                _ => {}
            }
        }
        if (self.code_index as usize) != self.func_fixups.len() {
            return Err(LoadError::invalid(
                "function signature count and function body count mismatch",
            ));
        }
        debug_assert!(self.func_fixups.iter().all(Vec::is_empty));
        Ok(())
    }

    /// Second pass: apply the already-validated element and data
    /// segments. Runs only after the whole first pass succeeded.
    fn run_segment_pass(&mut self, bytes: &[u8]) -> Result<(), LoadError> {
        for payload in Parser::new(0).parse_all(bytes) {
            match payload? {
                Payload::ElementSection(reader) => {
                    for elem in reader {
                        self.apply_elem_segment(elem?)?;
                    }
                }
                Payload::DataSection(reader) => {
                    for data in reader {
                        self.apply_data_segment(data?)?;
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // Module and index-space accessors
    // -----------------------------------------------------------------

    fn module(&self) -> &Module {
        &self.env.modules[self.module_index]
    }

    fn module_mut(&mut self) -> &mut Module {
        &mut self.env.modules[self.module_index]
    }

    fn defined_module_mut(&mut self) -> &mut DefinedModule {
        match &mut self.module_mut().kind {
            ModuleKind::Defined(defined) => defined,
            ModuleKind::Host(_) => unreachable!("the module being loaded is always defined"),
        }
    }

    fn translate_sig_index(&self, index: u32) -> Result<u32, LoadError> {
        self.sig_map.get(index).ok_or_else(|| {
            LoadError::invalid(format!(
                "invalid signature index: {index} (max {})",
                self.sig_map.len()
            ))
        })
    }

    fn translate_func_index(&self, index: u32) -> Result<u32, LoadError> {
        self.func_map.get(index).ok_or_else(|| {
            LoadError::invalid(format!(
                "invalid func_index: {index} (max {})",
                self.func_map.len()
            ))
        })
    }

    fn translate_global_index(&self, index: u32) -> Result<u32, LoadError> {
        self.global_map.get(index).ok_or_else(|| {
            LoadError::invalid(format!(
                "invalid global_index: {index} (max {})",
                self.global_map.len()
            ))
        })
    }

    // -----------------------------------------------------------------
    // Section handlers
    // -----------------------------------------------------------------

    fn on_signatures(&mut self, reader: wasmparser::TypeSectionReader) -> Result<(), LoadError> {
        let count = reader.count();
        let first = self.env.sigs.len() as u32;
        for i in 0..count {
            self.sig_map.push(first + i);
        }
        self.env
            .sigs
            .extend((0..count).map(|_| Signature::default()));

        for (i, ty) in reader.into_iter_err_on_gc_types().enumerate() {
            let ty = ty?;
            let params = ty
                .params()
                .iter()
                .map(|&t| value_type(t))
                .collect::<Result<Vec<_>, _>>()?;
            let results = ty
                .results()
                .iter()
                .map(|&t| value_type(t))
                .collect::<Result<Vec<_>, _>>()?;
            if results.len() > 1 {
                return Err(LoadError::invalid(
                    "multiple result values not supported",
                ));
            }
            self.env.sigs[(first as usize) + i] = Signature { params, results };
        }
        Ok(())
    }

    fn on_function_signatures(
        &mut self,
        reader: wasmparser::FunctionSectionReader,
    ) -> Result<(), LoadError> {
        let count = reader.count();
        let first = self.env.funcs.len() as u32;
        for i in 0..count {
            self.func_map.push(first + i);
        }
        self.env.funcs.extend((0..count).map(|_| {
            Func::Defined(DefinedFunc {
                sig_index: 0,
                offset: INVALID_OFFSET,
                local_decl_count: 0,
                local_count: 0,
                param_and_local_types: Vec::new(),
            })
        }));
        self.func_fixups.resize_with(count as usize, Vec::new);

        for (i, sig_index) in reader.into_iter().enumerate() {
            let env_sig_index = self.translate_sig_index(sig_index?)?;
            match &mut self.env.funcs[(first as usize) + i] {
                Func::Defined(func) => func.sig_index = env_sig_index,
                Func::Host(_) => unreachable!("freshly appended funcs are defined"),
            }
        }
        Ok(())
    }

    fn on_table(&mut self, table: wasmparser::Table) -> Result<(), LoadError> {
        if self.module().table_index.is_some() {
            return Err(LoadError::invalid("only one table allowed"));
        }
        if table.ty.element_type != RefType::FUNCREF {
            return Err(LoadError::invalid("unsupported table element type"));
        }
        if !matches!(table.init, TableInit::RefNull) {
            return Err(LoadError::invalid("unsupported table initializer"));
        }
        let limits = Limits {
            initial: table.ty.initial,
            max: table.ty.maximum,
        };
        self.env.tables.push(Table {
            limits,
            func_indexes: vec![INVALID_INDEX; limits.initial as usize],
        });
        let index = (self.env.tables.len() - 1) as u32;
        self.module_mut().table_index = Some(index);
        Ok(())
    }

    fn on_memory(&mut self, ty: wasmparser::MemoryType) -> Result<(), LoadError> {
        if self.module().memory_index.is_some() {
            return Err(LoadError::invalid("only one memory allowed"));
        }
        if ty.memory64 {
            return Err(LoadError::invalid("64-bit memories not supported"));
        }
        if ty.shared {
            return Err(LoadError::invalid("shared memories not supported"));
        }
        if ty.page_size_log2.is_some() {
            return Err(LoadError::invalid("custom page sizes not supported"));
        }
        let limits = Limits {
            initial: ty.initial,
            max: ty.maximum,
        };
        let byte_size = (limits.initial as usize) * PAGE_SIZE as usize;
        self.env.memories.push(Memory {
            page_limits: limits,
            data: vec![0; byte_size],
        });
        let index = (self.env.memories.len() - 1) as u32;
        self.module_mut().memory_index = Some(index);
        Ok(())
    }

    fn on_globals(&mut self, reader: wasmparser::GlobalSectionReader) -> Result<(), LoadError> {
        let count = reader.count();
        let first = self.env.globals.len() as u32;
        for i in 0..count {
            self.global_map.push(first + i);
        }
        self.env.globals.extend((0..count).map(|_| Global {
            value: Value::I32(0),
            mutable: false,
        }));

        for (i, global) in reader.into_iter().enumerate() {
            let global = global?;
            if global.ty.shared {
                return Err(LoadError::invalid("shared globals not supported"));
            }
            let declared = value_type(global.ty.content_type)?;
            let env_index = (first as usize) + i;
            self.env.globals[env_index] = Global {
                value: Value::zero(declared),
                mutable: global.ty.mutable,
            };
            let value = self.eval_init_expr(&global.init_expr)?;
            if value.ty() != declared {
                return Err(LoadError::invalid(format!(
                    "type mismatch in global, expected {declared} but got {}.",
                    value.ty()
                )));
            }
            self.env.globals[env_index].value = value;
        }
        Ok(())
    }

    fn on_export(&mut self, export: wasmparser::Export) -> Result<(), LoadError> {
        let (kind, item_index) = match export.kind {
            wasmparser::ExternalKind::Func => {
                (ExternalKind::Func, self.translate_func_index(export.index)?)
            }
            wasmparser::ExternalKind::Table => {
                let index = self
                    .module()
                    .table_index
                    .ok_or_else(|| LoadError::invalid("invalid exported table index"))?;
                (ExternalKind::Table, index)
            }
            wasmparser::ExternalKind::Memory => {
                let index = self
                    .module()
                    .memory_index
                    .ok_or_else(|| LoadError::invalid("invalid exported memory index"))?;
                (ExternalKind::Memory, index)
            }
            wasmparser::ExternalKind::Global => {
                let index = self.translate_global_index(export.index)?;
                if self.env.globals[index as usize].mutable {
                    return Err(LoadError::invalid("mutable globals cannot be exported"));
                }
                (ExternalKind::Global, index)
            }
            _ => return Err(LoadError::invalid("unsupported export kind")),
        };
        self.append_export(self.module_index, kind, item_index, export.name)
    }

    /// Append a named export to `module_index`, rejecting duplicates.
    fn append_export(
        &mut self,
        module_index: ModuleIndex,
        kind: ExternalKind,
        item_index: u32,
        name: &str,
    ) -> Result<(), LoadError> {
        let module = &mut self.env.modules[module_index];
        if module.export_bindings.contains_key(name) {
            return Err(LoadError::invalid(format!("duplicate export \"{name}\"")));
        }
        module.exports.push(Export {
            name: name.to_string(),
            kind,
            index: item_index,
        });
        let binding = module.exports.len() - 1;
        module.export_bindings.insert(name.to_string(), binding);
        Ok(())
    }

    fn on_start_function(&mut self, func_index: u32) -> Result<(), LoadError> {
        let env_index = self.translate_func_index(func_index)?;
        let sig_index = self.env.funcs[env_index as usize].sig_index();
        let sig = &self.env.sigs[sig_index as usize];
        if !sig.params.is_empty() {
            return Err(LoadError::invalid("start function must be nullary"));
        }
        if !sig.results.is_empty() {
            return Err(LoadError::invalid(
                "start function must not return anything",
            ));
        }
        self.defined_module_mut().start_func_index = Some(env_index);
        Ok(())
    }

    // -----------------------------------------------------------------
    // Code entries
    // -----------------------------------------------------------------

    fn on_code_entry(&mut self, body: FunctionBody) -> Result<(), LoadError> {
        let module_func_index = self.num_func_imports + self.code_index;
        self.code_index += 1;
        if module_func_index >= self.func_map.len() {
            return Err(LoadError::invalid(
                "function body without corresponding signature",
            ));
        }

        let env_index = self.begin_function_body(module_func_index)?;
        self.lower_locals(env_index, &body)?;

        let mut ops = body.get_operators_reader()?;
        while !ops.eof() {
            let op = ops.read()?;
            self.lower_op(&op)?;
        }
        if self.current_func.is_some() {
            return Err(LoadError::invalid("unexpected end of function body"));
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // Element and data segments
    // -----------------------------------------------------------------

    /// Unpack an active element segment, rejecting post-MVP shapes.
    fn elem_segment_parts<'a>(
        &self,
        elem: &Element<'a>,
    ) -> Result<(u32, wasmparser::SectionLimited<'a, u32>), LoadError> {
        let offset_expr = match &elem.kind {
            ElementKind::Active {
                table_index,
                offset_expr,
            } => {
                if table_index.unwrap_or(0) != 0 {
                    return Err(LoadError::invalid("invalid element segment table index"));
                }
                offset_expr
            }
            _ => {
                return Err(LoadError::invalid(
                    "passive element segments not supported",
                ))
            }
        };
        let items = match &elem.items {
            ElementItems::Functions(items) => items.clone(),
            ElementItems::Expressions(..) => {
                return Err(LoadError::invalid(
                    "expression element segments not supported",
                ))
            }
        };
        let value = self.eval_init_expr(offset_expr)?;
        let offset = match value {
            Value::I32(offset) => offset as u32,
            _ => {
                return Err(LoadError::invalid(format!(
                    "type mismatch in elem segment, expected i32 but got {}",
                    value.ty()
                )))
            }
        };
        Ok((offset, items))
    }

    fn validate_elem_segment(&mut self, elem: Element) -> Result<(), LoadError> {
        let (mut offset, items) = self.elem_segment_parts(&elem)?;
        let table_index = self
            .module()
            .table_index
            .ok_or_else(|| LoadError::invalid("elem segment requires a table"))?;
        let table_size = self.env.tables[table_index as usize].func_indexes.len();

        for func_index in items {
            let func_index = func_index?;
            if offset as usize >= table_size {
                return Err(LoadError::invalid(format!(
                    "elem segment offset is out of bounds: {offset} >= max value {table_size}"
                )));
            }
            if func_index >= self.func_map.len() {
                return Err(LoadError::invalid(format!(
                    "invalid func_index: {func_index} (max {})",
                    self.func_map.len()
                )));
            }
            offset += 1;
        }
        Ok(())
    }

    fn apply_elem_segment(&mut self, elem: Element) -> Result<(), LoadError> {
        let (mut offset, items) = self.elem_segment_parts(&elem)?;
        let table_index = self
            .module()
            .table_index
            .ok_or_else(|| LoadError::invalid("elem segment requires a table"))?;

        for func_index in items {
            let env_func_index = self.translate_func_index(func_index?)?;
            self.env.tables[table_index as usize].func_indexes[offset as usize] = env_func_index;
            offset += 1;
        }
        Ok(())
    }

    /// Unpack an active data segment, rejecting post-MVP shapes.
    fn data_segment_offset(&self, data: &Data) -> Result<u32, LoadError> {
        let offset_expr = match &data.kind {
            DataKind::Active {
                memory_index: 0,
                offset_expr,
            } => offset_expr,
            DataKind::Active { .. } => {
                return Err(LoadError::invalid("invalid data segment memory index"))
            }
            DataKind::Passive => {
                return Err(LoadError::invalid("passive data segments not supported"))
            }
        };
        let value = self.eval_init_expr(offset_expr)?;
        match value {
            Value::I32(offset) => Ok(offset as u32),
            _ => Err(LoadError::invalid(format!(
                "type mismatch in data segment, expected i32 but got {}",
                value.ty()
            ))),
        }
    }

    fn validate_data_segment(&mut self, data: Data) -> Result<(), LoadError> {
        let address = self.data_segment_offset(&data)?;
        let memory_index = self
            .module()
            .memory_index
            .ok_or_else(|| LoadError::invalid("data segment requires a memory"))?;
        let byte_size = self.env.memories[memory_index as usize].data.len() as u64;
        // 64-bit math so the end address cannot wrap.
        let end_address = address as u64 + data.data.len() as u64;
        if end_address > byte_size {
            return Err(LoadError::invalid(format!(
                "data segment is out of bounds: [{address}, {end_address}) >= max value {byte_size}"
            )));
        }
        Ok(())
    }

    fn apply_data_segment(&mut self, data: Data) -> Result<(), LoadError> {
        let address = self.data_segment_offset(&data)? as usize;
        let memory_index = self
            .module()
            .memory_index
            .ok_or_else(|| LoadError::invalid("data segment requires a memory"))?;
        let memory = &mut self.env.memories[memory_index as usize];
        memory.data[address..address + data.data.len()].copy_from_slice(data.data);
        Ok(())
    }
}
