//! Import resolution.
//!
//! Each declared import is resolved against a module registered in the
//! environment. Host modules answer through their
//! [`HostImportDelegate`](crate::env::HostImportDelegate), which
//! allocates and populates the environment entry; non-host modules are
//! searched for a matching export, whose kind, type and limits are
//! checked against the declaration.

use wasmparser::TypeRef;

use crate::env::{
    ExternalKind, Func, Global, HostFunc, Import, Limits, Memory, ModuleIndex, ModuleKind, Table,
};
use crate::error::LoadError;
use crate::istream::INVALID_INDEX;
use crate::value::{value_type, Value};

use super::Context;

/// The limit-compatibility rule: the actual entity must be at least as
/// large as declared, and may only promise an upper bound if the
/// declaration allows one at least as large.
pub(crate) fn check_import_limits(declared: &Limits, actual: &Limits) -> Result<(), LoadError> {
    if actual.initial < declared.initial {
        return Err(LoadError::invalid(format!(
            "actual size ({}) smaller than declared ({})",
            actual.initial, declared.initial
        )));
    }
    if let Some(declared_max) = declared.max {
        match actual.max {
            None => {
                return Err(LoadError::invalid(format!(
                    "max size (unspecified) larger than declared ({declared_max})"
                )))
            }
            Some(actual_max) if actual_max > declared_max => {
                return Err(LoadError::invalid(format!(
                    "max size ({actual_max}) larger than declared ({declared_max})"
                )))
            }
            Some(_) => {}
        }
    }
    Ok(())
}

impl Context<'_> {
    pub(super) fn link_import(&mut self, import: wasmparser::Import<'_>) -> Result<(), LoadError> {
        let kind = match import.ty {
            TypeRef::Func(_) => ExternalKind::Func,
            TypeRef::Table(_) => ExternalKind::Table,
            TypeRef::Memory(_) => ExternalKind::Memory,
            TypeRef::Global(_) => ExternalKind::Global,
            _ => return Err(LoadError::invalid("unsupported import kind")),
        };
        let record = Import {
            module_name: import.module.to_string(),
            field_name: import.name.to_string(),
            kind,
        };

        let source_index = self.env.registered_module(&record.module_name).ok_or_else(|| {
            LoadError::invalid(format!(
                "unknown import module \"{}\"",
                record.module_name
            ))
        })?;
        let is_host = self.env.modules[source_index].is_host();

        match import.ty {
            TypeRef::Func(sig_index) => {
                self.import_func(&record, source_index, is_host, sig_index)?
            }
            TypeRef::Table(ty) => self.import_table(&record, source_index, is_host, ty)?,
            TypeRef::Memory(ty) => self.import_memory(&record, source_index, is_host, ty)?,
            TypeRef::Global(ty) => self.import_global(&record, source_index, is_host, ty)?,
            _ => unreachable!("rejected above"),
        }

        self.defined_module_mut().imports.push(record);
        Ok(())
    }

    /// Find a named export on a non-host module and check its kind.
    fn resolve_export(
        &self,
        source_index: ModuleIndex,
        record: &Import,
    ) -> Result<u32, LoadError> {
        let export = self.env.modules[source_index]
            .export(&record.field_name)
            .ok_or_else(|| {
                LoadError::invalid(format!(
                    "unknown module field \"{}\"",
                    record.field_name
                ))
            })?;
        if export.kind != record.kind {
            return Err(LoadError::invalid(format!(
                "expected import \"{}.{}\" to have kind {}, not {}",
                record.module_name, record.field_name, record.kind, export.kind
            )));
        }
        Ok(export.index)
    }

    fn import_func(
        &mut self,
        record: &Import,
        source_index: ModuleIndex,
        is_host: bool,
        sig_index: u32,
    ) -> Result<(), LoadError> {
        let env_sig_index = self.translate_sig_index(sig_index)?;

        let func_env_index = if is_host {
            let sig = self.env.sigs[env_sig_index as usize].clone();
            let env = &mut *self.env;
            let ModuleKind::Host(host) = &mut env.modules[source_index].kind else {
                unreachable!("is_host checked above");
            };
            let callback = host
                .delegate
                .import_func(record, &sig)
                .map_err(LoadError::Invalid)?;
            env.funcs.push(Func::Host(HostFunc {
                module_name: record.module_name.clone(),
                field_name: record.field_name.clone(),
                sig_index: env_sig_index,
                callback,
            }));
            let index = (env.funcs.len() - 1) as u32;
            // A host module accumulates an export per resolved import;
            // re-importing the same field is not an error.
            let _ = self.append_export(source_index, ExternalKind::Func, index, &record.field_name);
            index
        } else {
            let index = self.resolve_export(source_index, record)?;
            let actual_sig = self.env.funcs[index as usize].sig_index();
            if !self.env.sigs_equal(env_sig_index, actual_sig) {
                return Err(LoadError::invalid("import signature mismatch"));
            }
            index
        };

        self.func_map.push(func_env_index);
        self.num_func_imports += 1;
        Ok(())
    }

    fn import_table(
        &mut self,
        record: &Import,
        source_index: ModuleIndex,
        is_host: bool,
        ty: wasmparser::TableType,
    ) -> Result<(), LoadError> {
        if self.module().table_index.is_some() {
            return Err(LoadError::invalid("only one table allowed"));
        }
        if ty.element_type != wasmparser::RefType::FUNCREF {
            return Err(LoadError::invalid("unsupported table element type"));
        }
        let declared = Limits {
            initial: ty.initial,
            max: ty.maximum,
        };

        let table_index = if is_host {
            self.env.tables.push(Table {
                limits: declared,
                func_indexes: vec![INVALID_INDEX; declared.initial as usize],
            });
            let index = self.env.tables.len() - 1;
            let env = &mut *self.env;
            let ModuleKind::Host(host) = &mut env.modules[source_index].kind else {
                unreachable!("is_host checked above");
            };
            host.delegate
                .import_table(record, &mut env.tables[index])
                .map_err(LoadError::Invalid)?;
            check_import_limits(&declared, &env.tables[index].limits)?;
            let _ = self.append_export(
                source_index,
                ExternalKind::Table,
                index as u32,
                &record.field_name,
            );
            index as u32
        } else {
            let index = self.resolve_export(source_index, record)?;
            check_import_limits(&declared, &self.env.tables[index as usize].limits)?;
            index
        };

        self.module_mut().table_index = Some(table_index);
        Ok(())
    }

    fn import_memory(
        &mut self,
        record: &Import,
        source_index: ModuleIndex,
        is_host: bool,
        ty: wasmparser::MemoryType,
    ) -> Result<(), LoadError> {
        if self.module().memory_index.is_some() {
            return Err(LoadError::invalid("only one memory allowed"));
        }
        if ty.memory64 {
            return Err(LoadError::invalid("64-bit memories not supported"));
        }
        if ty.shared {
            return Err(LoadError::invalid("shared memories not supported"));
        }
        let declared = Limits {
            initial: ty.initial,
            max: ty.maximum,
        };

        let memory_index = if is_host {
            self.env.memories.push(Memory {
                page_limits: declared,
                data: Vec::new(),
            });
            let index = self.env.memories.len() - 1;
            let env = &mut *self.env;
            let ModuleKind::Host(host) = &mut env.modules[source_index].kind else {
                unreachable!("is_host checked above");
            };
            host.delegate
                .import_memory(record, &mut env.memories[index])
                .map_err(LoadError::Invalid)?;
            check_import_limits(&declared, &env.memories[index].page_limits)?;
            let _ = self.append_export(
                source_index,
                ExternalKind::Memory,
                index as u32,
                &record.field_name,
            );
            index as u32
        } else {
            let index = self.resolve_export(source_index, record)?;
            check_import_limits(&declared, &self.env.memories[index as usize].page_limits)?;
            index
        };

        self.module_mut().memory_index = Some(memory_index);
        Ok(())
    }

    fn import_global(
        &mut self,
        record: &Import,
        source_index: ModuleIndex,
        is_host: bool,
        ty: wasmparser::GlobalType,
    ) -> Result<(), LoadError> {
        if ty.shared {
            return Err(LoadError::invalid("shared globals not supported"));
        }
        let declared = value_type(ty.content_type)?;

        let global_env_index = if is_host {
            self.env.globals.push(Global {
                value: Value::zero(declared),
                mutable: ty.mutable,
            });
            let index = self.env.globals.len() - 1;
            let env = &mut *self.env;
            let ModuleKind::Host(host) = &mut env.modules[source_index].kind else {
                unreachable!("is_host checked above");
            };
            host.delegate
                .import_global(record, &mut env.globals[index])
                .map_err(LoadError::Invalid)?;
            if env.globals[index].value.ty() != declared {
                return Err(LoadError::invalid(format!(
                    "host import \"{}.{}\" has the wrong type",
                    record.module_name, record.field_name
                )));
            }
            let _ = self.append_export(
                source_index,
                ExternalKind::Global,
                index as u32,
                &record.field_name,
            );
            index as u32
        } else {
            let index = self.resolve_export(source_index, record)?;
            let actual = &self.env.globals[index as usize];
            if actual.value.ty() != declared {
                return Err(LoadError::invalid(format!(
                    "global type mismatch in import \"{}.{}\"",
                    record.module_name, record.field_name
                )));
            }
            if actual.mutable != ty.mutable {
                return Err(LoadError::invalid(format!(
                    "global mutability mismatch in import \"{}.{}\"",
                    record.module_name, record.field_name
                )));
            }
            index
        };

        self.global_map.push(global_env_index);
        self.num_global_imports += 1;
        Ok(())
    }
}
