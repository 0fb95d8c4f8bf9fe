//! Constant initializer expressions.
//!
//! An initializer is a single `*.const` or a `global.get` of an
//! immutable, imported global. The evaluated value feeds the enclosing
//! installer: a global's value, an element segment offset, or a data
//! segment address.

use wasmparser::{ConstExpr, Operator};

use crate::error::LoadError;
use crate::value::Value;

use super::Context;

impl Context<'_> {
    pub(super) fn eval_init_expr(&self, expr: &ConstExpr) -> Result<Value, LoadError> {
        let mut reader = expr.get_operators_reader();
        let mut value: Option<Value> = None;
        loop {
            let op = reader.read()?;
            match op {
                Operator::End => break,
                _ if value.is_some() => {
                    return Err(LoadError::invalid("invalid initializer expression"))
                }
                Operator::I32Const { value: v } => value = Some(Value::I32(v)),
                Operator::I64Const { value: v } => value = Some(Value::I64(v)),
                Operator::F32Const { value: v } => {
                    value = Some(Value::F32(f32::from_bits(v.bits())))
                }
                Operator::F64Const { value: v } => {
                    value = Some(Value::F64(f64::from_bits(v.bits())))
                }
                Operator::GlobalGet { global_index } => {
                    if global_index >= self.num_global_imports {
                        return Err(LoadError::invalid(
                            "initializer expression can only reference an imported global",
                        ));
                    }
                    let env_index = self.translate_global_index(global_index)?;
                    let global = &self.env.globals[env_index as usize];
                    if global.mutable {
                        return Err(LoadError::invalid(
                            "initializer expression cannot reference a mutable global",
                        ));
                    }
                    value = Some(global.value);
                }
                _ => return Err(LoadError::invalid("invalid initializer expression")),
            }
        }
        value.ok_or_else(|| LoadError::invalid("invalid initializer expression"))
    }
}
