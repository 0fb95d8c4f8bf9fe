//! The instruction lowerer: per-opcode validation and istream emission.
//!
//! For each operator, in order: pre-checks (memory present, alignment,
//! index bounds), pop-and-check operand types, emit the opcode and its
//! immediates, push result types.
//!
//! Unreachable code is modeled with a synthetic `Any` on the operand
//! stack: after `br`, `br_table`, `return` or `unreachable` the stack is
//! reset to the enclosing label's floor and `Any` is pushed, making
//! every later check succeed vacuously until the label closes.

use tracing::trace;
use wasmparser::{BlockType, BrTable, FunctionBody, MemArg, Operator};

use crate::env::Func;
use crate::error::LoadError;
use crate::istream::{BR_TABLE_ENTRY_SIZE, INVALID_OFFSET};
use crate::opcode::Opcode;
use crate::value::{value_type, ValueType};

use super::Context;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum LabelKind {
    Func,
    Block,
    Loop,
    If,
    Else,
}

/// One frame of the structured-control stack.
#[derive(Debug, Clone)]
pub(super) struct Label {
    pub kind: LabelKind,
    /// Result types of the frame.
    pub sig: Vec<ValueType>,
    /// Operand-stack floor at entry; inner code may not pop below it.
    pub type_stack_limit: u32,
    /// Branch target: the loop entry for LOOP, otherwise INVALID until
    /// `end` patches the pending branches.
    pub offset: u32,
    /// IF's conditional-branch slot; ELSE's forward-jump slot.
    pub fixup_offset: u32,
}

fn br_arity(label: &Label) -> u32 {
    // A branch to a loop re-enters it and transfers nothing.
    if label.kind == LabelKind::Loop {
        0
    } else {
        label.sig.len() as u32
    }
}

impl Context<'_> {
    // -----------------------------------------------------------------
    // Function body framing
    // -----------------------------------------------------------------

    /// Start lowering the body of `module_func_index`. Records the body
    /// offset, patches pending direct calls to it, seeds the operand
    /// stack with the parameters and pushes the implicit FUNC label.
    pub(super) fn begin_function_body(&mut self, module_func_index: u32) -> Result<u32, LoadError> {
        let env_index = self.translate_func_index(module_func_index)?;
        let offset = self.env.istream.len();
        let sig_index = self.env.funcs[env_index as usize].sig_index();
        let sig = self.env.sigs[sig_index as usize].clone();

        match &mut self.env.funcs[env_index as usize] {
            Func::Defined(func) => {
                func.offset = offset;
                func.local_decl_count = 0;
                func.local_count = 0;
                func.param_and_local_types.clear();
            }
            Func::Host(_) => {
                return Err(LoadError::invalid("function body for an imported function"))
            }
        }

        self.current_func = Some(env_index);
        self.locals.clear();
        self.type_stack.clear();
        self.label_stack.clear();
        self.depth_fixups.clear();

        let defined_index = (module_func_index - self.num_func_imports) as usize;
        for slot in std::mem::take(&mut self.func_fixups[defined_index]) {
            self.env.istream.patch_u32(slot, offset);
        }

        self.locals.extend_from_slice(&sig.params);
        self.type_stack.extend_from_slice(&sig.params);
        self.push_label(LabelKind::Func, sig.results, INVALID_OFFSET, INVALID_OFFSET);
        Ok(env_index)
    }

    /// Install the body's local declarations. After the last declaration
    /// the locals are allocated in one `alloca` and the FUNC label's
    /// floor is raised past them, so inner code cannot pop locals and
    /// `local.get` depths count from the operand-stack top.
    pub(super) fn lower_locals(
        &mut self,
        env_index: u32,
        body: &FunctionBody,
    ) -> Result<(), LoadError> {
        let reader = body.get_locals_reader()?;
        let decl_count = reader.get_count();
        let mut local_count: u32 = 0;

        for decl in reader {
            let (count, ty) = decl?;
            let ty = value_type(ty)?;
            local_count = local_count
                .checked_add(count)
                .ok_or_else(|| LoadError::invalid("too many locals"))?;
            for _ in 0..count {
                self.locals.push(ty);
                self.push_type(ty);
            }
        }

        if decl_count > 0 {
            trace!(local_count, "alloca");
            self.env.istream.emit_opcode(Opcode::Alloca);
            self.env.istream.emit_u32(local_count);
            if let Some(label) = self.label_stack.last_mut() {
                label.type_stack_limit += local_count;
            }
        }

        match &mut self.env.funcs[env_index as usize] {
            Func::Defined(func) => {
                func.local_decl_count = decl_count;
                func.local_count = local_count;
                func.param_and_local_types = self.locals.clone();
            }
            Func::Host(_) => unreachable!("checked in begin_function_body"),
        }
        Ok(())
    }

    /// Close the function body. The fallthrough shape is reconciled, the
    /// return prologue drops locals and params, and the frame is popped.
    /// The body's final emission is always RETURN.
    fn end_function_body(&mut self) -> Result<(), LoadError> {
        let sig = match self.label_stack.last() {
            Some(label) if label.kind == LabelKind::Func => label.sig.clone(),
            _ => return Err(LoadError::invalid("unexpected function end")),
        };
        self.check_n_types(&sig, "implicit return")?;
        self.check_type_stack_limit_exact(sig.len(), "func")?;
        let target = self.env.istream.len();
        self.fixup_top_label(target);
        if self.top_is_any() {
            // Unreachable from the fallthrough; branches to the implicit
            // label were already validated, so just restore that shape.
            self.reset_type_stack_to_limit();
            self.push_types(&sig);
        }
        self.drop_types_for_return(sig.len() as u32);
        self.env.istream.emit_opcode(Opcode::Return);
        self.pop_label();
        self.current_func = None;
        self.type_stack.clear();
        self.locals.clear();
        Ok(())
    }

    /// Drop the locals and params but keep the return value, if any.
    fn drop_types_for_return(&mut self, arity: u32) {
        if self.top_is_any() {
            return;
        }
        if self.type_stack.len() as u32 >= arity {
            let drop = self.type_stack.len() as u32 - arity;
            self.env.istream.emit_drop_keep(drop, arity as u8);
        } else {
            // The stack can be smaller than the arity only when the last
            // instruction was itself a return.
            debug_assert!(self.type_stack.is_empty());
        }
    }

    // -----------------------------------------------------------------
    // Operand-type stack
    // -----------------------------------------------------------------

    fn type_stack_limit(&self) -> usize {
        self.label_stack
            .last()
            .map_or(0, |label| label.type_stack_limit as usize)
    }

    fn top_is_any(&self) -> bool {
        self.type_stack.len() > self.locals.len()
            && self.type_stack.last() == Some(&ValueType::Any)
    }

    fn top_type(&self) -> ValueType {
        debug_assert!(self.type_stack.len() > self.type_stack_limit());
        self.type_stack.last().copied().unwrap_or(ValueType::Any)
    }

    fn pop_type(&mut self) -> ValueType {
        let ty = self.top_type();
        if ty != ValueType::Any {
            trace!(depth = self.type_stack.len(), "pop {ty}");
            self.type_stack.pop();
        }
        ty
    }

    fn push_type(&mut self, ty: ValueType) {
        if self.top_is_any() {
            return;
        }
        trace!(depth = self.type_stack.len() + 1, "push {ty}");
        self.type_stack.push(ty);
    }

    fn push_types(&mut self, types: &[ValueType]) {
        for &ty in types {
            self.push_type(ty);
        }
    }

    fn reset_type_stack_to_limit(&mut self) {
        let limit = self.type_stack_limit();
        self.type_stack.truncate(limit);
    }

    fn check_type_stack_limit(&self, expected: usize, desc: &str) -> Result<(), LoadError> {
        if self.top_is_any() {
            return Ok(());
        }
        let avail = self.type_stack.len().saturating_sub(self.type_stack_limit());
        if expected > avail {
            return Err(LoadError::invalid(format!(
                "type stack size too small at {desc}. got {avail}, expected at least {expected}"
            )));
        }
        Ok(())
    }

    fn check_type_stack_limit_exact(&self, expected: usize, desc: &str) -> Result<(), LoadError> {
        if self.top_is_any() {
            return Ok(());
        }
        let avail = self.type_stack.len().saturating_sub(self.type_stack_limit());
        if expected != avail {
            return Err(LoadError::invalid(format!(
                "type stack at end of {desc} is {avail}. expected {expected}"
            )));
        }
        Ok(())
    }

    fn check_type(&self, expected: ValueType, actual: ValueType, desc: &str) -> Result<(), LoadError> {
        if self.top_is_any() {
            return Ok(());
        }
        if expected != actual {
            return Err(LoadError::invalid(format!(
                "type mismatch in {desc}, expected {expected} but got {actual}."
            )));
        }
        Ok(())
    }

    /// Check the top of the stack against an expected type list; values
    /// were pushed in order, so the comparison walks the expected list
    /// backwards over the top `expected.len()` stack slots.
    fn check_n_types(&self, expected: &[ValueType], desc: &str) -> Result<(), LoadError> {
        if self.top_is_any() {
            return Ok(());
        }
        self.check_type_stack_limit(expected.len(), desc)?;
        for i in 0..expected.len() {
            let actual = self.type_stack[self.type_stack.len() - expected.len() + i];
            self.check_type(expected[expected.len() - i - 1], actual, desc)?;
        }
        Ok(())
    }

    fn pop_and_check_1(&mut self, expected: ValueType, desc: &str) -> Result<(), LoadError> {
        if self.top_is_any() {
            return Ok(());
        }
        self.check_type_stack_limit(1, desc)?;
        let actual = self.pop_type();
        self.check_type(expected, actual, desc)
    }

    fn pop_and_check_2(
        &mut self,
        expected1: ValueType,
        expected2: ValueType,
        desc: &str,
    ) -> Result<(), LoadError> {
        if self.top_is_any() {
            return Ok(());
        }
        self.check_type_stack_limit(2, desc)?;
        let actual2 = self.pop_type();
        let actual1 = self.pop_type();
        self.check_type(expected1, actual1, desc)?;
        self.check_type(expected2, actual2, desc)
    }

    // -----------------------------------------------------------------
    // Labels and fixups
    // -----------------------------------------------------------------

    fn push_label(&mut self, kind: LabelKind, sig: Vec<ValueType>, offset: u32, fixup_offset: u32) {
        trace!(depth = self.label_stack.len(), ?kind, "push label");
        let type_stack_limit = self.type_stack.len() as u32;
        self.label_stack.push(Label {
            kind,
            sig,
            type_stack_limit,
            offset,
            fixup_offset,
        });
    }

    fn pop_label(&mut self) {
        trace!(depth = self.label_stack.len() - 1, "pop label");
        self.label_stack.pop();
        if self.depth_fixups.len() > self.label_stack.len() {
            debug_assert!(self.depth_fixups[self.label_stack.len()..]
                .iter()
                .all(Vec::is_empty));
            self.depth_fixups.truncate(self.label_stack.len());
        }
    }

    /// Patch every pending forward branch to the top label.
    fn fixup_top_label(&mut self, target: u32) {
        let top = self.label_stack.len() - 1;
        if top >= self.depth_fixups.len() {
            return;
        }
        for slot in std::mem::take(&mut self.depth_fixups[top]) {
            self.env.istream.patch_u32(slot, target);
        }
    }

    /// Translate a relative branch depth to an absolute label index.
    fn translate_depth(&self, depth: u32) -> Result<u32, LoadError> {
        if depth as usize >= self.label_stack.len() {
            return Err(LoadError::invalid(format!(
                "invalid depth: {depth} (max {})",
                self.label_stack.len()
            )));
        }
        Ok((self.label_stack.len() - 1 - depth as usize) as u32)
    }

    /// Emit a branch target, enqueueing a fixup when it is not yet known.
    fn emit_br_offset(&mut self, depth: u32, offset: u32) {
        if offset == INVALID_OFFSET {
            if depth as usize >= self.depth_fixups.len() {
                self.depth_fixups.resize_with(depth as usize + 1, Vec::new);
            }
            let slot = self.env.istream.len();
            self.depth_fixups[depth as usize].push(slot);
        }
        self.env.istream.emit_u32(offset);
    }

    /// Reconcile the operand stack to the target label's shape and emit
    /// the branch itself.
    fn emit_br(&mut self, depth: u32) {
        let label = &self.label_stack[depth as usize];
        let arity = br_arity(label);
        let limit = label.type_stack_limit;
        let target = label.offset;
        debug_assert!(self.type_stack.len() as u32 >= limit + arity);
        let drop = self.type_stack.len() as u32 - limit - arity;
        self.env.istream.emit_drop_keep(drop, arity as u8);
        self.env.istream.emit_opcode(Opcode::Br);
        self.emit_br_offset(depth, target);
    }

    /// One br_table entry: target, drop count, kept arity.
    fn emit_br_table_offset(&mut self, depth: u32) {
        let label = &self.label_stack[depth as usize];
        let arity = br_arity(label);
        let limit = label.type_stack_limit;
        let target = label.offset;
        debug_assert!(self.type_stack.len() as u32 >= limit + arity);
        let drop = self.type_stack.len() as u32 - limit - arity;
        self.emit_br_offset(depth, target);
        self.env.istream.emit_u32(drop);
        self.env.istream.emit_u8(arity as u8);
    }

    /// Emit a direct-call target, enqueueing a function fixup when the
    /// callee's body has not been lowered yet.
    fn emit_func_offset(&mut self, module_func_index: u32, offset: u32) {
        if offset == INVALID_OFFSET {
            let defined_index = (module_func_index - self.num_func_imports) as usize;
            let slot = self.env.istream.len();
            self.func_fixups[defined_index].push(slot);
        }
        self.env.istream.emit_u32(offset);
    }

    // -----------------------------------------------------------------
    // Pre-checks
    // -----------------------------------------------------------------

    fn check_has_memory(&self, opcode: Opcode) -> Result<u32, LoadError> {
        self.module().memory_index.ok_or_else(|| {
            LoadError::invalid(format!(
                "{opcode} requires an imported or defined memory."
            ))
        })
    }

    fn check_align(&self, alignment_log2: u8, natural_alignment: u32) -> Result<(), LoadError> {
        if alignment_log2 as u32 >= 32 || (1u32 << alignment_log2) > natural_alignment {
            return Err(LoadError::invalid(format!(
                "alignment must not be larger than natural alignment ({natural_alignment})"
            )));
        }
        Ok(())
    }

    fn local_type(&self, local_index: u32) -> Result<ValueType, LoadError> {
        self.locals.get(local_index as usize).copied().ok_or_else(|| {
            LoadError::invalid(format!(
                "invalid local_index: {local_index} (max {})",
                self.locals.len()
            ))
        })
    }

    /// A local's istream operand is its depth below the operand-stack
    /// top. Valid because the FUNC floor was raised past the locals.
    fn translate_local(&self, local_index: u32) -> u32 {
        self.type_stack.len() as u32 - local_index
    }

    fn block_sig(&self, blockty: BlockType) -> Result<Vec<ValueType>, LoadError> {
        match blockty {
            BlockType::Empty => Ok(Vec::new()),
            BlockType::Type(ty) => Ok(vec![value_type(ty)?]),
            BlockType::FuncType(_) => Err(LoadError::invalid(
                "multi-value block signatures not supported",
            )),
        }
    }

    // -----------------------------------------------------------------
    // Simple operator shapes
    // -----------------------------------------------------------------

    fn check_opcode_1(
        &mut self,
        opcode: Opcode,
        operand: ValueType,
        result: ValueType,
    ) -> Result<(), LoadError> {
        if self.top_is_any() {
            return Ok(());
        }
        self.pop_and_check_1(operand, opcode.mnemonic())?;
        self.push_type(result);
        Ok(())
    }

    fn check_opcode_2(
        &mut self,
        opcode: Opcode,
        operand1: ValueType,
        operand2: ValueType,
        result: ValueType,
    ) -> Result<(), LoadError> {
        if self.top_is_any() {
            return Ok(());
        }
        self.pop_and_check_2(operand1, operand2, opcode.mnemonic())?;
        self.push_type(result);
        Ok(())
    }

    fn unary(
        &mut self,
        opcode: Opcode,
        operand: ValueType,
        result: ValueType,
    ) -> Result<(), LoadError> {
        self.check_opcode_1(opcode, operand, result)?;
        self.env.istream.emit_opcode(opcode);
        Ok(())
    }

    fn binary(
        &mut self,
        opcode: Opcode,
        operand1: ValueType,
        operand2: ValueType,
        result: ValueType,
    ) -> Result<(), LoadError> {
        self.check_opcode_2(opcode, operand1, operand2, result)?;
        self.env.istream.emit_opcode(opcode);
        Ok(())
    }

    fn load(
        &mut self,
        opcode: Opcode,
        result: ValueType,
        natural_alignment: u32,
        memarg: &MemArg,
    ) -> Result<(), LoadError> {
        let memory_index = self.check_has_memory(opcode)?;
        self.check_align(memarg.align, natural_alignment)?;
        self.check_opcode_1(opcode, ValueType::I32, result)?;
        self.env.istream.emit_opcode(opcode);
        self.env.istream.emit_u32(memory_index);
        self.env.istream.emit_u32(address_offset(memarg)?);
        Ok(())
    }

    fn store(
        &mut self,
        opcode: Opcode,
        operand: ValueType,
        natural_alignment: u32,
        memarg: &MemArg,
    ) -> Result<(), LoadError> {
        let memory_index = self.check_has_memory(opcode)?;
        self.check_align(memarg.align, natural_alignment)?;
        if !self.top_is_any() {
            self.pop_and_check_2(ValueType::I32, operand, opcode.mnemonic())?;
        }
        self.env.istream.emit_opcode(opcode);
        self.env.istream.emit_u32(memory_index);
        self.env.istream.emit_u32(address_offset(memarg)?);
        Ok(())
    }

    // -----------------------------------------------------------------
    // Control flow
    // -----------------------------------------------------------------

    fn on_if(&mut self, blockty: BlockType) -> Result<(), LoadError> {
        let sig = self.block_sig(blockty)?;
        self.check_type_stack_limit(1, "if")?;
        self.pop_and_check_1(ValueType::I32, "if")?;
        self.env.istream.emit_opcode(Opcode::BrUnless);
        let fixup_offset = self.env.istream.len();
        self.env.istream.emit_u32(INVALID_OFFSET);
        self.push_label(LabelKind::If, sig, INVALID_OFFSET, fixup_offset);
        Ok(())
    }

    fn on_else(&mut self) -> Result<(), LoadError> {
        let top = match self.label_stack.last() {
            Some(label) if label.kind == LabelKind::If => self.label_stack.len() - 1,
            _ => return Err(LoadError::invalid("unexpected else operator")),
        };
        let sig = self.label_stack[top].sig.clone();
        self.check_n_types(&sig, "if true branch")?;

        self.label_stack[top].kind = LabelKind::Else;
        let fixup_cond_offset = self.label_stack[top].fixup_offset;
        // Jump over the else arm; the true arm's conditional branch now
        // targets the else arm's first instruction.
        self.env.istream.emit_opcode(Opcode::Br);
        self.label_stack[top].fixup_offset = self.env.istream.len();
        self.env.istream.emit_u32(INVALID_OFFSET);
        let else_start = self.env.istream.len();
        self.env.istream.patch_u32(fixup_cond_offset, else_start);

        let limit = self.label_stack[top].type_stack_limit as usize;
        self.type_stack.truncate(limit);
        Ok(())
    }

    fn on_end(&mut self) -> Result<(), LoadError> {
        let label = self
            .label_stack
            .last()
            .ok_or_else(|| LoadError::invalid("unexpected end operator"))?;
        if label.kind == LabelKind::Func {
            return self.end_function_body();
        }

        let kind = label.kind;
        let sig = label.sig.clone();
        let fixup_offset = label.fixup_offset;
        let desc = match kind {
            LabelKind::If => "if true branch",
            LabelKind::Else => "if false branch",
            LabelKind::Block => "block",
            LabelKind::Loop => "loop",
            LabelKind::Func => unreachable!("handled above"),
        };
        if matches!(kind, LabelKind::If | LabelKind::Else) {
            let target = self.env.istream.len();
            self.env.istream.patch_u32(fixup_offset, target);
        }
        self.check_n_types(&sig, desc)?;
        self.check_type_stack_limit_exact(sig.len(), desc)?;
        let target = self.env.istream.len();
        self.fixup_top_label(target);
        self.reset_type_stack_to_limit();
        self.push_types(&sig);
        self.pop_label();
        Ok(())
    }

    fn on_br(&mut self, relative_depth: u32) -> Result<(), LoadError> {
        let depth = self.translate_depth(relative_depth)?;
        let label = &self.label_stack[depth as usize];
        if label.kind != LabelKind::Loop {
            let sig = label.sig.clone();
            self.check_n_types(&sig, "br")?;
        }
        self.emit_br(depth);
        self.reset_type_stack_to_limit();
        self.push_type(ValueType::Any);
        Ok(())
    }

    fn on_br_if(&mut self, relative_depth: u32) -> Result<(), LoadError> {
        let depth = self.translate_depth(relative_depth)?;
        self.pop_and_check_1(ValueType::I32, "br_if")?;
        let label = &self.label_stack[depth as usize];
        if label.kind != LabelKind::Loop {
            let sig = label.sig.clone();
            self.check_n_types(&sig, "br_if")?;
        }
        // Flipped so the taken path can drop values from the stack.
        self.env.istream.emit_opcode(Opcode::BrUnless);
        let fixup_br_offset = self.env.istream.len();
        self.env.istream.emit_u32(INVALID_OFFSET);
        self.emit_br(depth);
        let after = self.env.istream.len();
        self.env.istream.patch_u32(fixup_br_offset, after);
        Ok(())
    }

    fn on_br_table(&mut self, targets: &BrTable) -> Result<(), LoadError> {
        self.pop_and_check_1(ValueType::I32, "br_table")?;
        let num_targets = targets.len();
        self.env.istream.emit_opcode(Opcode::BrTable);
        self.env.istream.emit_u32(num_targets);
        let fixup_table_offset = self.env.istream.len();
        self.env.istream.emit_u32(INVALID_OFFSET);
        // Not needed by the VM, but it keeps the stream disassemblable:
        // the marker says how many bytes of entry data follow.
        self.env.istream.emit_opcode(Opcode::Data);
        self.env
            .istream
            .emit_u32((num_targets + 1) * BR_TABLE_ENTRY_SIZE);
        let table_start = self.env.istream.len();
        self.env.istream.patch_u32(fixup_table_offset, table_start);

        let depths = targets
            .targets()
            .collect::<Result<Vec<u32>, _>>()?;
        for &relative_depth in depths.iter().chain(std::iter::once(&targets.default())) {
            let depth = self.translate_depth(relative_depth)?;
            let sig = self.label_stack[depth as usize].sig.clone();
            self.check_n_types(&sig, "br_table")?;
            self.emit_br_table_offset(depth);
        }

        self.reset_type_stack_to_limit();
        self.push_type(ValueType::Any);
        Ok(())
    }

    fn on_return(&mut self) -> Result<(), LoadError> {
        // The bottom frame is the implicit FUNC label carrying the
        // function's result types.
        let sig = self.label_stack[0].sig.clone();
        self.check_n_types(&sig, "return")?;
        self.drop_types_for_return(sig.len() as u32);
        self.env.istream.emit_opcode(Opcode::Return);
        self.reset_type_stack_to_limit();
        self.push_type(ValueType::Any);
        Ok(())
    }

    fn on_unreachable(&mut self) -> Result<(), LoadError> {
        self.env.istream.emit_opcode(Opcode::Unreachable);
        self.reset_type_stack_to_limit();
        self.push_type(ValueType::Any);
        Ok(())
    }

    // -----------------------------------------------------------------
    // Calls
    // -----------------------------------------------------------------

    fn on_call(&mut self, function_index: u32) -> Result<(), LoadError> {
        let env_func_index = self.translate_func_index(function_index)?;
        let sig_index = self.env.funcs[env_func_index as usize].sig_index();
        let sig = self.env.sigs[sig_index as usize].clone();

        self.check_type_stack_limit(sig.params.len(), "call")?;
        for i in (0..sig.params.len()).rev() {
            let arg = self.pop_type();
            self.check_type(sig.params[i], arg, "call")?;
        }

        let (is_host, offset) = match &self.env.funcs[env_func_index as usize] {
            Func::Host(_) => (true, 0),
            Func::Defined(func) => (false, func.offset),
        };
        if is_host {
            self.env.istream.emit_opcode(Opcode::CallHost);
            self.env.istream.emit_u32(env_func_index);
        } else {
            self.env.istream.emit_opcode(Opcode::Call);
            self.emit_func_offset(function_index, offset);
        }
        self.push_types(&sig.results);
        Ok(())
    }

    fn on_call_indirect(&mut self, type_index: u32) -> Result<(), LoadError> {
        let Some(table_index) = self.module().table_index else {
            return Err(LoadError::invalid(
                "found call_indirect operator, but no table",
            ));
        };
        let env_sig_index = self.translate_sig_index(type_index)?;
        let sig = self.env.sigs[env_sig_index as usize].clone();

        self.pop_and_check_1(ValueType::I32, "call_indirect")?;
        self.check_type_stack_limit(sig.params.len(), "call_indirect")?;
        for i in (0..sig.params.len()).rev() {
            let arg = self.pop_type();
            self.check_type(sig.params[i], arg, "call_indirect")?;
        }

        self.env.istream.emit_opcode(Opcode::CallIndirect);
        self.env.istream.emit_u32(table_index);
        self.env.istream.emit_u32(env_sig_index);
        self.push_types(&sig.results);
        Ok(())
    }

    // -----------------------------------------------------------------
    // Parametric, variable and memory operators
    // -----------------------------------------------------------------

    fn on_drop(&mut self) -> Result<(), LoadError> {
        self.check_type_stack_limit(1, "drop")?;
        self.env.istream.emit_opcode(Opcode::Drop);
        self.pop_type();
        Ok(())
    }

    fn on_select(&mut self) -> Result<(), LoadError> {
        self.pop_and_check_1(ValueType::I32, "select")?;
        self.check_type_stack_limit(2, "select")?;
        let right = self.pop_type();
        let left = self.pop_type();
        self.check_type(left, right, "select")?;
        self.env.istream.emit_opcode(Opcode::Select);
        self.push_type(left);
        Ok(())
    }

    fn on_local_get(&mut self, local_index: u32) -> Result<(), LoadError> {
        let ty = self.local_type(local_index)?;
        let depth = self.translate_local(local_index);
        self.env.istream.emit_opcode(Opcode::LocalGet);
        self.env.istream.emit_u32(depth);
        self.push_type(ty);
        Ok(())
    }

    fn on_local_set(&mut self, local_index: u32) -> Result<(), LoadError> {
        let ty = self.local_type(local_index)?;
        self.pop_and_check_1(ty, "local.set")?;
        let depth = self.translate_local(local_index);
        self.env.istream.emit_opcode(Opcode::LocalSet);
        self.env.istream.emit_u32(depth);
        Ok(())
    }

    fn on_local_tee(&mut self, local_index: u32) -> Result<(), LoadError> {
        let ty = self.local_type(local_index)?;
        self.check_type_stack_limit(1, "local.tee")?;
        let value = self.top_type();
        self.check_type(ty, value, "local.tee")?;
        let depth = self.translate_local(local_index);
        self.env.istream.emit_opcode(Opcode::LocalTee);
        self.env.istream.emit_u32(depth);
        Ok(())
    }

    fn on_global_get(&mut self, global_index: u32) -> Result<(), LoadError> {
        let env_index = self.translate_global_index(global_index)?;
        let ty = self.env.globals[env_index as usize].value.ty();
        self.env.istream.emit_opcode(Opcode::GlobalGet);
        self.env.istream.emit_u32(env_index);
        self.push_type(ty);
        Ok(())
    }

    fn on_global_set(&mut self, global_index: u32) -> Result<(), LoadError> {
        let env_index = self.translate_global_index(global_index)?;
        let global = &self.env.globals[env_index as usize];
        if !global.mutable {
            return Err(LoadError::invalid(format!(
                "can't global.set an immutable global at index {global_index}."
            )));
        }
        let ty = global.value.ty();
        self.pop_and_check_1(ty, "global.set")?;
        self.env.istream.emit_opcode(Opcode::GlobalSet);
        self.env.istream.emit_u32(env_index);
        Ok(())
    }

    fn on_memory_size(&mut self) -> Result<(), LoadError> {
        let memory_index = self.check_has_memory(Opcode::MemorySize)?;
        self.env.istream.emit_opcode(Opcode::MemorySize);
        self.env.istream.emit_u32(memory_index);
        self.push_type(ValueType::I32);
        Ok(())
    }

    fn on_memory_grow(&mut self) -> Result<(), LoadError> {
        let memory_index = self.check_has_memory(Opcode::MemoryGrow)?;
        self.pop_and_check_1(ValueType::I32, "memory.grow")?;
        self.env.istream.emit_opcode(Opcode::MemoryGrow);
        self.env.istream.emit_u32(memory_index);
        self.push_type(ValueType::I32);
        Ok(())
    }

    // -----------------------------------------------------------------
    // Operator dispatch
    // -----------------------------------------------------------------

    pub(super) fn lower_op(&mut self, op: &Operator) -> Result<(), LoadError> {
        use ValueType::{F32, F64, I32, I64};

        if self.current_func.is_none() {
            return Err(LoadError::invalid("operator after end of function"));
        }

        match op {
            Operator::Nop => {}
            Operator::Unreachable => self.on_unreachable()?,
            Operator::Block { blockty } => {
                let sig = self.block_sig(*blockty)?;
                self.push_label(LabelKind::Block, sig, INVALID_OFFSET, INVALID_OFFSET);
            }
            Operator::Loop { blockty } => {
                let sig = self.block_sig(*blockty)?;
                // Branches to a loop jump back to its entry.
                let offset = self.env.istream.len();
                self.push_label(LabelKind::Loop, sig, offset, INVALID_OFFSET);
            }
            Operator::If { blockty } => self.on_if(*blockty)?,
            Operator::Else => self.on_else()?,
            Operator::End => self.on_end()?,
            Operator::Br { relative_depth } => self.on_br(*relative_depth)?,
            Operator::BrIf { relative_depth } => self.on_br_if(*relative_depth)?,
            Operator::BrTable { targets } => self.on_br_table(targets)?,
            Operator::Return => self.on_return()?,
            Operator::Call { function_index } => self.on_call(*function_index)?,
            Operator::CallIndirect { type_index, .. } => self.on_call_indirect(*type_index)?,

            Operator::Drop => self.on_drop()?,
            Operator::Select => self.on_select()?,

            Operator::LocalGet { local_index } => self.on_local_get(*local_index)?,
            Operator::LocalSet { local_index } => self.on_local_set(*local_index)?,
            Operator::LocalTee { local_index } => self.on_local_tee(*local_index)?,
            Operator::GlobalGet { global_index } => self.on_global_get(*global_index)?,
            Operator::GlobalSet { global_index } => self.on_global_set(*global_index)?,

            Operator::I32Const { value } => {
                self.env.istream.emit_opcode(Opcode::I32Const);
                self.env.istream.emit_u32(*value as u32);
                self.push_type(I32);
            }
            Operator::I64Const { value } => {
                self.env.istream.emit_opcode(Opcode::I64Const);
                self.env.istream.emit_u64(*value as u64);
                self.push_type(I64);
            }
            Operator::F32Const { value } => {
                self.env.istream.emit_opcode(Opcode::F32Const);
                self.env.istream.emit_u32(value.bits());
                self.push_type(F32);
            }
            Operator::F64Const { value } => {
                self.env.istream.emit_opcode(Opcode::F64Const);
                self.env.istream.emit_u64(value.bits());
                self.push_type(F64);
            }

            Operator::MemorySize { .. } => self.on_memory_size()?,
            Operator::MemoryGrow { .. } => self.on_memory_grow()?,

            Operator::I32Load { memarg } => self.load(Opcode::I32Load, I32, 4, memarg)?,
            Operator::I64Load { memarg } => self.load(Opcode::I64Load, I64, 8, memarg)?,
            Operator::F32Load { memarg } => self.load(Opcode::F32Load, F32, 4, memarg)?,
            Operator::F64Load { memarg } => self.load(Opcode::F64Load, F64, 8, memarg)?,
            Operator::I32Load8S { memarg } => self.load(Opcode::I32Load8S, I32, 1, memarg)?,
            Operator::I32Load8U { memarg } => self.load(Opcode::I32Load8U, I32, 1, memarg)?,
            Operator::I32Load16S { memarg } => self.load(Opcode::I32Load16S, I32, 2, memarg)?,
            Operator::I32Load16U { memarg } => self.load(Opcode::I32Load16U, I32, 2, memarg)?,
            Operator::I64Load8S { memarg } => self.load(Opcode::I64Load8S, I64, 1, memarg)?,
            Operator::I64Load8U { memarg } => self.load(Opcode::I64Load8U, I64, 1, memarg)?,
            Operator::I64Load16S { memarg } => self.load(Opcode::I64Load16S, I64, 2, memarg)?,
            Operator::I64Load16U { memarg } => self.load(Opcode::I64Load16U, I64, 2, memarg)?,
            Operator::I64Load32S { memarg } => self.load(Opcode::I64Load32S, I64, 4, memarg)?,
            Operator::I64Load32U { memarg } => self.load(Opcode::I64Load32U, I64, 4, memarg)?,

            Operator::I32Store { memarg } => self.store(Opcode::I32Store, I32, 4, memarg)?,
            Operator::I64Store { memarg } => self.store(Opcode::I64Store, I64, 8, memarg)?,
            Operator::F32Store { memarg } => self.store(Opcode::F32Store, F32, 4, memarg)?,
            Operator::F64Store { memarg } => self.store(Opcode::F64Store, F64, 8, memarg)?,
            Operator::I32Store8 { memarg } => self.store(Opcode::I32Store8, I32, 1, memarg)?,
            Operator::I32Store16 { memarg } => self.store(Opcode::I32Store16, I32, 2, memarg)?,
            Operator::I64Store8 { memarg } => self.store(Opcode::I64Store8, I64, 1, memarg)?,
            Operator::I64Store16 { memarg } => self.store(Opcode::I64Store16, I64, 2, memarg)?,
            Operator::I64Store32 { memarg } => self.store(Opcode::I64Store32, I64, 4, memarg)?,

            Operator::I32Eqz => self.unary(Opcode::I32Eqz, I32, I32)?,
            Operator::I32Eq => self.binary(Opcode::I32Eq, I32, I32, I32)?,
            Operator::I32Ne => self.binary(Opcode::I32Ne, I32, I32, I32)?,
            Operator::I32LtS => self.binary(Opcode::I32LtS, I32, I32, I32)?,
            Operator::I32LtU => self.binary(Opcode::I32LtU, I32, I32, I32)?,
            Operator::I32GtS => self.binary(Opcode::I32GtS, I32, I32, I32)?,
            Operator::I32GtU => self.binary(Opcode::I32GtU, I32, I32, I32)?,
            Operator::I32LeS => self.binary(Opcode::I32LeS, I32, I32, I32)?,
            Operator::I32LeU => self.binary(Opcode::I32LeU, I32, I32, I32)?,
            Operator::I32GeS => self.binary(Opcode::I32GeS, I32, I32, I32)?,
            Operator::I32GeU => self.binary(Opcode::I32GeU, I32, I32, I32)?,
            Operator::I32Clz => self.unary(Opcode::I32Clz, I32, I32)?,
            Operator::I32Ctz => self.unary(Opcode::I32Ctz, I32, I32)?,
            Operator::I32Popcnt => self.unary(Opcode::I32Popcnt, I32, I32)?,
            Operator::I32Add => self.binary(Opcode::I32Add, I32, I32, I32)?,
            Operator::I32Sub => self.binary(Opcode::I32Sub, I32, I32, I32)?,
            Operator::I32Mul => self.binary(Opcode::I32Mul, I32, I32, I32)?,
            Operator::I32DivS => self.binary(Opcode::I32DivS, I32, I32, I32)?,
            Operator::I32DivU => self.binary(Opcode::I32DivU, I32, I32, I32)?,
            Operator::I32RemS => self.binary(Opcode::I32RemS, I32, I32, I32)?,
            Operator::I32RemU => self.binary(Opcode::I32RemU, I32, I32, I32)?,
            Operator::I32And => self.binary(Opcode::I32And, I32, I32, I32)?,
            Operator::I32Or => self.binary(Opcode::I32Or, I32, I32, I32)?,
            Operator::I32Xor => self.binary(Opcode::I32Xor, I32, I32, I32)?,
            Operator::I32Shl => self.binary(Opcode::I32Shl, I32, I32, I32)?,
            Operator::I32ShrS => self.binary(Opcode::I32ShrS, I32, I32, I32)?,
            Operator::I32ShrU => self.binary(Opcode::I32ShrU, I32, I32, I32)?,
            Operator::I32Rotl => self.binary(Opcode::I32Rotl, I32, I32, I32)?,
            Operator::I32Rotr => self.binary(Opcode::I32Rotr, I32, I32, I32)?,

            Operator::I64Eqz => self.unary(Opcode::I64Eqz, I64, I32)?,
            Operator::I64Eq => self.binary(Opcode::I64Eq, I64, I64, I32)?,
            Operator::I64Ne => self.binary(Opcode::I64Ne, I64, I64, I32)?,
            Operator::I64LtS => self.binary(Opcode::I64LtS, I64, I64, I32)?,
            Operator::I64LtU => self.binary(Opcode::I64LtU, I64, I64, I32)?,
            Operator::I64GtS => self.binary(Opcode::I64GtS, I64, I64, I32)?,
            Operator::I64GtU => self.binary(Opcode::I64GtU, I64, I64, I32)?,
            Operator::I64LeS => self.binary(Opcode::I64LeS, I64, I64, I32)?,
            Operator::I64LeU => self.binary(Opcode::I64LeU, I64, I64, I32)?,
            Operator::I64GeS => self.binary(Opcode::I64GeS, I64, I64, I32)?,
            Operator::I64GeU => self.binary(Opcode::I64GeU, I64, I64, I32)?,
            Operator::I64Clz => self.unary(Opcode::I64Clz, I64, I64)?,
            Operator::I64Ctz => self.unary(Opcode::I64Ctz, I64, I64)?,
            Operator::I64Popcnt => self.unary(Opcode::I64Popcnt, I64, I64)?,
            Operator::I64Add => self.binary(Opcode::I64Add, I64, I64, I64)?,
            Operator::I64Sub => self.binary(Opcode::I64Sub, I64, I64, I64)?,
            Operator::I64Mul => self.binary(Opcode::I64Mul, I64, I64, I64)?,
            Operator::I64DivS => self.binary(Opcode::I64DivS, I64, I64, I64)?,
            Operator::I64DivU => self.binary(Opcode::I64DivU, I64, I64, I64)?,
            Operator::I64RemS => self.binary(Opcode::I64RemS, I64, I64, I64)?,
            Operator::I64RemU => self.binary(Opcode::I64RemU, I64, I64, I64)?,
            Operator::I64And => self.binary(Opcode::I64And, I64, I64, I64)?,
            Operator::I64Or => self.binary(Opcode::I64Or, I64, I64, I64)?,
            Operator::I64Xor => self.binary(Opcode::I64Xor, I64, I64, I64)?,
            Operator::I64Shl => self.binary(Opcode::I64Shl, I64, I64, I64)?,
            Operator::I64ShrS => self.binary(Opcode::I64ShrS, I64, I64, I64)?,
            Operator::I64ShrU => self.binary(Opcode::I64ShrU, I64, I64, I64)?,
            Operator::I64Rotl => self.binary(Opcode::I64Rotl, I64, I64, I64)?,
            Operator::I64Rotr => self.binary(Opcode::I64Rotr, I64, I64, I64)?,

            Operator::F32Eq => self.binary(Opcode::F32Eq, F32, F32, I32)?,
            Operator::F32Ne => self.binary(Opcode::F32Ne, F32, F32, I32)?,
            Operator::F32Lt => self.binary(Opcode::F32Lt, F32, F32, I32)?,
            Operator::F32Gt => self.binary(Opcode::F32Gt, F32, F32, I32)?,
            Operator::F32Le => self.binary(Opcode::F32Le, F32, F32, I32)?,
            Operator::F32Ge => self.binary(Opcode::F32Ge, F32, F32, I32)?,
            Operator::F32Abs => self.unary(Opcode::F32Abs, F32, F32)?,
            Operator::F32Neg => self.unary(Opcode::F32Neg, F32, F32)?,
            Operator::F32Ceil => self.unary(Opcode::F32Ceil, F32, F32)?,
            Operator::F32Floor => self.unary(Opcode::F32Floor, F32, F32)?,
            Operator::F32Trunc => self.unary(Opcode::F32Trunc, F32, F32)?,
            Operator::F32Nearest => self.unary(Opcode::F32Nearest, F32, F32)?,
            Operator::F32Sqrt => self.unary(Opcode::F32Sqrt, F32, F32)?,
            Operator::F32Add => self.binary(Opcode::F32Add, F32, F32, F32)?,
            Operator::F32Sub => self.binary(Opcode::F32Sub, F32, F32, F32)?,
            Operator::F32Mul => self.binary(Opcode::F32Mul, F32, F32, F32)?,
            Operator::F32Div => self.binary(Opcode::F32Div, F32, F32, F32)?,
            Operator::F32Min => self.binary(Opcode::F32Min, F32, F32, F32)?,
            Operator::F32Max => self.binary(Opcode::F32Max, F32, F32, F32)?,
            Operator::F32Copysign => self.binary(Opcode::F32Copysign, F32, F32, F32)?,

            Operator::F64Eq => self.binary(Opcode::F64Eq, F64, F64, I32)?,
            Operator::F64Ne => self.binary(Opcode::F64Ne, F64, F64, I32)?,
            Operator::F64Lt => self.binary(Opcode::F64Lt, F64, F64, I32)?,
            Operator::F64Gt => self.binary(Opcode::F64Gt, F64, F64, I32)?,
            Operator::F64Le => self.binary(Opcode::F64Le, F64, F64, I32)?,
            Operator::F64Ge => self.binary(Opcode::F64Ge, F64, F64, I32)?,
            Operator::F64Abs => self.unary(Opcode::F64Abs, F64, F64)?,
            Operator::F64Neg => self.unary(Opcode::F64Neg, F64, F64)?,
            Operator::F64Ceil => self.unary(Opcode::F64Ceil, F64, F64)?,
            Operator::F64Floor => self.unary(Opcode::F64Floor, F64, F64)?,
            Operator::F64Trunc => self.unary(Opcode::F64Trunc, F64, F64)?,
            Operator::F64Nearest => self.unary(Opcode::F64Nearest, F64, F64)?,
            Operator::F64Sqrt => self.unary(Opcode::F64Sqrt, F64, F64)?,
            Operator::F64Add => self.binary(Opcode::F64Add, F64, F64, F64)?,
            Operator::F64Sub => self.binary(Opcode::F64Sub, F64, F64, F64)?,
            Operator::F64Mul => self.binary(Opcode::F64Mul, F64, F64, F64)?,
            Operator::F64Div => self.binary(Opcode::F64Div, F64, F64, F64)?,
            Operator::F64Min => self.binary(Opcode::F64Min, F64, F64, F64)?,
            Operator::F64Max => self.binary(Opcode::F64Max, F64, F64, F64)?,
            Operator::F64Copysign => self.binary(Opcode::F64Copysign, F64, F64, F64)?,

            Operator::I32WrapI64 => self.unary(Opcode::I32WrapI64, I64, I32)?,
            Operator::I32TruncF32S => self.unary(Opcode::I32TruncF32S, F32, I32)?,
            Operator::I32TruncF32U => self.unary(Opcode::I32TruncF32U, F32, I32)?,
            Operator::I32TruncF64S => self.unary(Opcode::I32TruncF64S, F64, I32)?,
            Operator::I32TruncF64U => self.unary(Opcode::I32TruncF64U, F64, I32)?,
            Operator::I64ExtendI32S => self.unary(Opcode::I64ExtendI32S, I32, I64)?,
            Operator::I64ExtendI32U => self.unary(Opcode::I64ExtendI32U, I32, I64)?,
            Operator::I64TruncF32S => self.unary(Opcode::I64TruncF32S, F32, I64)?,
            Operator::I64TruncF32U => self.unary(Opcode::I64TruncF32U, F32, I64)?,
            Operator::I64TruncF64S => self.unary(Opcode::I64TruncF64S, F64, I64)?,
            Operator::I64TruncF64U => self.unary(Opcode::I64TruncF64U, F64, I64)?,
            Operator::F32ConvertI32S => self.unary(Opcode::F32ConvertI32S, I32, F32)?,
            Operator::F32ConvertI32U => self.unary(Opcode::F32ConvertI32U, I32, F32)?,
            Operator::F32ConvertI64S => self.unary(Opcode::F32ConvertI64S, I64, F32)?,
            Operator::F32ConvertI64U => self.unary(Opcode::F32ConvertI64U, I64, F32)?,
            Operator::F32DemoteF64 => self.unary(Opcode::F32DemoteF64, F64, F32)?,
            Operator::F64ConvertI32S => self.unary(Opcode::F64ConvertI32S, I32, F64)?,
            Operator::F64ConvertI32U => self.unary(Opcode::F64ConvertI32U, I32, F64)?,
            Operator::F64ConvertI64S => self.unary(Opcode::F64ConvertI64S, I64, F64)?,
            Operator::F64ConvertI64U => self.unary(Opcode::F64ConvertI64U, I64, F64)?,
            Operator::F64PromoteF32 => self.unary(Opcode::F64PromoteF32, F32, F64)?,
            Operator::I32ReinterpretF32 => self.unary(Opcode::I32ReinterpretF32, F32, I32)?,
            Operator::I64ReinterpretF64 => self.unary(Opcode::I64ReinterpretF64, F64, I64)?,
            Operator::F32ReinterpretI32 => self.unary(Opcode::F32ReinterpretI32, I32, F32)?,
            Operator::F64ReinterpretI64 => self.unary(Opcode::F64ReinterpretI64, I64, F64)?,

            op => {
                return Err(LoadError::invalid(format!("unsupported opcode {op:?}")));
            }
        }
        Ok(())
    }
}

fn address_offset(memarg: &MemArg) -> Result<u32, LoadError> {
    u32::try_from(memarg.offset)
        .map_err(|_| LoadError::invalid("memory offset out of 32-bit range"))
}
