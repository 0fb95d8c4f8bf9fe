use super::link::check_import_limits;
use super::read_binary_interpreter;
use crate::env::{Environment, Limits};
use crate::error::LoadError;
use crate::istream::{BR_TABLE_ENTRY_SIZE, INVALID_INDEX};
use crate::opcode::Opcode;

fn load(wat_text: &str) -> (Environment, usize) {
    let bytes = wat::parse_str(wat_text).unwrap();
    let mut env = Environment::new();
    let index = read_binary_interpreter(&mut env, &bytes).unwrap();
    (env, index)
}

fn load_err(wat_text: &str) -> LoadError {
    let bytes = wat::parse_str(wat_text).unwrap();
    let mut env = Environment::new();
    read_binary_interpreter(&mut env, &bytes).unwrap_err()
}

fn module_istream(env: &Environment, index: usize) -> &[u8] {
    let module = env.modules[index].as_defined().unwrap();
    &env.istream.as_slice()[module.istream_start as usize..module.istream_end as usize]
}

/// Builder for expected istream bytes.
struct Stream(Vec<u8>);

impl Stream {
    fn new() -> Stream {
        Stream(Vec::new())
    }
    fn op(mut self, opcode: Opcode) -> Stream {
        self.0.push(opcode as u8);
        self
    }
    fn u8(mut self, value: u8) -> Stream {
        self.0.push(value);
        self
    }
    fn u32(mut self, value: u32) -> Stream {
        self.0.extend_from_slice(&value.to_le_bytes());
        self
    }
    fn u64(mut self, value: u64) -> Stream {
        self.0.extend_from_slice(&value.to_le_bytes());
        self
    }
}

#[test]
fn identity_function() {
    let (env, index) = load(
        r#"
        (module
            (func (export "id") (param i32) (result i32)
                local.get 0))
    "#,
    );
    // The parameter sits one below the pushed copy, so local.get
    // addresses depth 1; the return keeps the single result.
    let expected = Stream::new()
        .op(Opcode::LocalGet)
        .u32(1)
        .op(Opcode::DropKeep)
        .u32(1)
        .u8(1)
        .op(Opcode::Return);
    assert_eq!(module_istream(&env, index), expected.0);
}

#[test]
fn add_function() {
    let (env, index) = load(
        r#"
        (module
            (func (export "add") (param i32 i32) (result i32)
                local.get 0
                local.get 1
                i32.add))
    "#,
    );
    let expected = Stream::new()
        .op(Opcode::LocalGet)
        .u32(2)
        .op(Opcode::LocalGet)
        .u32(2)
        .op(Opcode::I32Add)
        .op(Opcode::DropKeep)
        .u32(2)
        .u8(1)
        .op(Opcode::Return);
    assert_eq!(module_istream(&env, index), expected.0);
}

#[test]
fn unreachable_body_is_polymorphic() {
    // The body never produces the declared i32; the synthetic `any`
    // left by unreachable satisfies the implicit return.
    let (env, index) = load(
        r#"
        (module
            (func (result i32)
                unreachable))
    "#,
    );
    let expected = Stream::new().op(Opcode::Unreachable).op(Opcode::Return);
    assert_eq!(module_istream(&env, index), expected.0);
}

#[test]
fn if_else_lowering() {
    let (env, index) = load(
        r#"
        (module
            (func (param i32) (result i32)
                local.get 0
                if (result i32)
                    i32.const 1
                else
                    i32.const 2
                end))
    "#,
    );
    // 0: local.get 1
    // 5: br_unless -> 20 (start of else arm)
    // 10: i32.const 1
    // 15: br -> 25 (end of if)
    // 20: i32.const 2
    // 25: drop_keep 1 1; return
    let expected = Stream::new()
        .op(Opcode::LocalGet)
        .u32(1)
        .op(Opcode::BrUnless)
        .u32(20)
        .op(Opcode::I32Const)
        .u32(1)
        .op(Opcode::Br)
        .u32(25)
        .op(Opcode::I32Const)
        .u32(2)
        .op(Opcode::DropKeep)
        .u32(1)
        .u8(1)
        .op(Opcode::Return);
    assert_eq!(module_istream(&env, index), expected.0);
}

#[test]
fn if_else_arm_type_mismatch() {
    let err = load_err(
        r#"
        (module
            (func (param i32) (result i32)
                local.get 0
                if (result i32)
                    i32.const 1
                else
                    i64.const 2
                end))
    "#,
    );
    assert_eq!(
        err,
        LoadError::Invalid(
            "type mismatch in if false branch, expected i32 but got i64.".to_string()
        )
    );
}

#[test]
fn br_table_layout() {
    let (env, index) = load(
        r#"
        (module
            (func (param i32)
                block block block
                    local.get 0
                    br_table 0 1 2 3
                end end end))
    "#,
    );
    // Three explicit targets plus the default, 9 bytes each. Every
    // label ends at the same offset here, right before the return
    // prologue, so all four entries share the target.
    let entry_data_size = 4 * BR_TABLE_ENTRY_SIZE;
    let target = 19 + entry_data_size;
    let mut expected = Stream::new()
        .op(Opcode::LocalGet)
        .u32(1)
        .op(Opcode::BrTable)
        .u32(3)
        .u32(19)
        .op(Opcode::Data)
        .u32(entry_data_size);
    for _ in 0..4 {
        expected = expected.u32(target).u32(0).u8(0);
    }
    expected = expected.op(Opcode::Drop).op(Opcode::Return);
    assert_eq!(module_istream(&env, index), expected.0);
}

#[test]
fn br_table_depth_out_of_range() {
    let err = load_err(
        r#"
        (module
            (func (param i32)
                local.get 0
                br_table 0 5))
    "#,
    );
    assert_eq!(err, LoadError::Invalid("invalid depth: 5 (max 1)".to_string()));
}

#[test]
fn forward_br_is_patched() {
    let (env, index) = load(
        r#"
        (module
            (func
                block
                    br 0
                end))
    "#,
    );
    // The branch targets the block's end, known only when `end` is
    // reached; the fixup rewrites the placeholder to 5.
    let expected = Stream::new().op(Opcode::Br).u32(5).op(Opcode::Return);
    assert_eq!(module_istream(&env, index), expected.0);
}

#[test]
fn backward_br_targets_loop_entry() {
    let (env, index) = load(
        r#"
        (module
            (func
                block
                    loop
                        br 0
                    end
                end))
    "#,
    );
    let expected = Stream::new().op(Opcode::Br).u32(0).op(Opcode::Return);
    assert_eq!(module_istream(&env, index), expected.0);
}

#[test]
fn br_if_keeps_fallthrough_stack() {
    let (env, index) = load(
        r#"
        (module
            (func (param i32)
                local.get 0
                br_if 0))
    "#,
    );
    // br_if is flipped: br_unless skips the unconditional br so the
    // false path never drops values.
    let expected = Stream::new()
        .op(Opcode::LocalGet)
        .u32(1)
        .op(Opcode::BrUnless)
        .u32(15)
        .op(Opcode::Br)
        .u32(15)
        .op(Opcode::Drop)
        .op(Opcode::Return);
    assert_eq!(module_istream(&env, index), expected.0);
}

#[test]
fn call_fixups_both_directions() {
    let (env, index) = load(
        r#"
        (module
            (func (result i32) call 1)
            (func (result i32) i32.const 7)
            (func (result i32) call 1))
    "#,
    );
    // Function 1's body starts at 6: the forward call in function 0 is
    // patched when that body begins, the backward call in function 2
    // sees the offset directly.
    let expected = Stream::new()
        .op(Opcode::Call)
        .u32(6)
        .op(Opcode::Return)
        .op(Opcode::I32Const)
        .u32(7)
        .op(Opcode::Return)
        .op(Opcode::Call)
        .u32(6)
        .op(Opcode::Return);
    assert_eq!(module_istream(&env, index), expected.0);
}

#[test]
fn locals_get_one_alloca() {
    let (env, index) = load(
        r#"
        (module
            (func (param i32) (local i32)
                local.get 0
                local.set 1))
    "#,
    );
    let expected = Stream::new()
        .op(Opcode::Alloca)
        .u32(1)
        .op(Opcode::LocalGet)
        .u32(2)
        .op(Opcode::LocalSet)
        .u32(1)
        .op(Opcode::DropKeep)
        .u32(2)
        .u8(0)
        .op(Opcode::Return);
    assert_eq!(module_istream(&env, index), expected.0);
}

#[test]
fn const_immediates() {
    let (env, index) = load(
        r#"
        (module
            (func
                i64.const -1
                drop
                f32.const 1.5
                drop
                f64.const 0.5
                drop))
    "#,
    );
    let expected = Stream::new()
        .op(Opcode::I64Const)
        .u64(u64::MAX)
        .op(Opcode::Drop)
        .op(Opcode::F32Const)
        .u32(1.5f32.to_bits())
        .op(Opcode::Drop)
        .op(Opcode::F64Const)
        .u64(0.5f64.to_bits())
        .op(Opcode::Drop)
        .op(Opcode::Return);
    assert_eq!(module_istream(&env, index), expected.0);
}

#[test]
fn memory_ops_carry_memory_index() {
    let (env, index) = load(
        r#"
        (module
            (memory 1)
            (func (param i32) (result i32)
                local.get 0
                i32.load offset=8))
    "#,
    );
    let expected = Stream::new()
        .op(Opcode::LocalGet)
        .u32(1)
        .op(Opcode::I32Load)
        .u32(0)
        .u32(8)
        .op(Opcode::DropKeep)
        .u32(1)
        .u8(1)
        .op(Opcode::Return);
    assert_eq!(module_istream(&env, index), expected.0);
}

#[test]
fn alignment_must_not_exceed_natural() {
    let err = load_err(
        r#"
        (module
            (memory 1)
            (func (param i32)
                local.get 0
                i32.load align=8
                drop))
    "#,
    );
    assert_eq!(
        err,
        LoadError::Invalid(
            "alignment must not be larger than natural alignment (4)".to_string()
        )
    );
}

#[test]
fn load_requires_memory() {
    let err = load_err(
        r#"
        (module
            (func (param i32)
                local.get 0
                i32.load
                drop))
    "#,
    );
    assert_eq!(
        err,
        LoadError::Invalid("i32.load requires an imported or defined memory.".to_string())
    );
}

#[test]
fn operand_stack_underflow() {
    let err = load_err("(module (func i32.add))");
    assert_eq!(
        err,
        LoadError::Invalid(
            "type stack size too small at i32.add. got 0, expected at least 2".to_string()
        )
    );
}

#[test]
fn implicit_return_type_mismatch() {
    let err = load_err("(module (func (result i32) i64.const 1))");
    assert_eq!(
        err,
        LoadError::Invalid(
            "type mismatch in implicit return, expected i32 but got i64.".to_string()
        )
    );
}

#[test]
fn leftover_value_at_function_end() {
    let err = load_err("(module (func i32.const 1))");
    assert_eq!(
        err,
        LoadError::Invalid("type stack at end of func is 1. expected 0".to_string())
    );
}

#[test]
fn branch_depth_out_of_range() {
    let err = load_err("(module (func br 1))");
    assert_eq!(err, LoadError::Invalid("invalid depth: 1 (max 1)".to_string()));
}

#[test]
fn local_index_out_of_range() {
    let err = load_err("(module (func local.get 0 drop))");
    assert_eq!(
        err,
        LoadError::Invalid("invalid local_index: 0 (max 0)".to_string())
    );
}

#[test]
fn set_immutable_global() {
    let err = load_err(
        r#"
        (module
            (global i32 (i32.const 1))
            (func
                i32.const 2
                global.set 0))
    "#,
    );
    assert_eq!(
        err,
        LoadError::Invalid("can't global.set an immutable global at index 0.".to_string())
    );
}

#[test]
fn select_requires_matching_types() {
    let err = load_err(
        r#"
        (module
            (func (result i32)
                i32.const 1
                i64.const 2
                i32.const 0
                select))
    "#,
    );
    assert_eq!(
        err,
        LoadError::Invalid("type mismatch in select, expected i32 but got i64.".to_string())
    );
}

#[test]
fn global_init_must_match_declared_type() {
    let err = load_err("(module (global i32 (i64.const 1)))");
    assert_eq!(
        err,
        LoadError::Invalid("type mismatch in global, expected i32 but got i64.".to_string())
    );
}

#[test]
fn global_init_cannot_reference_defined_global() {
    let err = load_err(
        r#"
        (module
            (global i32 (i32.const 1))
            (global i32 (global.get 0)))
    "#,
    );
    assert_eq!(
        err,
        LoadError::Invalid(
            "initializer expression can only reference an imported global".to_string()
        )
    );
}

#[test]
fn start_function_must_be_nullary() {
    let err = load_err("(module (func (param i32)) (start 0))");
    assert_eq!(
        err,
        LoadError::Invalid("start function must be nullary".to_string())
    );

    let err = load_err("(module (func (result i32) i32.const 1) (start 0))");
    assert_eq!(
        err,
        LoadError::Invalid("start function must not return anything".to_string())
    );
}

#[test]
fn start_function_is_recorded() {
    let (env, index) = load("(module (func) (start 0))");
    let module = env.modules[index].as_defined().unwrap();
    assert_eq!(module.start_func_index, Some(0));
}

#[test]
fn duplicate_export_rejected() {
    let err = load_err(
        r#"
        (module
            (func)
            (export "f" (func 0))
            (export "f" (func 0)))
    "#,
    );
    assert_eq!(err, LoadError::Invalid("duplicate export \"f\"".to_string()));
}

#[test]
fn mutable_global_export_rejected() {
    let err = load_err(
        r#"
        (module
            (global (mut i32) (i32.const 1))
            (export "g" (global 0)))
    "#,
    );
    assert_eq!(
        err,
        LoadError::Invalid("mutable globals cannot be exported".to_string())
    );
}

#[test]
fn elem_segment_bounds() {
    let err = load_err(
        r#"
        (module
            (table 1 funcref)
            (func)
            (elem (i32.const 5) 0))
    "#,
    );
    assert_eq!(
        err,
        LoadError::Invalid("elem segment offset is out of bounds: 5 >= max value 1".to_string())
    );
}

#[test]
fn elem_segment_applied_in_second_pass() {
    let (env, index) = load(
        r#"
        (module
            (table 2 funcref)
            (func)
            (elem (i32.const 1) 0))
    "#,
    );
    let table_index = env.modules[index].table_index.unwrap();
    let table = &env.tables[table_index as usize];
    assert_eq!(table.func_indexes, vec![INVALID_INDEX, 0]);
}

#[test]
fn data_segment_bounds() {
    let err = load_err(
        r#"
        (module
            (memory 1)
            (data (i32.const 65536) "a"))
    "#,
    );
    assert_eq!(
        err,
        LoadError::Invalid(
            "data segment is out of bounds: [65536, 65537) >= max value 65536".to_string()
        )
    );
}

#[test]
fn data_segment_applied_in_second_pass() {
    let (env, index) = load(
        r#"
        (module
            (memory 1)
            (data (i32.const 3) "hi"))
    "#,
    );
    let memory_index = env.modules[index].memory_index.unwrap();
    let memory = &env.memories[memory_index as usize];
    assert_eq!(&memory.data[3..5], b"hi");
    assert_eq!(memory.data.len(), 65536);
}

#[test]
fn second_table_or_memory_rejected() {
    let err = load_err("(module (memory 1) (memory 1))");
    assert_eq!(err, LoadError::Invalid("only one memory allowed".to_string()));

    let err = load_err("(module (table 1 funcref) (table 1 funcref))");
    assert_eq!(err, LoadError::Invalid("only one table allowed".to_string()));
}

#[test]
fn call_indirect_requires_table() {
    let err = load_err(
        r#"
        (module
            (type (func))
            (func (param i32)
                local.get 0
                call_indirect (type 0)))
    "#,
    );
    assert_eq!(
        err,
        LoadError::Invalid("found call_indirect operator, but no table".to_string())
    );
}

#[test]
fn call_indirect_emits_table_and_sig() {
    let (env, index) = load(
        r#"
        (module
            (type (func))
            (table 1 funcref)
            (func (param i32)
                local.get 0
                call_indirect (type 0)))
    "#,
    );
    let expected = Stream::new()
        .op(Opcode::LocalGet)
        .u32(1)
        .op(Opcode::CallIndirect)
        .u32(0)
        .u32(0)
        .op(Opcode::Drop)
        .op(Opcode::Return);
    assert_eq!(module_istream(&env, index), expected.0);
}

#[test]
fn branch_targets_stay_inside_module_code() {
    let (env, index) = load(
        r#"
        (module
            (func (param i32)
                block
                    local.get 0
                    br_if 0
                    br 0
                end))
    "#,
    );
    let module = env.modules[index].as_defined().unwrap();
    let bytes = module_istream(&env, index);
    // Walk the stream and bounds-check every branch target.
    let mut pos = 0usize;
    while pos < bytes.len() {
        let op = bytes[pos];
        pos += 1;
        if op == Opcode::Br as u8 || op == Opcode::BrUnless as u8 {
            let target = u32::from_le_bytes(bytes[pos..pos + 4].try_into().unwrap());
            assert!(target >= module.istream_start && target < module.istream_end);
            pos += 4;
        } else if op == Opcode::LocalGet as u8 {
            pos += 4;
        }
    }
}

#[test]
fn import_limit_algebra() {
    let declared = |initial, max| Limits { initial, max };

    assert!(check_import_limits(&declared(1, None), &declared(1, None)).is_ok());
    assert!(check_import_limits(&declared(1, None), &declared(2, Some(5))).is_ok());
    assert!(check_import_limits(&declared(2, None), &declared(1, None)).is_err());
    assert!(check_import_limits(&declared(1, Some(5)), &declared(1, Some(5))).is_ok());
    assert!(check_import_limits(&declared(1, Some(5)), &declared(1, Some(6))).is_err());
    assert!(check_import_limits(&declared(1, Some(5)), &declared(1, None)).is_err());
    assert!(check_import_limits(&declared(1, Some(5)), &declared(3, Some(4))).is_ok());
}
