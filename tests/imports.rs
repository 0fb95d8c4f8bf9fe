use std::rc::Rc;

use wist::{
    read_binary_interpreter, Environment, Func, Global, HostCallback, HostImportDelegate, Import,
    Limits, LoadError, Memory, Opcode, Signature, Table, Value, INVALID_INDEX, PAGE_SIZE,
};

fn load(env: &mut Environment, wat_text: &str) -> Result<usize, anyhow::Error> {
    let bytes = wat::parse_str(wat_text)?;
    Ok(read_binary_interpreter(env, &bytes)?)
}

fn load_err(env: &mut Environment, wat_text: &str) -> LoadError {
    let bytes = wat::parse_str(wat_text).unwrap();
    read_binary_interpreter(env, &bytes).unwrap_err()
}

fn invalid(message: &str) -> LoadError {
    LoadError::Invalid(message.to_string())
}

/// Registers an exporting module under "a" and returns its environment.
fn env_with_module_a(wat_text: &str) -> Environment {
    let mut env = Environment::new();
    let index = load(&mut env, wat_text).unwrap();
    env.register_module("a", index);
    env
}

#[test]
fn import_global_from_module() -> Result<(), anyhow::Error> {
    let mut env = env_with_module_a(r#"(module (global (export "g") i32 (i32.const 7)))"#);

    let index = load(
        &mut env,
        r#"
        (module
            (import "a" "g" (global i32))
            (global i32 (global.get 0))
            (func (export "get") (result i32) global.get 0))
    "#,
    )?;

    // The importer's second global is initialized from the imported one.
    assert_eq!(env.globals.len(), 2);
    assert_eq!(env.globals[1].value, Value::I32(7));
    assert!(env.modules[index].export("get").is_some());
    Ok(())
}

#[test]
fn import_global_type_and_mutability_must_match() {
    let mut env = env_with_module_a(r#"(module (global (export "g") i32 (i32.const 7)))"#);

    let err = load_err(&mut env, r#"(module (import "a" "g" (global i64)))"#);
    assert_eq!(err, invalid("global type mismatch in import \"a.g\""));

    let err = load_err(&mut env, r#"(module (import "a" "g" (global (mut i32))))"#);
    assert_eq!(err, invalid("global mutability mismatch in import \"a.g\""));
}

#[test]
fn import_kind_must_match() {
    let mut env = env_with_module_a(r#"(module (global (export "g") i32 (i32.const 7)))"#);
    let err = load_err(&mut env, r#"(module (import "a" "g" (func)))"#);
    assert_eq!(
        err,
        invalid("expected import \"a.g\" to have kind func, not global")
    );
}

#[test]
fn unknown_module_and_field() {
    let mut env = env_with_module_a("(module)");

    let err = load_err(&mut env, r#"(module (import "b" "x" (func)))"#);
    assert_eq!(err, invalid("unknown import module \"b\""));

    let err = load_err(&mut env, r#"(module (import "a" "x" (func)))"#);
    assert_eq!(err, invalid("unknown module field \"x\""));
}

#[test]
fn import_func_signature_must_match_deeply() -> Result<(), anyhow::Error> {
    let mut env = env_with_module_a(
        r#"(module (func (export "f") (param i32) (result i32) local.get 0))"#,
    );

    // The importer declares the same shape under its own type index;
    // equality is structural through the environment's signature table.
    load(
        &mut env,
        r#"
        (module
            (type (func))
            (type (func (param i32) (result i32)))
            (import "a" "f" (func (type 1))))
    "#,
    )?;

    let err = load_err(&mut env, r#"(module (import "a" "f" (func (param i64))))"#);
    assert_eq!(err, invalid("import signature mismatch"));
    Ok(())
}

#[test]
fn import_table_and_memory_limits() {
    let env_text = r#"
        (module
            (table (export "t") 2 5 funcref)
            (memory (export "m") 1))
    "#;

    let mut env = env_with_module_a(env_text);
    load(
        &mut env,
        r#"
        (module
            (import "a" "t" (table 1 6 funcref))
            (import "a" "m" (memory 1)))
    "#,
    )
    .unwrap();

    let mut env = env_with_module_a(env_text);
    let err = load_err(&mut env, r#"(module (import "a" "t" (table 3 funcref)))"#);
    assert_eq!(err, invalid("actual size (2) smaller than declared (3)"));

    let mut env = env_with_module_a(env_text);
    let err = load_err(&mut env, r#"(module (import "a" "t" (table 1 4 funcref)))"#);
    assert_eq!(err, invalid("max size (5) larger than declared (4)"));

    let mut env = env_with_module_a(r#"(module (table (export "t") 2 funcref))"#);
    let err = load_err(&mut env, r#"(module (import "a" "t" (table 1 3 funcref)))"#);
    assert_eq!(err, invalid("max size (unspecified) larger than declared (3)"));
}

#[test]
fn failed_importer_never_mutates_the_exporter() -> Result<(), anyhow::Error> {
    let mut env = env_with_module_a(
        r#"
        (module
            (table (export "t") 2 funcref)
            (memory (export "m") 1)
            (func (export "f")))
    "#,
    );

    // The element segment validates, then the data segment is out of
    // bounds; the apply pass never runs.
    let err = load_err(
        &mut env,
        r#"
        (module
            (import "a" "t" (table 2 funcref))
            (import "a" "m" (memory 1))
            (import "a" "f" (func))
            (elem (i32.const 0) 0)
            (data (i32.const 65536) "x"))
    "#,
    );
    assert_eq!(
        err,
        invalid("data segment is out of bounds: [65536, 65537) >= max value 65536")
    );

    assert_eq!(env.tables[0].func_indexes, vec![INVALID_INDEX, INVALID_INDEX]);
    assert!(env.memories[0].data.iter().all(|&b| b == 0));
    Ok(())
}

#[test]
fn importer_elem_segment_lands_in_exporter_table() -> Result<(), anyhow::Error> {
    let mut env = env_with_module_a(
        r#"
        (module
            (table (export "t") 2 funcref)
            (func (export "f")))
    "#,
    );

    load(
        &mut env,
        r#"
        (module
            (import "a" "t" (table 2 funcref))
            (import "a" "f" (func))
            (func)
            (elem (i32.const 0) 0 1))
    "#,
    )?;

    // Module-local indices 0 (the import) and 1 (the definition) map to
    // environment functions 0 and 1.
    assert_eq!(env.tables[0].func_indexes, vec![0, 1]);
    Ok(())
}

// ---------------------------------------------------------------------
// Host modules
// ---------------------------------------------------------------------

struct TestHost;

impl HostImportDelegate for TestHost {
    fn import_func(&mut self, import: &Import, sig: &Signature) -> Result<HostCallback, String> {
        if import.field_name != "add" || sig.params.len() != 2 {
            return Err(format!("unknown host function \"{}\"", import.field_name));
        }
        Ok(Rc::new(|args: &[Value]| {
            let (Value::I32(a), Value::I32(b)) = (args[0], args[1]) else {
                return Err("expected two i32 arguments".to_string());
            };
            Ok(vec![Value::I32(a.wrapping_add(b))])
        }))
    }

    fn import_table(&mut self, _import: &Import, _table: &mut Table) -> Result<(), String> {
        Ok(())
    }

    fn import_memory(&mut self, _import: &Import, memory: &mut Memory) -> Result<(), String> {
        memory.page_limits = Limits {
            initial: 2,
            max: Some(4),
        };
        memory.data = vec![0; 2 * PAGE_SIZE as usize];
        Ok(())
    }

    fn import_global(&mut self, _import: &Import, global: &mut Global) -> Result<(), String> {
        global.value = Value::I32(42);
        Ok(())
    }
}

#[test]
fn host_func_import_emits_call_host() -> Result<(), anyhow::Error> {
    let mut env = Environment::new();
    env.append_host_module("host", Box::new(TestHost));

    let index = load(
        &mut env,
        r#"
        (module
            (import "host" "add" (func (param i32 i32) (result i32)))
            (func (export "five") (result i32)
                i32.const 2
                i32.const 3
                call 0))
    "#,
    )?;

    let module = env.modules[index].as_defined().unwrap();
    let code = &env.istream.as_slice()[module.istream_start as usize..module.istream_end as usize];
    let mut expected = Vec::new();
    expected.push(Opcode::I32Const as u8);
    expected.extend_from_slice(&2u32.to_le_bytes());
    expected.push(Opcode::I32Const as u8);
    expected.extend_from_slice(&3u32.to_le_bytes());
    expected.push(Opcode::CallHost as u8);
    expected.extend_from_slice(&0u32.to_le_bytes());
    expected.push(Opcode::Return as u8);
    assert_eq!(code, expected);

    // The delegate bound a live callback into the environment entry.
    let Func::Host(host) = &env.funcs[0] else {
        panic!("expected a host function");
    };
    let results = (host.callback)(&[Value::I32(2), Value::I32(3)]).unwrap();
    assert_eq!(results, vec![Value::I32(5)]);

    // The host module accumulated an export for the resolved import.
    assert!(env.modules[0].export("add").is_some());
    Ok(())
}

#[test]
fn host_delegate_failure_aborts_the_load() {
    let mut env = Environment::new();
    env.append_host_module("host", Box::new(TestHost));

    let err = load_err(&mut env, r#"(module (import "host" "nope" (func)))"#);
    assert_eq!(err, invalid("unknown host function \"nope\""));

    // Only the host module itself survives.
    assert_eq!(env.modules.len(), 1);
    assert!(env.funcs.is_empty());
}

#[test]
fn host_memory_global_and_table_imports() -> Result<(), anyhow::Error> {
    let mut env = Environment::new();
    env.append_host_module("host", Box::new(TestHost));

    let index = load(
        &mut env,
        r#"
        (module
            (import "host" "mem" (memory 1))
            (import "host" "g" (global i32))
            (import "host" "t" (table 1 funcref))
            (func (export "get") (result i32) global.get 0))
    "#,
    )?;

    // The delegate sized the memory to two pages, beyond the declared
    // minimum of one.
    assert_eq!(env.memories[0].data.len(), 2 * PAGE_SIZE as usize);
    assert_eq!(env.memories[0].page_limits.initial, 2);
    assert_eq!(env.globals[0].value, Value::I32(42));
    assert_eq!(env.tables[0].func_indexes, vec![INVALID_INDEX]);

    let module = &env.modules[index];
    assert_eq!(module.memory_index, Some(0));
    assert_eq!(module.table_index, Some(0));
    Ok(())
}
