use wist::{read_binary_interpreter, Environment, LoadError};

fn load(env: &mut Environment, wat_text: &str) -> Result<usize, anyhow::Error> {
    let bytes = wat::parse_str(wat_text)?;
    Ok(read_binary_interpreter(env, &bytes)?)
}

fn load_err(env: &mut Environment, wat_text: &str) -> LoadError {
    let bytes = wat::parse_str(wat_text).unwrap();
    read_binary_interpreter(env, &bytes).unwrap_err()
}

#[test]
fn empty_module() -> Result<(), anyhow::Error> {
    let mut env = Environment::new();
    let index = load(&mut env, "(module)")?;

    assert_eq!(env.modules.len(), 1);
    assert!(env.sigs.is_empty());
    assert!(env.funcs.is_empty());
    assert!(env.globals.is_empty());
    assert!(env.memories.is_empty());
    assert!(env.tables.is_empty());
    assert!(env.istream.is_empty());

    let module = env.modules[index].as_defined().unwrap();
    assert_eq!(module.istream_start, module.istream_end);
    Ok(())
}

#[test]
fn failed_load_rolls_the_environment_back() -> Result<(), anyhow::Error> {
    let mut env = Environment::new();
    let index = load(
        &mut env,
        r#"
        (module
            (global (export "g") i32 (i32.const 7))
            (memory (export "m") 1)
            (func (export "f") (result i32) i32.const 1))
    "#,
    )?;
    env.register_module("a", index);

    let sizes_before = (
        env.sigs.len(),
        env.funcs.len(),
        env.globals.len(),
        env.memories.len(),
        env.tables.len(),
        env.modules.len(),
        env.istream.as_slice().to_vec(),
    );

    // Imports resolve and code lowers, then the final body fails the
    // type check; every append must be undone.
    let err = load_err(
        &mut env,
        r#"
        (module
            (import "a" "g" (global i32))
            (import "a" "f" (func (result i32)))
            (memory 1)
            (global i32 (i32.const 3))
            (func (result i32) call 0 drop call 1)
            (func (result i32) i64.const 1))
    "#,
    );
    assert!(matches!(err, LoadError::Invalid(_)));

    let sizes_after = (
        env.sigs.len(),
        env.funcs.len(),
        env.globals.len(),
        env.memories.len(),
        env.tables.len(),
        env.modules.len(),
        env.istream.as_slice().to_vec(),
    );
    assert_eq!(sizes_before, sizes_after);
    Ok(())
}

#[test]
fn decode_errors_carry_an_offset() {
    let mut env = Environment::new();
    let err = read_binary_interpreter(&mut env, b"\x00asm\x01\x00\x00\x00\xff").unwrap_err();
    assert!(err.offset().is_some());
    assert!(env.modules.is_empty());
}

#[test]
fn module_is_independent_of_the_input_buffer() -> Result<(), anyhow::Error> {
    let mut bytes = wat::parse_str(
        r#"
        (module
            (func (export "three") (result i32) i32.const 3))
    "#,
    )?;
    let mut env = Environment::new();
    read_binary_interpreter(&mut env, &bytes)?;
    let istream_before = env.istream.as_slice().to_vec();
    let export_before = env.modules[0].export("three").unwrap().clone();

    for byte in bytes.iter_mut() {
        *byte = !*byte;
    }

    assert_eq!(env.istream.as_slice(), istream_before);
    let export_after = env.modules[0].export("three").unwrap();
    assert_eq!(export_after.name, export_before.name);
    assert_eq!(export_after.index, export_before.index);
    Ok(())
}

#[test]
fn istream_ranges_of_two_modules_do_not_overlap() -> Result<(), anyhow::Error> {
    let mut env = Environment::new();
    let first = load(&mut env, "(module (func (result i32) i32.const 1))")?;
    let second = load(&mut env, "(module (func (result i32) i32.const 2))")?;

    let a = env.modules[first].as_defined().unwrap();
    let b = env.modules[second].as_defined().unwrap();
    assert!(a.istream_start < a.istream_end);
    assert_eq!(a.istream_end, b.istream_start);
    assert_eq!(b.istream_end, env.istream.len());
    Ok(())
}

#[test]
fn function_count_must_match_body_count() {
    // A function section entry with no code entry leaves a dangling
    // signature; built by hand since the text format cannot express it.
    let mut module = Vec::new();
    module.extend_from_slice(b"\x00asm\x01\x00\x00\x00");
    // type section: one empty func type
    module.extend_from_slice(&[0x01, 0x04, 0x01, 0x60, 0x00, 0x00]);
    // function section: one function of type 0
    module.extend_from_slice(&[0x03, 0x02, 0x01, 0x00]);
    // no code section

    let mut env = Environment::new();
    let err = read_binary_interpreter(&mut env, &module).unwrap_err();
    assert_eq!(
        err,
        LoadError::Invalid(
            "function signature count and function body count mismatch".to_string()
        )
    );
    assert!(env.modules.is_empty());
}
