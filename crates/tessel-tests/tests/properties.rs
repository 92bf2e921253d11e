//! The host-level guarantees an embedder relies on, each checked end to end
//! through `Host`.

use std::sync::Arc;

use tessel_core::{
    ExternRef, FuncType, Host, Imports, ParseError, Value, ValueType, WasmTrap, PAGE_SIZE,
};
use tessel_tests::{call_i32, instantiate, instantiate_with, ARITH, INDIRECT_CALL};

#[test]
fn test_minimal_module_returns_constant() {
    let host = Host::default();
    let bytes = wat::parse_str(r#"(module (func (export "answer") (result i32) i32.const 42))"#)
        .unwrap();
    let module = host.load(&bytes).unwrap();
    let mut instance = host.instantiate(&module, &Imports::new()).unwrap();
    assert_eq!(
        host.call(&mut instance, "answer", &[]).unwrap(),
        vec![Value::I32(42)]
    );
}

#[test]
fn test_wrong_magic_is_rejected() {
    let host = Host::default();
    for bytes in [
        &b"\0wsm\x01\0\0\0"[..],
        &b"\0asm\x02\0\0\0"[..],
        &b"\0as"[..],
        &[][..],
    ] {
        assert!(
            matches!(host.load(bytes), Err(ParseError::InvalidHeader)),
            "{bytes:?}"
        );
    }
}

#[test]
fn test_add_wraps_on_overflow() {
    let mut m = instantiate(ARITH);
    assert_eq!(call_i32(&mut m, "add", &[Value::I32(2), Value::I32(3)]), 5);
    assert_eq!(
        call_i32(&mut m, "add", &[Value::I32(i32::MAX), Value::I32(1)]),
        i32::MIN
    );
}

#[test]
fn test_indirect_signature_mismatch_skips_callee() {
    let mut m = instantiate(INDIRECT_CALL);
    // Slot 3 holds a unary function; the call site expects a binary one.
    let err = m
        .call("dispatch_binop", &[Value::I32(1), Value::I32(2), Value::I32(3)])
        .unwrap_err();
    assert_eq!(err.trap_kind(), Some(WasmTrap::IndirectCallTypeMismatch));
    assert_eq!(m.global("calls"), Some(Value::I32(0)));
}

#[test]
fn test_externref_handles_stay_in_their_instance() {
    let wat = r#"(module
        (global $held (mut externref) (ref.null extern))
        (func (export "hold") (param externref)
          local.get 0
          global.set $held)
        (func (export "held") (result externref)
          global.get $held))"#;
    let host = Host::default();
    let module = host.load(&wat::parse_str(wat).unwrap()).unwrap();
    let mut a_instance = host.instantiate(&module, &Imports::new()).unwrap();
    let mut b_instance = host.instantiate(&module, &Imports::new()).unwrap();

    let a = ExternRef::new("A");
    let b = ExternRef::new("B");
    host.call(&mut a_instance, "hold", &[Value::from(a.clone())]).unwrap();
    assert_eq!(
        host.call(&mut b_instance, "held", &[]).unwrap(),
        vec![Value::ExternRef(None)]
    );
    host.call(&mut b_instance, "hold", &[Value::from(b.clone())]).unwrap();

    let held_a = host.call(&mut a_instance, "held", &[]).unwrap();
    let held_b = host.call(&mut b_instance, "held", &[]).unwrap();
    assert_eq!(held_a, vec![Value::from(a)]);
    assert_eq!(held_b, vec![Value::from(b)]);
}

#[test]
fn test_memory_boundary() {
    let wat = r#"(module
        (memory 1)
        (func (export "load32") (param i32) (result i32)
          local.get 0
          i32.load)
        (func (export "load64") (param i32) (result i64)
          local.get 0
          i64.load)
        (func (export "load8") (param i32) (result i32)
          local.get 0
          i32.load8_u))"#;
    let mut m = instantiate(wat);
    let size = PAGE_SIZE as i32;
    for (name, width) in [("load8", 1), ("load32", 4), ("load64", 8)] {
        assert!(m.call(name, &[Value::I32(size - width)]).is_ok(), "{name}");
        let err = m.call(name, &[Value::I32(size)]).unwrap_err();
        assert_eq!(err.trap_kind(), Some(WasmTrap::MemoryOutOfBounds), "{name}");
        let err = m.call(name, &[Value::I32(size - width + 1)]).unwrap_err();
        assert_eq!(err.trap_kind(), Some(WasmTrap::MemoryOutOfBounds), "{name}");
    }
}

#[test]
fn test_reentrant_host_call_final_state() {
    let wat = r#"(module
        (import "env" "again" (func $again (param i32)))
        (memory (export "mem") 1)
        (global $depth (export "depth") (mut i32) (i32.const 0))
        (func (export "enter") (param $n i32)
          global.get $depth
          i32.const 1
          i32.add
          global.set $depth
          ;; mem[4 * depth] = n
          global.get $depth
          i32.const 4
          i32.mul
          local.get $n
          i32.store
          local.get $n
          if
            local.get $n
            i32.const 1
            i32.sub
            call $again
          end))"#;
    let mut imports = Imports::new();
    imports.func(
        "env",
        "again",
        FuncType::new([ValueType::I32], []),
        |caller, args| {
            caller.call("enter", args)?;
            Ok(Vec::new())
        },
    );
    let mut m = instantiate_with(wat, &imports);
    m.call("enter", &[Value::I32(3)]).unwrap();

    // enter(3) -> host -> enter(2) -> host -> enter(1) -> host -> enter(0)
    assert_eq!(m.global("depth"), Some(Value::I32(4)));
    let memory = m.memory().unwrap();
    let stored: Vec<i32> = (1..=4).map(|i| memory.load_i32(i * 4).unwrap()).collect();
    assert_eq!(stored, vec![3, 2, 1, 0]);
}

#[test]
fn test_instances_share_module_not_state() {
    let host = Host::default();
    let module = host.load(&wat::parse_str(ARITH).unwrap()).unwrap();
    let first = host.instantiate(&module, &Imports::new()).unwrap();
    let second = host.instantiate(&module, &Imports::new()).unwrap();
    assert!(Arc::ptr_eq(first.module(), second.module()));
}
