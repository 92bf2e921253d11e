//! Reference values crossing the host boundary: opaque `externref` handles
//! and `funcref`s handed back into the instance that produced them.

use std::sync::atomic::{AtomicU32, Ordering};

use tessel_core::{
    CallError, ExternRef, FuncRef, FuncType, HostError, Imports, Value, ValueType, WasmTrap,
};
use tessel_tests::{call_i32, instantiate, instantiate_with};

const HANDLES: &str = r#"(module
    (table $handles (export "handles") 4 externref)
    (func (export "store") (param i32 externref)
      local.get 0
      local.get 1
      table.set $handles)
    (func (export "fetch") (param i32) (result externref)
      local.get 0
      table.get $handles)
    (func (export "is_null") (param externref) (result i32)
      local.get 0
      ref.is_null)
    (func (export "identity") (param externref) (result externref)
      local.get 0)
    (func (export "grow") (param externref i32) (result i32)
      local.get 0
      local.get 1
      table.grow $handles)
    (func (export "size") (result i32)
      table.size $handles))"#;

fn handle(value: &Value) -> &ExternRef {
    value.as_externref().expect("non-null externref")
}

#[test]
fn test_handle_round_trips_unchanged() {
    let mut m = instantiate(HANDLES);
    let a = ExternRef::new(String::from("A"));
    let out = m.call("identity", &[Value::from(a.clone())]).unwrap();
    assert!(handle(&out[0]).ptr_eq(&a));
    assert_eq!(handle(&out[0]).downcast_ref::<String>().map(String::as_str), Some("A"));
}

#[test]
fn test_null_checks() {
    let mut m = instantiate(HANDLES);
    let a = ExternRef::new(1u8);
    assert_eq!(call_i32(&mut m, "is_null", &[Value::ExternRef(None)]), 1);
    assert_eq!(call_i32(&mut m, "is_null", &[Value::from(a)]), 0);
}

#[test]
fn test_instances_do_not_share_tables() {
    let a = ExternRef::new(String::from("A"));
    let b = ExternRef::new(String::from("B"));
    let mut first = instantiate(HANDLES);
    let mut second = instantiate(HANDLES);

    first.call("store", &[Value::I32(0), Value::from(a.clone())]).unwrap();
    second.call("store", &[Value::I32(1), Value::from(b.clone())]).unwrap();

    let from_first = first.call("fetch", &[Value::I32(0)]).unwrap();
    let from_second = second.call("fetch", &[Value::I32(1)]).unwrap();
    assert!(handle(&from_first[0]).ptr_eq(&a));
    assert!(handle(&from_second[0]).ptr_eq(&b));

    assert_eq!(second.table_get("handles", 0), Some(Value::ExternRef(None)));
    assert_eq!(first.table_get("handles", 1), Some(Value::ExternRef(None)));
}

#[test]
fn test_table_bounds_and_growth() {
    let mut m = instantiate(HANDLES);
    let a = ExternRef::new(());
    let err = m.call("fetch", &[Value::I32(4)]).unwrap_err();
    assert_eq!(err.trap_kind(), Some(WasmTrap::TableOutOfBounds));

    assert_eq!(call_i32(&mut m, "grow", &[Value::from(a.clone()), Value::I32(2)]), 4);
    assert_eq!(call_i32(&mut m, "size", &[]), 6);
    let grown = m.call("fetch", &[Value::I32(5)]).unwrap();
    assert!(handle(&grown[0]).ptr_eq(&a));
}

#[test]
fn test_host_sees_its_own_handle() {
    let mut imports = Imports::new();
    imports.func(
        "env",
        "bump",
        FuncType::new([ValueType::ExternRef], []),
        |_caller, args| {
            let counter = args
                .first()
                .and_then(Value::as_externref)
                .and_then(|r| r.downcast_ref::<AtomicU32>())
                .ok_or_else(|| HostError::custom("expected a counter handle"))?;
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Vec::new())
        },
    );
    let mut m = instantiate_with(
        r#"(module
            (import "env" "bump" (func $bump (param externref)))
            (func (export "twice") (param externref)
              local.get 0
              call $bump
              local.get 0
              call $bump))"#,
        &imports,
    );
    let counter = ExternRef::new(AtomicU32::new(0));
    m.call("twice", &[Value::from(counter.clone())]).unwrap();
    let count = counter.downcast_ref::<AtomicU32>().unwrap();
    assert_eq!(count.load(Ordering::SeqCst), 2);

    assert!(matches!(
        m.call("twice", &[Value::ExternRef(None)]),
        Err(CallError::Host(_))
    ));
}

// ── funcref ──

const FUNCS: &str = r#"(module
    (type $t (func (result i32)))
    (table $funcs 1 funcref)
    (elem declare func $seven)
    (func $seven (result i32)
      i32.const 7)
    (func (export "get_ref") (result funcref)
      ref.func $seven)
    (func (export "install_and_call") (param funcref) (result i32)
      i32.const 0
      local.get 0
      table.set $funcs
      i32.const 0
      call_indirect $funcs (type $t)))"#;

#[test]
fn test_funcref_round_trip() {
    let mut m = instantiate(FUNCS);
    let func = m.call("get_ref", &[]).unwrap();
    assert!(matches!(func[0], Value::FuncRef(Some(FuncRef { func_index: 0, .. }))));
    assert_eq!(call_i32(&mut m, "install_and_call", &func), 7);
}

#[test]
fn test_null_funcref_traps() {
    let mut m = instantiate(FUNCS);
    let err = m.call("install_and_call", &[Value::FuncRef(None)]).unwrap_err();
    assert_eq!(err.trap_kind(), Some(WasmTrap::UndefinedElement));
}

#[test]
fn test_forged_funcref_is_rejected() {
    let mut m = instantiate(FUNCS);
    let forged = Value::FuncRef(Some(FuncRef {
        type_index: 0,
        func_index: 99,
        owner: m.id(),
    }));
    assert!(matches!(
        m.call("install_and_call", &[forged]),
        Err(CallError::ArgumentMismatch { .. })
    ));
}

#[test]
fn test_funcref_of_other_instance_is_rejected() {
    let mut first = instantiate(FUNCS);
    let mut second = instantiate(FUNCS);
    assert_ne!(first.id(), second.id());
    let func = first.call("get_ref", &[]).unwrap();
    assert!(matches!(
        second.call("install_and_call", &func),
        Err(CallError::ArgumentMismatch { .. })
    ));
    assert_eq!(call_i32(&mut first, "install_and_call", &func), 7);
}
