//! Host functions, imported memories and globals, and re-entrant calls
//! through `Caller`.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use tessel_core::{
    CallError, FuncRef, FuncType, Host, HostError, HostGlobal, Imports, InstantiationError,
    LinearMemory, Value, ValueType, WasmTrap,
};
use tessel_tests::{call_i32, instantiate, instantiate_with, load};

use ValueType::I32;

// ── host functions ──

#[test]
fn test_host_function_receives_arguments() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut imports = Imports::new();
    let log = Arc::clone(&seen);
    imports.func(
        "env",
        "add_and_log",
        FuncType::new([I32, I32], [I32]),
        move |_caller, args| {
            log.lock().unwrap().extend_from_slice(args);
            let sum = args.iter().filter_map(Value::as_i32).sum::<i32>();
            Ok(vec![Value::I32(sum)])
        },
    );
    let mut m = instantiate_with(
        r#"(module
            (import "env" "add_and_log" (func $add (param i32 i32) (result i32)))
            (func (export "run") (result i32)
              i32.const 20
              i32.const 22
              call $add))"#,
        &imports,
    );
    assert_eq!(call_i32(&mut m, "run", &[]), 42);
    assert_eq!(*seen.lock().unwrap(), vec![Value::I32(20), Value::I32(22)]);
}

#[test]
fn test_host_reads_guest_memory() {
    let printed = Arc::new(Mutex::new(String::new()));
    let mut imports = Imports::new();
    let out = Arc::clone(&printed);
    imports.func(
        "env",
        "print",
        FuncType::new([I32, I32], []),
        move |caller, args| {
            let (Some(ptr), Some(len)) = (args[0].as_i32(), args[1].as_i32()) else {
                return Err(HostError::custom("bad arguments"));
            };
            let memory = caller.memory().ok_or_else(|| HostError::custom("no memory"))?;
            let bytes = memory
                .read(ptr as usize, len as usize)
                .map_err(HostError::custom)?;
            out.lock().unwrap().push_str(&String::from_utf8_lossy(bytes));
            Ok(Vec::new())
        },
    );
    let mut m = instantiate_with(
        r#"(module
            (import "env" "print" (func $print (param i32 i32)))
            (memory 1)
            (data (i32.const 8) "hi there")
            (func (export "main")
              i32.const 8
              i32.const 8
              call $print))"#,
        &imports,
    );
    m.call("main", &[]).unwrap();
    assert_eq!(*printed.lock().unwrap(), "hi there");
}

#[test]
fn test_host_function_called_per_iteration() {
    let ticks = Arc::new(AtomicU32::new(0));
    let mut imports = Imports::new();
    let counter = Arc::clone(&ticks);
    imports.func("env", "tick", FuncType::default(), move |_, _| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(Vec::new())
    });
    let mut m = instantiate_with(
        r#"(module
            (import "env" "tick" (func $tick))
            (func (export "spin") (param $n i32)
              block $done
                loop $again
                  local.get $n
                  i32.eqz
                  br_if $done
                  call $tick
                  local.get $n
                  i32.const 1
                  i32.sub
                  local.set $n
                  br $again
                end
              end))"#,
        &imports,
    );
    m.call("spin", &[Value::I32(25)]).unwrap();
    assert_eq!(ticks.load(Ordering::SeqCst), 25);
}

// ── host errors ──

const GUARDED: &str = r#"(module
    (import "env" "check" (func $check (result i32)))
    (global $after (export "after") (mut i32) (i32.const 0))
    (func (export "run") (result i32)
      call $check
      i32.const 1
      global.set $after))"#;

fn guarded(check: impl Fn() -> Result<Vec<Value>, HostError> + Send + Sync + 'static) -> Imports {
    let mut imports = Imports::new();
    imports.func("env", "check", FuncType::new([], [I32]), move |_, _| check());
    imports
}

#[test]
fn test_host_cancel_traps() {
    let mut m = instantiate_with(GUARDED, &guarded(|| Err(HostError::Cancelled)));
    let err = m.call("run", &[]).unwrap_err();
    assert_eq!(err.trap_kind(), Some(WasmTrap::HostCancelled));
    assert_eq!(m.global("after"), Some(Value::I32(0)));
    assert!(!m.is_poisoned());
}

#[test]
fn test_host_custom_error_passes_through() {
    let mut m = instantiate_with(GUARDED, &guarded(|| Err(HostError::custom("sensor offline"))));
    match m.call("run", &[]) {
        Err(CallError::Host(source)) => assert_eq!(source.to_string(), "sensor offline"),
        other => panic!("expected a host error, got {other:?}"),
    }
    assert_eq!(m.global("after"), Some(Value::I32(0)));
}

#[test]
fn test_host_result_mismatch() {
    let mut m = instantiate_with(GUARDED, &guarded(|| Ok(vec![Value::I64(1)])));
    match m.call("run", &[]) {
        Err(CallError::HostResultMismatch {
            expected, provided, ..
        }) => {
            assert_eq!(expected, "[i32]");
            assert_eq!(provided, "[i64]");
        }
        other => panic!("expected a result mismatch, got {other:?}"),
    }

    let mut m = instantiate_with(GUARDED, &guarded(|| Ok(Vec::new())));
    assert!(matches!(
        m.call("run", &[]),
        Err(CallError::HostResultMismatch { .. })
    ));
}

const MINTED: &str = r#"(module
    (import "env" "mint" (func $mint (result funcref)))
    (type $nullary (func (result i32)))
    (table 1 funcref)
    (elem declare func $one)
    (func $one (result i32)
      i32.const 1)
    (func $pair (param i32 i32) (result i32)
      local.get 0
      local.get 1
      i32.add)
    (func (export "one_ref") (result funcref)
      ref.func $one)
    (func (export "run") (result i32)
      i32.const 0
      call $mint
      table.set 0
      i32.const 0
      call_indirect (type $nullary)))"#;

/// `mint` hands back the instance's own `one_ref`, after `tamper` edits it.
fn minting(tamper: fn(&mut FuncRef)) -> Imports {
    let mut imports = Imports::new();
    imports.func(
        "env",
        "mint",
        FuncType::new([], [ValueType::FuncRef]),
        move |caller, _| {
            let mut results = caller.call("one_ref", &[])?;
            if let Some(Value::FuncRef(Some(func))) = results.first_mut() {
                tamper(func);
            }
            Ok(results)
        },
    );
    imports
}

#[test]
fn test_host_returns_own_funcref() {
    let mut m = instantiate_with(MINTED, &minting(|_| {}));
    assert_eq!(call_i32(&mut m, "run", &[]), 1);
}

#[test]
fn test_host_funcref_with_wrong_type_is_rejected() {
    // Function 2 is `$pair`, which takes two operands.
    let mut m = instantiate_with(MINTED, &minting(|func| func.func_index = 2));
    assert!(matches!(
        m.call("run", &[]),
        Err(CallError::HostResultMismatch { func: 0, .. })
    ));
}

#[test]
fn test_host_funcref_of_other_instance_is_rejected() {
    let mut m = instantiate_with(MINTED, &minting(|func| func.owner += 1));
    assert!(matches!(
        m.call("run", &[]),
        Err(CallError::HostResultMismatch { .. })
    ));
}

// ── re-entrancy ──

const REENTRANT: &str = r#"(module
    (import "env" "callback" (func $callback (param i32)))
    (memory (export "mem") 1)
    (global $hits (export "hits") (mut i32) (i32.const 0))
    (func (export "record") (param $v i32)
      i32.const 0
      local.get $v
      i32.store
      global.get $hits
      i32.const 1
      i32.add
      global.set $hits)
    (func (export "run") (param i32) (result i32)
      local.get 0
      call $callback
      i32.const 0
      i32.load
      global.get $hits
      i32.add)
    (func (export "boom") (result i32)
      i32.const 1
      i32.const 0
      i32.div_u))"#;

#[test]
fn test_reentrant_call_state_is_visible() {
    let mut imports = Imports::new();
    imports.func("env", "callback", FuncType::new([I32], []), |caller, args| {
        let doubled = args[0].as_i32().unwrap_or_default() * 2;
        caller.call("record", &[Value::I32(doubled)])?;
        // The re-entrant write is visible to the host right away.
        assert_eq!(caller.global("hits"), Some(Value::I32(1)));
        Ok(Vec::new())
    });
    let mut m = instantiate_with(REENTRANT, &imports);
    // memory[0] = 2 * 50, hits = 1
    assert_eq!(call_i32(&mut m, "run", &[Value::I32(50)]), 101);
    assert_eq!(m.memory().unwrap().load_i32(0).unwrap(), 100);
    assert_eq!(m.global("hits"), Some(Value::I32(1)));
}

#[test]
fn test_reentrant_trap_propagates() {
    let mut imports = Imports::new();
    imports.func("env", "callback", FuncType::new([I32], []), |caller, _| {
        caller.call("boom", &[])?;
        Ok(Vec::new())
    });
    let mut m = instantiate_with(REENTRANT, &imports);
    let err = m.call("run", &[Value::I32(1)]).unwrap_err();
    assert_eq!(err.trap_kind(), Some(WasmTrap::IntegerDivideByZero));
    // Still usable.
    m.call("record", &[Value::I32(3)]).unwrap();
    assert_eq!(m.global("hits"), Some(Value::I32(1)));
}

// ── imported memory and globals ──

#[test]
fn test_imported_memory_and_global() {
    let mut memory = LinearMemory::try_new(1, Some(2)).unwrap();
    memory.store_i32(64, 1000).unwrap();
    let mut imports = Imports::new();
    imports
        .define("env", "memory", memory)
        .define(
            "env",
            "base",
            HostGlobal {
                value: Value::I32(24),
                mutable: false,
            },
        );
    let mut m = instantiate_with(
        r#"(module
            (import "env" "memory" (memory 1))
            (import "env" "base" (global $base i32))
            (func (export "read") (result i32)
              i32.const 64
              i32.load
              global.get $base
              i32.add))"#,
        &imports,
    );
    assert_eq!(call_i32(&mut m, "read", &[]), 1024);
    assert_eq!(m.memory().unwrap().maximum(), Some(2));
}

#[test]
fn test_global_initializer_reads_import() {
    let mut imports = Imports::new();
    imports.define(
        "env",
        "seed",
        HostGlobal {
            value: Value::I64(7),
            mutable: false,
        },
    );
    let m = instantiate_with(
        r#"(module
            (import "env" "seed" (global $seed i64))
            (global (export "copy") i64 (global.get $seed)))"#,
        &imports,
    );
    assert_eq!(m.global("copy"), Some(Value::I64(7)));
}

// ── tables from other instances ──

const DISPATCHER: &str = r#"(module
    (import "env" "table" (table 1 funcref))
    (func $b0 (result i32)
      i32.const 222)
    (func $b1 (result i32)
      i32.const 999)
    (func (export "go") (result i32)
      i32.const 0
      call_indirect (result i32)))"#;

#[test]
fn test_funcref_table_of_other_instance_is_rejected() {
    let exporter = instantiate(
        r#"(module
            (table (export "table") 1 funcref)
            (elem (i32.const 0) $one)
            (func $one (result i32)
              i32.const 1))"#,
    );
    let mut imports = Imports::new();
    imports.define("env", "table", exporter.table("table").unwrap().clone());
    let err = Host::default()
        .instantiate(&load(DISPATCHER), &imports)
        .unwrap_err();
    assert!(matches!(
        err,
        InstantiationError::ForeignReference { ref module, ref field }
            if module == "env" && field == "table"
    ));
}

#[test]
fn test_empty_table_of_other_instance_is_accepted() {
    let exporter = instantiate(r#"(module (table (export "table") 1 funcref))"#);
    let mut imports = Imports::new();
    imports.define("env", "table", exporter.table("table").unwrap().clone());
    let mut m = instantiate_with(DISPATCHER, &imports);
    let err = m.call("go", &[]).unwrap_err();
    assert_eq!(err.trap_kind(), Some(WasmTrap::UndefinedElement));
}

#[test]
fn test_funcref_global_is_rejected() {
    let exporter = instantiate(
        r#"(module
            (global (export "f") funcref (ref.func $f))
            (func $f))"#,
    );
    let mut imports = Imports::new();
    imports.define(
        "env",
        "f",
        HostGlobal {
            value: exporter.global("f").unwrap(),
            mutable: false,
        },
    );
    let module = load(r#"(module (import "env" "f" (global funcref)))"#);
    assert!(matches!(
        Host::default().instantiate(&module, &imports),
        Err(InstantiationError::ForeignReference { .. })
    ));
}

// ── resolution failures ──

#[test]
fn test_unsatisfied_import() {
    let module = load(r#"(module (import "env" "missing" (func)))"#);
    let err = Host::default().instantiate(&module, &Imports::new()).unwrap_err();
    assert!(matches!(
        err,
        InstantiationError::UnsatisfiedImport { ref module, ref field }
            if module == "env" && field == "missing"
    ));
}

#[test]
fn test_import_signature_mismatch() {
    let module = load(r#"(module (import "env" "f" (func (param i32))))"#);
    let mut imports = Imports::new();
    imports.func("env", "f", FuncType::new([ValueType::I64], []), |_, _| Ok(Vec::new()));
    let err = Host::default().instantiate(&module, &imports).unwrap_err();
    match err {
        InstantiationError::ImportSignatureMismatch {
            expected, provided, ..
        } => {
            assert_eq!(expected, "func [i32] -> []");
            assert_eq!(provided, "func [i64] -> []");
        }
        other => panic!("expected a signature mismatch, got {other:?}"),
    }
}
