//! Shared fixtures for the tessel end-to-end tests and benchmarks.
//!
//! Fixture modules live as WebAssembly text under `data/wat/` and are
//! assembled with `wat` when a test loads them.

use std::sync::Arc;

use tessel_core::{Host, HostConfig, Imports, Instance, Module, Value};

macro_rules! fixtures {
    ($($(#[$doc:meta])* $name:ident => $file:literal,)*) => {
        $(
            $(#[$doc])*
            pub const $name: &str = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/data/wat/", $file));
        )*
    };
}

fixtures! {
    /// i32/i64/f32/f64 arithmetic exports.
    ARITH => "arith.wat",
    /// if/else, loops, br_table, early return, multi-value.
    CONTROL => "control.wat",
    /// One memory with a 4 page maximum, an active and a passive data segment.
    MEMORY => "memory.wat",
    /// funcref table dispatch with a `calls` counter global.
    INDIRECT_CALL => "indirect_call.wat",
    /// Recursive fibonacci and a memory fill/sum loop.
    FIB => "fib.wat",
}

/// Assemble and load a text module.
pub fn load(wat: &str) -> Arc<Module> {
    let bytes = wat::parse_str(wat).unwrap_or_else(|e| panic!("fixture does not assemble: {e}"));
    Host::default()
        .load(&bytes)
        .unwrap_or_else(|e| panic!("fixture does not parse: {e}"))
}

/// Instantiate a text module without imports.
pub fn instantiate(wat: &str) -> Instance {
    instantiate_with(wat, &Imports::new())
}

pub fn instantiate_with(wat: &str, imports: &Imports) -> Instance {
    instantiate_with_config(wat, imports, HostConfig::default())
}

pub fn instantiate_with_config(wat: &str, imports: &Imports, config: HostConfig) -> Instance {
    let host = Host::new(config);
    host.instantiate(&load(wat), imports)
        .unwrap_or_else(|e| panic!("fixture does not instantiate: {e}"))
}

/// Call an export that returns exactly one i32.
pub fn call_i32(instance: &mut Instance, name: &str, args: &[Value]) -> i32 {
    match instance.call(name, args) {
        Ok(results) => match results.as_slice() {
            [Value::I32(v)] => *v,
            other => panic!("`{name}` returned {other:?}, expected one i32"),
        },
        Err(e) => panic!("`{name}` failed: {e}"),
    }
}

/// Call an export that returns exactly one i64.
pub fn call_i64(instance: &mut Instance, name: &str, args: &[Value]) -> i64 {
    match instance.call(name, args) {
        Ok(results) => match results.as_slice() {
            [Value::I64(v)] => *v,
            other => panic!("`{name}` returned {other:?}, expected one i64"),
        },
        Err(e) => panic!("`{name}` failed: {e}"),
    }
}

/// Native counterpart of the `fib` fixture export.
pub fn fib_native(n: i32) -> i32 {
    if n < 2 {
        n
    } else {
        fib_native(n - 1).wrapping_add(fib_native(n - 2))
    }
}

/// Native counterpart of the `fill_sum` fixture export.
pub fn fill_sum_native(len: u32) -> i32 {
    (0..len).map(|i| (i & 0xff) as i32).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixtures_assemble() {
        for wat in [ARITH, CONTROL, MEMORY, INDIRECT_CALL, FIB] {
            let module = load(wat);
            assert!(Host::default().validate(&module).is_ok());
        }
    }

    #[test]
    fn native_references() {
        assert_eq!(fib_native(10), 55);
        assert_eq!(fill_sum_native(4), 6);
        assert_eq!(fill_sum_native(257), 255 * 256 / 2);
    }
}
