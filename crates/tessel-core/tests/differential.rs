//! Cross-checks the parser and validator against `wasmparser`.

use anyhow::{Context, Result};
use tessel_core::{parse, Host};
use wasmparser::{Parser, Payload};

#[derive(Debug, Default, PartialEq, Eq)]
struct Counts {
    types: u32,
    imports: u32,
    functions: u32,
    exports: u32,
    customs: u32,
}

fn reference_counts(bytes: &[u8]) -> Result<Counts> {
    let mut counts = Counts::default();
    for payload in Parser::new(0).parse_all(bytes) {
        match payload.context("reading payload")? {
            Payload::TypeSection(reader) => counts.types = reader.count(),
            Payload::ImportSection(reader) => counts.imports = reader.count(),
            Payload::FunctionSection(reader) => counts.functions = reader.count(),
            Payload::ExportSection(reader) => counts.exports = reader.count(),
            Payload::CustomSection(_) => counts.customs += 1,
            _ => {}
        }
    }
    Ok(counts)
}

fn our_counts(bytes: &[u8]) -> Result<Counts> {
    let module = parse(bytes)?;
    Ok(Counts {
        types: module.types().len() as u32,
        imports: module.imports().len() as u32,
        functions: module.func_count() - module.imported_func_count(),
        exports: module.exports().len() as u32,
        customs: module.custom_sections().count() as u32,
    })
}

const VALID: &[&str] = &[
    r#"(module (func (export "f") (result i32) i32.const 1))"#,
    r#"(module
        (type $t (func (param i32 i32) (result i32)))
        (import "env" "add" (func (type $t)))
        (import "env" "mem" (memory 1))
        (func (export "twice") (param i32) (result i32)
          local.get 0
          local.get 0
          call 0)
        (@custom "meta" "hello"))"#,
    r#"(module
        (table 2 funcref)
        (table 1 externref)
        (elem (i32.const 0) func $a $b)
        (elem declare func $a)
        (func $a (result i32) i32.const 1)
        (func $b (result i32) ref.func $a drop i32.const 2)
        (func (export "pick") (param i32) (result i32)
          local.get 0
          call_indirect (result i32)))"#,
    r#"(module
        (memory 1 2)
        (data "passive")
        (data (i32.const 16) "active")
        (func (export "copy") (param i32 i32 i32)
          local.get 0 local.get 1 local.get 2 memory.copy
          i32.const 0 i32.const 0 i32.const 4 memory.init 0
          data.drop 0))"#,
    r#"(module
        (func (export "swap") (param i32 i64) (result i64 i32)
          local.get 1
          local.get 0)
        (func (export "countdown") (param i32) (result i32)
          local.get 0
          loop (param i32) (result i32)
            i32.const 1
            i32.sub
            local.tee 0
            local.get 0
            br_if 0
          end))"#,
    r#"(module
        (global $g (mut i32) (i32.const 0))
        (global i64 (i64.const 7))
        (func (export "bump") (result i32)
          global.get $g
          i32.const 1
          i32.add
          global.set $g
          global.get $g))"#,
];

const INVALID: &[&str] = &[
    r#"(module (func (result i32) i64.const 1))"#,
    r#"(module (func (result i32)))"#,
    r#"(module (func br 1))"#,
    r#"(module (func call 3))"#,
    r#"(module (global i32 (i32.const 0)) (func i32.const 1 global.set 0))"#,
    r#"(module (func (param i32) local.get 0 if (result i32) i32.const 1 end drop))"#,
    r#"(module (func (local f32) local.get 0 i32.eqz drop))"#,
];

#[test]
fn section_counts_agree() -> Result<()> {
    for wat in VALID {
        let bytes = wat::parse_str(wat)?;
        assert_eq!(
            our_counts(&bytes)?,
            reference_counts(&bytes)?,
            "counts differ for {wat}"
        );
    }
    Ok(())
}

#[test]
fn validity_verdicts_agree() -> Result<()> {
    let host = Host::default();
    for (wat, expect_valid) in VALID
        .iter()
        .map(|w| (w, true))
        .chain(INVALID.iter().map(|w| (w, false)))
    {
        let bytes = wat::parse_str(wat)?;
        let reference = wasmparser::validate(&bytes).is_ok();
        let module = host.load(&bytes)?;
        let ours = host.validate(&module).is_ok();
        assert_eq!(reference, expect_valid, "wasmparser verdict for {wat}");
        assert_eq!(ours, reference, "verdicts differ for {wat}");
    }
    Ok(())
}
