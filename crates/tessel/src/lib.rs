//! tessel: command-line front end for the tessel WebAssembly host.
//!
//! Loads a `.wasm` or `.wat` module, validates it, and either lists its
//! imports and exports or invokes one export with arguments given as text.

use std::fmt::Write as _;
use std::path::Path;

pub use anyhow::{Context, Result};
use anyhow::bail;
use tessel_core::{
    ExternKind, FuncType, Host, HostConfig, ImportKind, Imports, Module, Value, ValueType,
};

/// What to do with a loaded module.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Export to call; `None` lists the module's imports and exports.
    pub invoke: Option<String>,
    /// Arguments for `invoke`, parsed by the export's parameter types.
    pub args: Vec<String>,
    /// Stop after validation.
    pub validate_only: bool,
    pub config: HostConfig,
}

/// Read a module from disk. Text files are converted to binary.
pub fn read_module(path: &Path) -> Result<Vec<u8>> {
    let bytes = std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let binary = wat::parse_bytes(&bytes)
        .with_context(|| format!("failed to parse {} as WebAssembly text", path.display()))?;
    Ok(binary.into_owned())
}

/// Run the pipeline on `bytes` and return what should be printed.
pub fn run(bytes: &[u8], options: &RunOptions) -> Result<String> {
    let host = Host::new(options.config.clone());
    let module = host.load(bytes).context("failed to load module")?;
    host.validate(&module).context("module is invalid")?;
    if options.validate_only {
        return Ok("valid\n".to_string());
    }

    let Some(name) = &options.invoke else {
        return Ok(describe(&module));
    };

    let mut instance = host
        .instantiate(&module, &spectest_imports())
        .context("failed to instantiate module")?;
    let ty = instance
        .func_type(name)
        .with_context(|| format!("no exported function named `{name}`"))?;
    let args = parse_args(ty, &options.args)?;
    let results = host
        .call(&mut instance, name, &args)
        .with_context(|| format!("call to `{name}` failed"))?;

    let mut out = String::new();
    for value in results {
        writeln!(out, "{value}")?;
    }
    Ok(out)
}

/// Imports and exports, one per line.
pub fn describe(module: &Module) -> String {
    let mut out = String::new();
    // Writing to a String cannot fail.
    let _ = writeln!(out, "imports:");
    for import in module.imports() {
        let ty = match &import.kind {
            ImportKind::Func(index) => match module.types().get(*index as usize) {
                Some(ty) => format!("func {ty}"),
                None => "func".to_string(),
            },
            ImportKind::Table(ty) => ty.to_string(),
            ImportKind::Memory(ty) => ty.to_string(),
            ImportKind::Global(ty) => ty.to_string(),
        };
        let _ = writeln!(out, "  {}.{}: {ty}", import.module, import.field);
    }
    let _ = writeln!(out, "exports:");
    for export in module.exports() {
        let ty = match export.kind {
            ExternKind::Func => module.func_type(export.index).map(|ty| format!("func {ty}")),
            ExternKind::Table => module.table_type(export.index).map(ToString::to_string),
            ExternKind::Memory => module.memory_type(export.index).map(ToString::to_string),
            ExternKind::Global => module.global_type(export.index).map(ToString::to_string),
        };
        let ty = ty.unwrap_or_else(|| export.kind.to_string());
        let _ = writeln!(out, "  {}: {ty}", export.name);
    }
    out
}

/// Parse textual arguments according to a function's parameter types.
pub fn parse_args(ty: &FuncType, raw: &[String]) -> Result<Vec<Value>> {
    if raw.len() != ty.params().len() {
        bail!(
            "expected {} argument(s) for {ty}, got {}",
            ty.params().len(),
            raw.len()
        );
    }
    ty.params()
        .iter()
        .zip(raw)
        .map(|(&param, text)| parse_value(param, text))
        .collect()
}

fn parse_value(ty: ValueType, text: &str) -> Result<Value> {
    let value = match ty {
        // Unsigned spellings up to the type's width are accepted and wrap.
        ValueType::I32 => match text.parse::<i32>() {
            Ok(v) => Value::I32(v),
            Err(_) => Value::I32(
                text.parse::<u32>()
                    .with_context(|| format!("`{text}` is not an i32"))? as i32,
            ),
        },
        ValueType::I64 => match text.parse::<i64>() {
            Ok(v) => Value::I64(v),
            Err(_) => Value::I64(
                text.parse::<u64>()
                    .with_context(|| format!("`{text}` is not an i64"))? as i64,
            ),
        },
        ValueType::F32 => Value::F32(
            text.parse::<f32>()
                .with_context(|| format!("`{text}` is not an f32"))?,
        ),
        ValueType::F64 => Value::F64(
            text.parse::<f64>()
                .with_context(|| format!("`{text}` is not an f64"))?,
        ),
        ValueType::FuncRef | ValueType::ExternRef => {
            bail!("{ty} parameters cannot be passed from the command line")
        }
    };
    Ok(value)
}

/// The `spectest` host module: print functions writing to stdout.
pub fn spectest_imports() -> Imports {
    use ValueType::{F32, F64, I32, I64};

    let mut imports = Imports::new();
    for (field, params) in [
        ("print", &[][..]),
        ("print_i32", &[I32][..]),
        ("print_i64", &[I64][..]),
        ("print_f32", &[F32][..]),
        ("print_f64", &[F64][..]),
        ("print_i32_f32", &[I32, F32][..]),
        ("print_f64_f64", &[F64, F64][..]),
    ] {
        let ty = FuncType::new(params.iter().copied(), []);
        imports.func("spectest", field, ty, |_caller, args| {
            let line: Vec<String> = args.iter().map(ToString::to_string).collect();
            println!("{}", line.join(" "));
            Ok(Vec::new())
        });
    }
    imports
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wasm(wat: &str) -> Vec<u8> {
        wat::parse_str(wat).unwrap()
    }

    #[test]
    fn invoke_prints_results() {
        let bytes = wasm(
            r#"(module (func (export "add") (param i32 i32) (result i32)
                local.get 0 local.get 1 i32.add))"#,
        );
        let options = RunOptions {
            invoke: Some("add".into()),
            args: vec!["2".into(), "-5".into()],
            ..RunOptions::default()
        };
        assert_eq!(run(&bytes, &options).unwrap(), "-3\n");
    }

    #[test]
    fn lists_imports_and_exports() {
        let bytes = wasm(
            r#"(module
                (import "spectest" "print_i32" (func (param i32)))
                (memory (export "mem") 1 2)
                (func (export "f") (result i64) i64.const 1))"#,
        );
        let out = run(&bytes, &RunOptions::default()).unwrap();
        assert_eq!(
            out,
            "imports:\n  spectest.print_i32: func [i32] -> []\n\
             exports:\n  mem: memory {min 1, max 2}\n  f: func [] -> [i64]\n"
        );
    }

    #[test]
    fn validate_only() {
        let options = RunOptions {
            validate_only: true,
            ..RunOptions::default()
        };
        assert_eq!(run(&wasm("(module)"), &options).unwrap(), "valid\n");
        assert!(run(&wasm("(module (func (result i32)))"), &options).is_err());
    }

    #[test]
    fn argument_parsing() {
        let ty = FuncType::new([ValueType::I32, ValueType::I64, ValueType::F64], []);
        let args = ["4294967295", "-2", "1.5"].map(String::from);
        assert_eq!(
            parse_args(&ty, &args).unwrap(),
            vec![Value::I32(-1), Value::I64(-2), Value::F64(1.5)]
        );
        assert!(parse_args(&ty, &args[..2]).is_err());
        assert!(parse_value(ValueType::I32, "x").is_err());
        assert!(parse_value(ValueType::ExternRef, "1").is_err());
    }

    #[test]
    fn spectest_module_is_importable() {
        let bytes = wasm(
            r#"(module
                (import "spectest" "print_i32" (func $p (param i32)))
                (func (export "main") (result i32) i32.const 7 call $p i32.const 0))"#,
        );
        let options = RunOptions {
            invoke: Some("main".into()),
            ..RunOptions::default()
        };
        assert_eq!(run(&bytes, &options).unwrap(), "0\n");
    }
}
