//! WebAssembly binary parser.
//!
//! Decodes the section structure into a [`Module`]. Function bodies are kept
//! as byte ranges; their instructions are decoded later by the validator and,
//! on first execution, by the interpreter.

use tessel_runtime::{RefType, ValueType};

use crate::error::ParseError;
use crate::module::{
    ConstExpr, ConstOp, CustomSection, DataMode, DataSegment, ElementMode, ElementSegment,
    Export, ExternKind, FunctionBody, Global, Import, ImportKind, Module,
};
use crate::reader::BinaryReader;
use crate::types::{FuncType, GlobalType, Limits, MemoryType, TableType};

type Result<T> = std::result::Result<T, ParseError>;

/// Magic number followed by version 1.
const HEADER: [u8; 8] = *b"\0asm\x01\0\0\0";

/// Upper bound on declared locals in a single function body.
const MAX_LOCALS: u64 = 50_000;

mod section {
    pub const CUSTOM: u8 = 0;
    pub const TYPE: u8 = 1;
    pub const IMPORT: u8 = 2;
    pub const FUNCTION: u8 = 3;
    pub const TABLE: u8 = 4;
    pub const MEMORY: u8 = 5;
    pub const GLOBAL: u8 = 6;
    pub const EXPORT: u8 = 7;
    pub const START: u8 = 8;
    pub const ELEMENT: u8 = 9;
    pub const CODE: u8 = 10;
    pub const DATA: u8 = 11;
    pub const DATA_COUNT: u8 = 12;
}

fn malformed(offset: usize, reason: &'static str) -> ParseError {
    ParseError::Malformed { offset, reason }
}

/// Parse a WebAssembly binary into a structured module.
pub fn parse(bytes: &[u8]) -> Result<Module> {
    let mut reader = BinaryReader::new(bytes);
    let header = reader.read_bytes(8).map_err(|_| ParseError::InvalidHeader)?;
    if header != HEADER {
        return Err(ParseError::InvalidHeader);
    }

    let mut module = Module::default();
    let mut seen = [false; 13];
    let mut function_count: Option<usize> = None;
    let mut code_offset = 0;

    while !reader.eof() {
        let id = reader.read_u8()?;
        let declared = reader.read_var_u32()? as usize;
        if declared > reader.remaining() {
            return Err(ParseError::SectionLengthMismatch {
                id,
                declared,
                consumed: reader.remaining(),
            });
        }
        let mut section = reader.sub_reader(declared)?;

        if id != section::CUSTOM {
            if let Some(flag) = seen.get_mut(id as usize) {
                if *flag {
                    return Err(ParseError::DuplicateSection { id });
                }
                *flag = true;
            }
        }

        match id {
            section::CUSTOM => {
                let name = section.read_name()?.to_string();
                let start = section.offset();
                let rest = section.remaining();
                section.read_bytes(rest)?;
                module.customs.push(CustomSection {
                    name,
                    range: start..start + rest,
                });
            }
            section::TYPE => {
                module.types = read_vec(&mut section, read_func_type)?;
            }
            section::IMPORT => {
                module.imports = read_vec(&mut section, read_import)?;
            }
            section::FUNCTION => {
                module.functions = read_vec(&mut section, |r| r.read_var_u32())?;
                function_count = Some(module.functions.len());
            }
            section::TABLE => {
                module.tables = read_vec(&mut section, read_table_type)?;
            }
            section::MEMORY => {
                module.memories = read_vec(&mut section, |r| {
                    Ok(MemoryType {
                        limits: read_limits(r)?,
                    })
                })?;
            }
            section::GLOBAL => {
                module.globals = read_vec(&mut section, |r| {
                    Ok(Global {
                        ty: read_global_type(r)?,
                        init: read_const_expr(r)?,
                    })
                })?;
            }
            section::EXPORT => {
                module.exports = read_vec(&mut section, read_export)?;
            }
            section::START => {
                module.start = Some(section.read_var_u32()?);
            }
            section::ELEMENT => {
                module.elements = read_vec(&mut section, read_element)?;
            }
            section::CODE => {
                code_offset = section.offset();
                module.bodies = read_vec(&mut section, read_body)?;
            }
            section::DATA => {
                module.data = read_vec(&mut section, read_data)?;
            }
            section::DATA_COUNT => {
                module.data_count = Some(section.read_var_u32()?);
            }
            _ => {
                // Unknown sections are skipped by length.
                section.read_bytes(declared)?;
            }
        }

        if !section.eof() {
            return Err(ParseError::SectionLengthMismatch {
                id,
                declared,
                consumed: section.position(),
            });
        }
    }

    if function_count.unwrap_or(0) != module.bodies.len() {
        return Err(malformed(
            code_offset,
            "function and code section counts differ",
        ));
    }
    if let Some(count) = module.data_count {
        if count as usize != module.data.len() {
            return Err(malformed(reader.offset(), "data count disagrees with data section"));
        }
    }

    module.bytes = bytes.into();
    Ok(module.finish())
}

fn read_vec<'a, T>(
    reader: &mut BinaryReader<'a>,
    mut item: impl FnMut(&mut BinaryReader<'a>) -> Result<T>,
) -> Result<Vec<T>> {
    let count = reader.read_var_u32()?;
    // Each item takes at least one byte; don't trust `count` for capacity.
    let mut items = Vec::with_capacity((count as usize).min(reader.remaining()));
    for _ in 0..count {
        items.push(item(reader)?);
    }
    Ok(items)
}

fn read_value_type(reader: &mut BinaryReader) -> Result<ValueType> {
    let offset = reader.offset();
    ValueType::from_byte(reader.read_u8()?).ok_or_else(|| malformed(offset, "invalid value type"))
}

fn read_ref_type(reader: &mut BinaryReader) -> Result<RefType> {
    let offset = reader.offset();
    RefType::from_byte(reader.read_u8()?)
        .ok_or_else(|| malformed(offset, "invalid reference type"))
}

fn read_func_type(reader: &mut BinaryReader) -> Result<FuncType> {
    let offset = reader.offset();
    if reader.read_u8()? != 0x60 {
        return Err(malformed(offset, "expected function type"));
    }
    let params = read_vec(reader, read_value_type)?;
    let results = read_vec(reader, read_value_type)?;
    Ok(FuncType::new(params, results))
}

fn read_limits(reader: &mut BinaryReader) -> Result<Limits> {
    let offset = reader.offset();
    match reader.read_u8()? {
        0x00 => Ok(Limits {
            min: reader.read_var_u32()?,
            max: None,
        }),
        0x01 => Ok(Limits {
            min: reader.read_var_u32()?,
            max: Some(reader.read_var_u32()?),
        }),
        _ => Err(malformed(offset, "invalid limits flag")),
    }
}

fn read_table_type(reader: &mut BinaryReader) -> Result<TableType> {
    let elem = read_ref_type(reader)?;
    let limits = read_limits(reader)?;
    Ok(TableType { elem, limits })
}

fn read_global_type(reader: &mut BinaryReader) -> Result<GlobalType> {
    let value_type = read_value_type(reader)?;
    let offset = reader.offset();
    let mutable = match reader.read_u8()? {
        0x00 => false,
        0x01 => true,
        _ => return Err(malformed(offset, "invalid global mutability")),
    };
    Ok(GlobalType {
        value_type,
        mutable,
    })
}

fn read_import(reader: &mut BinaryReader) -> Result<Import> {
    let module = reader.read_name()?.to_string();
    let field = reader.read_name()?.to_string();
    let offset = reader.offset();
    let kind = match reader.read_u8()? {
        0x00 => ImportKind::Func(reader.read_var_u32()?),
        0x01 => ImportKind::Table(read_table_type(reader)?),
        0x02 => ImportKind::Memory(MemoryType {
            limits: read_limits(reader)?,
        }),
        0x03 => ImportKind::Global(read_global_type(reader)?),
        _ => return Err(malformed(offset, "invalid import kind")),
    };
    Ok(Import {
        module,
        field,
        kind,
    })
}

fn read_export(reader: &mut BinaryReader) -> Result<Export> {
    let name = reader.read_name()?.to_string();
    let offset = reader.offset();
    let kind = match reader.read_u8()? {
        0x00 => ExternKind::Func,
        0x01 => ExternKind::Table,
        0x02 => ExternKind::Memory,
        0x03 => ExternKind::Global,
        _ => return Err(malformed(offset, "invalid export kind")),
    };
    let index = reader.read_var_u32()?;
    Ok(Export { name, kind, index })
}

/// Constant expression up to and including its `end`.
fn read_const_expr(reader: &mut BinaryReader) -> Result<ConstExpr> {
    let offset = reader.offset();
    let mut ops = Vec::new();
    loop {
        let op_offset = reader.offset();
        let op = match reader.read_u8()? {
            0x0B => break,
            0x41 => ConstOp::I32Const(reader.read_var_i32()?),
            0x42 => ConstOp::I64Const(reader.read_var_i64()?),
            0x43 => ConstOp::F32Const(reader.read_f32()?),
            0x44 => ConstOp::F64Const(reader.read_f64()?),
            0x23 => ConstOp::GlobalGet(reader.read_var_u32()?),
            0xD0 => ConstOp::RefNull(read_ref_type(reader)?),
            0xD2 => ConstOp::RefFunc(reader.read_var_u32()?),
            _ => {
                return Err(malformed(
                    op_offset,
                    "unsupported constant expression instruction",
                ))
            }
        };
        ops.push(op);
    }
    Ok(ConstExpr { ops, offset })
}

fn func_index_items(reader: &mut BinaryReader) -> Result<Vec<ConstExpr>> {
    read_vec(reader, |r| {
        let offset = r.offset();
        Ok(ConstExpr {
            ops: vec![ConstOp::RefFunc(r.read_var_u32()?)],
            offset,
        })
    })
}

/// `elemkind` byte of the function-index segment forms; only funcref exists.
fn read_elem_kind(reader: &mut BinaryReader) -> Result<RefType> {
    let offset = reader.offset();
    match reader.read_u8()? {
        0x00 => Ok(RefType::FuncRef),
        _ => Err(malformed(offset, "invalid element kind")),
    }
}

fn read_element(reader: &mut BinaryReader) -> Result<ElementSegment> {
    let offset = reader.offset();
    let flags = reader.read_var_u32()?;
    // Bit 0: passive or declarative. Bit 1: explicit table index (active) or
    // declarative (non-active). Bit 2: items are expressions.
    let (mode, elem_type, items) = match flags {
        0 => {
            let offset = read_const_expr(reader)?;
            let items = func_index_items(reader)?;
            (ElementMode::Active { table: 0, offset }, RefType::FuncRef, items)
        }
        1 => {
            let kind = read_elem_kind(reader)?;
            (ElementMode::Passive, kind, func_index_items(reader)?)
        }
        2 => {
            let table = reader.read_var_u32()?;
            let offset = read_const_expr(reader)?;
            let kind = read_elem_kind(reader)?;
            (ElementMode::Active { table, offset }, kind, func_index_items(reader)?)
        }
        3 => {
            let kind = read_elem_kind(reader)?;
            (ElementMode::Declarative, kind, func_index_items(reader)?)
        }
        4 => {
            let offset = read_const_expr(reader)?;
            let items = read_vec(reader, read_const_expr)?;
            (ElementMode::Active { table: 0, offset }, RefType::FuncRef, items)
        }
        5 => {
            let ty = read_ref_type(reader)?;
            (ElementMode::Passive, ty, read_vec(reader, read_const_expr)?)
        }
        6 => {
            let table = reader.read_var_u32()?;
            let offset = read_const_expr(reader)?;
            let ty = read_ref_type(reader)?;
            (
                ElementMode::Active { table, offset },
                ty,
                read_vec(reader, read_const_expr)?,
            )
        }
        7 => {
            let ty = read_ref_type(reader)?;
            (ElementMode::Declarative, ty, read_vec(reader, read_const_expr)?)
        }
        _ => return Err(malformed(offset, "invalid element segment flags")),
    };
    Ok(ElementSegment {
        mode,
        elem_type,
        items,
    })
}

fn read_data(reader: &mut BinaryReader) -> Result<DataSegment> {
    let offset = reader.offset();
    let mode = match reader.read_var_u32()? {
        0 => DataMode::Active {
            memory: 0,
            offset: read_const_expr(reader)?,
        },
        1 => DataMode::Passive,
        2 => DataMode::Active {
            memory: reader.read_var_u32()?,
            offset: read_const_expr(reader)?,
        },
        _ => return Err(malformed(offset, "invalid data segment flags")),
    };
    let len = reader.read_var_u32()? as usize;
    let start = reader.offset();
    reader.read_bytes(len)?;
    Ok(DataSegment {
        mode,
        range: start..start + len,
    })
}

fn read_body(reader: &mut BinaryReader) -> Result<FunctionBody> {
    let size = reader.read_var_u32()? as usize;
    let mut body = reader.sub_reader(size)?;
    let mut total: u64 = 0;
    let locals = read_vec(&mut body, |r| {
        let offset = r.offset();
        let count = r.read_var_u32()?;
        total += u64::from(count);
        if total > MAX_LOCALS {
            return Err(malformed(offset, "too many locals"));
        }
        Ok((count, read_value_type(r)?))
    })?;
    let start = body.offset();
    let len = body.remaining();
    body.read_bytes(len)?;
    Ok(FunctionBody {
        locals,
        code: start..start + len,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_wat(src: &str) -> Module {
        let wasm = wat::parse_str(src).unwrap();
        parse(&wasm).unwrap()
    }

    #[test]
    fn parse_empty_module() {
        let module = parse(b"\0asm\x01\0\0\0").unwrap();
        assert!(module.types().is_empty());
        assert!(module.exports().is_empty());
        assert_eq!(module.func_count(), 0);
    }

    #[test]
    fn rejects_bad_header() {
        assert_eq!(parse(b"\0asn\x01\0\0\0").unwrap_err(), ParseError::InvalidHeader);
        assert_eq!(parse(b"\0asm\x02\0\0\0").unwrap_err(), ParseError::InvalidHeader);
        assert_eq!(parse(b"\0as").unwrap_err(), ParseError::InvalidHeader);
    }

    #[test]
    fn parse_simple_function() {
        let module = parse_wat(
            r#"
            (module
                (func (export "add") (param i32 i32) (result i32)
                    local.get 0
                    local.get 1
                    i32.add
                )
            )
            "#,
        );
        assert_eq!(module.types().len(), 1);
        assert_eq!(module.bodies.len(), 1);
        let export = module.export("add").unwrap();
        assert_eq!(export.kind, ExternKind::Func);
        let ty = module.func_type(export.index).unwrap();
        assert_eq!(ty.params(), &[ValueType::I32, ValueType::I32]);
        assert_eq!(ty.results(), &[ValueType::I32]);
        // local.get 0, local.get 1, i32.add, end
        assert_eq!(module.bodies[0].code.len(), 6);
    }

    #[test]
    fn parse_imports_and_index_spaces() {
        let module = parse_wat(
            r#"
            (module
                (import "env" "log" (func (param i32)))
                (import "env" "mem" (memory 1 2))
                (import "env" "handles" (table 4 externref))
                (import "env" "base" (global i32))
                (func (export "run"))
            )
            "#,
        );
        assert_eq!(module.imports().len(), 4);
        assert_eq!(module.imported_func_count(), 1);
        assert_eq!(module.func_count(), 2);
        assert_eq!(module.export("run").unwrap().index, 1);
        assert_eq!(module.memory_type(0).unwrap().limits, Limits { min: 1, max: Some(2) });
        assert_eq!(module.table_type(0).unwrap().elem, RefType::ExternRef);
        assert!(!module.global_type(0).unwrap().mutable);
    }

    #[test]
    fn parse_segments() {
        let module = parse_wat(
            r#"
            (module
                (memory 1)
                (table 2 funcref)
                (func $f)
                (elem (i32.const 1) $f)
                (elem declare func $f)
                (data (i32.const 8) "hello")
                (data "passive")
            )
            "#,
        );
        assert_eq!(module.elements.len(), 2);
        assert!(matches!(module.elements[0].mode, ElementMode::Active { table: 0, .. }));
        assert!(matches!(module.elements[1].mode, ElementMode::Declarative));
        assert_eq!(module.elements[0].items[0].ops, vec![ConstOp::RefFunc(0)]);
        assert_eq!(module.data_bytes(0), b"hello");
        assert!(matches!(module.data[1].mode, DataMode::Passive));
        assert_eq!(module.data_bytes(1), b"passive");
    }

    #[test]
    fn custom_sections_are_kept() {
        let mut wasm = b"\0asm\x01\0\0\0".to_vec();
        wasm.extend_from_slice(&[0x00, 0x07, 0x04]);
        wasm.extend_from_slice(b"meta");
        wasm.extend_from_slice(&[0xAA, 0xBB]);
        let module = parse(&wasm).unwrap();
        let sections: Vec<_> = module.custom_sections().collect();
        assert_eq!(sections, vec![("meta", &[0xAA, 0xBB][..])]);
    }

    #[test]
    fn section_length_mismatch() {
        // Type section declares 5 bytes but holds 4 (one empty func type).
        let wasm = b"\0asm\x01\0\0\0\x01\x05\x01\x60\x00\x00\x00";
        assert_eq!(
            parse(wasm).unwrap_err(),
            ParseError::SectionLengthMismatch {
                id: 1,
                declared: 5,
                consumed: 4
            }
        );
        // Declared size runs past the end of input.
        let wasm = b"\0asm\x01\0\0\0\x01\x09\x01\x60\x00\x00";
        assert!(matches!(
            parse(wasm).unwrap_err(),
            ParseError::SectionLengthMismatch { id: 1, declared: 9, .. }
        ));
    }

    #[test]
    fn duplicate_section() {
        let wasm = b"\0asm\x01\0\0\0\x01\x01\x00\x01\x01\x00";
        assert_eq!(parse(wasm).unwrap_err(), ParseError::DuplicateSection { id: 1 });
    }

    #[test]
    fn function_without_body() {
        // One type, one function declared, no code section.
        let wasm = b"\0asm\x01\0\0\0\x01\x04\x01\x60\x00\x00\x03\x02\x01\x00";
        assert!(matches!(
            parse(wasm).unwrap_err(),
            ParseError::Malformed { reason: "function and code section counts differ", .. }
        ));
    }

    #[test]
    fn truncated_body() {
        let wasm = wat::parse_str("(module (func (result i32) i32.const 7))").unwrap();
        assert!(parse(&wasm[..wasm.len() - 2]).is_err());
    }
}
