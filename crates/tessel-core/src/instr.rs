//! Instruction decoding.
//!
//! Shared by the validator, which walks each body once, and by the lazy
//! decoder in `exec::code`, which keeps the decoded form for execution.
//! Numeric operators with no immediates are carried as their opcode byte.

use tessel_runtime::{RefType, ValueType};

use crate::error::ParseError;
use crate::reader::BinaryReader;
use crate::types::BlockType;

type Result<T> = std::result::Result<T, ParseError>;

#[derive(Debug, Clone, PartialEq)]
pub enum Instr {
    Unreachable,
    Nop,
    Block(BlockType),
    Loop(BlockType),
    If(BlockType),
    Else,
    End,
    Br(u32),
    BrIf(u32),
    BrTable { targets: Box<[u32]>, default: u32 },
    Return,
    Call(u32),
    CallIndirect { type_index: u32, table: u32 },
    Drop,
    /// `select`, with the explicit result type of the typed form.
    Select(Option<ValueType>),
    LocalGet(u32),
    LocalSet(u32),
    LocalTee(u32),
    GlobalGet(u32),
    GlobalSet(u32),
    TableGet(u32),
    TableSet(u32),
    /// Opcodes 0x28..=0x35.
    Load { opcode: u8, align: u32, offset: u32 },
    /// Opcodes 0x36..=0x3E.
    Store { opcode: u8, align: u32, offset: u32 },
    MemorySize(u32),
    MemoryGrow(u32),
    I32Const(i32),
    I64Const(i64),
    F32Const(f32),
    F64Const(f64),
    /// Opcodes 0x45..=0xC4.
    Numeric(u8),
    RefNull(RefType),
    RefIsNull,
    RefFunc(u32),
    /// `0xFC 0..=7`, saturating float-to-int truncation.
    TruncSat(u8),
    MemoryInit { data: u32, memory: u32 },
    DataDrop(u32),
    MemoryCopy { dst: u32, src: u32 },
    MemoryFill(u32),
    TableInit { elem: u32, table: u32 },
    ElemDrop(u32),
    TableCopy { dst: u32, src: u32 },
    TableGrow(u32),
    TableSize(u32),
    TableFill(u32),
}

fn read_block_type(reader: &mut BinaryReader) -> Result<BlockType> {
    let byte = reader.peek_u8()?;
    if byte == 0x40 {
        reader.read_u8()?;
        return Ok(BlockType::Empty);
    }
    if let Some(ty) = ValueType::from_byte(byte) {
        reader.read_u8()?;
        return Ok(BlockType::Value(ty));
    }
    let offset = reader.offset();
    let index = reader.read_var_s33()?;
    u32::try_from(index)
        .map(BlockType::Func)
        .map_err(|_| ParseError::Malformed {
            offset,
            reason: "invalid block type",
        })
}

fn read_memarg(reader: &mut BinaryReader) -> Result<(u32, u32)> {
    let align = reader.read_var_u32()?;
    let offset = reader.read_var_u32()?;
    Ok((align, offset))
}

/// Decode one instruction.
pub fn read_instr(reader: &mut BinaryReader) -> Result<Instr> {
    let offset = reader.offset();
    let opcode = reader.read_u8()?;
    Ok(match opcode {
        0x00 => Instr::Unreachable,
        0x01 => Instr::Nop,
        0x02 => Instr::Block(read_block_type(reader)?),
        0x03 => Instr::Loop(read_block_type(reader)?),
        0x04 => Instr::If(read_block_type(reader)?),
        0x05 => Instr::Else,
        0x0B => Instr::End,
        0x0C => Instr::Br(reader.read_var_u32()?),
        0x0D => Instr::BrIf(reader.read_var_u32()?),
        0x0E => {
            let count = reader.read_var_u32()?;
            let mut targets = Vec::with_capacity((count as usize).min(reader.remaining()));
            for _ in 0..count {
                targets.push(reader.read_var_u32()?);
            }
            Instr::BrTable {
                targets: targets.into_boxed_slice(),
                default: reader.read_var_u32()?,
            }
        }
        0x0F => Instr::Return,
        0x10 => Instr::Call(reader.read_var_u32()?),
        0x11 => Instr::CallIndirect {
            type_index: reader.read_var_u32()?,
            table: reader.read_var_u32()?,
        },
        0x1A => Instr::Drop,
        0x1B => Instr::Select(None),
        0x1C => {
            if reader.read_var_u32()? != 1 {
                return Err(ParseError::Malformed {
                    offset,
                    reason: "typed select must name one type",
                });
            }
            let ty_offset = reader.offset();
            let ty = ValueType::from_byte(reader.read_u8()?).ok_or(ParseError::Malformed {
                offset: ty_offset,
                reason: "invalid value type",
            })?;
            Instr::Select(Some(ty))
        }
        0x20 => Instr::LocalGet(reader.read_var_u32()?),
        0x21 => Instr::LocalSet(reader.read_var_u32()?),
        0x22 => Instr::LocalTee(reader.read_var_u32()?),
        0x23 => Instr::GlobalGet(reader.read_var_u32()?),
        0x24 => Instr::GlobalSet(reader.read_var_u32()?),
        0x25 => Instr::TableGet(reader.read_var_u32()?),
        0x26 => Instr::TableSet(reader.read_var_u32()?),
        0x28..=0x35 => {
            let (align, offset) = read_memarg(reader)?;
            Instr::Load {
                opcode,
                align,
                offset,
            }
        }
        0x36..=0x3E => {
            let (align, offset) = read_memarg(reader)?;
            Instr::Store {
                opcode,
                align,
                offset,
            }
        }
        0x3F => Instr::MemorySize(reader.read_var_u32()?),
        0x40 => Instr::MemoryGrow(reader.read_var_u32()?),
        0x41 => Instr::I32Const(reader.read_var_i32()?),
        0x42 => Instr::I64Const(reader.read_var_i64()?),
        0x43 => Instr::F32Const(reader.read_f32()?),
        0x44 => Instr::F64Const(reader.read_f64()?),
        0x45..=0xC4 => Instr::Numeric(opcode),
        0xD0 => {
            let ty_offset = reader.offset();
            Instr::RefNull(RefType::from_byte(reader.read_u8()?).ok_or(
                ParseError::Malformed {
                    offset: ty_offset,
                    reason: "invalid reference type",
                },
            )?)
        }
        0xD1 => Instr::RefIsNull,
        0xD2 => Instr::RefFunc(reader.read_var_u32()?),
        0xFC => {
            let sub = reader.read_var_u32()?;
            match sub {
                0..=7 => Instr::TruncSat(sub as u8),
                8 => Instr::MemoryInit {
                    data: reader.read_var_u32()?,
                    memory: reader.read_var_u32()?,
                },
                9 => Instr::DataDrop(reader.read_var_u32()?),
                10 => Instr::MemoryCopy {
                    dst: reader.read_var_u32()?,
                    src: reader.read_var_u32()?,
                },
                11 => Instr::MemoryFill(reader.read_var_u32()?),
                12 => Instr::TableInit {
                    elem: reader.read_var_u32()?,
                    table: reader.read_var_u32()?,
                },
                13 => Instr::ElemDrop(reader.read_var_u32()?),
                14 => Instr::TableCopy {
                    dst: reader.read_var_u32()?,
                    src: reader.read_var_u32()?,
                },
                15 => Instr::TableGrow(reader.read_var_u32()?),
                16 => Instr::TableSize(reader.read_var_u32()?),
                17 => Instr::TableFill(reader.read_var_u32()?),
                _ => {
                    return Err(ParseError::UnknownOpcode {
                        offset,
                        opcode: 0xFC00 | sub.min(0xFF),
                    })
                }
            }
        }
        _ => {
            return Err(ParseError::UnknownOpcode {
                offset,
                opcode: u32::from(opcode),
            })
        }
    })
}

/// Access width in bytes of a load or store opcode.
pub fn access_width(opcode: u8) -> u32 {
    match opcode {
        // i64.load, f64.load, i64.store, f64.store
        0x29 | 0x2B | 0x37 | 0x39 => 8,
        // i32.load, f32.load, i64.load32_*, i32.store, f32.store, i64.store32
        0x28 | 0x2A | 0x34 | 0x35 | 0x36 | 0x38 | 0x3E => 4,
        // *.load16_*, *.store16
        0x2E | 0x2F | 0x32 | 0x33 | 0x3B | 0x3D => 2,
        _ => 1,
    }
}

/// Value type produced by a load or consumed by a store.
pub fn access_type(opcode: u8) -> ValueType {
    match opcode {
        0x28 | 0x2C..=0x2F | 0x36 | 0x3A | 0x3B => ValueType::I32,
        0x2A | 0x38 => ValueType::F32,
        0x2B | 0x39 => ValueType::F64,
        _ => ValueType::I64,
    }
}

/// Operand and result types of a numeric opcode (0x45..=0xC4).
pub fn numeric_signature(opcode: u8) -> Option<(&'static [ValueType], ValueType)> {
    use ValueType::{F32, F64, I32, I64};
    let signature: (&'static [ValueType], ValueType) = match opcode {
        0x45 => (&[I32], I32),
        0x46..=0x4F => (&[I32, I32], I32),
        0x50 => (&[I64], I32),
        0x51..=0x5A => (&[I64, I64], I32),
        0x5B..=0x60 => (&[F32, F32], I32),
        0x61..=0x66 => (&[F64, F64], I32),
        0x67..=0x69 => (&[I32], I32),
        0x6A..=0x78 => (&[I32, I32], I32),
        0x79..=0x7B => (&[I64], I64),
        0x7C..=0x8A => (&[I64, I64], I64),
        0x8B..=0x91 => (&[F32], F32),
        0x92..=0x98 => (&[F32, F32], F32),
        0x99..=0x9F => (&[F64], F64),
        0xA0..=0xA6 => (&[F64, F64], F64),
        0xA7 => (&[I64], I32),
        0xA8 | 0xA9 => (&[F32], I32),
        0xAA | 0xAB => (&[F64], I32),
        0xAC | 0xAD => (&[I32], I64),
        0xAE | 0xAF => (&[F32], I64),
        0xB0 | 0xB1 => (&[F64], I64),
        0xB2 | 0xB3 => (&[I32], F32),
        0xB4 | 0xB5 => (&[I64], F32),
        0xB6 => (&[F64], F32),
        0xB7 | 0xB8 => (&[I32], F64),
        0xB9 | 0xBA => (&[I64], F64),
        0xBB => (&[F32], F64),
        0xBC => (&[F32], I32),
        0xBD => (&[F64], I64),
        0xBE => (&[I32], F32),
        0xBF => (&[I64], F64),
        0xC0 | 0xC1 => (&[I32], I32),
        0xC2..=0xC4 => (&[I64], I64),
        _ => return None,
    };
    Some(signature)
}

/// Operand and result type of `0xFC` saturating truncation `sub`.
pub fn trunc_sat_signature(sub: u8) -> (ValueType, ValueType) {
    use ValueType::{F32, F64, I32, I64};
    match sub {
        0 | 1 => (F32, I32),
        2 | 3 => (F64, I32),
        4 | 5 => (F32, I64),
        _ => (F64, I64),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(bytes: &[u8]) -> Vec<Instr> {
        let mut reader = BinaryReader::new(bytes);
        let mut out = Vec::new();
        while !reader.eof() {
            out.push(read_instr(&mut reader).unwrap());
        }
        out
    }

    #[test]
    fn decode_control_and_immediates() {
        let instrs = decode_all(&[
            0x02, 0x7F, // block (result i32)
            0x41, 0x7F, // i32.const -1
            0x0E, 0x02, 0x00, 0x01, 0x00, // br_table 0 1 0
            0x0B, // end
        ]);
        assert_eq!(
            instrs,
            vec![
                Instr::Block(BlockType::Value(ValueType::I32)),
                Instr::I32Const(-1),
                Instr::BrTable {
                    targets: vec![0, 1].into_boxed_slice(),
                    default: 0
                },
                Instr::End,
            ]
        );
    }

    #[test]
    fn decode_type_indexed_block_and_memarg() {
        let instrs = decode_all(&[0x03, 0x02, 0x28, 0x02, 0x10, 0xFC, 0x0B, 0x00]);
        assert_eq!(
            instrs,
            vec![
                Instr::Loop(BlockType::Func(2)),
                Instr::Load {
                    opcode: 0x28,
                    align: 2,
                    offset: 16
                },
                Instr::MemoryFill(0),
            ]
        );
    }

    #[test]
    fn unknown_opcodes() {
        let mut reader = BinaryReader::new_at(&[0x06], 40);
        assert_eq!(
            read_instr(&mut reader),
            Err(ParseError::UnknownOpcode {
                offset: 40,
                opcode: 0x06
            })
        );
        let mut reader = BinaryReader::new(&[0xFC, 0x12]);
        assert_eq!(
            read_instr(&mut reader),
            Err(ParseError::UnknownOpcode {
                offset: 0,
                opcode: 0xFC12
            })
        );
    }

    #[test]
    fn numeric_signatures_cover_range() {
        for op in 0x45..=0xC4u8 {
            assert!(numeric_signature(op).is_some(), "opcode {op:#x}");
        }
        assert_eq!(
            numeric_signature(0xA7),
            Some((&[ValueType::I64][..], ValueType::I32))
        );
    }

    #[test]
    fn access_widths() {
        assert_eq!(access_width(0x29), 8);
        assert_eq!(access_width(0x2D), 1);
        assert_eq!(access_width(0x3D), 2);
        assert_eq!(access_type(0x35), ValueType::I64);
        assert_eq!(access_type(0x3B), ValueType::I32);
    }
}
