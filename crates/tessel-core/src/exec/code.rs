//! Decoded function bodies.
//!
//! A body is decoded once into a flat instruction list with its structured
//! control already resolved: every `block`, `loop`, `if` and `else` knows the
//! index of its matching `end`, and every `if` knows where its `else` is.

use tessel_runtime::ValueType;

use crate::error::ParseError;
use crate::instr::{read_instr, Instr};
use crate::module::{FunctionBody, Module};
use crate::reader::BinaryReader;

const NONE: usize = usize::MAX;

#[derive(Debug)]
pub(crate) struct Code {
    pub(crate) instrs: Vec<Instr>,
    /// Absolute module offset of each instruction.
    offsets: Vec<usize>,
    end_at: Vec<usize>,
    else_at: Vec<usize>,
    /// Declared locals, expanded (parameters not included).
    pub(crate) locals: Vec<ValueType>,
    /// Offset one past the body, reported for traps past the last instruction.
    end_offset: usize,
}

impl Code {
    pub(crate) fn len(&self) -> usize {
        self.instrs.len()
    }

    pub(crate) fn offset(&self, pc: usize) -> usize {
        self.offsets.get(pc).copied().unwrap_or(self.end_offset)
    }

    /// Index of the `end` closing the construct opened at `pc`.
    pub(crate) fn end_of(&self, pc: usize) -> Option<usize> {
        self.end_at.get(pc).copied().filter(|&at| at != NONE)
    }

    /// Index of the `else` of the `if` at `pc`, if it has one.
    pub(crate) fn else_of(&self, pc: usize) -> Option<usize> {
        self.else_at.get(pc).copied().filter(|&at| at != NONE)
    }
}

fn unbalanced(offset: usize) -> ParseError {
    ParseError::Malformed {
        offset,
        reason: "unbalanced control instructions",
    }
}

pub(crate) fn compile(module: &Module, body: &FunctionBody) -> Result<Code, ParseError> {
    let bytes = module.slice(body.code.clone());
    let mut reader = BinaryReader::new_at(bytes, body.code.start);

    let mut instrs = Vec::new();
    let mut offsets = Vec::new();
    // Nesting depth of open `block`/`loop`/`if` constructs.
    let mut depth = 0usize;
    let mut closed = false;

    while !reader.eof() {
        let offset = reader.offset();
        let instr = read_instr(&mut reader)?;
        match &instr {
            Instr::Block(_) | Instr::Loop(_) | Instr::If(_) => depth += 1,
            Instr::End if depth == 0 => closed = true,
            Instr::End => depth -= 1,
            _ => {}
        }
        instrs.push(instr);
        offsets.push(offset);
        if closed {
            break;
        }
    }
    if !closed || !reader.eof() {
        return Err(unbalanced(reader.offset()));
    }

    let (end_at, else_at) = resolve_control(&instrs, reader.offset())?;
    let locals = body
        .locals
        .iter()
        .flat_map(|&(count, ty)| std::iter::repeat(ty).take(count as usize))
        .collect();

    Ok(Code {
        instrs,
        offsets,
        end_at,
        else_at,
        locals,
        end_offset: reader.offset(),
    })
}

/// Match every structured instruction with its `end` (and `if` with `else`).
fn resolve_control(
    instrs: &[Instr],
    end_offset: usize,
) -> Result<(Vec<usize>, Vec<usize>), ParseError> {
    let mut end_at = vec![NONE; instrs.len()];
    let mut else_at = vec![NONE; instrs.len()];
    // (opener pc, else pc)
    let mut open: Vec<(usize, Option<usize>)> = Vec::new();

    for (pc, instr) in instrs.iter().enumerate() {
        match instr {
            Instr::Block(_) | Instr::Loop(_) | Instr::If(_) => open.push((pc, None)),
            Instr::Else => {
                let top = open.last_mut().ok_or_else(|| unbalanced(end_offset))?;
                top.1 = Some(pc);
                if let Some(slot) = else_at.get_mut(top.0) {
                    *slot = pc;
                }
            }
            Instr::End => {
                // The function's own `end` closes nothing.
                let Some((opener, else_pc)) = open.pop() else {
                    continue;
                };
                if let Some(slot) = end_at.get_mut(opener) {
                    *slot = pc;
                }
                if let Some(slot) = else_pc.and_then(|at| end_at.get_mut(at)) {
                    *slot = pc;
                }
            }
            _ => {}
        }
    }
    Ok((end_at, else_at))
}
