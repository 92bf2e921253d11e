//! The interpreter.
//!
//! Execution is iterative: wasm-to-wasm calls push a [`Frame`] onto an
//! explicit frame stack instead of recursing on the native stack, so deep
//! wasm recursion is bounded only by `HostConfig::max_call_depth`. The only
//! native recursion is a host function calling back into its Instance, and
//! that shares the same depth budget.
//!
//! Structured control is executed from the side tables built by
//! [`code::compile`]: each entered `block`/`loop`/`if` pushes a [`Label`]
//! recording where a branch to it continues and how many values it carries.

pub(crate) mod code;
mod numeric;
mod stack;

use std::sync::Arc;

use tessel_runtime::{FuncRef, LinearMemory, TableInstance, Value, WasmTrap};
use tracing::warn;

use crate::error::{CallError, HostError, ParseError, Trap};
use crate::imports::HostFunc;
use crate::instance::{Caller, FuncInst, Instance};
use crate::instr::Instr;
use crate::types::{BlockType, TypeList};

use self::code::Code;
use self::stack::ValueStack;

/// Failure inside the interpreter loop, before it is given a location.
#[derive(Debug)]
pub(crate) enum ExecError {
    Trap(WasmTrap),
    /// Propagated unchanged to the caller (host errors, nested calls).
    Call(CallError),
    /// A callee body failed to decode.
    Decode { func: u32, source: ParseError },
    /// Broken interpreter state; only reachable with unvalidated code.
    Corrupt(&'static str),
}

impl From<WasmTrap> for ExecError {
    fn from(kind: WasmTrap) -> Self {
        ExecError::Trap(kind)
    }
}

impl ExecError {
    fn at(self, func: u32, offset: usize) -> CallError {
        match self {
            ExecError::Trap(kind) => CallError::Trap(Trap { kind, func, offset }),
            ExecError::Call(err) => err,
            ExecError::Decode { func, source } => CallError::InvalidCode {
                func,
                reason: source.to_string(),
            },
            ExecError::Corrupt(reason) => CallError::InvalidCode {
                func,
                reason: reason.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Label {
    /// Values carried by a branch to this label.
    arity: usize,
    /// Operand stack height below the construct's parameters.
    height: usize,
    /// Instruction index a branch continues at.
    cont: usize,
    /// Branching to a loop re-enters it, so its label stays.
    is_loop: bool,
}

struct Frame {
    func: u32,
    code: Arc<Code>,
    pc: usize,
    locals: Vec<Value>,
    /// Operand stack height at entry, arguments already removed.
    base: usize,
    arity: usize,
    labels: Vec<Label>,
}

enum Flow {
    Next,
    Jump(usize),
    Call(u32),
    Return,
}

/// Run function `func` of `instance` to completion.
///
/// The instance's call depth is restored on exit whatever the outcome. A
/// stack overflow poisons the instance.
pub(crate) fn invoke(
    instance: &mut Instance,
    func: u32,
    args: Vec<Value>,
) -> Result<Vec<Value>, CallError> {
    let entry_depth = instance.depth;
    let result = Machine {
        instance: &mut *instance,
        stack: ValueStack::from_values(args),
        frames: Vec::new(),
    }
    .run(func);
    instance.depth = entry_depth;

    if let Err(CallError::Trap(trap)) = &result {
        if trap.kind == WasmTrap::StackOverflow && !instance.poisoned {
            warn!(
                target: "tessel::exec",
                func = trap.func,
                depth = entry_depth,
                "call stack exhausted, instance poisoned"
            );
            instance.poisoned = true;
        }
    }
    result
}

struct Machine<'a> {
    instance: &'a mut Instance,
    stack: ValueStack,
    frames: Vec<Frame>,
}

impl Machine<'_> {
    fn run(mut self, func: u32) -> Result<Vec<Value>, CallError> {
        self.call(func).map_err(|e| e.at(func, 0))?;

        while let Some(frame) = self.frames.last() {
            let code = Arc::clone(&frame.code);
            let func = frame.func;
            let mut pc = frame.pc;

            let flow = loop {
                let Some(instr) = code.instrs.get(pc) else {
                    break Ok(Flow::Return);
                };
                match self.step(&code, pc, instr) {
                    Ok(Flow::Next) => pc += 1,
                    Ok(Flow::Jump(target)) => pc = target,
                    other => break other,
                }
            };

            match flow {
                Ok(Flow::Call(callee)) => {
                    if let Some(frame) = self.frames.last_mut() {
                        frame.pc = pc + 1;
                    }
                    self.call(callee).map_err(|e| e.at(func, code.offset(pc)))?;
                }
                Ok(_) => self.ret().map_err(|e| e.at(func, code.offset(pc)))?,
                Err(e) => return Err(e.at(func, code.offset(pc))),
            }
        }
        Ok(self.stack.into_values())
    }

    /// Enter `func`: push a frame for a defined function, or run a host
    /// function to completion.
    fn call(&mut self, func: u32) -> Result<(), ExecError> {
        if self.instance.depth >= self.instance.config.max_call_depth {
            return Err(WasmTrap::StackOverflow.into());
        }
        let defined = match self.instance.funcs.get(func as usize) {
            Some(FuncInst::Host(host)) => {
                let host = host.clone();
                return self.call_host(func, &host);
            }
            Some(FuncInst::Local { defined }) => *defined,
            None => return Err(ExecError::Corrupt("function index out of range")),
        };

        let module = Arc::clone(&self.instance.module);
        let code = module
            .code(defined)
            .map_err(|source| ExecError::Decode { func, source })?;
        let ty = module
            .func_type(func)
            .ok_or(ExecError::Corrupt("function without a type"))?;

        let mut locals = self.stack.pop_n(ty.params().len())?;
        locals.extend(code.locals.iter().map(|&ty| Value::default_for(ty)));
        let live = self.stack.len() + locals.len();
        if live > self.instance.config.max_value_stack {
            return Err(WasmTrap::StackOverflow.into());
        }

        let arity = ty.results().len();
        let base = self.stack.len();
        let function_label = Label {
            arity,
            height: base,
            cont: code.len(),
            is_loop: false,
        };
        self.instance.depth += 1;
        self.frames.push(Frame {
            func,
            code,
            pc: 0,
            locals,
            base,
            arity,
            labels: vec![function_label],
        });
        Ok(())
    }

    fn call_host(&mut self, func: u32, host: &HostFunc) -> Result<(), ExecError> {
        let args = self.stack.pop_n(host.ty().params().len())?;

        self.instance.depth += 1;
        let outcome = host.call(&mut Caller::new(&mut *self.instance), &args);
        self.instance.depth -= 1;
        // A re-entrant call overflowed and the host swallowed the error.
        if self.instance.poisoned && !matches!(outcome, Err(HostError::Call(_))) {
            return Err(WasmTrap::StackOverflow.into());
        }

        let results = match outcome {
            Ok(results) => results,
            Err(HostError::Cancelled) => return Err(WasmTrap::HostCancelled.into()),
            Err(HostError::Call(err)) => return Err(ExecError::Call(*err)),
            Err(HostError::Custom(err)) => return Err(ExecError::Call(CallError::Host(err))),
        };
        let expected = host.ty().results();
        let matches = results.len() == expected.len()
            && results
                .iter()
                .zip(expected)
                .all(|(v, ty)| v.ty() == *ty && self.instance.admits(v));
        if !matches {
            let provided: Vec<_> = results.iter().map(Value::ty).collect();
            return Err(ExecError::Call(CallError::HostResultMismatch {
                func,
                expected: TypeList(expected).to_string(),
                provided: TypeList(&provided).to_string(),
            }));
        }
        self.stack.extend(results);
        Ok(())
    }

    /// Leave the innermost frame, keeping its results.
    fn ret(&mut self) -> Result<(), ExecError> {
        let frame = self
            .frames
            .pop()
            .ok_or(ExecError::Corrupt("return without a frame"))?;
        let results = self.stack.pop_n(frame.arity)?;
        self.stack.truncate(frame.base)?;
        self.stack.extend(results);
        self.instance.depth = self.instance.depth.saturating_sub(1);
        Ok(())
    }

    fn frame(&mut self) -> Result<&mut Frame, ExecError> {
        self.frames
            .last_mut()
            .ok_or(ExecError::Corrupt("no active frame"))
    }

    fn memory(&mut self) -> Result<&mut LinearMemory, ExecError> {
        self.instance
            .memories
            .first_mut()
            .ok_or(ExecError::Corrupt("no memory"))
    }

    fn table(&mut self, index: u32) -> Result<&mut TableInstance, ExecError> {
        self.instance
            .tables
            .get_mut(index as usize)
            .ok_or(ExecError::Corrupt("table index out of range"))
    }

    /// `(params, results)` counts of a block type.
    fn block_arity(&self, bt: BlockType) -> Result<(usize, usize), ExecError> {
        match bt {
            BlockType::Empty => Ok((0, 0)),
            BlockType::Value(_) => Ok((0, 1)),
            BlockType::Func(index) => self
                .instance
                .module
                .types()
                .get(index as usize)
                .map(|ty| (ty.params().len(), ty.results().len()))
                .ok_or(ExecError::Corrupt("block type index out of range")),
        }
    }

    fn enter(&mut self, bt: BlockType, cont: usize, is_loop: bool) -> Result<(), ExecError> {
        let (params, results) = self.block_arity(bt)?;
        let height = self
            .stack
            .len()
            .checked_sub(params)
            .ok_or(ExecError::Corrupt("operand stack underflow"))?;
        let arity = if is_loop { params } else { results };
        self.frame()?.labels.push(Label {
            arity,
            height,
            cont,
            is_loop,
        });
        Ok(())
    }

    /// Branch to the label `depth` levels out.
    fn branch(&mut self, depth: u32) -> Result<Flow, ExecError> {
        let Machine { stack, frames, .. } = self;
        let frame = frames
            .last_mut()
            .ok_or(ExecError::Corrupt("no active frame"))?;
        let index = frame
            .labels
            .len()
            .checked_sub(depth as usize + 1)
            .ok_or(ExecError::Corrupt("branch depth out of range"))?;
        let label = frame
            .labels
            .get(index)
            .copied()
            .ok_or(ExecError::Corrupt("branch depth out of range"))?;

        let carried = stack.pop_n(label.arity)?;
        stack.truncate(label.height)?;
        stack.extend(carried);
        frame
            .labels
            .truncate(if label.is_loop { index + 1 } else { index });
        Ok(Flow::Jump(label.cont))
    }

    fn step(&mut self, code: &Code, pc: usize, instr: &Instr) -> Result<Flow, ExecError> {
        match instr {
            Instr::Unreachable => return Err(WasmTrap::UnreachableExecuted.into()),
            Instr::Nop => {}
            Instr::Block(bt) => {
                let end = code.end_of(pc).ok_or(ExecError::Corrupt("unmatched block"))?;
                self.enter(*bt, end + 1, false)?;
            }
            Instr::Loop(bt) => self.enter(*bt, pc + 1, true)?,
            Instr::If(bt) => {
                let end = code.end_of(pc).ok_or(ExecError::Corrupt("unmatched if"))?;
                let condition = self.stack.pop_i32()?;
                if condition != 0 {
                    self.enter(*bt, end + 1, false)?;
                } else if let Some(else_pc) = code.else_of(pc) {
                    self.enter(*bt, end + 1, false)?;
                    return Ok(Flow::Jump(else_pc + 1));
                } else {
                    return Ok(Flow::Jump(end + 1));
                }
            }
            // End of the `then` arm: skip to the `end`, which pops the label.
            Instr::Else => {
                let end = code.end_of(pc).ok_or(ExecError::Corrupt("unmatched else"))?;
                return Ok(Flow::Jump(end));
            }
            Instr::End => {
                self.frame()?.labels.pop();
            }
            Instr::Br(depth) => return self.branch(*depth),
            Instr::BrIf(depth) => {
                if self.stack.pop_i32()? != 0 {
                    return self.branch(*depth);
                }
            }
            Instr::BrTable { targets, default } => {
                let index = self.stack.pop_u32()? as usize;
                let depth = targets.get(index).copied().unwrap_or(*default);
                return self.branch(depth);
            }
            Instr::Return => return Ok(Flow::Return),
            Instr::Call(func) => return Ok(Flow::Call(*func)),
            Instr::CallIndirect { type_index, table } => {
                let index = self.stack.pop_u32()?;
                let target = match self.table(*table)? {
                    TableInstance::Func(table) => table.get_func(index)?,
                    TableInstance::Extern(_) => {
                        return Err(ExecError::Corrupt("call_indirect through an externref table"))
                    }
                };
                if target.owner != self.instance.id {
                    return Err(WasmTrap::IndirectCallTypeMismatch.into());
                }
                let types = self.instance.module.types();
                let expected = types.get(*type_index as usize);
                let actual = types.get(target.type_index as usize);
                if expected.is_none() || expected != actual {
                    return Err(WasmTrap::IndirectCallTypeMismatch.into());
                }
                return Ok(Flow::Call(target.func_index));
            }

            Instr::Drop => {
                self.stack.pop()?;
            }
            Instr::Select(_) => {
                let condition = self.stack.pop_i32()?;
                let b = self.stack.pop()?;
                let a = self.stack.pop()?;
                self.stack.push(if condition != 0 { a } else { b });
            }
            Instr::LocalGet(index) => {
                let value = self
                    .frame()?
                    .locals
                    .get(*index as usize)
                    .cloned()
                    .ok_or(ExecError::Corrupt("local index out of range"))?;
                self.stack.push(value);
            }
            Instr::LocalSet(index) => {
                let value = self.stack.pop()?;
                self.set_local(*index, value)?;
            }
            Instr::LocalTee(index) => {
                let value = self.stack.pop()?;
                self.set_local(*index, value.clone())?;
                self.stack.push(value);
            }
            Instr::GlobalGet(index) => {
                let value = self
                    .instance
                    .globals
                    .get(*index as usize)
                    .cloned()
                    .ok_or(ExecError::Corrupt("global index out of range"))?;
                self.stack.push(value);
            }
            Instr::GlobalSet(index) => {
                let value = self.stack.pop()?;
                let slot = self
                    .instance
                    .globals
                    .get_mut(*index as usize)
                    .ok_or(ExecError::Corrupt("global index out of range"))?;
                *slot = value;
            }
            Instr::TableGet(table) => {
                let index = self.stack.pop_u32()?;
                let value = self.table(*table)?.get(index)?;
                self.stack.push(value);
            }
            Instr::TableSet(table) => {
                let value = self.stack.pop()?;
                let index = self.stack.pop_u32()?;
                self.table(*table)?.set(index, value)?;
            }

            Instr::Load { opcode, offset, .. } => {
                let addr = effective_address(self.stack.pop_u32()?, *offset);
                let value = load(self.memory()?, *opcode, addr)?;
                self.stack.push(value);
            }
            Instr::Store { opcode, offset, .. } => {
                let value = self.stack.pop()?;
                let addr = effective_address(self.stack.pop_u32()?, *offset);
                store(self.memory()?, *opcode, addr, value)?;
            }
            Instr::MemorySize(_) => {
                let pages = self.memory()?.size();
                self.stack.push(pages);
            }
            Instr::MemoryGrow(_) => {
                let delta = self.stack.pop_u32()?;
                let previous = self.memory()?.grow(delta);
                self.stack.push(previous);
            }

            Instr::I32Const(v) => self.stack.push(*v),
            Instr::I64Const(v) => self.stack.push(*v),
            Instr::F32Const(v) => self.stack.push(*v),
            Instr::F64Const(v) => self.stack.push(*v),
            Instr::Numeric(opcode) => numeric::execute(&mut self.stack, *opcode)?,
            Instr::TruncSat(sub) => numeric::trunc_sat(&mut self.stack, *sub)?,

            Instr::RefNull(ty) => self.stack.push(Value::null(*ty)),
            Instr::RefIsNull => {
                let value = self.stack.pop()?;
                self.stack.push(i32::from(value.is_null_ref()));
            }
            Instr::RefFunc(func) => {
                let type_index = self
                    .instance
                    .module
                    .func_type_index(*func)
                    .ok_or(ExecError::Corrupt("function index out of range"))?;
                self.stack.push(Value::FuncRef(Some(FuncRef {
                    type_index,
                    func_index: *func,
                    owner: self.instance.id,
                })));
            }

            Instr::MemoryInit { data, .. } => {
                let len = self.stack.pop_u32()? as usize;
                let src = self.stack.pop_u32()? as usize;
                let dst = self.stack.pop_u32()? as usize;
                let module = Arc::clone(&self.instance.module);
                let dropped = self
                    .instance
                    .dropped_data
                    .get(*data as usize)
                    .copied()
                    .unwrap_or(true);
                let bytes = if dropped { &[][..] } else { module.data_bytes(*data) };
                let chunk = src
                    .checked_add(len)
                    .and_then(|end| bytes.get(src..end))
                    .ok_or(WasmTrap::MemoryOutOfBounds)?;
                self.memory()?.write(dst, chunk)?;
            }
            Instr::DataDrop(data) => {
                if let Some(dropped) = self.instance.dropped_data.get_mut(*data as usize) {
                    *dropped = true;
                }
            }
            Instr::MemoryCopy { .. } => {
                let len = self.stack.pop_u32()?;
                let src = self.stack.pop_u32()?;
                let dst = self.stack.pop_u32()?;
                self.memory()?.memory_copy(dst, src, len)?;
            }
            Instr::MemoryFill(_) => {
                let len = self.stack.pop_u32()?;
                let value = self.stack.pop_i32()?;
                let dst = self.stack.pop_u32()?;
                self.memory()?.memory_fill(dst, value as u8, len)?;
            }
            Instr::TableInit { elem, table } => {
                let len = self.stack.pop_u32()? as usize;
                let src = self.stack.pop_u32()? as usize;
                let dst = self.stack.pop_u32()?;
                let items = self.instance.elements.get(*elem as usize).cloned().flatten();
                let items: &[Value] = items.as_deref().unwrap_or(&[]);
                let chunk = src
                    .checked_add(len)
                    .and_then(|end| items.get(src..end))
                    .ok_or(WasmTrap::TableOutOfBounds)?;
                self.table(*table)?.init(dst, chunk)?;
            }
            Instr::ElemDrop(elem) => {
                if let Some(items) = self.instance.elements.get_mut(*elem as usize) {
                    *items = None;
                }
            }
            Instr::TableCopy { dst: dst_table, src: src_table } => {
                let len = self.stack.pop_u32()?;
                let src = self.stack.pop_u32()?;
                let dst = self.stack.pop_u32()?;
                let source = self.table(*src_table)?;
                if u64::from(src) + u64::from(len) > u64::from(source.size()) {
                    return Err(WasmTrap::TableOutOfBounds.into());
                }
                let values = (src..src + len)
                    .map(|i| source.get(i))
                    .collect::<Result<Vec<_>, _>>()?;
                self.table(*dst_table)?.init(dst, &values)?;
            }
            Instr::TableGrow(table) => {
                let delta = self.stack.pop_u32()?;
                let init = self.stack.pop()?;
                let previous = self.table(*table)?.grow(delta, init)?;
                self.stack.push(previous);
            }
            Instr::TableSize(table) => {
                let size = self.table(*table)?.size();
                self.stack.push(size as i32);
            }
            Instr::TableFill(table) => {
                let len = self.stack.pop_u32()?;
                let value = self.stack.pop()?;
                let dst = self.stack.pop_u32()?;
                self.table(*table)?.fill(dst, value, len)?;
            }
        }
        Ok(Flow::Next)
    }

    fn set_local(&mut self, index: u32, value: Value) -> Result<(), ExecError> {
        let slot = self
            .frame()?
            .locals
            .get_mut(index as usize)
            .ok_or(ExecError::Corrupt("local index out of range"))?;
        *slot = value;
        Ok(())
    }
}

/// `base + offset` without 32-bit wrap-around.
#[inline]
fn effective_address(base: u32, offset: u32) -> usize {
    (u64::from(base) + u64::from(offset)) as usize
}

fn load(memory: &LinearMemory, opcode: u8, addr: usize) -> Result<Value, WasmTrap> {
    Ok(match opcode {
        0x28 => Value::I32(memory.load_i32(addr)?),
        0x29 => Value::I64(memory.load_i64(addr)?),
        0x2A => Value::F32(memory.load_f32(addr)?),
        0x2B => Value::F64(memory.load_f64(addr)?),
        0x2C => Value::I32(i32::from(memory.load_u8(addr)? as i8)),
        0x2D => Value::I32(i32::from(memory.load_u8(addr)?)),
        0x2E => Value::I32(i32::from(memory.load_u16(addr)? as i16)),
        0x2F => Value::I32(i32::from(memory.load_u16(addr)?)),
        0x30 => Value::I64(i64::from(memory.load_u8(addr)? as i8)),
        0x31 => Value::I64(i64::from(memory.load_u8(addr)?)),
        0x32 => Value::I64(i64::from(memory.load_u16(addr)? as i16)),
        0x33 => Value::I64(i64::from(memory.load_u16(addr)?)),
        0x34 => Value::I64(i64::from(memory.load_i32(addr)?)),
        _ => Value::I64(i64::from(memory.load_i32(addr)? as u32)),
    })
}

fn store(memory: &mut LinearMemory, opcode: u8, addr: usize, value: Value) -> Result<(), ExecError> {
    let bad = || ExecError::Corrupt("stored value has the wrong type");
    match (opcode, value) {
        (0x36, Value::I32(v)) => memory.store_i32(addr, v)?,
        (0x37, Value::I64(v)) => memory.store_i64(addr, v)?,
        (0x38, Value::F32(v)) => memory.store_f32(addr, v)?,
        (0x39, Value::F64(v)) => memory.store_f64(addr, v)?,
        (0x3A, Value::I32(v)) => memory.store_u8(addr, v as u8)?,
        (0x3B, Value::I32(v)) => memory.store_u16(addr, v as u16)?,
        (0x3C, Value::I64(v)) => memory.store_u8(addr, v as u8)?,
        (0x3D, Value::I64(v)) => memory.store_u16(addr, v as u16)?,
        (0x3E, Value::I64(v)) => memory.store_i32(addr, v as i32)?,
        _ => return Err(bad()),
    }
    Ok(())
}
