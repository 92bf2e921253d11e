//! Static validation.
//!
//! Module-level index and type checks, then a type-stack simulation of every
//! function body using the standard control-frame algorithm: each `block`,
//! `loop` and `if` records the operand height at entry, and after an
//! unconditional branch the stack above that height becomes polymorphic.

use std::collections::HashSet;
use std::fmt::Display;

use tessel_runtime::{RefType, ValueType, MAX_PAGES};

use crate::error::{ParseError, ValidationError};
use crate::instr::{
    access_type, access_width, numeric_signature, read_instr, trunc_sat_signature, Instr,
};
use crate::module::{
    ConstExpr, ConstOp, DataMode, ElementMode, ExternKind, FunctionBody, ImportKind, Module,
};
use crate::reader::BinaryReader;
use crate::types::{BlockType, FuncType, Limits, TypeList};

type Result<T> = std::result::Result<T, ValidationError>;

/// Validate a whole module.
pub(crate) fn validate(module: &Module) -> Result<()> {
    for import in &module.imports {
        match &import.kind {
            ImportKind::Func(ty) => {
                check_type_index(module, *ty)?;
            }
            ImportKind::Table(tt) => check_limits("table", tt.limits, u32::MAX)?,
            ImportKind::Memory(mt) => check_limits("memory", mt.limits, MAX_PAGES)?,
            ImportKind::Global(_) => {}
        }
    }
    for &ty in &module.functions {
        check_type_index(module, ty)?;
    }
    for tt in &module.tables {
        check_limits("table", tt.limits, u32::MAX)?;
    }
    for mt in &module.memories {
        check_limits("memory", mt.limits, MAX_PAGES)?;
    }
    if module.memory_types.len() > 1 {
        return Err(ValidationError::MultipleMemories);
    }

    let imported_globals = module.global_types.len() - module.globals.len();
    for (i, global) in module.globals.iter().enumerate() {
        check_const_expr(
            module,
            &global.init,
            global.ty.value_type,
            imported_globals + i,
        )?;
    }
    let all_globals = module.global_types.len();

    let mut names = HashSet::new();
    for export in &module.exports {
        if !names.insert(export.name.as_str()) {
            return Err(ValidationError::DuplicateExport {
                name: export.name.clone(),
            });
        }
        let index = export.index;
        match export.kind {
            ExternKind::Func if module.func_type_index(index).is_none() => {
                return Err(ValidationError::UnknownFunctionIndex { index })
            }
            ExternKind::Table if module.table_type(index).is_none() => {
                return Err(ValidationError::UnknownTable { index })
            }
            ExternKind::Memory if module.memory_type(index).is_none() => {
                return Err(ValidationError::UnknownMemory { index })
            }
            ExternKind::Global if module.global_type(index).is_none() => {
                return Err(ValidationError::UnknownGlobal { index })
            }
            _ => {}
        }
    }

    if let Some(index) = module.start {
        let ty = module
            .func_type(index)
            .ok_or(ValidationError::UnknownFunctionIndex { index })?;
        if !ty.params().is_empty() || !ty.results().is_empty() {
            return Err(ValidationError::InvalidStartFunction { index });
        }
    }

    for segment in &module.elements {
        for item in &segment.items {
            check_const_expr(module, item, segment.elem_type.into(), all_globals)?;
        }
        if let ElementMode::Active { table, offset } = &segment.mode {
            let tt = module
                .table_type(*table)
                .ok_or(ValidationError::UnknownTable { index: *table })?;
            check_elem_type(tt.elem, segment.elem_type)?;
            check_const_expr(module, offset, ValueType::I32, all_globals)?;
        }
    }

    for segment in &module.data {
        if let DataMode::Active { memory, offset } = &segment.mode {
            if module.memory_type(*memory).is_none() {
                return Err(ValidationError::UnknownMemory { index: *memory });
            }
            check_const_expr(module, offset, ValueType::I32, all_globals)?;
        }
    }

    let imported_funcs = module.imported_func_count();
    for (i, (body, &ty)) in module.bodies.iter().zip(&module.functions).enumerate() {
        let func = imported_funcs + i as u32;
        let ty = check_type_index(module, ty)?;
        FuncValidator::new(module, func, ty, body).run(body)?;
    }
    Ok(())
}

fn check_type_index(module: &Module, index: u32) -> Result<&FuncType> {
    module
        .types
        .get(index as usize)
        .ok_or(ValidationError::UnknownTypeIndex { index })
}

fn check_limits(what: &'static str, limits: Limits, bound: u32) -> Result<()> {
    let Limits { min, max } = limits;
    let too_big = min > bound || max.is_some_and(|m| m > bound);
    if too_big || max.is_some_and(|m| m < min) {
        return Err(ValidationError::InvalidLimits { what, min, max });
    }
    Ok(())
}

fn check_elem_type(expected: RefType, found: RefType) -> Result<()> {
    if expected != found {
        return Err(ValidationError::InvalidElementType {
            expected: expected.to_string(),
            found: found.to_string(),
        });
    }
    Ok(())
}

/// A constant expression must leave exactly one value of type `expected`.
/// `global.get` may only read immutable globals below `visible_globals`.
fn check_const_expr(
    module: &Module,
    expr: &ConstExpr,
    expected: ValueType,
    visible_globals: usize,
) -> Result<()> {
    let invalid = |reason| ValidationError::InvalidConstExpr {
        offset: expr.offset,
        reason,
    };
    let mut stack = Vec::with_capacity(1);
    for op in &expr.ops {
        let ty = match *op {
            ConstOp::I32Const(_) => ValueType::I32,
            ConstOp::I64Const(_) => ValueType::I64,
            ConstOp::F32Const(_) => ValueType::F32,
            ConstOp::F64Const(_) => ValueType::F64,
            ConstOp::RefNull(ty) => ty.into(),
            ConstOp::RefFunc(index) => {
                if module.func_type_index(index).is_none() {
                    return Err(ValidationError::UnknownFunctionIndex { index });
                }
                ValueType::FuncRef
            }
            ConstOp::GlobalGet(index) => {
                if index as usize >= visible_globals {
                    return Err(ValidationError::UnknownGlobal { index });
                }
                let gt = module
                    .global_type(index)
                    .ok_or(ValidationError::UnknownGlobal { index })?;
                if gt.mutable {
                    return Err(invalid("global.get of a mutable global"));
                }
                gt.value_type
            }
        };
        stack.push(ty);
    }
    match stack.as_slice() {
        [ty] if *ty == expected => Ok(()),
        [_] => Err(invalid("constant expression has the wrong type")),
        _ => Err(invalid("constant expression must produce one value")),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameKind {
    Function,
    Block,
    Loop,
    If,
    Else,
}

#[derive(Debug)]
struct CtrlFrame {
    kind: FrameKind,
    params: Vec<ValueType>,
    results: Vec<ValueType>,
    height: usize,
    unreachable: bool,
}

impl CtrlFrame {
    /// Types a branch to this frame carries.
    fn label_types(&self) -> &[ValueType] {
        if self.kind == FrameKind::Loop {
            &self.params
        } else {
            &self.results
        }
    }
}

/// Type-checks one function body. `None` on the value stack is the unknown
/// type of a polymorphic stack.
struct FuncValidator<'m> {
    module: &'m Module,
    func: u32,
    locals: Vec<ValueType>,
    results: &'m [ValueType],
    vals: Vec<Option<ValueType>>,
    ctrls: Vec<CtrlFrame>,
    offset: usize,
}

impl<'m> FuncValidator<'m> {
    fn new(module: &'m Module, func: u32, ty: &'m FuncType, body: &FunctionBody) -> Self {
        let mut locals = ty.params().to_vec();
        for &(count, ty) in &body.locals {
            locals.extend(std::iter::repeat(ty).take(count as usize));
        }
        Self {
            module,
            func,
            locals,
            results: ty.results(),
            vals: Vec::new(),
            ctrls: Vec::new(),
            offset: body.code.start,
        }
    }

    fn run(mut self, body: &FunctionBody) -> Result<()> {
        let bytes = self.module.slice(body.code.clone());
        let mut reader = BinaryReader::new_at(bytes, body.code.start);
        self.push_ctrl(FrameKind::Function, Vec::new(), self.results.to_vec());
        while !reader.eof() {
            self.offset = reader.offset();
            let instr = read_instr(&mut reader).map_err(|source| self.malformed(source))?;
            self.step(instr)?;
            if self.ctrls.is_empty() {
                if !reader.eof() {
                    return Err(self.malformed(ParseError::Malformed {
                        offset: reader.offset(),
                        reason: "bytes after the end of the function body",
                    }));
                }
                return Ok(());
            }
        }
        Err(self.malformed(ParseError::TruncatedInput {
            offset: reader.offset(),
        }))
    }

    fn malformed(&self, source: ParseError) -> ValidationError {
        ValidationError::MalformedCode {
            func: self.func,
            source,
        }
    }

    fn mismatch(&self, expected: impl Display, found: impl Display) -> ValidationError {
        ValidationError::TypeMismatch {
            func: self.func,
            offset: self.offset,
            expected: expected.to_string(),
            found: found.to_string(),
        }
    }

    fn malformed_control(&self) -> ValidationError {
        ValidationError::MalformedControl {
            func: self.func,
            offset: self.offset,
        }
    }

    // ── Operand stack ────────────────────────────────────────────────────

    fn push(&mut self, ty: ValueType) {
        self.vals.push(Some(ty));
    }

    fn push_many(&mut self, types: &[ValueType]) {
        self.vals.extend(types.iter().copied().map(Some));
    }

    fn pop(&mut self) -> Result<Option<ValueType>> {
        let frame = self.ctrls.last().ok_or_else(|| self.malformed_control())?;
        if self.vals.len() == frame.height {
            if frame.unreachable {
                return Ok(None);
            }
            return Err(self.mismatch("a value", "an empty stack"));
        }
        Ok(self.vals.pop().flatten())
    }

    fn pop_expect(&mut self, expected: ValueType) -> Result<()> {
        match self.pop()? {
            Some(found) if found != expected => Err(self.mismatch(expected, found)),
            _ => Ok(()),
        }
    }

    fn pop_many(&mut self, types: &[ValueType]) -> Result<Vec<Option<ValueType>>> {
        let mut popped = Vec::with_capacity(types.len());
        for &ty in types.iter().rev() {
            let found = self.pop()?;
            if let Some(found) = found {
                if found != ty {
                    return Err(self.mismatch(ty, found));
                }
            }
            popped.push(found.or(Some(ty)));
        }
        popped.reverse();
        Ok(popped)
    }

    fn pop_ref(&mut self) -> Result<()> {
        match self.pop()? {
            Some(found) if !found.is_ref() => Err(self.mismatch("a reference", found)),
            _ => Ok(()),
        }
    }

    // ── Control stack ────────────────────────────────────────────────────

    fn push_ctrl(&mut self, kind: FrameKind, params: Vec<ValueType>, results: Vec<ValueType>) {
        let height = self.vals.len();
        self.push_many(&params);
        self.ctrls.push(CtrlFrame {
            kind,
            params,
            results,
            height,
            unreachable: false,
        });
    }

    fn pop_ctrl(&mut self) -> Result<CtrlFrame> {
        let results = match self.ctrls.last() {
            Some(frame) => frame.results.clone(),
            None => return Err(self.malformed_control()),
        };
        self.pop_many(&results)?;
        let height = self.ctrls.last().map_or(0, |f| f.height);
        if self.vals.len() != height {
            return Err(self.mismatch(TypeList(&results), "extra values on the stack"));
        }
        self.ctrls.pop().ok_or_else(|| self.malformed_control())
    }

    fn set_unreachable(&mut self) {
        if let Some(frame) = self.ctrls.last_mut() {
            self.vals.truncate(frame.height);
            frame.unreachable = true;
        }
    }

    fn label_types(&self, depth: u32) -> Result<Vec<ValueType>> {
        self.ctrls
            .iter()
            .rev()
            .nth(depth as usize)
            .map(|frame| frame.label_types().to_vec())
            .ok_or(ValidationError::InvalidBranchTarget {
                func: self.func,
                offset: self.offset,
                depth,
            })
    }

    fn enter_block(&mut self, kind: FrameKind, bt: BlockType) -> Result<()> {
        let (params, results) = self.block_signature(bt)?;
        if kind == FrameKind::If {
            self.pop_expect(ValueType::I32)?;
        }
        self.pop_many(&params)?;
        self.push_ctrl(kind, params, results);
        Ok(())
    }

    fn block_signature(&self, bt: BlockType) -> Result<(Vec<ValueType>, Vec<ValueType>)> {
        match bt {
            BlockType::Empty => Ok((Vec::new(), Vec::new())),
            BlockType::Value(ty) => Ok((Vec::new(), vec![ty])),
            BlockType::Func(index) => {
                let ty = check_type_index(self.module, index)?;
                Ok((ty.params().to_vec(), ty.results().to_vec()))
            }
        }
    }

    // ── Index lookups ────────────────────────────────────────────────────

    fn local(&self, index: u32) -> Result<ValueType> {
        self.locals
            .get(index as usize)
            .copied()
            .ok_or(ValidationError::UnknownLocal {
                func: self.func,
                index,
            })
    }

    fn table_elem(&self, index: u32) -> Result<ValueType> {
        self.module
            .table_type(index)
            .map(|tt| tt.elem.into())
            .ok_or(ValidationError::UnknownTable { index })
    }

    fn memory(&self, index: u32) -> Result<()> {
        self.module
            .memory_type(index)
            .map(|_| ())
            .ok_or(ValidationError::UnknownMemory { index })
    }

    fn data_segment(&self, index: u32) -> Result<()> {
        if index as usize >= self.module.data.len() {
            return Err(ValidationError::UnknownDataSegment { index });
        }
        Ok(())
    }

    fn check_align(&self, opcode: u8, align: u32) -> Result<()> {
        let natural = access_width(opcode);
        if align >= 32 || (1u32 << align) > natural {
            return Err(ValidationError::InvalidAlignment {
                func: self.func,
                offset: self.offset,
            });
        }
        Ok(())
    }

    // ── Instructions ─────────────────────────────────────────────────────

    fn step(&mut self, instr: Instr) -> Result<()> {
        use ValueType::{F32, F64, I32, I64};
        match instr {
            Instr::Unreachable => self.set_unreachable(),
            Instr::Nop => {}
            Instr::Block(bt) => self.enter_block(FrameKind::Block, bt)?,
            Instr::Loop(bt) => self.enter_block(FrameKind::Loop, bt)?,
            Instr::If(bt) => self.enter_block(FrameKind::If, bt)?,
            Instr::Else => {
                let frame = self.pop_ctrl()?;
                if frame.kind != FrameKind::If {
                    return Err(self.malformed_control());
                }
                self.push_ctrl(FrameKind::Else, frame.params, frame.results);
            }
            Instr::End => {
                let frame = self.pop_ctrl()?;
                if frame.kind == FrameKind::If && frame.params != frame.results {
                    return Err(self.mismatch(TypeList(&frame.results), TypeList(&frame.params)));
                }
                self.push_many(&frame.results);
            }
            Instr::Br(depth) => {
                let types = self.label_types(depth)?;
                self.pop_many(&types)?;
                self.set_unreachable();
            }
            Instr::BrIf(depth) => {
                self.pop_expect(I32)?;
                let types = self.label_types(depth)?;
                self.pop_many(&types)?;
                self.push_many(&types);
            }
            Instr::BrTable { targets, default } => {
                self.pop_expect(I32)?;
                let default_types = self.label_types(default)?;
                for &target in targets.iter() {
                    let types = self.label_types(target)?;
                    if types.len() != default_types.len() {
                        return Err(self.mismatch(TypeList(&default_types), TypeList(&types)));
                    }
                    let popped = self.pop_many(&types)?;
                    self.vals.extend(popped);
                }
                self.pop_many(&default_types)?;
                self.set_unreachable();
            }
            Instr::Return => {
                self.pop_many(self.results)?;
                self.set_unreachable();
            }
            Instr::Call(index) => {
                let ty = self
                    .module
                    .func_type(index)
                    .ok_or(ValidationError::UnknownFunctionIndex { index })?;
                self.pop_many(ty.params())?;
                self.push_many(ty.results());
            }
            Instr::CallIndirect { type_index, table } => {
                let elem = self.table_elem(table)?;
                if elem != ValueType::FuncRef {
                    return Err(ValidationError::InvalidElementType {
                        expected: ValueType::FuncRef.to_string(),
                        found: elem.to_string(),
                    });
                }
                let ty = check_type_index(self.module, type_index)?;
                self.pop_expect(I32)?;
                self.pop_many(ty.params())?;
                self.push_many(ty.results());
            }
            Instr::Drop => {
                self.pop()?;
            }
            Instr::Select(None) => {
                self.pop_expect(I32)?;
                let first = self.pop()?;
                let second = self.pop()?;
                for ty in [first, second].into_iter().flatten() {
                    if ty.is_ref() {
                        return Err(self.mismatch("a numeric type", ty));
                    }
                }
                match (first, second) {
                    (Some(a), Some(b)) if a != b => return Err(self.mismatch(a, b)),
                    (Some(ty), _) | (None, Some(ty)) => self.push(ty),
                    (None, None) => self.vals.push(None),
                }
            }
            Instr::Select(Some(ty)) => {
                self.pop_expect(I32)?;
                self.pop_expect(ty)?;
                self.pop_expect(ty)?;
                self.push(ty);
            }
            Instr::LocalGet(index) => {
                let ty = self.local(index)?;
                self.push(ty);
            }
            Instr::LocalSet(index) => {
                let ty = self.local(index)?;
                self.pop_expect(ty)?;
            }
            Instr::LocalTee(index) => {
                let ty = self.local(index)?;
                self.pop_expect(ty)?;
                self.push(ty);
            }
            Instr::GlobalGet(index) => {
                let gt = self
                    .module
                    .global_type(index)
                    .ok_or(ValidationError::UnknownGlobal { index })?;
                self.push(gt.value_type);
            }
            Instr::GlobalSet(index) => {
                let gt = *self
                    .module
                    .global_type(index)
                    .ok_or(ValidationError::UnknownGlobal { index })?;
                if !gt.mutable {
                    return Err(ValidationError::ImmutableGlobal { index });
                }
                self.pop_expect(gt.value_type)?;
            }
            Instr::TableGet(table) => {
                let elem = self.table_elem(table)?;
                self.pop_expect(I32)?;
                self.push(elem);
            }
            Instr::TableSet(table) => {
                let elem = self.table_elem(table)?;
                self.pop_expect(elem)?;
                self.pop_expect(I32)?;
            }
            Instr::Load { opcode, align, .. } => {
                self.memory(0)?;
                self.check_align(opcode, align)?;
                self.pop_expect(I32)?;
                self.push(access_type(opcode));
            }
            Instr::Store { opcode, align, .. } => {
                self.memory(0)?;
                self.check_align(opcode, align)?;
                self.pop_expect(access_type(opcode))?;
                self.pop_expect(I32)?;
            }
            Instr::MemorySize(memory) => {
                self.memory(memory)?;
                self.push(I32);
            }
            Instr::MemoryGrow(memory) => {
                self.memory(memory)?;
                self.pop_expect(I32)?;
                self.push(I32);
            }
            Instr::I32Const(_) => self.push(I32),
            Instr::I64Const(_) => self.push(I64),
            Instr::F32Const(_) => self.push(F32),
            Instr::F64Const(_) => self.push(F64),
            Instr::Numeric(opcode) => {
                let (params, result) = numeric_signature(opcode).ok_or_else(|| {
                    self.malformed(ParseError::UnknownOpcode {
                        offset: self.offset,
                        opcode: u32::from(opcode),
                    })
                })?;
                self.pop_many(params)?;
                self.push(result);
            }
            Instr::RefNull(ty) => self.push(ty.into()),
            Instr::RefIsNull => {
                self.pop_ref()?;
                self.push(I32);
            }
            Instr::RefFunc(index) => {
                if self.module.func_type_index(index).is_none() {
                    return Err(ValidationError::UnknownFunctionIndex { index });
                }
                self.push(ValueType::FuncRef);
            }
            Instr::TruncSat(sub) => {
                let (from, to) = trunc_sat_signature(sub);
                self.pop_expect(from)?;
                self.push(to);
            }
            Instr::MemoryInit { data, memory } => {
                self.memory(memory)?;
                self.data_segment(data)?;
                self.pop_many(&[I32, I32, I32])?;
            }
            Instr::DataDrop(data) => self.data_segment(data)?,
            Instr::MemoryCopy { dst, src } => {
                self.memory(dst)?;
                self.memory(src)?;
                self.pop_many(&[I32, I32, I32])?;
            }
            Instr::MemoryFill(memory) => {
                self.memory(memory)?;
                self.pop_many(&[I32, I32, I32])?;
            }
            Instr::TableInit { elem, table } => {
                let table_elem = self.module.table_type(table).map(|tt| tt.elem);
                let table_elem = table_elem.ok_or(ValidationError::UnknownTable { index: table })?;
                let segment = self
                    .module
                    .elements
                    .get(elem as usize)
                    .ok_or(ValidationError::UnknownElementSegment { index: elem })?;
                check_elem_type(table_elem, segment.elem_type)?;
                self.pop_many(&[I32, I32, I32])?;
            }
            Instr::ElemDrop(elem) => {
                if elem as usize >= self.module.elements.len() {
                    return Err(ValidationError::UnknownElementSegment { index: elem });
                }
            }
            Instr::TableCopy { dst, src } => {
                let dst_elem = self.table_elem(dst)?;
                let src_elem = self.table_elem(src)?;
                if dst_elem != src_elem {
                    return Err(ValidationError::InvalidElementType {
                        expected: dst_elem.to_string(),
                        found: src_elem.to_string(),
                    });
                }
                self.pop_many(&[I32, I32, I32])?;
            }
            Instr::TableGrow(table) => {
                let elem = self.table_elem(table)?;
                self.pop_expect(I32)?;
                self.pop_expect(elem)?;
                self.push(I32);
            }
            Instr::TableSize(table) => {
                self.table_elem(table)?;
                self.push(I32);
            }
            Instr::TableFill(table) => {
                let elem = self.table_elem(table)?;
                self.pop_expect(I32)?;
                self.pop_expect(elem)?;
                self.pop_expect(I32)?;
            }
        }
        Ok(())
    }
}
