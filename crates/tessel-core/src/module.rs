//! `Module`: the parsed, immutable form of a WebAssembly binary.
//!
//! A Module is built once by the parser and shared behind an `Arc` by every
//! Instance created from it. Two write-once cells are its only interior
//! state: the validation verdict and the per-function decoded bodies.

use std::ops::Range;
use std::sync::{Arc, OnceLock};

use tessel_runtime::{RefType, ValueType};

use crate::error::{ParseError, ValidationError};
use crate::exec::code::{self, Code};
use crate::types::{FuncType, GlobalType, MemoryType, TableType};

/// What an import expects from the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportKind {
    /// Type index of the expected signature.
    Func(u32),
    Table(TableType),
    Memory(MemoryType),
    Global(GlobalType),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Import {
    pub module: String,
    pub field: String,
    pub kind: ImportKind,
}

/// Index space an export points into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExternKind {
    Func,
    Table,
    Memory,
    Global,
}

impl std::fmt::Display for ExternKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ExternKind::Func => "func",
            ExternKind::Table => "table",
            ExternKind::Memory => "memory",
            ExternKind::Global => "global",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Export {
    pub name: String,
    pub kind: ExternKind,
    pub index: u32,
}

/// One instruction of a constant expression.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConstOp {
    I32Const(i32),
    I64Const(i64),
    F32Const(f32),
    F64Const(f64),
    GlobalGet(u32),
    RefNull(RefType),
    RefFunc(u32),
}

/// Initializer of a global, segment offset or element item.
#[derive(Debug, Clone, PartialEq)]
pub struct ConstExpr {
    pub ops: Vec<ConstOp>,
    /// Absolute offset of the first instruction.
    pub offset: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Global {
    pub ty: GlobalType,
    pub init: ConstExpr,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ElementMode {
    Active { table: u32, offset: ConstExpr },
    Passive,
    Declarative,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ElementSegment {
    pub mode: ElementMode,
    pub elem_type: RefType,
    /// Function-index items are stored as single `ref.func` expressions.
    pub items: Vec<ConstExpr>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DataMode {
    Active { memory: u32, offset: ConstExpr },
    Passive,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DataSegment {
    pub mode: DataMode,
    /// Payload range in the module bytes.
    pub range: Range<usize>,
}

/// A function body as stored by the parser: local declarations plus the
/// still-encoded instruction bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionBody {
    /// Run-length encoded locals: `(count, type)`.
    pub locals: Vec<(u32, ValueType)>,
    /// Instruction bytes in the module, including the final `end`.
    pub code: Range<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CustomSection {
    pub name: String,
    pub range: Range<usize>,
}

/// Parsed module. Fields are filled in by `parser::parse`.
#[derive(Debug, Default)]
pub struct Module {
    pub(crate) bytes: Box<[u8]>,
    pub(crate) types: Vec<FuncType>,
    pub(crate) imports: Vec<Import>,
    /// Type index per defined function.
    pub(crate) functions: Vec<u32>,
    pub(crate) tables: Vec<TableType>,
    pub(crate) memories: Vec<MemoryType>,
    pub(crate) globals: Vec<Global>,
    pub(crate) exports: Vec<Export>,
    pub(crate) start: Option<u32>,
    pub(crate) elements: Vec<ElementSegment>,
    pub(crate) data: Vec<DataSegment>,
    pub(crate) data_count: Option<u32>,
    pub(crate) bodies: Vec<FunctionBody>,
    pub(crate) customs: Vec<CustomSection>,

    // Derived index spaces, imports first.
    pub(crate) func_types: Vec<u32>,
    pub(crate) table_types: Vec<TableType>,
    pub(crate) memory_types: Vec<MemoryType>,
    pub(crate) global_types: Vec<GlobalType>,

    pub(crate) validated: OnceLock<Result<(), ValidationError>>,
    pub(crate) compiled: Box<[OnceLock<Arc<Code>>]>,
}

impl Module {
    /// Fill the derived index spaces and allocate the decode cache.
    pub(crate) fn finish(mut self) -> Self {
        let mut func_types = Vec::new();
        let mut table_types = Vec::new();
        let mut memory_types = Vec::new();
        let mut global_types = Vec::new();
        for import in &self.imports {
            match &import.kind {
                ImportKind::Func(ty) => func_types.push(*ty),
                ImportKind::Table(ty) => table_types.push(*ty),
                ImportKind::Memory(ty) => memory_types.push(*ty),
                ImportKind::Global(ty) => global_types.push(*ty),
            }
        }
        func_types.extend_from_slice(&self.functions);
        table_types.extend_from_slice(&self.tables);
        memory_types.extend_from_slice(&self.memories);
        global_types.extend(self.globals.iter().map(|g| g.ty));

        self.func_types = func_types;
        self.table_types = table_types;
        self.memory_types = memory_types;
        self.global_types = global_types;
        self.compiled = (0..self.bodies.len()).map(|_| OnceLock::new()).collect();
        self
    }

    pub fn types(&self) -> &[FuncType] {
        &self.types
    }

    pub fn imports(&self) -> &[Import] {
        &self.imports
    }

    pub fn exports(&self) -> &[Export] {
        &self.exports
    }

    pub fn export(&self, name: &str) -> Option<&Export> {
        self.exports.iter().find(|e| e.name == name)
    }

    pub fn start(&self) -> Option<u32> {
        self.start
    }

    /// Custom sections as `(name, payload)` pairs, in file order.
    pub fn custom_sections(&self) -> impl Iterator<Item = (&str, &[u8])> + '_ {
        self.customs
            .iter()
            .map(|c| (c.name.as_str(), self.slice(c.range.clone())))
    }

    /// Size of the function index space (imported plus defined).
    pub fn func_count(&self) -> u32 {
        self.func_types.len() as u32
    }

    pub fn imported_func_count(&self) -> u32 {
        (self.func_types.len() - self.functions.len()) as u32
    }

    /// Type index of a function in the function index space.
    pub fn func_type_index(&self, func: u32) -> Option<u32> {
        self.func_types.get(func as usize).copied()
    }

    /// Signature of a function in the function index space.
    pub fn func_type(&self, func: u32) -> Option<&FuncType> {
        self.func_type_index(func)
            .and_then(|ty| self.types.get(ty as usize))
    }

    pub fn table_type(&self, table: u32) -> Option<&TableType> {
        self.table_types.get(table as usize)
    }

    pub fn memory_type(&self, memory: u32) -> Option<&MemoryType> {
        self.memory_types.get(memory as usize)
    }

    pub fn global_type(&self, global: u32) -> Option<&GlobalType> {
        self.global_types.get(global as usize)
    }

    pub(crate) fn slice(&self, range: Range<usize>) -> &[u8] {
        self.bytes.get(range).unwrap_or_default()
    }

    /// Payload of a data segment.
    pub(crate) fn data_bytes(&self, segment: u32) -> &[u8] {
        match self.data.get(segment as usize) {
            Some(seg) => self.slice(seg.range.clone()),
            None => &[],
        }
    }

    /// Validate once; later calls return the cached verdict.
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.validated
            .get_or_init(|| crate::validate::validate(self))
            .clone()
    }

    /// Decoded body of defined function `index` (not counting imports),
    /// decoding it on first use.
    pub(crate) fn code(&self, index: u32) -> Result<Arc<Code>, ParseError> {
        let (cell, body) = self
            .compiled
            .get(index as usize)
            .zip(self.bodies.get(index as usize))
            .ok_or(ParseError::Malformed {
                offset: 0,
                reason: "function body index out of range",
            })?;
        if let Some(code) = cell.get() {
            return Ok(Arc::clone(code));
        }
        let code = Arc::new(code::compile(self, body)?);
        tracing::trace!(
            target: "tessel::decode",
            func = index + self.imported_func_count(),
            instrs = code.len(),
            "decoded function body"
        );
        Ok(Arc::clone(cell.get_or_init(|| code)))
    }
}
