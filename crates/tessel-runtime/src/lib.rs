//! `tessel-runtime`: runtime data model for the tessel WebAssembly host.
//!
//! This crate has no dependencies. It provides:
//! - `Value` / `ValueType` / `ExternRef` / `FuncRef`, the values that cross
//!   the host/guest boundary
//! - `LinearMemory`, a bounds-checked, page-granular byte buffer
//! - `Table<T>` for function-reference and external-reference tables, and
//!   `TableInstance` which holds either kind behind `Value`s
//! - `WasmTrap` / `WasmResult<T>` for Wasm trap handling
//! - `ops`, the numeric operators whose semantics need runtime checks

use std::fmt;

/// WebAssembly page size: 64 KiB per the Wasm specification.
pub const PAGE_SIZE: usize = 65536;

/// Largest page count a 32-bit linear memory can address.
pub const MAX_PAGES: u32 = 65536;

mod memory;
pub use memory::LinearMemory;

mod table;
pub use table::{ExternTable, FuncTable, Table, TableInstance};

mod value;
pub use value::{ExternRef, FuncRef, RefType, Value, ValueType};

pub mod ops;

/// Wasm execution errors: no panics, no unwinding.
///
/// Every variant is recoverable at the call boundary; the embedder decides
/// whether an instance stays usable afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WasmTrap {
    /// Linear memory access outside the current memory size.
    MemoryOutOfBounds,
    /// Integer division or remainder by zero.
    IntegerDivideByZero,
    /// Integer overflow (`i32.div_s` of `MIN / -1`, or a float-to-int
    /// truncation whose input is NaN or out of range).
    IntegerOverflow,
    /// `unreachable` instruction executed.
    UnreachableExecuted,
    /// `call_indirect` found a function whose signature differs from the
    /// signature expected at the call site.
    IndirectCallTypeMismatch,
    /// Table index at or beyond the table's current size.
    TableOutOfBounds,
    /// `call_indirect` through a null table slot.
    UndefinedElement,
    /// Call depth or operand stack exceeded its configured limit.
    StackOverflow,
    /// A host function asked for the current call to be abandoned.
    HostCancelled,
    /// A reference of one kind was stored into a table of the other kind.
    /// Validated guest code cannot do this; only host-side table writes can.
    ElementTypeMismatch,
}

impl WasmTrap {
    /// Stable, lowercase name of the trap kind.
    pub fn as_str(self) -> &'static str {
        match self {
            WasmTrap::MemoryOutOfBounds => "memory out of bounds",
            WasmTrap::IntegerDivideByZero => "integer divide by zero",
            WasmTrap::IntegerOverflow => "integer overflow",
            WasmTrap::UnreachableExecuted => "unreachable executed",
            WasmTrap::IndirectCallTypeMismatch => "indirect call type mismatch",
            WasmTrap::TableOutOfBounds => "table out of bounds",
            WasmTrap::UndefinedElement => "undefined element",
            WasmTrap::StackOverflow => "call stack exhausted",
            WasmTrap::HostCancelled => "cancelled by host",
            WasmTrap::ElementTypeMismatch => "element type mismatch",
        }
    }
}

impl fmt::Display for WasmTrap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::error::Error for WasmTrap {}

/// Result type for Wasm operations: `Result<T, WasmTrap>`.
pub type WasmResult<T> = Result<T, WasmTrap>;

/// Errors that occur while allocating memories and tables.
///
/// These come from declarations or host-supplied limits, not from executing
/// guest code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstructionError {
    /// Initial pages exceeds the memory's maximum.
    MemoryInitialPagesExceedsMax { initial: u32, max: u32 },
    /// Initial size exceeds the table's maximum.
    TableInitialSizeExceedsMax { initial: u32, max: u32 },
}

impl fmt::Display for ConstructionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConstructionError::MemoryInitialPagesExceedsMax { initial, max } => {
                write!(f, "memory initial size {initial} pages exceeds maximum {max}")
            }
            ConstructionError::TableInitialSizeExceedsMax { initial, max } => {
                write!(f, "table initial size {initial} exceeds maximum {max}")
            }
        }
    }
}

impl std::error::Error for ConstructionError {}
