//! Wasm tables: vectors of nullable references.
//!
//! A funcref table backs `call_indirect`: each entry carries the callee's
//! type index so the call site can check the signature before dispatching.
//! An externref table stores opaque host handles; empty slots hold the
//! "no handle" sentinel (`None`).
//!
//! Both are `Table<T>` with a different element type. The size starts at
//! the declared minimum and only grows, up to the declared maximum.

use crate::{ConstructionError, ExternRef, FuncRef, RefType, Value, WasmResult, WasmTrap};

/// Table of function references.
pub type FuncTable = Table<FuncRef>;

/// Table of opaque host handles.
pub type ExternTable = Table<ExternRef>;

/// A Wasm table with element type `T`.
#[derive(Debug, Clone)]
pub struct Table<T> {
    entries: Vec<Option<T>>,
    maximum: Option<u32>,
}

impl<T: Clone> Table<T> {
    /// Create a table with `initial` null slots.
    ///
    /// # Errors
    /// Returns `ConstructionError::TableInitialSizeExceedsMax` if `initial > maximum`.
    pub fn try_new(initial: u32, maximum: Option<u32>) -> Result<Self, ConstructionError> {
        if let Some(max) = maximum {
            if initial > max {
                return Err(ConstructionError::TableInitialSizeExceedsMax { initial, max });
            }
        }
        Ok(Self {
            entries: vec![None; initial as usize],
            maximum,
        })
    }

    /// Current number of slots.
    #[inline(always)]
    pub fn size(&self) -> u32 {
        self.entries.len() as u32
    }

    /// Declared maximum, if any.
    pub fn maximum(&self) -> Option<u32> {
        self.maximum
    }

    /// Read a slot. `Ok(None)` is a null reference.
    ///
    /// - `TableOutOfBounds` if `index >= size`
    #[inline]
    pub fn get(&self, index: u32) -> WasmResult<Option<T>> {
        self.entries
            .get(index as usize)
            .cloned()
            .ok_or(WasmTrap::TableOutOfBounds)
    }

    /// Write a slot.
    ///
    /// Returns `Err(TableOutOfBounds)` if `index >= size`.
    #[inline]
    pub fn set(&mut self, index: u32, entry: Option<T>) -> WasmResult<()> {
        match self.entries.get_mut(index as usize) {
            Some(slot) => {
                *slot = entry;
                Ok(())
            }
            None => Err(WasmTrap::TableOutOfBounds),
        }
    }

    /// Write consecutive slots starting at `base` (element segment
    /// initialization and `table.init`).
    ///
    /// The whole range is checked before anything is written, so a failing
    /// call leaves the table untouched.
    pub fn init(&mut self, base: u32, items: &[Option<T>]) -> WasmResult<()> {
        let start = base as usize;
        let end = start
            .checked_add(items.len())
            .ok_or(WasmTrap::TableOutOfBounds)?;
        let dst = self
            .entries
            .get_mut(start..end)
            .ok_or(WasmTrap::TableOutOfBounds)?;
        dst.clone_from_slice(items);
        Ok(())
    }

    /// Wasm `table.fill`: set `len` slots starting at `dst` to `value`.
    pub fn fill(&mut self, dst: u32, value: Option<T>, len: u32) -> WasmResult<()> {
        let start = dst as usize;
        let end = start
            .checked_add(len as usize)
            .ok_or(WasmTrap::TableOutOfBounds)?;
        let region = self
            .entries
            .get_mut(start..end)
            .ok_or(WasmTrap::TableOutOfBounds)?;
        region.fill(value);
        Ok(())
    }

    /// Wasm `table.grow`: grow by `delta` slots filled with `init`.
    /// Returns the previous size, or -1 on failure.
    pub fn grow(&mut self, delta: u32, init: Option<T>) -> i32 {
        let old = self.size();
        let limit = self.maximum.unwrap_or(u32::MAX);
        match old.checked_add(delta) {
            Some(new) if new <= limit => {
                self.entries.resize(new as usize, init);
                old as i32
            }
            _ => -1,
        }
    }
}

impl Table<FuncRef> {
    /// Look up a callable entry for `call_indirect`.
    ///
    /// - `TableOutOfBounds` if `index >= size`
    /// - `UndefinedElement` if the slot is null
    #[inline]
    pub fn get_func(&self, index: u32) -> WasmResult<FuncRef> {
        self.get(index)?.ok_or(WasmTrap::UndefinedElement)
    }
}

/// A table of either element type, accessed through `Value`s.
///
/// This is what an instance stores and what the interpreter's `table.*`
/// instructions operate on.
#[derive(Debug, Clone)]
pub enum TableInstance {
    Func(FuncTable),
    Extern(ExternTable),
}

impl TableInstance {
    /// Allocate a table with `initial` null slots.
    pub fn try_new(
        elem: RefType,
        initial: u32,
        maximum: Option<u32>,
    ) -> Result<Self, ConstructionError> {
        Ok(match elem {
            RefType::FuncRef => TableInstance::Func(Table::try_new(initial, maximum)?),
            RefType::ExternRef => TableInstance::Extern(Table::try_new(initial, maximum)?),
        })
    }

    pub fn elem_type(&self) -> RefType {
        match self {
            TableInstance::Func(_) => RefType::FuncRef,
            TableInstance::Extern(_) => RefType::ExternRef,
        }
    }

    pub fn size(&self) -> u32 {
        match self {
            TableInstance::Func(t) => t.size(),
            TableInstance::Extern(t) => t.size(),
        }
    }

    pub fn maximum(&self) -> Option<u32> {
        match self {
            TableInstance::Func(t) => t.maximum(),
            TableInstance::Extern(t) => t.maximum(),
        }
    }

    /// Wasm `table.get`.
    pub fn get(&self, index: u32) -> WasmResult<Value> {
        match self {
            TableInstance::Func(t) => t.get(index).map(Value::FuncRef),
            TableInstance::Extern(t) => t.get(index).map(Value::ExternRef),
        }
    }

    /// Wasm `table.set`.
    pub fn set(&mut self, index: u32, value: Value) -> WasmResult<()> {
        match (self, value) {
            (TableInstance::Func(t), Value::FuncRef(r)) => t.set(index, r),
            (TableInstance::Extern(t), Value::ExternRef(r)) => t.set(index, r),
            _ => Err(WasmTrap::ElementTypeMismatch),
        }
    }

    /// Wasm `table.grow`. Returns the previous size, or -1 on failure.
    pub fn grow(&mut self, delta: u32, init: Value) -> WasmResult<i32> {
        match (self, init) {
            (TableInstance::Func(t), Value::FuncRef(r)) => Ok(t.grow(delta, r)),
            (TableInstance::Extern(t), Value::ExternRef(r)) => Ok(t.grow(delta, r)),
            _ => Err(WasmTrap::ElementTypeMismatch),
        }
    }

    /// Wasm `table.fill`.
    pub fn fill(&mut self, dst: u32, value: Value, len: u32) -> WasmResult<()> {
        match (self, value) {
            (TableInstance::Func(t), Value::FuncRef(r)) => t.fill(dst, r, len),
            (TableInstance::Extern(t), Value::ExternRef(r)) => t.fill(dst, r, len),
            _ => Err(WasmTrap::ElementTypeMismatch),
        }
    }

    /// Write `items` into consecutive slots starting at `base`. The range is
    /// checked before anything is written.
    pub fn init(&mut self, base: u32, items: &[Value]) -> WasmResult<()> {
        match self {
            TableInstance::Func(t) => {
                let refs = items
                    .iter()
                    .map(|v| match v {
                        Value::FuncRef(r) => Ok(*r),
                        _ => Err(WasmTrap::ElementTypeMismatch),
                    })
                    .collect::<WasmResult<Vec<_>>>()?;
                t.init(base, &refs)
            }
            TableInstance::Extern(t) => {
                let refs = items
                    .iter()
                    .map(|v| match v {
                        Value::ExternRef(r) => Ok(r.clone()),
                        _ => Err(WasmTrap::ElementTypeMismatch),
                    })
                    .collect::<WasmResult<Vec<_>>>()?;
                t.init(base, &refs)
            }
        }
    }
}
