//! WebAssembly linear memory: `LinearMemory`.
//!
//! The backing store is a `Vec<u8>` holding exactly `pages * PAGE_SIZE`
//! bytes. Growing appends zeroed pages; memory never shrinks.
//!
//! Every access goes through `checked_slice` / `checked_slice_mut`, which
//! compute `offset + len` with overflow checks and compare against the
//! current size. There is no unchecked access path.

use crate::{ConstructionError, WasmResult, WasmTrap, MAX_PAGES, PAGE_SIZE};

/// Linear memory owned by exactly one instance.
#[derive(Debug, Clone)]
pub struct LinearMemory {
    bytes: Vec<u8>,
    /// Declared maximum in pages, if any. Reported back for import matching.
    maximum: Option<u32>,
    /// Hard cap for `grow`, the smaller of `maximum` and the host limit.
    grow_limit: u32,
}

impl LinearMemory {
    /// Create a zero-filled memory of `initial` pages.
    ///
    /// # Errors
    /// Returns `ConstructionError::MemoryInitialPagesExceedsMax` if `initial`
    /// exceeds `maximum` or the 65 536 page address-space limit.
    pub fn try_new(initial: u32, maximum: Option<u32>) -> Result<Self, ConstructionError> {
        let max = maximum.unwrap_or(MAX_PAGES).min(MAX_PAGES);
        if initial > max {
            return Err(ConstructionError::MemoryInitialPagesExceedsMax { initial, max });
        }
        Ok(Self {
            bytes: vec![0u8; initial as usize * PAGE_SIZE],
            maximum,
            grow_limit: max,
        })
    }

    /// Lower the grow cap to `pages` (never below the current size).
    pub fn set_grow_limit(&mut self, pages: u32) {
        self.grow_limit = self.grow_limit.min(pages).max(self.page_count());
    }

    /// Current number of pages.
    #[inline(always)]
    pub fn page_count(&self) -> u32 {
        (self.bytes.len() / PAGE_SIZE) as u32
    }

    /// Declared maximum in pages.
    pub fn maximum(&self) -> Option<u32> {
        self.maximum
    }

    /// Current size in bytes.
    #[inline(always)]
    pub fn active_size(&self) -> usize {
        self.bytes.len()
    }

    /// Wasm `memory.grow`: returns previous page count, or -1 on failure.
    pub fn grow(&mut self, delta: u32) -> i32 {
        let old = self.page_count();
        let new = match old.checked_add(delta) {
            Some(new) if new <= self.grow_limit => new,
            _ => return -1,
        };
        // Wasm requires new pages to be zeroed; `resize` does exactly that.
        self.bytes.resize(new as usize * PAGE_SIZE, 0);
        old as i32
    }

    /// Wasm `memory.size`: returns current page count.
    #[inline(always)]
    pub fn size(&self) -> i32 {
        self.page_count() as i32
    }

    // ── Bulk memory operations ────────────────────────────────────────

    /// Wasm `memory.copy`: copy `len` bytes from `src` to `dst`.
    ///
    /// Overlapping regions behave like `memmove`. Traps if either region
    /// extends beyond the current memory.
    pub fn memory_copy(&mut self, dst: u32, src: u32, len: u32) -> WasmResult<()> {
        let active = self.active_size();
        let (dst, src, len) = (dst as usize, src as usize, len as usize);
        if src.checked_add(len).is_none_or(|end| end > active)
            || dst.checked_add(len).is_none_or(|end| end > active)
        {
            return Err(WasmTrap::MemoryOutOfBounds);
        }
        self.bytes.copy_within(src..src + len, dst);
        Ok(())
    }

    /// Wasm `memory.fill`: set `len` bytes starting at `dst` to `value`.
    pub fn memory_fill(&mut self, dst: u32, value: u8, len: u32) -> WasmResult<()> {
        let region = checked_slice_mut(&mut self.bytes, dst as usize, len as usize)?;
        region.fill(value);
        Ok(())
    }

    // ── Bounds-checked load/store ─────────────────────────────────────

    /// Read `N` bytes at `offset`.
    #[inline]
    pub fn load<const N: usize>(&self, offset: usize) -> WasmResult<[u8; N]> {
        let s = checked_slice(&self.bytes, offset, N)?;
        s.try_into().map_err(|_| WasmTrap::MemoryOutOfBounds)
    }

    /// Write `N` bytes at `offset`.
    #[inline]
    pub fn store<const N: usize>(&mut self, offset: usize, bytes: [u8; N]) -> WasmResult<()> {
        let s = checked_slice_mut(&mut self.bytes, offset, N)?;
        s.copy_from_slice(&bytes);
        Ok(())
    }

    pub fn load_u8(&self, offset: usize) -> WasmResult<u8> {
        Ok(self.load::<1>(offset)?[0])
    }

    pub fn load_u16(&self, offset: usize) -> WasmResult<u16> {
        self.load(offset).map(u16::from_le_bytes)
    }

    pub fn load_i32(&self, offset: usize) -> WasmResult<i32> {
        self.load(offset).map(i32::from_le_bytes)
    }

    pub fn load_i64(&self, offset: usize) -> WasmResult<i64> {
        self.load(offset).map(i64::from_le_bytes)
    }

    pub fn load_f32(&self, offset: usize) -> WasmResult<f32> {
        self.load(offset).map(f32::from_le_bytes)
    }

    pub fn load_f64(&self, offset: usize) -> WasmResult<f64> {
        self.load(offset).map(f64::from_le_bytes)
    }

    pub fn store_u8(&mut self, offset: usize, value: u8) -> WasmResult<()> {
        self.store(offset, [value])
    }

    pub fn store_u16(&mut self, offset: usize, value: u16) -> WasmResult<()> {
        self.store(offset, value.to_le_bytes())
    }

    pub fn store_i32(&mut self, offset: usize, value: i32) -> WasmResult<()> {
        self.store(offset, value.to_le_bytes())
    }

    pub fn store_i64(&mut self, offset: usize, value: i64) -> WasmResult<()> {
        self.store(offset, value.to_le_bytes())
    }

    pub fn store_f32(&mut self, offset: usize, value: f32) -> WasmResult<()> {
        self.store(offset, value.to_le_bytes())
    }

    pub fn store_f64(&mut self, offset: usize, value: f64) -> WasmResult<()> {
        self.store(offset, value.to_le_bytes())
    }

    /// Borrow `len` bytes at `offset`. Used by host functions that read
    /// guest buffers.
    pub fn read(&self, offset: usize, len: usize) -> WasmResult<&[u8]> {
        checked_slice(&self.bytes, offset, len)
    }

    /// Copy `data` into memory at `offset`.
    pub fn write(&mut self, offset: usize, data: &[u8]) -> WasmResult<()> {
        let dst = checked_slice_mut(&mut self.bytes, offset, data.len())?;
        dst.copy_from_slice(data);
        Ok(())
    }

    /// Initialize a region from a data segment. Same as `write`, named for
    /// the instantiation step it implements.
    #[inline]
    pub fn init_data(&mut self, offset: usize, data: &[u8]) -> WasmResult<()> {
        self.write(offset, data)
    }

    /// Read-only access to the whole memory.
    #[inline(always)]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    /// Mutable access to the whole memory.
    #[inline(always)]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes
    }
}

// ── Helpers ───────────────────────────────────────────────────────────

/// Bounds-check and return `memory[offset..offset+len]`.
/// Returns `Err(MemoryOutOfBounds)` on overflow or out-of-range. Never panics.
#[inline(always)]
fn checked_slice(memory: &[u8], offset: usize, len: usize) -> WasmResult<&[u8]> {
    let end = offset.checked_add(len).ok_or(WasmTrap::MemoryOutOfBounds)?;
    memory.get(offset..end).ok_or(WasmTrap::MemoryOutOfBounds)
}

/// Mutable variant of `checked_slice`.
#[inline(always)]
fn checked_slice_mut(memory: &mut [u8], offset: usize, len: usize) -> WasmResult<&mut [u8]> {
    let end = offset.checked_add(len).ok_or(WasmTrap::MemoryOutOfBounds)?;
    memory
        .get_mut(offset..end)
        .ok_or(WasmTrap::MemoryOutOfBounds)
}


// ── Kani Formal Verification Proofs ──────────────────────────────────────
//
// Bounded model checking of the bounds-check helpers. Run with:
// cargo kani -p tessel-runtime

#[cfg(kani)]
mod proofs {
    use super::*;

    /// Proof: a successful checked slice lies entirely inside the buffer.
    #[kani::proof]
    #[kani::unwind(1)]
    fn checked_slice_success_implies_in_range() {
        let buf = [0u8; 16];
        let offset: usize = kani::any();
        let len: usize = kani::any();
        if let Ok(s) = checked_slice(&buf, offset, len) {
            kani::assert(s.len() == len, "slice has requested length");
            kani::assert(offset + len <= buf.len(), "slice is within buffer");
        }
    }

    /// Proof: offsets that overflow when the width is added are rejected.
    #[kani::proof]
    #[kani::unwind(1)]
    fn checked_slice_rejects_overflow() {
        let buf = [0u8; 16];
        let len: usize = kani::any();
        kani::assume(len > 0);
        let result = checked_slice(&buf, usize::MAX, len);
        kani::assert(
            result == Err(WasmTrap::MemoryOutOfBounds),
            "overflowing offset is out of bounds",
        );
    }

    /// Proof: store followed by load at the same offset returns the value.
    #[kani::proof]
    #[kani::unwind(1)]
    fn store_load_roundtrip() {
        let mut buf = [0u8; 16];
        let offset: usize = kani::any();
        let value: [u8; 4] = kani::any();
        if let Ok(dst) = checked_slice_mut(&mut buf, offset, 4) {
            dst.copy_from_slice(&value);
            let back = checked_slice(&buf, offset, 4);
            kani::assert(back == Ok(&value[..]), "roundtrip preserves value");
        }
    }
}
