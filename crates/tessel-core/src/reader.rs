//! `BinaryReader`: bounds-checked cursor over module bytes.
//!
//! Offsets in errors are absolute: a sub-reader created for a section or a
//! function body remembers where its slice starts in the module.

use crate::error::ParseError;

type Result<T> = std::result::Result<T, ParseError>;

#[derive(Debug, Clone)]
pub struct BinaryReader<'a> {
    data: &'a [u8],
    pos: usize,
    base: usize,
}

impl<'a> BinaryReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self::new_at(data, 0)
    }

    /// A reader over `data`, which starts at absolute offset `base`.
    pub fn new_at(data: &'a [u8], base: usize) -> Self {
        Self { data, pos: 0, base }
    }

    /// Absolute offset of the next byte.
    #[inline]
    pub fn offset(&self) -> usize {
        self.base + self.pos
    }

    /// Bytes consumed so far.
    #[inline]
    pub fn position(&self) -> usize {
        self.pos
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    #[inline]
    pub fn eof(&self) -> bool {
        self.pos >= self.data.len()
    }

    fn truncated(&self) -> ParseError {
        ParseError::TruncatedInput {
            offset: self.offset(),
        }
    }

    #[inline]
    pub fn read_u8(&mut self) -> Result<u8> {
        let byte = *self.data.get(self.pos).ok_or_else(|| self.truncated())?;
        self.pos += 1;
        Ok(byte)
    }

    #[inline]
    pub fn peek_u8(&self) -> Result<u8> {
        self.data.get(self.pos).copied().ok_or_else(|| self.truncated())
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let bytes = self
            .pos
            .checked_add(len)
            .and_then(|end| self.data.get(self.pos..end))
            .ok_or_else(|| self.truncated())?;
        self.pos += len;
        Ok(bytes)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_bytes(N)?);
        Ok(out)
    }

    pub fn read_u32_le(&mut self) -> Result<u32> {
        self.read_array().map(u32::from_le_bytes)
    }

    pub fn read_u64_le(&mut self) -> Result<u64> {
        self.read_array().map(u64::from_le_bytes)
    }

    pub fn read_f32(&mut self) -> Result<f32> {
        self.read_u32_le().map(f32::from_bits)
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        self.read_u64_le().map(f64::from_bits)
    }

    pub fn read_var_u32(&mut self) -> Result<u32> {
        self.read_unsigned(32).map(|v| v as u32)
    }

    pub fn read_var_u64(&mut self) -> Result<u64> {
        self.read_unsigned(64)
    }

    pub fn read_var_i32(&mut self) -> Result<i32> {
        self.read_signed(32).map(|v| v as i32)
    }

    pub fn read_var_i64(&mut self) -> Result<i64> {
        self.read_signed(64)
    }

    /// Signed 33-bit integer, used for type-indexed block types.
    pub fn read_var_s33(&mut self) -> Result<i64> {
        self.read_signed(33)
    }

    /// Length-prefixed UTF-8 string.
    pub fn read_name(&mut self) -> Result<&'a str> {
        let len = self.read_var_u32()? as usize;
        let offset = self.offset();
        let bytes = self.read_bytes(len)?;
        std::str::from_utf8(bytes).map_err(|_| ParseError::InvalidUtf8 { offset })
    }

    /// Split off the next `len` bytes as their own reader.
    pub fn sub_reader(&mut self, len: usize) -> Result<BinaryReader<'a>> {
        let base = self.offset();
        let data = self.read_bytes(len)?;
        Ok(BinaryReader::new_at(data, base))
    }

    fn read_unsigned(&mut self, bits: u32) -> Result<u64> {
        let start = self.offset();
        let max_bytes = bits.div_ceil(7);
        let mut result = 0u64;
        for i in 0..max_bytes {
            let byte = self.read_u8()?;
            if i == max_bytes - 1 {
                // Last permitted byte: no continuation and no bits past `bits`.
                let used = bits - 7 * i;
                if byte & 0x80 != 0 || u32::from(byte) >> used != 0 {
                    return Err(ParseError::MalformedVarint { offset: start });
                }
            }
            result |= u64::from(byte & 0x7F) << (7 * i);
            if byte & 0x80 == 0 {
                return Ok(result);
            }
        }
        Err(ParseError::MalformedVarint { offset: start })
    }

    fn read_signed(&mut self, bits: u32) -> Result<i64> {
        let start = self.offset();
        let max_bytes = bits.div_ceil(7);
        let mut result = 0i64;
        let mut shift = 0u32;
        for i in 0..max_bytes {
            let byte = self.read_u8()?;
            if i == max_bytes - 1 {
                // Unused high bits must all repeat the sign bit.
                let used = bits - 7 * i;
                let high = (byte & 0x7F) >> (used - 1);
                if byte & 0x80 != 0 || (high != 0 && high != 0x7F >> (used - 1)) {
                    return Err(ParseError::MalformedVarint { offset: start });
                }
            }
            result |= i64::from(byte & 0x7F) << shift;
            shift += 7;
            if byte & 0x80 == 0 {
                if shift < 64 && byte & 0x40 != 0 {
                    result |= -1i64 << shift;
                }
                return Ok(result);
            }
        }
        Err(ParseError::MalformedVarint { offset: start })
    }
}
