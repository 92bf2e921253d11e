//! Numeric instructions (`0x45..=0xC4` and the saturating truncations).
//!
//! Operands are popped right to left; the validator has already proven
//! their types, so a mismatch here surfaces as [`ExecError::Corrupt`].

use tessel_runtime::ops;
use tessel_runtime::{Value, WasmResult};

use super::stack::{FromValue, ValueStack};
use super::ExecError;

#[inline]
fn unary<A: FromValue, R: Into<Value>>(
    stack: &mut ValueStack,
    f: impl FnOnce(A) -> R,
) -> Result<(), ExecError> {
    let a = stack.pop_as::<A>()?;
    stack.push(f(a));
    Ok(())
}

#[inline]
fn unary_trap<A: FromValue, R: Into<Value>>(
    stack: &mut ValueStack,
    f: impl FnOnce(A) -> WasmResult<R>,
) -> Result<(), ExecError> {
    let a = stack.pop_as::<A>()?;
    stack.push(f(a)?);
    Ok(())
}

#[inline]
fn binary<A: FromValue, R: Into<Value>>(
    stack: &mut ValueStack,
    f: impl FnOnce(A, A) -> R,
) -> Result<(), ExecError> {
    let b = stack.pop_as::<A>()?;
    let a = stack.pop_as::<A>()?;
    stack.push(f(a, b));
    Ok(())
}

#[inline]
fn binary_trap<A: FromValue, R: Into<Value>>(
    stack: &mut ValueStack,
    f: impl FnOnce(A, A) -> WasmResult<R>,
) -> Result<(), ExecError> {
    let b = stack.pop_as::<A>()?;
    let a = stack.pop_as::<A>()?;
    stack.push(f(a, b)?);
    Ok(())
}

#[inline]
fn flag(b: bool) -> i32 {
    i32::from(b)
}

/// Execute the numeric instruction with the given opcode.
pub(crate) fn execute(stack: &mut ValueStack, opcode: u8) -> Result<(), ExecError> {
    match opcode {
        // i32 comparisons
        0x45 => unary(stack, |a: i32| flag(a == 0)),
        0x46 => binary(stack, |a: i32, b| flag(a == b)),
        0x47 => binary(stack, |a: i32, b| flag(a != b)),
        0x48 => binary(stack, |a: i32, b| flag(a < b)),
        0x49 => binary(stack, |a: i32, b| flag((a as u32) < (b as u32))),
        0x4A => binary(stack, |a: i32, b| flag(a > b)),
        0x4B => binary(stack, |a: i32, b| flag((a as u32) > (b as u32))),
        0x4C => binary(stack, |a: i32, b| flag(a <= b)),
        0x4D => binary(stack, |a: i32, b| flag((a as u32) <= (b as u32))),
        0x4E => binary(stack, |a: i32, b| flag(a >= b)),
        0x4F => binary(stack, |a: i32, b| flag((a as u32) >= (b as u32))),

        // i64 comparisons
        0x50 => unary(stack, |a: i64| flag(a == 0)),
        0x51 => binary(stack, |a: i64, b| flag(a == b)),
        0x52 => binary(stack, |a: i64, b| flag(a != b)),
        0x53 => binary(stack, |a: i64, b| flag(a < b)),
        0x54 => binary(stack, |a: i64, b| flag((a as u64) < (b as u64))),
        0x55 => binary(stack, |a: i64, b| flag(a > b)),
        0x56 => binary(stack, |a: i64, b| flag((a as u64) > (b as u64))),
        0x57 => binary(stack, |a: i64, b| flag(a <= b)),
        0x58 => binary(stack, |a: i64, b| flag((a as u64) <= (b as u64))),
        0x59 => binary(stack, |a: i64, b| flag(a >= b)),
        0x5A => binary(stack, |a: i64, b| flag((a as u64) >= (b as u64))),

        // float comparisons
        0x5B => binary(stack, |a: f32, b| flag(a == b)),
        0x5C => binary(stack, |a: f32, b| flag(a != b)),
        0x5D => binary(stack, |a: f32, b| flag(a < b)),
        0x5E => binary(stack, |a: f32, b| flag(a > b)),
        0x5F => binary(stack, |a: f32, b| flag(a <= b)),
        0x60 => binary(stack, |a: f32, b| flag(a >= b)),
        0x61 => binary(stack, |a: f64, b| flag(a == b)),
        0x62 => binary(stack, |a: f64, b| flag(a != b)),
        0x63 => binary(stack, |a: f64, b| flag(a < b)),
        0x64 => binary(stack, |a: f64, b| flag(a > b)),
        0x65 => binary(stack, |a: f64, b| flag(a <= b)),
        0x66 => binary(stack, |a: f64, b| flag(a >= b)),

        // i32 arithmetic
        0x67 => unary(stack, |a: i32| a.leading_zeros() as i32),
        0x68 => unary(stack, |a: i32| a.trailing_zeros() as i32),
        0x69 => unary(stack, |a: i32| a.count_ones() as i32),
        0x6A => binary(stack, |a: i32, b| a.wrapping_add(b)),
        0x6B => binary(stack, |a: i32, b| a.wrapping_sub(b)),
        0x6C => binary(stack, |a: i32, b| a.wrapping_mul(b)),
        0x6D => binary_trap(stack, ops::i32_div_s),
        0x6E => binary_trap(stack, ops::i32_div_u),
        0x6F => binary_trap(stack, ops::i32_rem_s),
        0x70 => binary_trap(stack, ops::i32_rem_u),
        0x71 => binary(stack, |a: i32, b| a & b),
        0x72 => binary(stack, |a: i32, b| a | b),
        0x73 => binary(stack, |a: i32, b| a ^ b),
        0x74 => binary(stack, |a: i32, b| a.wrapping_shl(b as u32)),
        0x75 => binary(stack, |a: i32, b| a.wrapping_shr(b as u32)),
        0x76 => binary(stack, |a: i32, b| (a as u32).wrapping_shr(b as u32) as i32),
        0x77 => binary(stack, |a: i32, b| a.rotate_left(b as u32)),
        0x78 => binary(stack, |a: i32, b| a.rotate_right(b as u32)),

        // i64 arithmetic
        0x79 => unary(stack, |a: i64| i64::from(a.leading_zeros())),
        0x7A => unary(stack, |a: i64| i64::from(a.trailing_zeros())),
        0x7B => unary(stack, |a: i64| i64::from(a.count_ones())),
        0x7C => binary(stack, |a: i64, b| a.wrapping_add(b)),
        0x7D => binary(stack, |a: i64, b| a.wrapping_sub(b)),
        0x7E => binary(stack, |a: i64, b| a.wrapping_mul(b)),
        0x7F => binary_trap(stack, ops::i64_div_s),
        0x80 => binary_trap(stack, ops::i64_div_u),
        0x81 => binary_trap(stack, ops::i64_rem_s),
        0x82 => binary_trap(stack, ops::i64_rem_u),
        0x83 => binary(stack, |a: i64, b| a & b),
        0x84 => binary(stack, |a: i64, b| a | b),
        0x85 => binary(stack, |a: i64, b| a ^ b),
        0x86 => binary(stack, |a: i64, b| a.wrapping_shl(b as u32)),
        0x87 => binary(stack, |a: i64, b| a.wrapping_shr(b as u32)),
        0x88 => binary(stack, |a: i64, b| (a as u64).wrapping_shr(b as u32) as i64),
        0x89 => binary(stack, |a: i64, b| a.rotate_left(b as u32)),
        0x8A => binary(stack, |a: i64, b| a.rotate_right(b as u32)),

        // f32 arithmetic
        0x8B => unary(stack, |a: f32| a.abs()),
        0x8C => unary(stack, |a: f32| -a),
        0x8D => unary(stack, |a: f32| a.ceil()),
        0x8E => unary(stack, |a: f32| a.floor()),
        0x8F => unary(stack, |a: f32| a.trunc()),
        0x90 => unary(stack, ops::f32_nearest),
        0x91 => unary(stack, |a: f32| a.sqrt()),
        0x92 => binary(stack, |a: f32, b| a + b),
        0x93 => binary(stack, |a: f32, b| a - b),
        0x94 => binary(stack, |a: f32, b| a * b),
        0x95 => binary(stack, |a: f32, b| a / b),
        0x96 => binary(stack, ops::f32_min),
        0x97 => binary(stack, ops::f32_max),
        0x98 => binary(stack, |a: f32, b| a.copysign(b)),

        // f64 arithmetic
        0x99 => unary(stack, |a: f64| a.abs()),
        0x9A => unary(stack, |a: f64| -a),
        0x9B => unary(stack, |a: f64| a.ceil()),
        0x9C => unary(stack, |a: f64| a.floor()),
        0x9D => unary(stack, |a: f64| a.trunc()),
        0x9E => unary(stack, ops::f64_nearest),
        0x9F => unary(stack, |a: f64| a.sqrt()),
        0xA0 => binary(stack, |a: f64, b| a + b),
        0xA1 => binary(stack, |a: f64, b| a - b),
        0xA2 => binary(stack, |a: f64, b| a * b),
        0xA3 => binary(stack, |a: f64, b| a / b),
        0xA4 => binary(stack, ops::f64_min),
        0xA5 => binary(stack, ops::f64_max),
        0xA6 => binary(stack, |a: f64, b| a.copysign(b)),

        // conversions
        0xA7 => unary(stack, |a: i64| a as i32),
        0xA8 => unary_trap(stack, ops::i32_trunc_f32_s),
        0xA9 => unary_trap(stack, ops::i32_trunc_f32_u),
        0xAA => unary_trap(stack, ops::i32_trunc_f64_s),
        0xAB => unary_trap(stack, ops::i32_trunc_f64_u),
        0xAC => unary(stack, |a: i32| i64::from(a)),
        0xAD => unary(stack, |a: i32| i64::from(a as u32)),
        0xAE => unary_trap(stack, ops::i64_trunc_f32_s),
        0xAF => unary_trap(stack, ops::i64_trunc_f32_u),
        0xB0 => unary_trap(stack, ops::i64_trunc_f64_s),
        0xB1 => unary_trap(stack, ops::i64_trunc_f64_u),
        0xB2 => unary(stack, |a: i32| a as f32),
        0xB3 => unary(stack, |a: i32| a as u32 as f32),
        0xB4 => unary(stack, |a: i64| a as f32),
        0xB5 => unary(stack, |a: i64| a as u64 as f32),
        0xB6 => unary(stack, |a: f64| a as f32),
        0xB7 => unary(stack, |a: i32| f64::from(a)),
        0xB8 => unary(stack, |a: i32| f64::from(a as u32)),
        0xB9 => unary(stack, |a: i64| a as f64),
        0xBA => unary(stack, |a: i64| a as u64 as f64),
        0xBB => unary(stack, |a: f32| f64::from(a)),
        0xBC => unary(stack, |a: f32| a.to_bits() as i32),
        0xBD => unary(stack, |a: f64| a.to_bits() as i64),
        0xBE => unary(stack, |a: i32| f32::from_bits(a as u32)),
        0xBF => unary(stack, |a: i64| f64::from_bits(a as u64)),

        // sign extension
        0xC0 => unary(stack, |a: i32| i32::from(a as i8)),
        0xC1 => unary(stack, |a: i32| i32::from(a as i16)),
        0xC2 => unary(stack, |a: i64| i64::from(a as i8)),
        0xC3 => unary(stack, |a: i64| i64::from(a as i16)),
        0xC4 => unary(stack, |a: i64| i64::from(a as i32)),

        _ => Err(ExecError::Corrupt("unknown numeric opcode")),
    }
}

/// `0xFC 0..=7`: float-to-int truncation that saturates instead of trapping.
/// Rust's `as` casts already have exactly these semantics.
pub(crate) fn trunc_sat(stack: &mut ValueStack, sub: u8) -> Result<(), ExecError> {
    match sub {
        0 => unary(stack, |a: f32| a as i32),
        1 => unary(stack, |a: f32| a as u32 as i32),
        2 => unary(stack, |a: f64| a as i32),
        3 => unary(stack, |a: f64| a as u32 as i32),
        4 => unary(stack, |a: f32| a as i64),
        5 => unary(stack, |a: f32| a as u64 as i64),
        6 => unary(stack, |a: f64| a as i64),
        7 => unary(stack, |a: f64| a as u64 as i64),
        _ => Err(ExecError::Corrupt("unknown saturating truncation")),
    }
}
