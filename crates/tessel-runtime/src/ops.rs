//! Wasm numeric operators whose semantics differ from plain Rust operators.
//!
//! ## Float-to-integer truncation
//!
//! Rust's `as` cast from float to integer saturates (`f32::INFINITY as i32 ==
//! i32::MAX`, NaN becomes 0). That is exactly the `trunc_sat` family. The
//! plain `trunc` family must trap instead, so each function below range-checks
//! its input before casting. The bounds are the first float values that no
//! longer fit; they are exact powers of two in both f32 and f64.
//!
//! ## Integer division / remainder
//!
//! Division by zero traps with `IntegerDivideByZero`; signed `MIN / -1`
//! traps with `IntegerOverflow`. `MIN rem_s -1` is defined as 0 and does not
//! trap, although Rust's `checked_rem` reports it as overflow.
//!
//! ## Float min / max / nearest
//!
//! Wasm `min`/`max` return NaN when either operand is NaN and order `-0.0`
//! below `+0.0`; Rust's `f32::min` returns the non-NaN operand. `nearest`
//! rounds half to even.

use crate::{WasmResult, WasmTrap};

// ── Float → integer trapping truncation ──────────────────────────────────────

macro_rules! trunc_trapping {
    ($(#[$doc:meta] $name:ident: $from:ty => $to:ty as $out:ty, ($lo:expr, $hi:expr);)*) => {
        $(
            #[$doc]
            #[inline]
            pub fn $name(v: $from) -> WasmResult<$out> {
                // `lo` is exclusive: for signed targets it is one below MIN
                // after truncation, for unsigned targets it is -1.0.
                if v.is_nan() || v <= $lo || v >= $hi {
                    return Err(WasmTrap::IntegerOverflow);
                }
                Ok(v as $to as $out)
            }
        )*
    };
}

trunc_trapping! {
    /// Wasm `i32.trunc_f32_s`.
    i32_trunc_f32_s: f32 => i32 as i32, (-2147483904.0f32, 2147483648.0f32);
    /// Wasm `i32.trunc_f32_u`.
    i32_trunc_f32_u: f32 => u32 as i32, (-1.0f32, 4294967296.0f32);
    /// Wasm `i32.trunc_f64_s`.
    i32_trunc_f64_s: f64 => i32 as i32, (-2147483649.0f64, 2147483648.0f64);
    /// Wasm `i32.trunc_f64_u`.
    i32_trunc_f64_u: f64 => u32 as i32, (-1.0f64, 4294967296.0f64);
    /// Wasm `i64.trunc_f32_s`.
    i64_trunc_f32_s: f32 => i64 as i64, (-9223373136366403584.0f32, 9223372036854775808.0f32);
    /// Wasm `i64.trunc_f32_u`.
    i64_trunc_f32_u: f32 => u64 as i64, (-1.0f32, 18446744073709551616.0f32);
    /// Wasm `i64.trunc_f64_s`.
    i64_trunc_f64_s: f64 => i64 as i64, (-9223372036854777856.0f64, 9223372036854775808.0f64);
    /// Wasm `i64.trunc_f64_u`.
    i64_trunc_f64_u: f64 => u64 as i64, (-1.0f64, 18446744073709551616.0f64);
}

// ── Integer division / remainder ──────────────────────────────────────────────

macro_rules! int_div_rem {
    ($ty:ty, $uty:ty, $div_s:ident, $div_u:ident, $rem_s:ident, $rem_u:ident) => {
        /// Signed division, trapping on zero divisor and on `MIN / -1`.
        #[inline]
        pub fn $div_s(lhs: $ty, rhs: $ty) -> WasmResult<$ty> {
            if rhs == 0 {
                return Err(WasmTrap::IntegerDivideByZero);
            }
            lhs.checked_div(rhs).ok_or(WasmTrap::IntegerOverflow)
        }

        /// Unsigned division, trapping on zero divisor.
        #[inline]
        pub fn $div_u(lhs: $ty, rhs: $ty) -> WasmResult<$ty> {
            (lhs as $uty)
                .checked_div(rhs as $uty)
                .map(|v| v as $ty)
                .ok_or(WasmTrap::IntegerDivideByZero)
        }

        /// Signed remainder, trapping on zero divisor. `MIN rem_s -1` is 0.
        #[inline]
        pub fn $rem_s(lhs: $ty, rhs: $ty) -> WasmResult<$ty> {
            if rhs == 0 {
                return Err(WasmTrap::IntegerDivideByZero);
            }
            Ok(lhs.wrapping_rem(rhs))
        }

        /// Unsigned remainder, trapping on zero divisor.
        #[inline]
        pub fn $rem_u(lhs: $ty, rhs: $ty) -> WasmResult<$ty> {
            (lhs as $uty)
                .checked_rem(rhs as $uty)
                .map(|v| v as $ty)
                .ok_or(WasmTrap::IntegerDivideByZero)
        }
    };
}

int_div_rem!(i32, u32, i32_div_s, i32_div_u, i32_rem_s, i32_rem_u);
int_div_rem!(i64, u64, i64_div_s, i64_div_u, i64_rem_s, i64_rem_u);

// ── Float min / max / nearest ─────────────────────────────────────────────────

macro_rules! float_ops {
    ($ty:ty, $min:ident, $max:ident, $nearest:ident) => {
        /// Wasm `min`: NaN-propagating, `-0.0 < +0.0`.
        #[inline]
        pub fn $min(a: $ty, b: $ty) -> $ty {
            if a.is_nan() || b.is_nan() {
                return <$ty>::NAN;
            }
            if a == 0.0 && b == 0.0 {
                return if a.is_sign_negative() { a } else { b };
            }
            a.min(b)
        }

        /// Wasm `max`: NaN-propagating, `-0.0 < +0.0`.
        #[inline]
        pub fn $max(a: $ty, b: $ty) -> $ty {
            if a.is_nan() || b.is_nan() {
                return <$ty>::NAN;
            }
            if a == 0.0 && b == 0.0 {
                return if a.is_sign_negative() { b } else { a };
            }
            a.max(b)
        }

        /// Wasm `nearest`: round to integer, ties to even.
        #[inline]
        pub fn $nearest(v: $ty) -> $ty {
            v.round_ties_even()
        }
    };
}

float_ops!(f32, f32_min, f32_max, f32_nearest);
float_ops!(f64, f64_min, f64_max, f64_nearest);

// ── Tests ─────────────────────────────────────────────────────────────────────
