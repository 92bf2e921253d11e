//! Operand stack shared by every frame of one invocation.

use tessel_runtime::{ExternRef, FuncRef, Value};

use super::ExecError;

/// Extracts a typed operand from a [`Value`].
pub(crate) trait FromValue: Sized {
    fn from_value(value: Value) -> Option<Self>;
}

macro_rules! from_value {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(impl FromValue for $ty {
            #[inline]
            fn from_value(value: Value) -> Option<Self> {
                match value {
                    Value::$variant(v) => Some(v),
                    _ => None,
                }
            }
        })*
    };
}

from_value!(i32 => I32, i64 => I64, f32 => F32, f64 => F64);

impl FromValue for Option<FuncRef> {
    fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::FuncRef(v) => Some(v),
            _ => None,
        }
    }
}

impl FromValue for Option<ExternRef> {
    fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::ExternRef(v) => Some(v),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct ValueStack {
    values: Vec<Value>,
}

impl ValueStack {
    pub(crate) fn from_values(values: Vec<Value>) -> Self {
        Self { values }
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.values.len()
    }

    #[inline]
    pub(crate) fn push(&mut self, value: impl Into<Value>) {
        self.values.push(value.into());
    }

    #[inline]
    pub(crate) fn pop(&mut self) -> Result<Value, ExecError> {
        self.values
            .pop()
            .ok_or(ExecError::Corrupt("operand stack underflow"))
    }

    /// Pop an operand of a statically known type.
    #[inline]
    pub(crate) fn pop_as<T: FromValue>(&mut self) -> Result<T, ExecError> {
        T::from_value(self.pop()?).ok_or(ExecError::Corrupt("operand has the wrong type"))
    }

    #[inline]
    pub(crate) fn pop_i32(&mut self) -> Result<i32, ExecError> {
        self.pop_as()
    }

    /// Pop an `i32` used as an address, length or index.
    #[inline]
    pub(crate) fn pop_u32(&mut self) -> Result<u32, ExecError> {
        self.pop_i32().map(|v| v as u32)
    }

    /// Remove the top `count` operands, bottom first.
    pub(crate) fn pop_n(&mut self, count: usize) -> Result<Vec<Value>, ExecError> {
        let at = self
            .values
            .len()
            .checked_sub(count)
            .ok_or(ExecError::Corrupt("operand stack underflow"))?;
        Ok(self.values.split_off(at))
    }

    pub(crate) fn truncate(&mut self, height: usize) -> Result<(), ExecError> {
        if height > self.values.len() {
            return Err(ExecError::Corrupt("invalid operand stack height"));
        }
        self.values.truncate(height);
        Ok(())
    }

    pub(crate) fn extend(&mut self, values: impl IntoIterator<Item = Value>) {
        self.values.extend(values);
    }

    pub(crate) fn into_values(self) -> Vec<Value> {
        self.values
    }
}
