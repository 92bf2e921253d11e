//! Values that cross the host/guest boundary.
//!
//! Numbers are carried as native Rust scalars. References are nullable:
//! `None` is the Wasm null reference. An `ExternRef` is an opaque handle owned
//! by the embedder; the interpreter moves it around and tests it for null but
//! never looks inside.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Wasm value types, including the two reference types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
    I32,
    I64,
    F32,
    F64,
    FuncRef,
    ExternRef,
}

impl ValueType {
    /// Decode a value type from its binary-format byte.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x7F => Some(ValueType::I32),
            0x7E => Some(ValueType::I64),
            0x7D => Some(ValueType::F32),
            0x7C => Some(ValueType::F64),
            0x70 => Some(ValueType::FuncRef),
            0x6F => Some(ValueType::ExternRef),
            _ => None,
        }
    }

    pub fn is_ref(self) -> bool {
        matches!(self, ValueType::FuncRef | ValueType::ExternRef)
    }

    pub fn is_num(self) -> bool {
        !self.is_ref()
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ValueType::I32 => "i32",
            ValueType::I64 => "i64",
            ValueType::F32 => "f32",
            ValueType::F64 => "f64",
            ValueType::FuncRef => "funcref",
            ValueType::ExternRef => "externref",
        })
    }
}

/// Element type of a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RefType {
    FuncRef,
    ExternRef,
}

impl RefType {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x70 => Some(RefType::FuncRef),
            0x6F => Some(RefType::ExternRef),
            _ => None,
        }
    }
}

impl From<RefType> for ValueType {
    fn from(ty: RefType) -> Self {
        match ty {
            RefType::FuncRef => ValueType::FuncRef,
            RefType::ExternRef => ValueType::ExternRef,
        }
    }
}

impl fmt::Display for RefType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        ValueType::from(*self).fmt(f)
    }
}

/// A typed function reference, as stored in funcref tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FuncRef {
    /// Index into the owning module's type section. `call_indirect` compares
    /// the signature behind this index with the call site's expected one.
    pub type_index: u32,
    /// Index into the owning instance's function index space.
    pub func_index: u32,
    /// Id of the instance that created the reference. Both indexes are
    /// meaningless anywhere else.
    pub owner: u64,
}

/// Opaque host handle carried through `externref` values.
///
/// Cloning shares the handle; equality is identity. Only the embedder can
/// recover its concrete type with [`ExternRef::downcast_ref`].
#[derive(Clone)]
pub struct ExternRef(Arc<dyn Any + Send + Sync>);

impl ExternRef {
    /// Wrap a host value into a new handle.
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        ExternRef(Arc::new(value))
    }

    /// Wrap an already shared host value without re-allocating.
    pub fn from_arc(value: Arc<dyn Any + Send + Sync>) -> Self {
        ExternRef(value)
    }

    /// Borrow the host value if it has type `T`.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }

    /// `true` if both handles refer to the same host value.
    pub fn ptr_eq(&self, other: &ExternRef) -> bool {
        std::ptr::addr_eq(Arc::as_ptr(&self.0), Arc::as_ptr(&other.0))
    }
}

impl PartialEq for ExternRef {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for ExternRef {}

impl fmt::Debug for ExternRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ExternRef({:p})", Arc::as_ptr(&self.0) as *const ())
    }
}

/// A runtime value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    FuncRef(Option<FuncRef>),
    ExternRef(Option<ExternRef>),
}

impl Value {
    /// The zero value of a type: `0` for numbers, null for references.
    pub fn default_for(ty: ValueType) -> Value {
        match ty {
            ValueType::I32 => Value::I32(0),
            ValueType::I64 => Value::I64(0),
            ValueType::F32 => Value::F32(0.0),
            ValueType::F64 => Value::F64(0.0),
            ValueType::FuncRef => Value::FuncRef(None),
            ValueType::ExternRef => Value::ExternRef(None),
        }
    }

    /// Null reference of the given table element type.
    pub fn null(ty: RefType) -> Value {
        Value::default_for(ty.into())
    }

    pub fn ty(&self) -> ValueType {
        match self {
            Value::I32(_) => ValueType::I32,
            Value::I64(_) => ValueType::I64,
            Value::F32(_) => ValueType::F32,
            Value::F64(_) => ValueType::F64,
            Value::FuncRef(_) => ValueType::FuncRef,
            Value::ExternRef(_) => ValueType::ExternRef,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Value::I32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::I64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f32(&self) -> Option<f32> {
        match self {
            Value::F32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::F64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_externref(&self) -> Option<&ExternRef> {
        match self {
            Value::ExternRef(Some(r)) => Some(r),
            _ => None,
        }
    }

    /// `true` for a null reference of either reference type.
    pub fn is_null_ref(&self) -> bool {
        matches!(self, Value::FuncRef(None) | Value::ExternRef(None))
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::I32(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::I64(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::F32(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::F64(v)
    }
}

impl From<ExternRef> for Value {
    fn from(r: ExternRef) -> Self {
        Value::ExternRef(Some(r))
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::I32(v) => write!(f, "{v}"),
            Value::I64(v) => write!(f, "{v}"),
            Value::F32(v) => write!(f, "{v}"),
            Value::F64(v) => write!(f, "{v}"),
            Value::FuncRef(None) | Value::ExternRef(None) => f.write_str("null"),
            Value::FuncRef(Some(r)) => write!(f, "func[{}]", r.func_index),
            Value::ExternRef(Some(r)) => write!(f, "{r:?}"),
        }
    }
}
