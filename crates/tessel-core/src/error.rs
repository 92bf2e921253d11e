//! Error taxonomy, one enum per pipeline stage.
//!
//! `ParseError` is fatal to `load`, `ValidationError` and
//! `InstantiationError` to `instantiate`. `CallError` is per call: an
//! Instance stays usable after a trap unless the trap was a stack overflow.

use std::fmt;

use tessel_runtime::WasmTrap;
use thiserror::Error;

/// Malformed module bytes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("invalid module header (expected `\\0asm` version 1)")]
    InvalidHeader,

    #[error("unexpected end of input at offset {offset:#x}")]
    TruncatedInput { offset: usize },

    #[error("malformed LEB128 integer at offset {offset:#x}")]
    MalformedVarint { offset: usize },

    #[error("section {id}: declared {declared} bytes, consumed {consumed}")]
    SectionLengthMismatch {
        id: u8,
        declared: usize,
        consumed: usize,
    },

    #[error("section {id} appears more than once")]
    DuplicateSection { id: u8 },

    #[error("invalid UTF-8 in name at offset {offset:#x}")]
    InvalidUtf8 { offset: usize },

    #[error("unknown opcode {opcode:#x} at offset {offset:#x}")]
    UnknownOpcode { offset: usize, opcode: u32 },

    #[error("malformed module at offset {offset:#x}: {reason}")]
    Malformed { offset: usize, reason: &'static str },
}

/// A module that parses but breaks a static typing or indexing rule.
///
/// `func` fields are indices into the function index space (imports first);
/// `offset` fields are absolute byte offsets into the module.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("type mismatch in function {func} at offset {offset:#x}: expected {expected}, found {found}")]
    TypeMismatch {
        func: u32,
        offset: usize,
        expected: String,
        found: String,
    },

    #[error("unknown type index {index}")]
    UnknownTypeIndex { index: u32 },

    #[error("unknown function index {index}")]
    UnknownFunctionIndex { index: u32 },

    #[error("branch depth {depth} out of range in function {func} at offset {offset:#x}")]
    InvalidBranchTarget { func: u32, offset: usize, depth: u32 },

    #[error("invalid {what} limits: min {min}, max {max:?}")]
    InvalidLimits {
        what: &'static str,
        min: u32,
        max: Option<u32>,
    },

    #[error("unknown local {index} in function {func}")]
    UnknownLocal { func: u32, index: u32 },

    #[error("unknown global {index}")]
    UnknownGlobal { index: u32 },

    #[error("global {index} is immutable")]
    ImmutableGlobal { index: u32 },

    #[error("unknown table {index}")]
    UnknownTable { index: u32 },

    #[error("unknown memory {index}")]
    UnknownMemory { index: u32 },

    #[error("unknown data segment {index}")]
    UnknownDataSegment { index: u32 },

    #[error("unknown element segment {index}")]
    UnknownElementSegment { index: u32 },

    #[error("alignment larger than natural in function {func} at offset {offset:#x}")]
    InvalidAlignment { func: u32, offset: usize },

    #[error("malformed control structure in function {func} at offset {offset:#x}")]
    MalformedControl { func: u32, offset: usize },

    #[error("function {func} has a malformed body")]
    MalformedCode {
        func: u32,
        #[source]
        source: ParseError,
    },

    #[error("duplicate export name `{name}`")]
    DuplicateExport { name: String },

    #[error("start function {index} must have type [] -> []")]
    InvalidStartFunction { index: u32 },

    #[error("invalid constant expression at offset {offset:#x}: {reason}")]
    InvalidConstExpr { offset: usize, reason: &'static str },

    #[error("element type mismatch: expected {expected}, found {found}")]
    InvalidElementType { expected: String, found: String },

    #[error("at most one memory is supported")]
    MultipleMemories,
}

/// Which kind of segment failed to initialize.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentKind {
    Element,
    Data,
}

impl fmt::Display for SegmentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SegmentKind::Element => "element",
            SegmentKind::Data => "data",
        })
    }
}

/// Instantiation failed; no Instance was produced.
#[derive(Debug, Error)]
pub enum InstantiationError {
    #[error("module failed validation: {0}")]
    Validation(#[from] ValidationError),

    #[error("unsatisfied import `{module}`.`{field}`")]
    UnsatisfiedImport { module: String, field: String },

    #[error("import `{module}`.`{field}`: expected {expected}, provided {provided}")]
    ImportSignatureMismatch {
        module: String,
        field: String,
        expected: String,
        provided: String,
    },

    /// An imported table or global holds a function reference. References
    /// belong to the instance that created them and cannot cross over.
    #[error("import `{module}`.`{field}` holds a function reference of another instance")]
    ForeignReference { module: String, field: String },

    #[error("{kind} segment {segment} does not fit its target")]
    OutOfBoundsInit { kind: SegmentKind, segment: u32 },

    #[error("start function failed: {0}")]
    StartTrap(#[source] CallError),

    #[error("resource limit exceeded: {0}")]
    ResourceLimit(String),
}

/// A trap with its location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("wasm trap: {kind} (function {func}, offset {offset:#x})")]
pub struct Trap {
    pub kind: WasmTrap,
    /// Function index (imports first) executing when the trap was raised.
    pub func: u32,
    /// Absolute byte offset of the trapping instruction in the module.
    pub offset: usize,
}

/// A call into an Instance failed.
#[derive(Debug, Error)]
pub enum CallError {
    #[error("no exported function named `{0}`")]
    ExportNotFound(String),

    #[error("argument mismatch: expected {expected}, provided {provided}")]
    ArgumentMismatch { expected: String, provided: String },

    #[error(transparent)]
    Trap(#[from] Trap),

    /// Error raised by a host function, passed through untouched.
    #[error("host function failed: {0}")]
    Host(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("host function {func} returned {provided}, declared {expected}")]
    HostResultMismatch {
        func: u32,
        expected: String,
        provided: String,
    },

    #[error("instance is poisoned by an earlier stack overflow")]
    InstancePoisoned,

    #[error("function {func} cannot be executed: {reason}")]
    InvalidCode { func: u32, reason: String },
}

impl CallError {
    /// The trap kind, if this error is a trap.
    pub fn trap_kind(&self) -> Option<WasmTrap> {
        match self {
            CallError::Trap(trap) => Some(trap.kind),
            _ => None,
        }
    }
}

/// What a host function returns instead of results.
#[derive(Debug, Error)]
pub enum HostError {
    /// Abandon the whole call with a `HostCancelled` trap.
    #[error("cancelled by host")]
    Cancelled,

    /// A re-entrant call made through `Caller` failed; the error is
    /// propagated to the outer caller as-is.
    #[error(transparent)]
    Call(Box<CallError>),

    /// Embedder-defined failure, surfaced as `CallError::Host`.
    #[error(transparent)]
    Custom(Box<dyn std::error::Error + Send + Sync>),
}

impl HostError {
    pub fn custom(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        HostError::Custom(err.into())
    }
}

impl From<CallError> for HostError {
    fn from(err: CallError) -> Self {
        HostError::Call(Box::new(err))
    }
}
