//! tessel: an embeddable WebAssembly loader, validator and interpreter.
//!
//! The pipeline is `bytes → Module → validate → resolve imports → Instance →
//! call`. [`Host`] drives it end to end:
//!
//! - [`Host::load`] parses a binary into an immutable, shareable [`Module`].
//!   Function bodies stay encoded until first executed.
//! - [`Host::instantiate`] validates the module (once; the verdict is cached),
//!   binds the [`Imports`] the embedder registered, allocates memory, tables
//!   and globals, applies segments and runs the start function.
//! - [`Host::call`] invokes an export with literal [`Value`] arguments.
//!
//! Opaque host handles travel through `externref` as [`ExternRef`]s: guest
//! code can store, pass and null-test them but never look inside.

pub mod config;
pub mod error;
mod exec;
pub mod host;
pub mod imports;
pub mod instance;
mod instr;
pub mod module;
pub mod parser;
pub mod reader;
pub mod types;
mod validate;

pub use config::HostConfig;
pub use error::{
    CallError, HostError, InstantiationError, ParseError, SegmentKind, Trap, ValidationError,
};
pub use host::Host;
pub use imports::{Extern, HostFunc, HostGlobal, Imports};
pub use instance::{Caller, Instance};
pub use module::{Export, ExternKind, Import, ImportKind, Module};
pub use parser::parse;
pub use types::{BlockType, FuncType, GlobalType, Limits, MemoryType, TableType};

pub use tessel_runtime::{
    ExternRef, FuncRef, LinearMemory, RefType, TableInstance, Value, ValueType, WasmTrap,
    MAX_PAGES, PAGE_SIZE,
};
