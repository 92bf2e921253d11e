//! Host-provided entities and import resolution.
//!
//! The embedder fills an [`Imports`] map keyed by `(module, field)`;
//! [`resolve`] matches every import of a Module against it in declaration
//! order and fails on the first one that is missing or has the wrong shape.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tessel_runtime::{LinearMemory, RefType, TableInstance, Value};

use crate::error::{HostError, InstantiationError, ValidationError};
use crate::instance::Caller;
use crate::module::{ImportKind, Module};
use crate::types::{FuncType, GlobalType, Limits, MemoryType, TableType};

type Callback = dyn Fn(&mut Caller<'_>, &[Value]) -> Result<Vec<Value>, HostError> + Send + Sync;

/// A host function with its declared signature.
///
/// Arguments are checked against the signature before the callback runs;
/// results are checked after it returns.
#[derive(Clone)]
pub struct HostFunc {
    ty: FuncType,
    callback: Arc<Callback>,
}

impl HostFunc {
    pub fn new<F>(ty: FuncType, callback: F) -> Self
    where
        F: Fn(&mut Caller<'_>, &[Value]) -> Result<Vec<Value>, HostError> + Send + Sync + 'static,
    {
        Self {
            ty,
            callback: Arc::new(callback),
        }
    }

    pub fn ty(&self) -> &FuncType {
        &self.ty
    }

    pub(crate) fn call(
        &self,
        caller: &mut Caller<'_>,
        args: &[Value],
    ) -> Result<Vec<Value>, HostError> {
        (self.callback)(caller, args)
    }
}

impl fmt::Debug for HostFunc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HostFunc({})", self.ty)
    }
}

/// A global supplied by the host. The importing module sees a snapshot of
/// `value` taken at instantiation.
#[derive(Debug, Clone, PartialEq)]
pub struct HostGlobal {
    pub value: Value,
    pub mutable: bool,
}

/// Anything that can satisfy an import.
#[derive(Debug, Clone)]
pub enum Extern {
    Func(HostFunc),
    Table(TableInstance),
    Memory(LinearMemory),
    Global(HostGlobal),
}

impl Extern {
    fn describe(&self) -> String {
        match self {
            Extern::Func(func) => format!("func {}", func.ty()),
            Extern::Table(table) => TableType {
                elem: table.elem_type(),
                limits: Limits {
                    min: table.size(),
                    max: table.maximum(),
                },
            }
            .to_string(),
            Extern::Memory(memory) => MemoryType {
                limits: Limits {
                    min: memory.page_count(),
                    max: memory.maximum(),
                },
            }
            .to_string(),
            Extern::Global(global) => GlobalType {
                value_type: global.value.ty(),
                mutable: global.mutable,
            }
            .to_string(),
        }
    }
}

impl From<HostFunc> for Extern {
    fn from(func: HostFunc) -> Self {
        Extern::Func(func)
    }
}

impl From<TableInstance> for Extern {
    fn from(table: TableInstance) -> Self {
        Extern::Table(table)
    }
}

impl From<LinearMemory> for Extern {
    fn from(memory: LinearMemory) -> Self {
        Extern::Memory(memory)
    }
}

impl From<HostGlobal> for Extern {
    fn from(global: HostGlobal) -> Self {
        Extern::Global(global)
    }
}

/// Host entities offered to a module, keyed by `(module, field)`.
#[derive(Debug, Clone, Default)]
pub struct Imports {
    entries: HashMap<String, HashMap<String, Extern>>,
}

impl Imports {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `item` under `module`.`field`, replacing any earlier entry.
    pub fn define(
        &mut self,
        module: impl Into<String>,
        field: impl Into<String>,
        item: impl Into<Extern>,
    ) -> &mut Self {
        self.entries
            .entry(module.into())
            .or_default()
            .insert(field.into(), item.into());
        self
    }

    /// Shorthand for defining a host function from a closure.
    pub fn func<F>(
        &mut self,
        module: impl Into<String>,
        field: impl Into<String>,
        ty: FuncType,
        callback: F,
    ) -> &mut Self
    where
        F: Fn(&mut Caller<'_>, &[Value]) -> Result<Vec<Value>, HostError> + Send + Sync + 'static,
    {
        self.define(module, field, HostFunc::new(ty, callback))
    }

    pub fn get(&self, module: &str, field: &str) -> Option<&Extern> {
        self.entries.get(module)?.get(field)
    }

    pub fn len(&self) -> usize {
        self.entries.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Imported entities, in import order within each index space.
#[derive(Debug, Default)]
pub(crate) struct Resolved {
    pub funcs: Vec<HostFunc>,
    pub tables: Vec<TableInstance>,
    pub memories: Vec<LinearMemory>,
    pub globals: Vec<Value>,
}

/// Only the importing instance could give a function reference meaning, and
/// it does not exist yet.
fn holds_func_ref(value: Option<Value>) -> bool {
    matches!(value, Some(Value::FuncRef(Some(_))))
}

pub(crate) fn resolve(module: &Module, imports: &Imports) -> Result<Resolved, InstantiationError> {
    let mut resolved = Resolved::default();

    for import in module.imports() {
        let provided = imports.get(&import.module, &import.field).ok_or_else(|| {
            InstantiationError::UnsatisfiedImport {
                module: import.module.clone(),
                field: import.field.clone(),
            }
        })?;
        let mismatch = |expected: String| InstantiationError::ImportSignatureMismatch {
            module: import.module.clone(),
            field: import.field.clone(),
            expected,
            provided: provided.describe(),
        };
        let foreign = || InstantiationError::ForeignReference {
            module: import.module.clone(),
            field: import.field.clone(),
        };

        match (&import.kind, provided) {
            (ImportKind::Func(type_index), Extern::Func(func)) => {
                let expected = module
                    .types()
                    .get(*type_index as usize)
                    .ok_or(ValidationError::UnknownTypeIndex { index: *type_index })?;
                if func.ty() != expected {
                    return Err(mismatch(format!("func {expected}")));
                }
                resolved.funcs.push(func.clone());
            }
            (ImportKind::Table(declared), Extern::Table(table)) => {
                let limits = Limits {
                    min: table.size(),
                    max: table.maximum(),
                };
                if table.elem_type() != declared.elem || !limits.satisfies(&declared.limits) {
                    return Err(mismatch(declared.to_string()));
                }
                if declared.elem == RefType::FuncRef
                    && (0..table.size()).any(|i| holds_func_ref(table.get(i).ok()))
                {
                    return Err(foreign());
                }
                resolved.tables.push(table.clone());
            }
            (ImportKind::Memory(declared), Extern::Memory(memory)) => {
                let limits = Limits {
                    min: memory.page_count(),
                    max: memory.maximum(),
                };
                if !limits.satisfies(&declared.limits) {
                    return Err(mismatch(declared.to_string()));
                }
                resolved.memories.push(memory.clone());
            }
            (ImportKind::Global(declared), Extern::Global(global)) => {
                if global.value.ty() != declared.value_type || global.mutable != declared.mutable {
                    return Err(mismatch(declared.to_string()));
                }
                if holds_func_ref(Some(global.value.clone())) {
                    return Err(foreign());
                }
                resolved.globals.push(global.value.clone());
            }
            (ImportKind::Func(type_index), _) => {
                let expected = module
                    .types()
                    .get(*type_index as usize)
                    .map(|ty| format!("func {ty}"))
                    .unwrap_or_else(|| "func".to_string());
                return Err(mismatch(expected));
            }
            (ImportKind::Table(declared), _) => return Err(mismatch(declared.to_string())),
            (ImportKind::Memory(declared), _) => return Err(mismatch(declared.to_string())),
            (ImportKind::Global(declared), _) => return Err(mismatch(declared.to_string())),
        }
    }

    tracing::debug!(
        target: "tessel::instantiate",
        funcs = resolved.funcs.len(),
        tables = resolved.tables.len(),
        memories = resolved.memories.len(),
        globals = resolved.globals.len(),
        "imports resolved"
    );
    Ok(resolved)
}
