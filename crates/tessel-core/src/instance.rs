//! Live module instances.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tessel_runtime::{FuncRef, LinearMemory, TableInstance, Value};
use tracing::debug;

use crate::config::HostConfig;
use crate::error::{CallError, InstantiationError, SegmentKind, ValidationError};
use crate::exec;
use crate::imports::{resolve, HostFunc, Imports};
use crate::module::{ConstExpr, ConstOp, DataMode, ElementMode, Export, ExternKind, Module};
use crate::types::{FuncType, TypeList};

/// Source of `Instance` ids. Zero is never handed out.
static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// An entry of the function index space.
#[derive(Debug, Clone)]
pub(crate) enum FuncInst {
    Host(HostFunc),
    /// Index among the module's defined functions.
    Local { defined: u32 },
}

/// A module bound to its imports, with its own memory, tables and globals.
///
/// Calls take `&mut self`, so one call chain runs at a time. Host functions
/// re-enter through [`Caller`].
#[derive(Debug)]
pub struct Instance {
    /// Stamped into every `FuncRef` this instance creates.
    pub(crate) id: u64,
    pub(crate) module: Arc<Module>,
    pub(crate) funcs: Vec<FuncInst>,
    pub(crate) tables: Vec<TableInstance>,
    pub(crate) memories: Vec<LinearMemory>,
    pub(crate) globals: Vec<Value>,
    /// Items of passive element segments; `None` once dropped.
    pub(crate) elements: Vec<Option<Arc<[Value]>>>,
    pub(crate) dropped_data: Vec<bool>,
    pub(crate) config: HostConfig,
    /// Active frames plus host re-entries, across nested invocations.
    pub(crate) depth: usize,
    pub(crate) poisoned: bool,
}

impl Instance {
    pub(crate) fn instantiate(
        module: &Arc<Module>,
        imports: &Imports,
        config: &HostConfig,
    ) -> Result<Self, InstantiationError> {
        module.validate()?;
        let resolved = resolve(module, imports)?;

        let mut funcs: Vec<FuncInst> = resolved.funcs.into_iter().map(FuncInst::Host).collect();
        funcs.extend((0..module.functions.len() as u32).map(|defined| FuncInst::Local { defined }));

        let mut tables = resolved.tables;
        for ty in &module.tables {
            let table = TableInstance::try_new(ty.elem, ty.limits.min, ty.limits.max)
                .map_err(|e| InstantiationError::ResourceLimit(e.to_string()))?;
            tables.push(table);
        }

        let mut memories = resolved.memories;
        for ty in &module.memories {
            if ty.limits.min > config.max_memory_pages {
                return Err(InstantiationError::ResourceLimit(format!(
                    "memory of {} pages exceeds the configured limit of {} pages",
                    ty.limits.min, config.max_memory_pages
                )));
            }
            let memory = LinearMemory::try_new(ty.limits.min, ty.limits.max)
                .map_err(|e| InstantiationError::ResourceLimit(e.to_string()))?;
            memories.push(memory);
        }
        for memory in &mut memories {
            memory.set_grow_limit(config.max_memory_pages);
        }

        let mut instance = Instance {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            module: Arc::clone(module),
            funcs,
            tables,
            memories,
            globals: resolved.globals,
            elements: Vec::with_capacity(module.elements.len()),
            dropped_data: vec![false; module.data.len()],
            config: config.clone(),
            depth: 0,
            poisoned: false,
        };

        for global in &module.globals {
            let value = instance.eval_const(&global.init)?;
            instance.globals.push(value);
        }

        for (index, segment) in module.elements.iter().enumerate() {
            let items = segment
                .items
                .iter()
                .map(|item| instance.eval_const(item))
                .collect::<Result<Vec<_>, _>>()?;
            match &segment.mode {
                ElementMode::Active { table, offset } => {
                    let base = instance.eval_offset(offset)?;
                    instance
                        .tables
                        .get_mut(*table as usize)
                        .ok_or(ValidationError::UnknownTable { index: *table })?
                        .init(base, &items)
                        .map_err(|_| InstantiationError::OutOfBoundsInit {
                            kind: SegmentKind::Element,
                            segment: index as u32,
                        })?;
                    instance.elements.push(None);
                }
                ElementMode::Passive => instance.elements.push(Some(items.into())),
                ElementMode::Declarative => instance.elements.push(None),
            }
        }

        for (index, segment) in module.data.iter().enumerate() {
            let DataMode::Active { memory, offset } = &segment.mode else {
                continue;
            };
            let base = instance.eval_offset(offset)?;
            let out_of_bounds = || InstantiationError::OutOfBoundsInit {
                kind: SegmentKind::Data,
                segment: index as u32,
            };
            instance
                .memories
                .get_mut(*memory as usize)
                .ok_or(ValidationError::UnknownMemory { index: *memory })?
                .init_data(base as usize, module.data_bytes(index as u32))
                .map_err(|_| out_of_bounds())?;
            if let Some(dropped) = instance.dropped_data.get_mut(index) {
                *dropped = true;
            }
        }

        debug!(
            target: "tessel::instantiate",
            funcs = instance.funcs.len(),
            tables = instance.tables.len(),
            memories = instance.memories.len(),
            globals = instance.globals.len(),
            elements = module.elements.len(),
            data = module.data.len(),
            "instance created"
        );

        if let Some(start) = module.start() {
            exec::invoke(&mut instance, start, Vec::new()).map_err(InstantiationError::StartTrap)?;
        }
        Ok(instance)
    }

    /// Evaluate a constant expression against the globals defined so far.
    fn eval_const(&self, expr: &ConstExpr) -> Result<Value, ValidationError> {
        let invalid = |reason| ValidationError::InvalidConstExpr {
            offset: expr.offset,
            reason,
        };
        let mut result = None;
        for op in &expr.ops {
            result = Some(match *op {
                ConstOp::I32Const(v) => Value::I32(v),
                ConstOp::I64Const(v) => Value::I64(v),
                ConstOp::F32Const(v) => Value::F32(v),
                ConstOp::F64Const(v) => Value::F64(v),
                ConstOp::GlobalGet(index) => self
                    .globals
                    .get(index as usize)
                    .cloned()
                    .ok_or_else(|| invalid("global is not yet defined"))?,
                ConstOp::RefNull(ty) => Value::null(ty),
                ConstOp::RefFunc(func) => Value::FuncRef(Some(FuncRef {
                    type_index: self
                        .module
                        .func_type_index(func)
                        .ok_or(ValidationError::UnknownFunctionIndex { index: func })?,
                    func_index: func,
                    owner: self.id,
                })),
            });
        }
        result.ok_or_else(|| invalid("empty expression"))
    }

    fn eval_offset(&self, expr: &ConstExpr) -> Result<u32, ValidationError> {
        match self.eval_const(expr)? {
            Value::I32(v) => Ok(v as u32),
            _ => Err(ValidationError::InvalidConstExpr {
                offset: expr.offset,
                reason: "segment offset must be i32",
            }),
        }
    }

    /// Call an exported function.
    ///
    /// Arguments are checked against the export's signature before any guest
    /// code runs.
    pub fn call(&mut self, name: &str, args: &[Value]) -> Result<Vec<Value>, CallError> {
        if self.poisoned {
            return Err(CallError::InstancePoisoned);
        }
        let func = match self.module.export(name) {
            Some(Export {
                kind: ExternKind::Func,
                index,
                ..
            }) => *index,
            _ => return Err(CallError::ExportNotFound(name.to_string())),
        };
        let ty = self
            .module
            .func_type(func)
            .ok_or_else(|| CallError::ExportNotFound(name.to_string()))?;
        self.check_args(ty, args)?;

        debug!(target: "tessel::call", export = name, func, args = args.len(), "call");
        exec::invoke(self, func, args.to_vec())
    }

    fn check_args(&self, ty: &FuncType, args: &[Value]) -> Result<(), CallError> {
        let kinds_match = args.len() == ty.params().len()
            && args.iter().zip(ty.params()).all(|(v, p)| v.ty() == *p);
        let refs_valid = args.iter().all(|v| self.admits(v));
        if kinds_match && refs_valid {
            return Ok(());
        }
        let provided: Vec<_> = args.iter().map(Value::ty).collect();
        Err(CallError::ArgumentMismatch {
            expected: TypeList(ty.params()).to_string(),
            provided: TypeList(&provided).to_string(),
        })
    }

    /// `false` for a function reference this instance did not create, or
    /// one whose type index does not match its function.
    pub(crate) fn admits(&self, value: &Value) -> bool {
        match value {
            Value::FuncRef(Some(f)) => {
                f.owner == self.id
                    && self.module.func_type_index(f.func_index) == Some(f.type_index)
            }
            _ => true,
        }
    }

    /// Process-unique id, carried by the function references this
    /// instance hands out.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn module(&self) -> &Arc<Module> {
        &self.module
    }

    pub fn exports(&self) -> &[Export] {
        self.module.exports()
    }

    /// Signature of an exported function.
    pub fn func_type(&self, name: &str) -> Option<&FuncType> {
        match self.module.export(name)? {
            Export {
                kind: ExternKind::Func,
                index,
                ..
            } => self.module.func_type(*index),
            _ => None,
        }
    }

    /// The instance's linear memory, if it has one.
    pub fn memory(&self) -> Option<&LinearMemory> {
        self.memories.first()
    }

    pub fn memory_mut(&mut self) -> Option<&mut LinearMemory> {
        self.memories.first_mut()
    }

    /// Current value of an exported global.
    pub fn global(&self, name: &str) -> Option<Value> {
        match self.module.export(name)? {
            Export {
                kind: ExternKind::Global,
                index,
                ..
            } => self.globals.get(*index as usize).cloned(),
            _ => None,
        }
    }

    /// An exported table.
    pub fn table(&self, name: &str) -> Option<&TableInstance> {
        match self.module.export(name)? {
            Export {
                kind: ExternKind::Table,
                index,
                ..
            } => self.tables.get(*index as usize),
            _ => None,
        }
    }

    /// Element `index` of an exported table; `None` if the table does not
    /// exist or the index is out of range.
    pub fn table_get(&self, name: &str, index: u32) -> Option<Value> {
        self.table(name)?.get(index).ok()
    }

    /// `true` once a stack overflow has made the instance unusable.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }
}

/// The calling Instance, as seen by a host function.
pub struct Caller<'a> {
    instance: &'a mut Instance,
}

impl<'a> Caller<'a> {
    pub(crate) fn new(instance: &'a mut Instance) -> Self {
        Self { instance }
    }

    pub fn memory(&self) -> Option<&LinearMemory> {
        self.instance.memory()
    }

    pub fn memory_mut(&mut self) -> Option<&mut LinearMemory> {
        self.instance.memory_mut()
    }

    pub fn global(&self, name: &str) -> Option<Value> {
        self.instance.global(name)
    }

    /// Re-enter an export of the calling Instance. Shares the caller's
    /// call-depth budget.
    pub fn call(&mut self, name: &str, args: &[Value]) -> Result<Vec<Value>, CallError> {
        self.instance.call(name, args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;

    fn instantiate(wat: &str) -> Result<Instance, InstantiationError> {
        let module = Arc::new(parse(&wat::parse_str(wat).unwrap()).unwrap());
        Instance::instantiate(&module, &Imports::new(), &HostConfig::default())
    }

    #[test]
    fn globals_and_segments_are_initialized() {
        let instance = instantiate(
            r#"(module
                (global $base i32 (i32.const 8))
                (global (export "g") i32 (global.get $base))
                (memory (export "mem") 1)
                (data (global.get $base) "\01\02")
                (table (export "t") 4 funcref)
                (elem (i32.const 1) $f)
                (func $f))"#,
        )
        .unwrap();
        assert_eq!(instance.global("g"), Some(Value::I32(8)));
        assert_eq!(instance.memory().unwrap().read(8, 2).unwrap(), &[1, 2]);
        assert_eq!(instance.table_get("t", 0), Some(Value::FuncRef(None)));
        assert!(matches!(
            instance.table_get("t", 1),
            Some(Value::FuncRef(Some(FuncRef { func_index: 0, .. })))
        ));
        assert_eq!(instance.table_get("t", 4), None);
    }

    #[test]
    fn out_of_bounds_data_segment() {
        let err = instantiate(r#"(module (memory 1) (data (i32.const 65535) "ab"))"#).unwrap_err();
        assert!(matches!(
            err,
            InstantiationError::OutOfBoundsInit {
                kind: SegmentKind::Data,
                segment: 0
            }
        ));
    }

    #[test]
    fn out_of_bounds_element_segment() {
        let err = instantiate(r#"(module (table 1 funcref) (elem (i32.const 1) $f) (func $f))"#)
            .unwrap_err();
        assert!(matches!(
            err,
            InstantiationError::OutOfBoundsInit {
                kind: SegmentKind::Element,
                ..
            }
        ));
    }

    #[test]
    fn memory_over_configured_limit() {
        let module = Arc::new(parse(&wat::parse_str("(module (memory 4))").unwrap()).unwrap());
        let config = HostConfig::default().with_max_memory_pages(2);
        let err = Instance::instantiate(&module, &Imports::new(), &config).unwrap_err();
        assert!(matches!(err, InstantiationError::ResourceLimit(_)));
    }

    #[test]
    fn start_trap_fails_instantiation() {
        let err = instantiate(r#"(module (func $s unreachable) (start $s))"#).unwrap_err();
        assert!(matches!(err, InstantiationError::StartTrap(_)));
    }

    #[test]
    fn call_checks_arguments() {
        let mut instance =
            instantiate(r#"(module (func (export "id") (param i32) (result i32) local.get 0))"#)
                .unwrap();
        assert_eq!(instance.call("id", &[Value::I32(4)]).unwrap(), vec![Value::I32(4)]);
        assert!(matches!(
            instance.call("id", &[Value::I64(4)]),
            Err(CallError::ArgumentMismatch { .. })
        ));
        assert!(matches!(
            instance.call("id", &[]),
            Err(CallError::ArgumentMismatch { .. })
        ));
        assert!(matches!(
            instance.call("missing", &[]),
            Err(CallError::ExportNotFound(_))
        ));
        assert_eq!(
            instance.func_type("id").map(ToString::to_string).as_deref(),
            Some("[i32] -> [i32]")
        );
    }
}
