//! `Host`: the top-level façade: load, validate, instantiate, call.

use std::sync::Arc;

use tessel_runtime::Value;
use tracing::debug;

use crate::config::HostConfig;
use crate::error::{CallError, InstantiationError, ParseError, ValidationError};
use crate::imports::Imports;
use crate::instance::Instance;
use crate::module::Module;
use crate::parser::parse;

/// Entry point for embedders. Holds the resource limits applied to every
/// Instance it creates.
///
/// ```no_run
/// use tessel_core::{Host, Imports, Value};
///
/// let host = Host::default();
/// let bytes = std::fs::read("add.wasm").unwrap();
/// let module = host.load(&bytes).unwrap();
/// let mut instance = host.instantiate(&module, &Imports::new()).unwrap();
/// let sum = host.call(&mut instance, "add", &[Value::I32(2), Value::I32(3)]).unwrap();
/// assert_eq!(sum, vec![Value::I32(5)]);
/// ```
#[derive(Debug, Clone, Default)]
pub struct Host {
    config: HostConfig,
}

impl Host {
    pub fn new(config: HostConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    /// Parse a binary module. Function bodies are decoded lazily.
    pub fn load(&self, bytes: &[u8]) -> Result<Arc<Module>, ParseError> {
        let module = parse(bytes)?;
        debug!(
            target: "tessel::load",
            bytes = bytes.len(),
            types = module.types.len(),
            imports = module.imports.len(),
            funcs = module.bodies.len(),
            exports = module.exports.len(),
            customs = module.customs.len(),
            "module loaded"
        );
        Ok(Arc::new(module))
    }

    /// Validate a module. The verdict is cached on the Module.
    pub fn validate(&self, module: &Module) -> Result<(), ValidationError> {
        module.validate()
    }

    pub fn instantiate(
        &self,
        module: &Arc<Module>,
        imports: &Imports,
    ) -> Result<Instance, InstantiationError> {
        Instance::instantiate(module, imports, &self.config)
    }

    /// Call an exported function of `instance`.
    pub fn call(
        &self,
        instance: &mut Instance,
        name: &str,
        args: &[Value],
    ) -> Result<Vec<Value>, CallError> {
        instance.call(name, args)
    }
}
