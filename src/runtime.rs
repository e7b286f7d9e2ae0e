//! The embeddable script runtime
//!
//! A [`Runtime`] owns one VM and walks a fixed lifecycle:
//!
//! ```text
//! Created --register_builtins--> BuiltinsRegistered --load--> Loaded --run--> Executed
//!                                        ^                                      |
//!                                        +------------- run error               load
//! ```
//!
//! Globals accumulate across `load`/`run` pairs, which is what lets the
//! shell build up state one line at a time.

use std::fmt;
use std::rc::Rc;

use tracing::{debug, info, trace, Level};

use crate::builtins::{AssetTable, BuiltinLibrary};
use crate::bytecode::Chunk;
use crate::compiler::{Compiler, SCRIPT_FUNCTION};
use crate::error::EngineError;
use crate::marshal::{self, HostValue};
use crate::validator;
use crate::value::Value;
use crate::vm::VM;

/// Lifecycle state of a [`Runtime`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeState {
    Created,
    BuiltinsRegistered,
    Loaded,
    Executed,
}

impl fmt::Display for RuntimeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            RuntimeState::Created => "created",
            RuntimeState::BuiltinsRegistered => "builtins-registered",
            RuntimeState::Loaded => "loaded",
            RuntimeState::Executed => "executed",
        };
        write!(f, "{}", text)
    }
}

/// Snapshot of a global taken by [`Runtime::get`]
#[derive(Debug, Clone, PartialEq)]
pub struct Binding {
    pub name: String,
    pub value: HostValue,
}

/// One interpreter with its builtin library
pub struct Runtime {
    vm: VM,
    state: RuntimeState,
    pending: Option<Chunk>,
    /// Text of the most recently loaded script, for error excerpts
    source: String,
    builtins: Vec<String>,
}

impl Runtime {
    pub fn new() -> Self {
        Self::with_assets(AssetTable::new())
    }

    /// A runtime whose `Asset` builtin serves `assets`
    pub fn with_assets(assets: AssetTable) -> Self {
        let mut vm = VM::new();
        vm.assets = assets;
        Self {
            vm,
            state: RuntimeState::Created,
            pending: None,
            source: String::new(),
            builtins: Vec::new(),
        }
    }

    pub fn state(&self) -> RuntimeState {
        self.state
    }

    /// Expose every builtin of `library` as an immutable global. Allowed once.
    pub fn register_builtins(&mut self, library: &BuiltinLibrary) -> Result<(), EngineError> {
        self.expect_state("register builtins", &[RuntimeState::Created])?;

        for descriptor in library.iter() {
            self.vm
                .define_global(&descriptor.name, Value::Builtin(Rc::new(descriptor.clone())), false);
            self.builtins.push(descriptor.name.clone());
        }

        debug!(count = library.len(), "builtins registered");
        self.state = RuntimeState::BuiltinsRegistered;
        Ok(())
    }

    /// Validate and compile `source`; it runs on the next [`run`](Self::run)
    pub fn load(&mut self, source: &str) -> Result<(), EngineError> {
        self.expect_state("load a script", &[RuntimeState::BuiltinsRegistered, RuntimeState::Executed])?;

        let script = validator::validate(source).map_err(EngineError::Syntax)?;
        let chunk = Compiler::new()
            .compile(script.program(), &mut self.vm.heap)
            .map_err(|e| EngineError::Syntax(e.with_source(source)))?;

        debug!(declarations = ?script.declarations(), "script loaded");
        if tracing::enabled!(Level::TRACE) {
            trace!("\n{}", chunk.disassemble(SCRIPT_FUNCTION));
        }
        self.pending = Some(chunk);
        self.source = source.to_string();
        self.state = RuntimeState::Loaded;
        Ok(())
    }

    /// Execute the loaded script. Returns the value of a trailing expression.
    pub fn run(&mut self) -> Result<HostValue, EngineError> {
        self.expect_state("run", &[RuntimeState::Loaded])?;
        let chunk = self.pending.take().ok_or(EngineError::InvalidState {
            operation: "run",
            state: "loaded without a script".to_string(),
        })?;

        match self.vm.run(chunk) {
            Ok(value) => {
                self.state = RuntimeState::Executed;
                info!("script executed");
                Ok(marshal::export(&self.vm.heap, &value))
            }
            Err(err) => {
                self.state = RuntimeState::BuiltinsRegistered;
                Err(EngineError::Runtime(err.with_source(&self.source)))
            }
        }
    }

    /// `load` then `run`
    pub fn eval(&mut self, source: &str) -> Result<HostValue, EngineError> {
        self.load(source)?;
        self.run()
    }

    /// Snapshot of the global `name`
    pub fn get(&self, name: &str) -> Result<Binding, EngineError> {
        let value = self
            .vm
            .get_global(name)
            .ok_or_else(|| EngineError::NotFound(name.to_string()))?;
        Ok(Binding {
            name: name.to_string(),
            value: marshal::export(&self.vm.heap, value),
        })
    }

    /// Globals declared by scripts, sorted by name
    pub fn exports(&self) -> Vec<Binding> {
        self.vm
            .globals()
            .into_iter()
            .filter(|(name, value)| !matches!(value, Value::NativeFunction(_)) && !self.is_builtin(name))
            .map(|(name, value)| Binding {
                name: name.to_string(),
                value: marshal::export(&self.vm.heap, value),
            })
            .collect()
    }

    /// Call the script function bound to `name`
    pub fn call(&mut self, name: &str, args: &[HostValue]) -> Result<HostValue, EngineError> {
        self.expect_state("call a function", &[RuntimeState::Executed])?;

        let binding = self
            .vm
            .get_global(name)
            .ok_or_else(|| EngineError::NotFound(name.to_string()))?;
        if !binding.is_callable() {
            return Err(EngineError::NotFound(format!("{} (bound to a {}, not a function)", name, binding.type_name())));
        }

        let args = args
            .iter()
            .map(|arg| marshal::import(&mut self.vm.heap, arg.clone()))
            .collect();

        debug!(function = name, "calling script function");
        let value = self
            .vm
            .call_global(name, args)
            .map_err(|e| EngineError::Runtime(e.with_source(&self.source)))?;
        Ok(marshal::export(&self.vm.heap, &value))
    }

    /// Names of the builtins this runtime exposes
    pub fn builtin_names(&self) -> &[String] {
        &self.builtins
    }

    fn is_builtin(&self, name: &str) -> bool {
        self.builtins.iter().any(|b| b == name)
    }

    fn expect_state(&self, operation: &'static str, allowed: &[RuntimeState]) -> Result<(), EngineError> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(EngineError::InvalidState {
                operation,
                state: self.state.to_string(),
            })
        }
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ready() -> Runtime {
        let mut runtime = Runtime::new();
        runtime.register_builtins(&BuiltinLibrary::standard()).unwrap();
        runtime
    }

    #[test]
    fn test_lifecycle() {
        let mut runtime = Runtime::new();
        assert_eq!(runtime.state(), RuntimeState::Created);

        runtime.register_builtins(&BuiltinLibrary::standard()).unwrap();
        assert_eq!(runtime.state(), RuntimeState::BuiltinsRegistered);

        runtime.load("let x = 1").unwrap();
        assert_eq!(runtime.state(), RuntimeState::Loaded);

        runtime.run().unwrap();
        assert_eq!(runtime.state(), RuntimeState::Executed);
    }

    #[test]
    fn test_load_before_registration_is_invalid() {
        let mut runtime = Runtime::new();
        let err = runtime.load("1").unwrap_err();
        assert!(matches!(err, EngineError::InvalidState { operation: "load a script", .. }));
    }

    #[test]
    fn test_syntax_error_keeps_state() {
        let mut runtime = ready();
        let err = runtime.load("let = 1").unwrap_err();
        assert!(err.is_syntax());
        assert_eq!(runtime.state(), RuntimeState::BuiltinsRegistered);
    }

    #[test]
    fn test_runtime_error_returns_to_registered() {
        let mut runtime = ready();
        runtime.load("var before = 1\nundefined_call()").unwrap();
        let err = runtime.run().unwrap_err();
        assert!(matches!(err, EngineError::Runtime(_)));
        assert_eq!(runtime.state(), RuntimeState::BuiltinsRegistered);
        // Globals written before the error persist
        assert_eq!(runtime.get("before").unwrap().value, HostValue::Number(1.0));
    }

    #[test]
    fn test_exports_skip_intrinsics_and_builtins() {
        let mut runtime = ready();
        runtime.eval("let name = \"x\"\nfn Deploy() { return true }").unwrap();
        let names: Vec<String> = runtime.exports().into_iter().map(|b| b.name).collect();
        assert_eq!(names, vec!["Deploy", "name"]);
    }

    #[test]
    fn test_call_marshals_arguments() {
        let mut runtime = ready();
        runtime.eval("fn size(bytes) { return len(bytes) }").unwrap();
        let result = runtime.call("size", &[HostValue::Bytes(vec![1, 2, 3])]).unwrap();
        assert_eq!(result, HostValue::Number(3.0));
    }

    #[test]
    fn test_call_non_function_is_not_found() {
        let mut runtime = ready();
        runtime.eval("let Deploy = 5").unwrap();
        assert!(matches!(runtime.call("Deploy", &[]), Err(EngineError::NotFound(_))));
    }
}
