//! Execution plans built from reserved hook names
//!
//! After a script has run, the host looks for the hook functions it
//! declared and calls them in a fixed order. A hook fails when it raises an
//! error or returns exactly `false`; the plan then stops and `OnError`
//! receives the name of the failed hook.

use tracing::{info, warn};

use crate::error::EngineError;
use crate::marshal::HostValue;
use crate::runtime::{Runtime, RuntimeState};

/// Version of the hook naming convention below
pub const HOOK_CONVENTION_VERSION: u32 = 1;

/// Hooks in execution order
pub const HOOKS: [&str; 3] = ["BeforeDeploy", "Deploy", "AfterDeploy"];

/// Called with the failed hook's name
pub const ERROR_HOOK: &str = "OnError";

/// Hooks that ran to completion
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlanReport {
    pub completed: Vec<String>,
}

/// The ordered hooks a script declared
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionPlan {
    hooks: Vec<String>,
    error_hook: bool,
}

impl ExecutionPlan {
    /// Collect the declared hooks of an executed runtime
    pub fn discover(runtime: &Runtime) -> Result<Self, EngineError> {
        if runtime.state() != RuntimeState::Executed {
            return Err(EngineError::InvalidState {
                operation: "discover hooks",
                state: runtime.state().to_string(),
            });
        }

        let mut hooks = Vec::new();
        for name in HOOKS {
            if declared_function(runtime, name)? {
                hooks.push(name.to_string());
            }
        }
        let error_hook = declared_function(runtime, ERROR_HOOK)?;

        info!(hooks = ?hooks, error_hook, version = HOOK_CONVENTION_VERSION, "execution plan discovered");
        Ok(Self { hooks, error_hook })
    }

    pub fn hooks(&self) -> &[String] {
        &self.hooks
    }

    pub fn has_error_hook(&self) -> bool {
        self.error_hook
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Run each hook in order, stopping at the first failure
    pub fn execute(self, runtime: &mut Runtime) -> Result<PlanReport, EngineError> {
        let mut report = PlanReport::default();

        for hook in self.hooks {
            info!(hook = %hook, "running hook");
            let reason = match runtime.call(&hook, &[]) {
                Ok(HostValue::Bool(false)) => Some("returned false".to_string()),
                Ok(_) => None,
                Err(err) => Some(err.to_string()),
            };

            if let Some(reason) = reason {
                warn!(hook = %hook, reason = %reason, "hook failed");
                if self.error_hook {
                    if let Err(err) = runtime.call(ERROR_HOOK, &[HostValue::String(hook.clone())]) {
                        warn!(error = %err, "{} failed", ERROR_HOOK);
                    }
                }
                return Err(EngineError::Plan { hook, reason });
            }
            report.completed.push(hook);
        }

        Ok(report)
    }
}

/// Whether `name` is bound to a function; any other binding is an error
fn declared_function(runtime: &Runtime, name: &str) -> Result<bool, EngineError> {
    match runtime.get(name) {
        Ok(binding) if binding.value.is_function() => Ok(true),
        Ok(binding) => Err(EngineError::Plan {
            hook: name.to_string(),
            reason: format!("reserved name is bound to a {}", binding.value.type_name()),
        }),
        Err(EngineError::NotFound(_)) => Ok(false),
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtins::BuiltinLibrary;

    fn executed(source: &str) -> Runtime {
        let mut runtime = Runtime::new();
        runtime.register_builtins(&BuiltinLibrary::standard()).unwrap();
        runtime.eval(source).unwrap();
        runtime
    }

    #[test]
    fn test_discover_orders_hooks() {
        let runtime = executed("fn AfterDeploy() {}\nfn Deploy() {}\nfn BeforeDeploy() {}");
        let plan = ExecutionPlan::discover(&runtime).unwrap();
        assert_eq!(plan.hooks(), ["BeforeDeploy", "Deploy", "AfterDeploy"]);
        assert!(!plan.has_error_hook());
    }

    #[test]
    fn test_discover_skips_undeclared_hooks() {
        let runtime = executed("fn Deploy() {}");
        let plan = ExecutionPlan::discover(&runtime).unwrap();
        assert_eq!(plan.hooks(), ["Deploy"]);
    }

    #[test]
    fn test_discover_rejects_non_function_hook() {
        let runtime = executed("let Deploy = 1");
        let err = ExecutionPlan::discover(&runtime).unwrap_err();
        assert!(matches!(err, EngineError::Plan { ref hook, .. } if hook == "Deploy"));
    }

    #[test]
    fn test_discover_requires_executed_runtime() {
        let mut runtime = Runtime::new();
        runtime.register_builtins(&BuiltinLibrary::standard()).unwrap();
        assert!(matches!(ExecutionPlan::discover(&runtime), Err(EngineError::InvalidState { .. })));
    }
}
