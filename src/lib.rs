//! gscript - a capability-bounded scripting engine
//!
//! Scripts run on a small bytecode VM and reach the host only through a
//! vetted [`BuiltinLibrary`]. A script can be validated without running it,
//! executed through a [`Runtime`] and its deploy hooks, or packaged with its
//! resources into a standalone Cargo project by [`aot::compile`].

pub mod token;
pub mod lexer;
pub mod parser;
pub mod ast;
pub mod value;
pub mod gc;
pub mod error;
pub mod bytecode;
pub mod compiler;
pub mod vm;
pub mod marshal;
pub mod builtins;
pub mod validator;
pub mod runtime;
pub mod plan;
pub mod aot;
pub mod config;
pub mod logging;

pub use builtins::{AssetTable, BuiltinLibrary};
pub use error::{CompileError, EngineError, Result, ScriptError};
pub use lexer::Lexer;
pub use marshal::HostValue;
pub use parser::Parser;
pub use plan::ExecutionPlan;
pub use runtime::Runtime;
pub use validator::{validate, Script};
pub use value::Value;

/// Run `source` in a fresh runtime with the standard library and return
/// the value of its trailing expression
pub fn run(source: &str) -> std::result::Result<HostValue, EngineError> {
    let mut runtime = Runtime::new();
    runtime.register_builtins(&BuiltinLibrary::standard())?;
    runtime.eval(source)
}

/// Version of the gscript engine
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
