//! Error types for the engine
//!
//! `ScriptError` is raised inside the language (syntax and runtime errors,
//! with source locations). `EngineError` and `CompileError` are what hosts
//! see from the runtime, the execution plan and the AOT compiler.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::token::Span;

/// Error kinds raised by the lexer, parser, compiler and VM
#[derive(Debug, Clone, Error)]
pub enum ErrorKind {
    // Lexer errors
    #[error("unexpected character '{0}'")]
    UnexpectedCharacter(char),
    #[error("unterminated string")]
    UnterminatedString,
    #[error("unterminated block comment")]
    UnterminatedComment,
    #[error("invalid number '{0}'")]
    InvalidNumber(String),

    // Parser errors
    #[error("unexpected token '{0}'")]
    UnexpectedToken(String),
    #[error("{0}, got '{1}'")]
    ExpectedToken(String, String),
    #[error("expected expression")]
    ExpectedExpression,
    #[error("invalid assignment target")]
    InvalidAssignmentTarget,

    // Compile errors
    #[error("break outside of loop")]
    BreakOutsideLoop,
    #[error("continue outside of loop")]
    ContinueOutsideLoop,
    #[error("cannot assign to immutable binding '{0}'")]
    ImmutableVariable(String),
    #[error("{0} exceeds the supported limit")]
    LimitExceeded(&'static str),

    // Runtime errors
    #[error("undefined variable '{0}'")]
    UndefinedVariable(String),
    #[error("undefined property '{0}'")]
    UndefinedProperty(String),
    #[error("type mismatch: expected {0}, got {1}")]
    TypeMismatch(String, String),
    #[error("division by zero")]
    DivisionByZero,
    #[error("expected {0} arguments, got {1}")]
    WrongArity(usize, usize),
    #[error("{builtin}() expects {expected} arguments, got {got}")]
    ArgumentCount { builtin: String, expected: usize, got: usize },
    #[error("{builtin}() argument {position} must be {expected}, got {got}")]
    ArgumentType { builtin: String, position: usize, expected: String, got: String },
    #[error("index {0} out of bounds")]
    IndexOutOfBounds(i64),
    #[error("stack overflow")]
    StackOverflow,
    #[error("{0}")]
    RuntimeError(String),
}

impl ErrorKind {
    /// True for errors produced before any statement runs
    pub fn is_syntax(&self) -> bool {
        matches!(
            self,
            ErrorKind::UnexpectedCharacter(_)
                | ErrorKind::UnterminatedString
                | ErrorKind::UnterminatedComment
                | ErrorKind::InvalidNumber(_)
                | ErrorKind::UnexpectedToken(_)
                | ErrorKind::ExpectedToken(..)
                | ErrorKind::ExpectedExpression
                | ErrorKind::InvalidAssignmentTarget
                | ErrorKind::BreakOutsideLoop
                | ErrorKind::ContinueOutsideLoop
                | ErrorKind::ImmutableVariable(_)
                | ErrorKind::LimitExceeded(_)
        )
    }
}

/// A script error with location information
#[derive(Debug, Clone)]
pub struct ScriptError {
    pub kind: ErrorKind,
    pub span: Option<Span>,
    pub source_line: Option<String>,
}

impl ScriptError {
    pub fn new(kind: ErrorKind, span: Option<Span>) -> Self {
        Self {
            kind,
            span,
            source_line: None,
        }
    }

    /// Attach the offending line of `source` for display
    pub fn with_source(mut self, source: &str) -> Self {
        if let Some(span) = &self.span {
            self.source_line = source.lines().nth(span.line.saturating_sub(1)).map(str::to_string);
        }
        self
    }

    pub fn is_syntax(&self) -> bool {
        self.kind.is_syntax()
    }
}

impl fmt::Display for ScriptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(span) = &self.span {
            // Runtime errors only know the line
            if span.column == 0 {
                write!(f, "[line {}] Error: {}", span.line, self.kind)?;
            } else {
                write!(f, "[line {}:{}] Error: {}", span.line, span.column, self.kind)?;
            }

            if let Some(ref line) = self.source_line {
                write!(f, "\n  | {}", line)?;
                if span.column > 0 {
                    write!(f, "\n  | {}^", " ".repeat(span.column - 1))?;
                }
            }
        } else {
            write!(f, "Error: {}", self.kind)?;
        }
        Ok(())
    }
}

impl std::error::Error for ScriptError {}

impl From<ErrorKind> for ScriptError {
    fn from(kind: ErrorKind) -> Self {
        ScriptError::new(kind, None)
    }
}

/// Result type for language-level operations
pub type Result<T> = std::result::Result<T, ScriptError>;

/// Errors surfaced by a `Runtime` and the execution plan
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("syntax error: {0}")]
    Syntax(ScriptError),

    #[error("runtime error: {0}")]
    Runtime(ScriptError),

    #[error("binding not found: {0}")]
    NotFound(String),

    #[error("cannot {operation} while runtime is {state}")]
    InvalidState { operation: &'static str, state: String },

    #[error("duplicate builtin '{0}'")]
    DuplicateBuiltin(String),

    #[error("hook {hook} failed: {reason}")]
    Plan { hook: String, reason: String },
}

impl EngineError {
    pub fn is_syntax(&self) -> bool {
        matches!(self, EngineError::Syntax(_))
    }
}

/// Errors from the ahead-of-time compiler
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("cannot read script {path}: {source}")]
    ReadScript {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("script {path} is invalid: {error}")]
    Syntax { path: PathBuf, error: ScriptError },

    #[error("cannot read resource {path}: {source}")]
    Resource {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("resource name '{0}' is embedded more than once")]
    DuplicateAsset(String),

    #[error("output directory {0} already exists")]
    OutputExists(PathBuf),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("toolchain `{command}` failed: {detail}")]
    Toolchain { command: String, detail: String },
}
