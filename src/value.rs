//! Runtime value types for gscript

use std::fmt;
use std::rc::Rc;

use crate::builtins::BuiltinDescriptor;
use crate::gc::{Handle, Heap};

/// Nesting depth past which arrays and records display as `...`
const DISPLAY_DEPTH: usize = 16;

/// Runtime values in gscript
#[derive(Clone)]
pub enum Value {
    /// Numeric value
    Number(f64),

    /// String value
    String(String),

    /// Boolean value
    Bool(bool),

    /// Nil/null value
    Nil,

    /// User-defined function (Prototype/Code)
    Function(Handle),

    /// Closure (Runtime Function Instance)
    Closure(Handle),

    /// Language intrinsic (len, str, ...)
    NativeFunction(NativeFn),

    /// Host capability exposed through the builtin library
    Builtin(Rc<BuiltinDescriptor>),

    /// Array/list
    Array(Handle),

    /// Record with string keys
    Record(Handle),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Bool(_) => "bool",
            Value::Nil => "nil",
            Value::Function(_)
            | Value::Closure(_)
            | Value::NativeFunction(_)
            | Value::Builtin(_) => "function",
            Value::Array(_) => "array",
            Value::Record(_) => "record",
        }
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Nil => false,
            Value::Bool(b) => *b,
            Value::Number(n) => *n != 0.0,
            Value::String(s) => !s.is_empty(),
            _ => true,
        }
    }

    pub fn is_callable(&self) -> bool {
        self.type_name() == "function"
    }

    /// Render the value the way scripts see it: arrays join their elements
    /// with `,` and integral numbers print without a fraction.
    pub fn display(&self, heap: &Heap) -> String {
        self.display_nested(heap, 0)
    }

    fn display_nested(&self, heap: &Heap, depth: usize) -> String {
        if depth > DISPLAY_DEPTH {
            return "...".to_string();
        }
        match self {
            Value::Number(n) => format!("{}", n),
            Value::String(s) => s.clone(),
            Value::Bool(b) => format!("{}", b),
            Value::Nil => "nil".to_string(),
            Value::Function(handle) | Value::Closure(handle) => match heap.function_name(*handle) {
                Some(name) => format!("<fn {}>", name),
                None => "<fn (collected)>".to_string(),
            },
            Value::NativeFunction(nf) => format!("<native fn {}>", nf.name),
            Value::Builtin(builtin) => format!("<builtin {}>", builtin.name),
            Value::Array(handle) => match heap.get_array(*handle) {
                Some(items) => items
                    .iter()
                    .map(|item| item.display_nested(heap, depth + 1))
                    .collect::<Vec<_>>()
                    .join(","),
                None => "<array (collected)>".to_string(),
            },
            Value::Record(handle) => match heap.get_record(*handle) {
                Some(fields) => {
                    let body = fields
                        .iter()
                        .map(|(key, value)| format!("{}: {}", key, value.display_nested(heap, depth + 1)))
                        .collect::<Vec<_>>()
                        .join(", ");
                    format!("{{{}}}", body)
                }
                None => "<record (collected)>".to_string(),
            },
        }
    }

    pub fn children(&self) -> Vec<Handle> {
        match self {
            Value::Function(handle)
            | Value::Closure(handle)
            | Value::Array(handle)
            | Value::Record(handle) => vec![*handle],
            _ => vec![],
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Number(n) => write!(f, "{}", n),
            Value::String(s) => write!(f, "{}", s),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Nil => write!(f, "nil"),
            Value::Function(_) | Value::Closure(_) => write!(f, "<fn>"), // Cannot access name without heap
            Value::NativeFunction(nf) => write!(f, "<native fn {}>", nf.name),
            Value::Builtin(builtin) => write!(f, "<builtin {}>", builtin.name),
            Value::Array(_) => write!(f, "<array>"), // Cannot access elements without heap
            Value::Record(_) => write!(f, "<record>"),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Nil, Value::Nil) => true,
            // Heap values compare by identity
            (Value::Function(a), Value::Function(b))
            | (Value::Closure(a), Value::Closure(b))
            | (Value::Array(a), Value::Array(b))
            | (Value::Record(a), Value::Record(b)) => a == b,
            (Value::NativeFunction(a), Value::NativeFunction(b)) => a.name == b.name,
            (Value::Builtin(a), Value::Builtin(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

/// User-defined function
#[derive(Debug, Clone)]
pub struct Function {
    pub chunk: Rc<crate::bytecode::Chunk>,
    pub upvalue_count: usize,
    pub name: String,
    pub params: Vec<String>,
}

impl Function {
    pub fn new(
        name: String,
        params: Vec<String>,
        chunk: Rc<crate::bytecode::Chunk>,
        upvalue_count: usize,
    ) -> Self {
        Self {
            name,
            params,
            chunk,
            upvalue_count,
        }
    }

    /// Nested function prototypes live in the constant pool
    pub fn children(&self) -> Vec<Handle> {
        self.chunk.constants.iter().flat_map(Value::children).collect()
    }
}

/// Native function type
pub type NativeFnPtr = fn(&mut crate::vm::VM, &[Value]) -> Result<Value, String>;

/// Native/built-in function
#[derive(Clone)]
pub struct NativeFn {
    pub name: String,
    pub arity: Option<usize>, // None means variadic
    pub func: NativeFnPtr,
}

impl NativeFn {
    pub fn new(name: &str, arity: Option<usize>, func: NativeFnPtr) -> Self {
        Self {
            name: name.to_string(),
            arity,
            func,
        }
    }
}

impl fmt::Debug for NativeFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<native fn {}>", self.name)
    }
}
