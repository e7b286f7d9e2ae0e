//! Conversion between VM values and host values
//!
//! Builtins never see VM values directly. Their arguments are checked and
//! converted to typed [`Arg`]s by [`unpack`], and their results come back as
//! [`HostValue`]s that [`import`] allocates on the script heap. Hosts read
//! script globals through [`export`].

use std::collections::BTreeMap;
use std::fmt;

use crate::error::ErrorKind;
use crate::gc::Heap;
use crate::value::Value;

/// Nesting depth past which exported containers become `Nil`
const EXPORT_DEPTH: usize = 32;

/// A value owned by the host, detached from any runtime heap
#[derive(Debug, Clone, PartialEq)]
pub enum HostValue {
    Nil,
    Bool(bool),
    Number(f64),
    String(String),
    /// Raw bytes; scripts see them as an array of integers 0-255
    Bytes(Vec<u8>),
    List(Vec<HostValue>),
    Record(BTreeMap<String, HostValue>),
    /// A script or builtin function, identified by name
    Function(String),
}

impl HostValue {
    /// Build a record from `(field, value)` pairs
    pub fn record<K, I>(fields: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, HostValue)>,
    {
        HostValue::Record(fields.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            HostValue::Nil => "nil",
            HostValue::Bool(_) => "bool",
            HostValue::Number(_) => "number",
            HostValue::String(_) => "string",
            HostValue::Bytes(_) => "bytes",
            HostValue::List(_) => "array",
            HostValue::Record(_) => "record",
            HostValue::Function(_) => "function",
        }
    }

    /// Numeric reading: numbers as-is, booleans as 0/1, numeric text parsed
    pub fn to_number(&self) -> Option<f64> {
        match self {
            HostValue::Number(n) => Some(*n),
            HostValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            HostValue::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Integer reading of [`to_number`](Self::to_number), truncating toward zero
    pub fn to_integer(&self) -> Option<i64> {
        self.to_number()
            .filter(|n| n.is_finite())
            .map(|n| n.trunc() as i64)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            HostValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            HostValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Byte reading: `Bytes` directly, or a list of integers 0-255
    pub fn to_bytes(&self) -> Option<Vec<u8>> {
        match self {
            HostValue::Bytes(bytes) => Some(bytes.clone()),
            HostValue::List(items) => items.iter().map(|item| byte_of(item.to_number()?)).collect(),
            _ => None,
        }
    }

    /// Field of a record
    pub fn get(&self, field: &str) -> Option<&HostValue> {
        match self {
            HostValue::Record(fields) => fields.get(field),
            _ => None,
        }
    }

    pub fn is_function(&self) -> bool {
        matches!(self, HostValue::Function(_))
    }
}

impl fmt::Display for HostValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostValue::Nil => write!(f, "nil"),
            HostValue::Bool(b) => write!(f, "{}", b),
            HostValue::Number(n) => write!(f, "{}", n),
            HostValue::String(s) => write!(f, "{}", s),
            HostValue::Bytes(bytes) => {
                let parts: Vec<String> = bytes.iter().map(u8::to_string).collect();
                write!(f, "{}", parts.join(","))
            }
            HostValue::List(items) => {
                let parts: Vec<String> = items.iter().map(HostValue::to_string).collect();
                write!(f, "{}", parts.join(","))
            }
            HostValue::Record(fields) => {
                let parts: Vec<String> = fields.iter().map(|(k, v)| format!("{}: {}", k, v)).collect();
                write!(f, "{{{}}}", parts.join(", "))
            }
            HostValue::Function(name) => write!(f, "<fn {}>", name),
        }
    }
}

impl From<bool> for HostValue {
    fn from(b: bool) -> Self {
        HostValue::Bool(b)
    }
}

impl From<f64> for HostValue {
    fn from(n: f64) -> Self {
        HostValue::Number(n)
    }
}

impl From<&str> for HostValue {
    fn from(s: &str) -> Self {
        HostValue::String(s.to_string())
    }
}

impl From<String> for HostValue {
    fn from(s: String) -> Self {
        HostValue::String(s)
    }
}

impl From<Vec<u8>> for HostValue {
    fn from(bytes: Vec<u8>) -> Self {
        HostValue::Bytes(bytes)
    }
}

/// Accepted shape of one builtin parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamShape {
    String,
    Number,
    /// An array of integers 0-255, or a string (its UTF-8 bytes)
    Bytes,
    /// An array of strings; numbers are accepted as their text
    Strings,
}

impl fmt::Display for ParamShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ParamShape::String => "string",
            ParamShape::Number => "number",
            ParamShape::Bytes => "bytes",
            ParamShape::Strings => "array of strings",
        };
        write!(f, "{}", text)
    }
}

/// A builtin argument after shape checking
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    String(String),
    Number(f64),
    Bytes(Vec<u8>),
    Strings(Vec<String>),
}

/// Deep-copy a VM value out of the heap
pub fn export(heap: &Heap, value: &Value) -> HostValue {
    export_nested(heap, value, 0)
}

fn export_nested(heap: &Heap, value: &Value, depth: usize) -> HostValue {
    if depth > EXPORT_DEPTH {
        return HostValue::Nil;
    }
    match value {
        Value::Nil => HostValue::Nil,
        Value::Bool(b) => HostValue::Bool(*b),
        Value::Number(n) => HostValue::Number(*n),
        Value::String(s) => HostValue::String(s.clone()),
        Value::Array(handle) => match heap.get_array(*handle) {
            Some(items) => HostValue::List(
                items.iter().map(|item| export_nested(heap, item, depth + 1)).collect(),
            ),
            None => HostValue::Nil,
        },
        Value::Record(handle) => match heap.get_record(*handle) {
            Some(fields) => HostValue::Record(
                fields
                    .iter()
                    .map(|(k, v)| (k.clone(), export_nested(heap, v, depth + 1)))
                    .collect(),
            ),
            None => HostValue::Nil,
        },
        Value::Function(handle) | Value::Closure(handle) => {
            HostValue::Function(heap.function_name(*handle).unwrap_or("<fn>").to_string())
        }
        Value::NativeFunction(native) => HostValue::Function(native.name.clone()),
        Value::Builtin(builtin) => HostValue::Function(builtin.name.clone()),
    }
}

/// Allocate a host value on the script heap.
///
/// Bytes become arrays of integer numbers. Functions cannot cross into a
/// heap they were not created on and import as `nil`.
pub fn import(heap: &mut Heap, host: HostValue) -> Value {
    match host {
        HostValue::Nil | HostValue::Function(_) => Value::Nil,
        HostValue::Bool(b) => Value::Bool(b),
        HostValue::Number(n) => Value::Number(n),
        HostValue::String(s) => Value::String(s),
        HostValue::Bytes(bytes) => {
            let items = bytes.into_iter().map(|b| Value::Number(b as f64)).collect();
            Value::Array(heap.alloc_array(items))
        }
        HostValue::List(items) => {
            let items = items.into_iter().map(|item| import(heap, item)).collect();
            Value::Array(heap.alloc_array(items))
        }
        HostValue::Record(fields) => {
            let fields = fields.into_iter().map(|(k, v)| (k, import(heap, v))).collect();
            Value::Record(heap.alloc_record(fields))
        }
    }
}

/// Check a builtin call's arguments against its parameter shapes
pub fn unpack(heap: &Heap, builtin: &str, shapes: &[ParamShape], args: &[Value]) -> Result<Vec<Arg>, ErrorKind> {
    if args.len() != shapes.len() {
        return Err(ErrorKind::ArgumentCount {
            builtin: builtin.to_string(),
            expected: shapes.len(),
            got: args.len(),
        });
    }

    shapes
        .iter()
        .zip(args)
        .enumerate()
        .map(|(i, (shape, arg))| {
            convert(heap, *shape, arg).map_err(|got| ErrorKind::ArgumentType {
                builtin: builtin.to_string(),
                position: i + 1,
                expected: shape.to_string(),
                got,
            })
        })
        .collect()
}

/// Convert one argument, or describe what was received instead
fn convert(heap: &Heap, shape: ParamShape, value: &Value) -> Result<Arg, String> {
    match (shape, value) {
        (ParamShape::String, Value::String(s)) => Ok(Arg::String(s.clone())),
        (ParamShape::Number, Value::Number(n)) => Ok(Arg::Number(*n)),
        (ParamShape::Bytes, Value::String(s)) => Ok(Arg::Bytes(s.as_bytes().to_vec())),
        (ParamShape::Bytes, Value::Array(handle)) => {
            let items = heap.get_array(*handle).map(Vec::as_slice).unwrap_or_default();
            items
                .iter()
                .map(|item| match item {
                    Value::Number(n) => byte_of(*n).ok_or_else(|| format!("array containing {}", n)),
                    other => Err(format!("array containing {}", other.type_name())),
                })
                .collect::<Result<Vec<u8>, String>>()
                .map(Arg::Bytes)
        }
        (ParamShape::Strings, Value::Array(handle)) => {
            let items = heap.get_array(*handle).map(Vec::as_slice).unwrap_or_default();
            items
                .iter()
                .map(|item| match item {
                    Value::String(s) => Ok(s.clone()),
                    Value::Number(n) => Ok(n.to_string()),
                    other => Err(format!("array containing {}", other.type_name())),
                })
                .collect::<Result<Vec<String>, String>>()
                .map(Arg::Strings)
        }
        (_, other) => Err(other.type_name().to_string()),
    }
}

fn byte_of(n: f64) -> Option<u8> {
    if n.fract() == 0.0 && (0.0..=255.0).contains(&n) {
        Some(n as u8)
    } else {
        None
    }
}
