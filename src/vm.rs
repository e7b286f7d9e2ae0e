//! Stack-based virtual machine for gscript
//!
//! Executes bytecode produced by the compiler. Builtins are reached through
//! the marshaling layer so they only ever see host values.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::rc::Rc;

use tracing::{debug, trace};

use crate::builtins::{AssetTable, CallContext};
use crate::bytecode::{Chunk, OpCode};
use crate::compiler::SCRIPT_FUNCTION;
use crate::error::{ErrorKind, Result, ScriptError};
use crate::gc::{Handle, Heap, UpvalueState};
use crate::marshal;
use crate::token::Span;
use crate::value::{Function, NativeFn, Value};

/// Initial stack capacity
const STACK_INITIAL: usize = 256;

/// Maximum call depth
const FRAMES_MAX: usize = 64;

/// Most elements a single `range` call or string repetition may produce
pub const MAX_SEQUENCE_LEN: usize = 1 << 24;

/// A call frame for function calls
#[derive(Debug, Clone)]
struct CallFrame {
    /// The closure being executed
    closure: Handle,

    /// The chunk being executed (cached from closure)
    chunk: Rc<Chunk>,

    /// Instruction pointer
    ip: usize,

    /// Stack slot where this frame begins
    slot: usize,
}

impl CallFrame {
    fn new(closure: Handle, chunk: Rc<Chunk>, slot: usize) -> Self {
        Self { closure, chunk, ip: 0, slot }
    }
}

/// Global binding in the VM
#[derive(Debug, Clone)]
struct Binding {
    value: Value,
    mutable: bool,
}

/// The Virtual Machine
pub struct VM {
    /// Value stack
    stack: Vec<Value>,

    /// Call frames
    frames: Vec<CallFrame>,

    /// Global variables
    globals: HashMap<String, Binding>,

    /// Garbage collected heap
    pub heap: Heap,

    /// Open upvalues (pointing to stack)
    open_upvalues: Vec<Handle>,

    /// Resources visible to the `Asset` builtin
    pub assets: AssetTable,
}

impl VM {
    pub fn new() -> Self {
        let mut vm = Self {
            stack: Vec::with_capacity(STACK_INITIAL),
            frames: Vec::with_capacity(FRAMES_MAX),
            globals: HashMap::new(),
            heap: Heap::new(),
            open_upvalues: Vec::new(),
            assets: AssetTable::new(),
        };

        vm.define_natives();
        vm
    }

    fn define_natives(&mut self) {
        let natives = vec![
            // len(val)
            NativeFn::new("len", Some(1), |vm, args| {
                length_of(&vm.heap, &args[0])
                    .map(|n| Value::Number(n as f64))
                    .ok_or_else(|| format!("len() requires string, array or record, got {}", args[0].type_name()))
            }),

            // str(val)
            NativeFn::new("str", Some(1), |vm, args| Ok(Value::String(args[0].display(&vm.heap)))),

            // num(val)
            NativeFn::new("num", Some(1), |_vm, args| match &args[0] {
                Value::Number(n) => Ok(Value::Number(*n)),
                Value::String(s) => s
                    .trim()
                    .parse::<f64>()
                    .map(Value::Number)
                    .map_err(|_| format!("cannot convert '{}' to number", s)),
                Value::Bool(b) => Ok(Value::Number(if *b { 1.0 } else { 0.0 })),
                other => Err(format!("cannot convert {} to number", other.type_name())),
            }),

            // type(val)
            NativeFn::new("type", Some(1), |_vm, args| Ok(Value::String(args[0].type_name().to_string()))),

            // range(n) or range(start, end)
            NativeFn::new("range", None, |vm, args| {
                let (start, end) = match args {
                    [Value::Number(n)] => (0, *n as i64),
                    [Value::Number(a), Value::Number(b)] => (*a as i64, *b as i64),
                    [_] | [_, _] => return Err("range() requires numbers".to_string()),
                    _ => return Err("range() takes 1 or 2 arguments".to_string()),
                };

                if end.saturating_sub(start) > MAX_SEQUENCE_LEN as i64 {
                    return Err(format!("range() would produce more than {} elements", MAX_SEQUENCE_LEN));
                }

                let values = (start..end).map(|i| Value::Number(i as f64)).collect();
                Ok(Value::Array(vm.heap.alloc_array(values)))
            }),

            // push(array, value) -> new length
            NativeFn::new("push", Some(2), |vm, args| match &args[0] {
                Value::Array(handle) => {
                    let items = vm
                        .heap
                        .get_array_mut(*handle)
                        .ok_or_else(|| "push() on a collected array".to_string())?;
                    items.push(args[1].clone());
                    Ok(Value::Number(items.len() as f64))
                }
                other => Err(format!("push() requires an array, got {}", other.type_name())),
            }),

            // keys(record) -> sorted field names
            NativeFn::new("keys", Some(1), |vm, args| match &args[0] {
                Value::Record(handle) => {
                    let keys: Vec<Value> = vm
                        .heap
                        .get_record(*handle)
                        .map(|fields| fields.keys().map(|k| Value::String(k.clone())).collect())
                        .unwrap_or_default();
                    Ok(Value::Array(vm.heap.alloc_array(keys)))
                }
                other => Err(format!("keys() requires a record, got {}", other.type_name())),
            }),

            // assert(cond, msg?)
            NativeFn::new("assert", None, |vm, args| {
                let Some(condition) = args.first() else {
                    return Err("assert() requires at least one argument".to_string());
                };
                if !condition.is_truthy() {
                    return Err(args
                        .get(1)
                        .map(|msg| msg.display(&vm.heap))
                        .unwrap_or_else(|| "assertion failed".to_string()));
                }
                Ok(Value::Nil)
            }),
        ];

        for native in natives {
            let name = native.name.clone();
            self.define_global(&name, Value::NativeFunction(native), false);
        }
    }

    /// Bind a global, replacing any existing binding of the same name
    pub fn define_global(&mut self, name: &str, value: Value, mutable: bool) {
        self.globals.insert(name.to_string(), Binding { value, mutable });
    }

    pub fn get_global(&self, name: &str) -> Option<&Value> {
        self.globals.get(name).map(|binding| &binding.value)
    }

    /// All globals, sorted by name
    pub fn globals(&self) -> Vec<(&str, &Value)> {
        let mut globals: Vec<(&str, &Value)> = self
            .globals
            .iter()
            .map(|(name, binding)| (name.as_str(), &binding.value))
            .collect();
        globals.sort_by(|a, b| a.0.cmp(b.0));
        globals
    }

    /// Run the top-level chunk of a script
    pub fn run(&mut self, chunk: Chunk) -> Result<Value> {
        let chunk = Rc::new(chunk);
        let function = Function::new(SCRIPT_FUNCTION.to_string(), Vec::new(), Rc::clone(&chunk), 0);
        let func_handle = self.heap.alloc_function(function);
        let closure_handle = self.heap.alloc_closure(func_handle, Vec::new());

        // Script closure occupies the frame's slot 0
        self.stack.push(Value::Closure(closure_handle));
        self.frames.push(CallFrame::new(closure_handle, chunk, self.stack.len() - 1));

        self.execute()
    }

    /// Call the global `name` from the host with already-imported arguments
    pub fn call_global(&mut self, name: &str, args: Vec<Value>) -> Result<Value> {
        let callee = self
            .get_global(name)
            .cloned()
            .ok_or_else(|| ScriptError::from(ErrorKind::UndefinedVariable(name.to_string())))?;

        let depth = self.frames.len();
        let arg_count = args.len();
        self.stack.push(callee.clone());
        self.stack.extend(args);

        if let Err(err) = self.call_value(callee, arg_count) {
            self.reset();
            return Err(err);
        }

        if self.frames.len() > depth {
            self.execute()
        } else {
            // Natives and builtins complete without a frame
            Ok(self.pop())
        }
    }

    pub fn collect_garbage(&mut self) {
        let before = self.heap.live_objects();

        self.mark_roots();
        self.heap.trace_references();
        self.heap.sweep();

        trace!(before, after = self.heap.live_objects(), "garbage collected");
    }

    fn mark_roots(&mut self) {
        for value in &self.stack {
            for child in value.children() {
                self.heap.mark(child);
            }
        }

        for binding in self.globals.values() {
            for child in binding.value.children() {
                self.heap.mark(child);
            }
        }

        for frame in &self.frames {
            self.heap.mark(frame.closure);
        }

        for &upvalue in &self.open_upvalues {
            self.heap.mark(upvalue);
        }
    }

    fn capture_upvalue(&mut self, location: usize) -> Handle {
        // Reuse an open upvalue for the same slot
        for &handle in &self.open_upvalues {
            if let Some(upvalue) = self.heap.get_upvalue(handle) {
                if let UpvalueState::Open(slot) = *upvalue.location.borrow() {
                    if slot == location {
                        return handle;
                    }
                }
            }
        }

        let handle = self.heap.alloc_upvalue(location);
        self.open_upvalues.push(handle);
        handle
    }

    /// Close every open upvalue pointing at or above stack slot `last`
    fn close_upvalues(&mut self, last: usize) {
        let stack = &self.stack;
        let heap = &self.heap;

        self.open_upvalues.retain(|&handle| {
            let Some(upvalue) = heap.get_upvalue(handle) else {
                return false;
            };
            let slot = match *upvalue.location.borrow() {
                UpvalueState::Open(slot) => slot,
                UpvalueState::Closed(_) => return false,
            };
            if slot < last {
                return true;
            }
            let value = stack.get(slot).cloned().unwrap_or(Value::Nil);
            *upvalue.location.borrow_mut() = UpvalueState::Closed(value);
            false
        });
    }

    /// Drop all execution state after an error
    fn reset(&mut self) {
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues.clear();
    }

    fn execute(&mut self) -> Result<Value> {
        match self.dispatch() {
            Ok(value) => Ok(value),
            Err(mut err) => {
                if err.span.is_none() {
                    err.span = self.current_line().map(|line| Span::new(0, 0, line, 0));
                }
                self.reset();
                Err(err)
            }
        }
    }

    /// Line of the instruction that is executing
    fn current_line(&self) -> Option<usize> {
        let frame = self.frames.last()?;
        frame.chunk.line_at(frame.ip.saturating_sub(1)).filter(|&line| line > 0)
    }

    fn dispatch(&mut self) -> Result<Value> {
        loop {
            let byte = self.read_byte();
            let opcode = OpCode::try_from(byte)
                .map_err(|b| ErrorKind::RuntimeError(format!("invalid opcode {}", b)))?;

            if self.heap.should_collect() {
                self.collect_garbage();
            }

            match opcode {
                OpCode::Constant => {
                    let idx = self.read_u16();
                    let value = self.frame().chunk.constants[idx as usize].clone();
                    self.push(value);
                }

                OpCode::Nil => self.push(Value::Nil),
                OpCode::True => self.push(Value::Bool(true)),
                OpCode::False => self.push(Value::Bool(false)),

                OpCode::Pop => {
                    self.pop();
                }

                OpCode::DefineGlobal | OpCode::DefineVar => {
                    let idx = self.read_u16();
                    let name = self.get_name(idx);
                    let value = self.pop();
                    // Host-provided functions stay bound for the life of the VM
                    if let Some(Binding { value: Value::Builtin(_) | Value::NativeFunction(_), mutable: false }) =
                        self.globals.get(&name)
                    {
                        return Err(ErrorKind::ImmutableVariable(name).into());
                    }
                    self.globals.insert(name, Binding { value, mutable: opcode == OpCode::DefineVar });
                }

                OpCode::GetGlobal => {
                    let idx = self.read_u16();
                    let name = self.get_name(idx);
                    let value = self
                        .get_global(&name)
                        .cloned()
                        .ok_or(ErrorKind::UndefinedVariable(name))?;
                    self.push(value);
                }

                OpCode::SetGlobal => {
                    let idx = self.read_u16();
                    let name = self.get_name(idx);
                    let value = self.peek(0);

                    match self.globals.get_mut(&name) {
                        Some(binding) if binding.mutable => binding.value = value,
                        Some(_) => return Err(ErrorKind::ImmutableVariable(name).into()),
                        None => return Err(ErrorKind::UndefinedVariable(name).into()),
                    }
                }

                OpCode::GetLocal => {
                    let slot = self.read_u16() as usize;
                    let value = self.stack[self.frame().slot + slot].clone();
                    self.push(value);
                }

                OpCode::SetLocal => {
                    let slot = self.read_u16() as usize;
                    let index = self.frame().slot + slot;
                    let value = self.peek(0);
                    self.stack[index] = value;
                }

                // Arithmetic
                OpCode::Add => {
                    let b = self.pop();
                    let a = self.pop();

                    let result = match (&a, &b) {
                        (Value::Number(x), Value::Number(y)) => Value::Number(x + y),
                        (Value::String(_), _) | (_, Value::String(_)) => {
                            Value::String(format!("{}{}", a.display(&self.heap), b.display(&self.heap)))
                        }
                        _ => return Err(mismatch("numbers or strings", &a, &b)),
                    };
                    self.push(result);
                }

                OpCode::Subtract => self.binary_op(|a, b| a - b, "-")?,
                OpCode::Multiply => self.binary_op(|a, b| a * b, "*")?,
                OpCode::Divide => {
                    let b = self.pop();
                    let a = self.pop();
                    match (&a, &b) {
                        (Value::Number(_), Value::Number(y)) if *y == 0.0 => {
                            return Err(ErrorKind::DivisionByZero.into());
                        }
                        (Value::Number(x), Value::Number(y)) => self.push(Value::Number(x / y)),
                        _ => return Err(mismatch("numbers", &a, &b)),
                    }
                }
                OpCode::Modulo => self.binary_op(|a, b| a % b, "%")?,

                OpCode::Negate => match self.pop() {
                    Value::Number(n) => self.push(Value::Number(-n)),
                    other => {
                        return Err(ErrorKind::TypeMismatch("number".to_string(), other.type_name().to_string()).into());
                    }
                },

                // Comparison
                OpCode::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(a == b));
                }

                OpCode::NotEqual => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(a != b));
                }

                OpCode::Less => self.comparison_op(Ordering::is_lt)?,
                OpCode::LessEqual => self.comparison_op(Ordering::is_le)?,
                OpCode::Greater => self.comparison_op(Ordering::is_gt)?,
                OpCode::GreaterEqual => self.comparison_op(Ordering::is_ge)?,

                OpCode::Not => {
                    let val = self.pop();
                    self.push(Value::Bool(!val.is_truthy()));
                }

                // Control flow
                OpCode::Jump => {
                    let offset = self.read_u16() as usize;
                    self.frame_mut().ip += offset;
                }

                OpCode::JumpIfFalse => {
                    let offset = self.read_u16() as usize;
                    if !self.peek(0).is_truthy() {
                        self.frame_mut().ip += offset;
                    }
                }

                OpCode::JumpIfTrue => {
                    let offset = self.read_u16() as usize;
                    if self.peek(0).is_truthy() {
                        self.frame_mut().ip += offset;
                    }
                }

                OpCode::Loop => {
                    let offset = self.read_u16() as usize;
                    self.frame_mut().ip -= offset;
                }

                // Functions
                OpCode::Call => {
                    let arg_count = self.read_byte() as usize;
                    let callee = self.peek(arg_count);
                    self.call_value(callee, arg_count)?;
                }

                OpCode::Return => {
                    let result = self.pop();
                    let Some(frame) = self.frames.pop() else {
                        return Ok(result);
                    };

                    self.close_upvalues(frame.slot);
                    // Drop the callee and its arguments
                    self.stack.truncate(frame.slot);

                    if self.frames.is_empty() {
                        return Ok(result);
                    }
                    self.push(result);
                }

                OpCode::Closure => {
                    let idx = self.read_u16();
                    let count = self.read_byte() as usize;
                    let func_handle = match &self.frame().chunk.constants[idx as usize] {
                        Value::Function(handle) => *handle,
                        _ => return Err(ErrorKind::RuntimeError("closure operand must be a function".to_string()).into()),
                    };

                    let mut upvalues = Vec::with_capacity(count);
                    for _ in 0..count {
                        let is_local = self.read_byte() != 0;
                        let index = self.read_byte() as usize;

                        if is_local {
                            let location = self.frame().slot + index;
                            upvalues.push(self.capture_upvalue(location));
                        } else {
                            upvalues.push(self.upvalue_handle(index)?);
                        }
                    }

                    let closure_handle = self.heap.alloc_closure(func_handle, upvalues);
                    self.push(Value::Closure(closure_handle));
                }

                OpCode::GetUpvalue => {
                    let idx = self.read_u16() as usize;
                    let handle = self.upvalue_handle(idx)?;

                    let value = match self.heap.get_upvalue(handle) {
                        Some(upvalue) => match &*upvalue.location.borrow() {
                            UpvalueState::Open(slot) => self.stack[*slot].clone(),
                            UpvalueState::Closed(val) => val.clone(),
                        },
                        None => Value::Nil,
                    };
                    self.push(value);
                }

                OpCode::SetUpvalue => {
                    let idx = self.read_u16() as usize;
                    let handle = self.upvalue_handle(idx)?;
                    let value = self.peek(0);

                    if let Some(upvalue) = self.heap.get_upvalue(handle) {
                        match &mut *upvalue.location.borrow_mut() {
                            UpvalueState::Open(slot) => self.stack[*slot] = value,
                            UpvalueState::Closed(val) => *val = value,
                        }
                    }
                }

                OpCode::CloseUpvalue => {
                    self.close_upvalues(self.stack.len().saturating_sub(1));
                    self.pop();
                }

                // Built-ins
                OpCode::Print => {
                    let count = self.read_byte() as usize;
                    let start = self.stack.len() - count;
                    let output: Vec<String> = self.stack[start..].iter().map(|v| v.display(&self.heap)).collect();
                    self.stack.truncate(start);
                    println!("{}", output.join(" "));
                    self.push(Value::Nil);
                }

                OpCode::Len => {
                    let value = self.pop();
                    let len = length_of(&self.heap, &value).ok_or_else(|| {
                        ErrorKind::TypeMismatch("array, string or record".to_string(), value.type_name().to_string())
                    })?;
                    self.push(Value::Number(len as f64));
                }

                // Collections
                OpCode::Array => {
                    let count = self.read_u16() as usize;
                    let start = self.stack.len() - count;
                    let elements: Vec<Value> = self.stack.drain(start..).collect();
                    let handle = self.heap.alloc_array(elements);
                    self.push(Value::Array(handle));
                }

                OpCode::Record => {
                    let count = self.read_u16() as usize;
                    let start = self.stack.len() - count * 2;
                    let items: Vec<Value> = self.stack.drain(start..).collect();

                    let mut fields = std::collections::BTreeMap::new();
                    for pair in items.chunks(2) {
                        if let [Value::String(key), value] = pair {
                            fields.insert(key.clone(), value.clone());
                        }
                    }
                    let handle = self.heap.alloc_record(fields);
                    self.push(Value::Record(handle));
                }

                OpCode::Index => {
                    let index = self.pop();
                    let container = self.pop();
                    let value = self.index(&container, &index)?;
                    self.push(value);
                }

                OpCode::SetIndex => {
                    let value = self.pop();
                    let index = self.pop();
                    let container = self.pop();
                    self.set_index(&container, &index, value.clone())?;
                    self.push(value);
                }

                OpCode::GetProperty => {
                    let idx = self.read_u16();
                    let name = self.get_name(idx);
                    let receiver = self.pop();

                    let value = match &receiver {
                        Value::Record(handle) => self
                            .heap
                            .get_record(*handle)
                            .and_then(|fields| fields.get(&name).cloned())
                            .unwrap_or(Value::Nil),
                        Value::Array(_) | Value::String(_) if name == "length" => {
                            let len = length_of(&self.heap, &receiver).unwrap_or(0);
                            Value::Number(len as f64)
                        }
                        Value::Array(_) | Value::String(_) => return Err(ErrorKind::UndefinedProperty(name).into()),
                        other => {
                            return Err(ErrorKind::TypeMismatch("record".to_string(), other.type_name().to_string()).into());
                        }
                    };
                    self.push(value);
                }

                OpCode::SetProperty => {
                    let idx = self.read_u16();
                    let name = self.get_name(idx);
                    let value = self.pop();
                    let receiver = self.pop();

                    match receiver {
                        Value::Record(handle) => {
                            if let Some(fields) = self.heap.get_record_mut(handle) {
                                fields.insert(name, value.clone());
                            }
                        }
                        other => {
                            return Err(ErrorKind::TypeMismatch("record".to_string(), other.type_name().to_string()).into());
                        }
                    }
                    self.push(value);
                }
            }
        }
    }

    /// Call a value
    fn call_value(&mut self, callee: Value, arg_count: usize) -> Result<()> {
        match callee {
            Value::Function(func_handle) => {
                // Wrap raw function in closure
                let closure_handle = self.heap.alloc_closure(func_handle, Vec::new());
                self.call_function(closure_handle, arg_count)
            }
            Value::Closure(handle) => self.call_function(handle, arg_count),
            Value::NativeFunction(native) => {
                if let Some(arity) = native.arity {
                    if arg_count != arity {
                        return Err(ErrorKind::WrongArity(arity, arg_count).into());
                    }
                }

                let args_start = self.stack.len() - arg_count;
                // Natives take &mut VM, so the arguments are copied out
                let args = self.stack[args_start..].to_vec();
                let result = (native.func)(self, &args).map_err(ErrorKind::RuntimeError)?;

                self.stack.truncate(args_start - 1);
                self.push(result);
                Ok(())
            }
            Value::Builtin(builtin) => {
                let args_start = self.stack.len() - arg_count;
                let args = marshal::unpack(&self.heap, &builtin.name, &builtin.params, &self.stack[args_start..])?;

                let caller = self
                    .frames
                    .last()
                    .and_then(|frame| self.heap.function_name(frame.closure))
                    .unwrap_or(SCRIPT_FUNCTION)
                    .to_string();
                debug!(builtin = %builtin.name, caller = %caller, "calling builtin");

                let ctx = CallContext { caller: &caller, assets: &self.assets };
                let result = (builtin.func)(&ctx, &args)?;
                let value = marshal::import(&mut self.heap, result);

                self.stack.truncate(args_start - 1);
                self.push(value);
                Ok(())
            }
            other => Err(ErrorKind::TypeMismatch("function".to_string(), other.type_name().to_string()).into()),
        }
    }

    /// Call a closure
    fn call_function(&mut self, closure_handle: Handle, arg_count: usize) -> Result<()> {
        let func = self
            .heap
            .get_closure(closure_handle)
            .and_then(|closure| self.heap.get_function(closure.function))
            .ok_or_else(|| ErrorKind::RuntimeError("called value is not a live function".to_string()))?;

        if arg_count != func.params.len() {
            return Err(ErrorKind::WrongArity(func.params.len(), arg_count).into());
        }

        if self.frames.len() >= FRAMES_MAX {
            return Err(ErrorKind::StackOverflow.into());
        }

        let chunk = Rc::clone(&func.chunk);
        let slot = self.stack.len() - arg_count - 1;
        self.frames.push(CallFrame::new(closure_handle, chunk, slot));
        Ok(())
    }

    fn index(&self, container: &Value, index: &Value) -> Result<Value> {
        let value = match (container, index) {
            (Value::Array(handle), Value::Number(i)) => match position(*i) {
                Some(i) => self.heap.get_array(*handle).and_then(|items| items.get(i).cloned()),
                None => None,
            },
            (Value::String(s), Value::Number(i)) => {
                position(*i).and_then(|i| s.chars().nth(i)).map(|c| Value::String(c.to_string()))
            }
            (Value::Record(handle), Value::String(key)) => {
                self.heap.get_record(*handle).and_then(|fields| fields.get(key).cloned())
            }
            (Value::Array(_) | Value::String(_), other) => {
                return Err(ErrorKind::TypeMismatch("number index".to_string(), other.type_name().to_string()).into());
            }
            (Value::Record(_), other) => {
                return Err(ErrorKind::TypeMismatch("string key".to_string(), other.type_name().to_string()).into());
            }
            (other, _) => {
                return Err(ErrorKind::TypeMismatch(
                    "array, string or record".to_string(),
                    other.type_name().to_string(),
                )
                .into());
            }
        };
        Ok(value.unwrap_or(Value::Nil))
    }

    fn set_index(&mut self, container: &Value, index: &Value, value: Value) -> Result<()> {
        match (container, index) {
            (Value::Array(handle), Value::Number(i)) => {
                let items = self
                    .heap
                    .get_array_mut(*handle)
                    .ok_or_else(|| ErrorKind::RuntimeError("array was collected".to_string()))?;
                match position(*i) {
                    Some(i) if i < items.len() => items[i] = value,
                    // Writing one past the end appends
                    Some(i) if i == items.len() => items.push(value),
                    _ => return Err(ErrorKind::IndexOutOfBounds(*i as i64).into()),
                }
            }
            (Value::Record(handle), Value::String(key)) => {
                if let Some(fields) = self.heap.get_record_mut(*handle) {
                    fields.insert(key.clone(), value);
                }
            }
            (Value::Array(_), other) => {
                return Err(ErrorKind::TypeMismatch("number index".to_string(), other.type_name().to_string()).into());
            }
            (Value::Record(_), other) => {
                return Err(ErrorKind::TypeMismatch("string key".to_string(), other.type_name().to_string()).into());
            }
            (other, _) => {
                return Err(ErrorKind::TypeMismatch("array or record".to_string(), other.type_name().to_string()).into());
            }
        }
        Ok(())
    }

    fn binary_op<F>(&mut self, op: F, op_name: &str) -> Result<()>
    where
        F: Fn(f64, f64) -> f64,
    {
        let b = self.pop();
        let a = self.pop();

        match (&a, &b) {
            (Value::Number(x), Value::Number(y)) => {
                self.push(Value::Number(op(*x, *y)));
                Ok(())
            }
            (Value::String(s), Value::Number(n)) if op_name == "*" && *n >= 0.0 => {
                if n.fract() != 0.0 {
                    return Err(ErrorKind::RuntimeError(format!("cannot repeat a string {} times", n)).into());
                }
                let fits = *n <= MAX_SEQUENCE_LEN as f64
                    && s.len().checked_mul(*n as usize).map_or(false, |len| len <= MAX_SEQUENCE_LEN);
                if !fits {
                    return Err(ErrorKind::RuntimeError("string repetition too large".to_string()).into());
                }
                self.push(Value::String(s.repeat(*n as usize)));
                Ok(())
            }
            _ => Err(mismatch("numbers", &a, &b)),
        }
    }

    fn comparison_op(&mut self, op: fn(Ordering) -> bool) -> Result<()> {
        let b = self.pop();
        let a = self.pop();

        let ordering = match (&a, &b) {
            (Value::Number(x), Value::Number(y)) => x.partial_cmp(y),
            (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
            _ => return Err(mismatch("numbers or strings", &a, &b)),
        };
        // NaN compares false both ways
        self.push(Value::Bool(ordering.map_or(false, op)));
        Ok(())
    }

    // ==================== Helpers ====================

    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().unwrap_or(Value::Nil)
    }

    fn peek(&self, distance: usize) -> Value {
        self.stack
            .len()
            .checked_sub(distance + 1)
            .and_then(|i| self.stack.get(i))
            .cloned()
            .unwrap_or(Value::Nil)
    }

    fn read_byte(&mut self) -> u8 {
        let frame = self.frame_mut();
        let byte = frame.chunk.code[frame.ip];
        frame.ip += 1;
        byte
    }

    fn read_u16(&mut self) -> u16 {
        let frame = self.frame_mut();
        let value = frame.chunk.read_u16(frame.ip);
        frame.ip += 2;
        value
    }

    fn frame(&self) -> &CallFrame {
        self.frames.last().expect("dispatch runs with an active frame")
    }

    fn frame_mut(&mut self) -> &mut CallFrame {
        self.frames.last_mut().expect("dispatch runs with an active frame")
    }

    fn get_name(&self, idx: u16) -> String {
        self.frame().chunk.names[idx as usize].clone()
    }

    fn upvalue_handle(&self, idx: usize) -> Result<Handle> {
        self.heap
            .get_closure(self.frame().closure)
            .and_then(|closure| closure.upvalues.get(idx).copied())
            .ok_or_else(|| ErrorKind::RuntimeError(format!("missing upvalue {}", idx)).into())
    }
}

impl Default for VM {
    fn default() -> Self {
        Self::new()
    }
}

/// Element count of an array, record or string (in characters)
fn length_of(heap: &Heap, value: &Value) -> Option<usize> {
    match value {
        Value::String(s) => Some(s.chars().count()),
        Value::Array(handle) => heap.get_array(*handle).map(Vec::len),
        Value::Record(handle) => heap.get_record(*handle).map(|fields| fields.len()),
        _ => None,
    }
}

/// A script number used as a position, if it is a non-negative integer
fn position(n: f64) -> Option<usize> {
    if n >= 0.0 && n.fract() == 0.0 {
        Some(n as usize)
    } else {
        None
    }
}

fn mismatch(expected: &str, a: &Value, b: &Value) -> ScriptError {
    ErrorKind::TypeMismatch(expected.to_string(), format!("{} and {}", a.type_name(), b.type_name())).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::Compiler;
    use crate::lexer::Lexer;
    use crate::parser::Parser;

    fn try_run(vm: &mut VM, source: &str) -> Result<Value> {
        let tokens = Lexer::new(source).tokenize()?;
        let program = Parser::new(tokens).parse()?;
        let chunk = Compiler::new().compile(&program, &mut vm.heap)?;
        vm.run(chunk)
    }

    fn run_vm(source: &str) -> Value {
        try_run(&mut VM::new(), source).unwrap()
    }

    fn run_display(source: &str) -> String {
        let mut vm = VM::new();
        let value = try_run(&mut vm, source).unwrap();
        value.display(&vm.heap)
    }

    #[test]
    fn test_vm_arithmetic() {
        assert_eq!(run_vm("1 + 2"), Value::Number(3.0));
        assert_eq!(run_vm("10 - 3"), Value::Number(7.0));
        assert_eq!(run_vm("4 * 5"), Value::Number(20.0));
        assert_eq!(run_vm("20 / 4"), Value::Number(5.0));
        assert_eq!(run_vm("7 % 4"), Value::Number(3.0));
    }

    #[test]
    fn test_vm_comparison() {
        assert_eq!(run_vm("1 < 2"), Value::Bool(true));
        assert_eq!(run_vm("5 > 3"), Value::Bool(true));
        assert_eq!(run_vm("2 == 2"), Value::Bool(true));
        assert_eq!(run_vm("1 != 2"), Value::Bool(true));
        assert_eq!(run_vm("\"a\" < \"b\""), Value::Bool(true));
    }

    #[test]
    fn test_vm_string_concatenation_displays_operands() {
        assert_eq!(run_vm("\"n=\" + 3"), Value::String("n=3".to_string()));
        assert_eq!(run_display("\"bytes: \" + [1, 2]"), "bytes: 1,2");
    }

    #[test]
    fn test_vm_variables() {
        assert_eq!(run_vm("let x = 42\nx"), Value::Number(42.0));
        assert_eq!(run_vm("var x = 1\nx = x + 1\nx"), Value::Number(2.0));
    }

    #[test]
    fn test_vm_assign_to_global_let_fails() {
        let err = try_run(&mut VM::new(), "let x = 1\nx = 2").unwrap_err();
        assert!(matches!(err.kind, ErrorKind::ImmutableVariable(ref n) if n == "x"));
        assert_eq!(err.span.map(|s| s.line), Some(2));
    }

    #[test]
    fn test_vm_if() {
        let result = run_vm(
            r#"
            let x = 10
            var result = 0
            if x > 5 {
                result = 1
            } else {
                result = 2
            }
            result
        "#,
        );
        assert_eq!(result, Value::Number(1.0));
    }

    #[test]
    fn test_vm_while_with_break_and_continue() {
        let result = run_vm(
            r#"
            var sum = 0
            var i = 0
            while true {
                i = i + 1
                if i > 10 { break }
                if i % 2 == 0 { continue }
                sum = sum + i
            }
            sum
        "#,
        );
        assert_eq!(result, Value::Number(25.0));
    }

    #[test]
    fn test_vm_for_in_array() {
        let result = run_vm(
            r#"
            var total = 0
            for n in [1, 2, 3, 4] {
                total = total + n
            }
            total
        "#,
        );
        assert_eq!(result, Value::Number(10.0));
    }

    #[test]
    fn test_vm_records() {
        let result = run_vm(
            r#"
            let config = { name: "app", "port": 8080 }
            config.port = config.port + 1
            config["name"] + ":" + config.port
        "#,
        );
        assert_eq!(result, Value::String("app:8081".to_string()));
        assert_eq!(run_vm("let r = {}\nr.missing"), Value::Nil);
    }

    #[test]
    fn test_vm_array_index_assignment_appends_at_end() {
        assert_eq!(run_display("let a = [1]\na[1] = 2\na"), "1,2");

        let err = try_run(&mut VM::new(), "let a = [1]\na[5] = 2").unwrap_err();
        assert!(matches!(err.kind, ErrorKind::IndexOutOfBounds(5)));
    }

    #[test]
    fn test_vm_intrinsics() {
        assert_eq!(run_vm("len(\"héllo\")"), Value::Number(5.0));
        assert_eq!(run_vm("let a = []\npush(a, 1)\npush(a, 2)"), Value::Number(2.0));
        assert_eq!(run_vm("type({})"), Value::String("record".to_string()));
        assert_eq!(run_vm("num(\" 12 \")"), Value::Number(12.0));
        assert_eq!(run_display("range(3)"), "0,1,2");
        assert_eq!(run_display("keys({ b: 1, a: 2 })"), "a,b");
        assert_eq!(run_vm("str(1.5)"), Value::String("1.5".to_string()));
    }

    #[test]
    fn test_vm_assert_failure_message() {
        let err = try_run(&mut VM::new(), "assert(1 == 2, \"math is broken\")").unwrap_err();
        assert_eq!(err.kind.to_string(), "math is broken");
    }

    #[test]
    fn test_vm_runtime_error_carries_line() {
        let err = try_run(&mut VM::new(), "let a = 1\nlet b = a / 0").unwrap_err();
        assert!(matches!(err.kind, ErrorKind::DivisionByZero));
        assert_eq!(err.span.map(|s| s.line), Some(2));
    }

    #[test]
    fn test_vm_recursion_limit() {
        let err = try_run(&mut VM::new(), "fn f() { return f() }\nf()").unwrap_err();
        assert!(matches!(err.kind, ErrorKind::StackOverflow));
    }

    #[test]
    fn test_vm_state_is_reset_after_error() {
        let mut vm = VM::new();
        assert!(try_run(&mut vm, "fn f() { return 1 / 0 }\nf()").is_err());
        assert_eq!(try_run(&mut vm, "1 + 1").unwrap(), Value::Number(2.0));
    }

    #[test]
    fn test_call_global_from_host() {
        let mut vm = VM::new();
        try_run(&mut vm, "fn add(a, b) { return a + b }").unwrap();

        let result = vm.call_global("add", vec![Value::Number(2.0), Value::Number(3.0)]).unwrap();
        assert_eq!(result, Value::Number(5.0));

        let native = vm.call_global("type", vec![Value::Nil]).unwrap();
        assert_eq!(native, Value::String("nil".to_string()));

        let missing = vm.call_global("nope", vec![]).unwrap_err();
        assert!(matches!(missing.kind, ErrorKind::UndefinedVariable(_)));
    }

    #[test]
    fn test_gc_keeps_globals_alive() {
        let mut vm = VM::new();
        try_run(&mut vm, "let items = [1, 2, 3]\nlet cfg = { k: [4] }").unwrap();
        vm.collect_garbage();

        let items = vm.get_global("items").cloned().unwrap();
        assert_eq!(items.display(&vm.heap), "1,2,3");
        assert_eq!(try_run(&mut vm, "cfg.k[0]").unwrap(), Value::Number(4.0));
    }

    #[test]
    fn test_string_repetition_bounds() {
        assert_eq!(run_vm(r#""ab" * 3"#), Value::String("ababab".to_string()));
        assert_eq!(run_vm(r#""ab" * 0"#), Value::String(String::new()));

        let err = try_run(&mut VM::new(), r#""ab" * 99999999999999999999"#).unwrap_err();
        assert!(matches!(err.kind, ErrorKind::RuntimeError(ref m) if m == "string repetition too large"));

        let err = try_run(&mut VM::new(), r#""ab" * 1.5"#).unwrap_err();
        assert!(matches!(err.kind, ErrorKind::RuntimeError(_)));
    }

    #[test]
    fn test_range_is_bounded() {
        let err = try_run(&mut VM::new(), "range(1000000000000)").unwrap_err();
        assert!(err.to_string().contains("range() would produce more than"), "{}", err);

        assert!(try_run(&mut VM::new(), "range(-1000000000000, 1000000000000)").is_err());
        assert_eq!(run_display("range(5, 2)"), "");
    }

    #[test]
    fn test_natives_cannot_be_redeclared() {
        let mut vm = VM::new();
        let err = try_run(&mut vm, "let type = 1").unwrap_err();
        assert!(matches!(err.kind, ErrorKind::ImmutableVariable(ref n) if n == "type"));

        let err = try_run(&mut vm, "var len = nil").unwrap_err();
        assert!(matches!(err.kind, ErrorKind::ImmutableVariable(_)));
        assert!(matches!(vm.get_global("len"), Some(Value::NativeFunction(_))));
    }

    #[test]
    fn test_script_globals_can_be_redeclared() {
        let mut vm = VM::new();
        try_run(&mut vm, "let x = 1").unwrap();
        try_run(&mut vm, "let x = 2").unwrap();
        assert_eq!(try_run(&mut vm, "x").unwrap(), Value::Number(2.0));
    }
}
