use std::cell::RefCell;
use std::collections::{BTreeMap, HashSet};
use crate::value::Value;

/// A safe handle to a heap-allocated object.
/// This acts as an index into the Heap's object storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(pub usize);

/// State of an upvalue
#[derive(Debug, Clone)]
pub enum UpvalueState {
    /// Points to a stack slot (index)
    Open(usize),
    /// Contains a closed-over value
    Closed(Value),
}

/// Upvalue object
#[derive(Debug, Clone)]
pub struct Upvalue {
    pub location: RefCell<UpvalueState>,
}

/// Closure object
#[derive(Debug, Clone)]
pub struct Closure {
    pub function: Handle, // Handle to Object::Function (the prototype)
    pub upvalues: Vec<Handle>, // Handles to Object::Upvalue
}

pub struct Heap {
    objects: Vec<Option<Object>>,
    free_list: Vec<usize>,
    marked: HashSet<usize>,
    grey_stack: Vec<Handle>,

    pub bytes_allocated: usize,
    pub next_gc: usize,
}

pub enum Object {
    Function(crate::value::Function),
    Array(Vec<Value>),
    Record(BTreeMap<String, Value>),
    Closure(Closure),
    Upvalue(Upvalue),
}

impl Object {
    pub fn children(&self) -> Vec<Handle> {
        match self {
            Object::Function(f) => f.children(),
            Object::Array(arr) => arr.iter().flat_map(Value::children).collect(),
            Object::Record(fields) => fields.values().flat_map(Value::children).collect(),
            Object::Closure(c) => {
                let mut children = vec![c.function];
                children.extend(c.upvalues.iter().cloned());
                children
            }
            Object::Upvalue(u) => {
                match &*u.location.borrow() {
                    UpvalueState::Closed(v) => v.children(),
                    UpvalueState::Open(_) => vec![], // Open upvalues point to stack (traced by VM)
                }
            }
        }
    }

    pub fn size_bytes(&self) -> usize {
        let base = std::mem::size_of::<Object>();
        match self {
            Object::Function(_) => base + std::mem::size_of::<crate::value::Function>(),
            Object::Array(arr) => base + arr.len() * std::mem::size_of::<Value>(),
            Object::Record(fields) => {
                base + fields
                    .keys()
                    .map(|k| k.len() + std::mem::size_of::<Value>())
                    .sum::<usize>()
            }
            Object::Closure(c) => base + std::mem::size_of::<Closure>() + c.upvalues.len() * std::mem::size_of::<Handle>(),
            Object::Upvalue(_) => base + std::mem::size_of::<Upvalue>(),
        }
    }
}

impl Heap {
    pub fn new() -> Self {
        Self {
            objects: Vec::new(),
            free_list: Vec::new(),
            marked: HashSet::new(),
            grey_stack: Vec::new(),
            bytes_allocated: 0,
            next_gc: 1024 * 1024, // Start at 1MB
        }
    }

    pub fn alloc_function(&mut self, f: crate::value::Function) -> Handle {
        self.alloc(Object::Function(f))
    }

    pub fn alloc_array(&mut self, arr: Vec<Value>) -> Handle {
        self.alloc(Object::Array(arr))
    }

    pub fn alloc_record(&mut self, fields: BTreeMap<String, Value>) -> Handle {
        self.alloc(Object::Record(fields))
    }

    pub fn alloc_closure(&mut self, function: Handle, upvalues: Vec<Handle>) -> Handle {
        self.alloc(Object::Closure(Closure { function, upvalues }))
    }

    pub fn alloc_upvalue(&mut self, slot: usize) -> Handle {
        self.alloc(Object::Upvalue(Upvalue { location: RefCell::new(UpvalueState::Open(slot)) }))
    }

    fn alloc(&mut self, obj: Object) -> Handle {
        self.bytes_allocated += obj.size_bytes();

        // Collection is triggered by the VM between instructions
        if let Some(idx) = self.free_list.pop() {
            self.objects[idx] = Some(obj);
            Handle(idx)
        } else {
            let idx = self.objects.len();
            self.objects.push(Some(obj));
            Handle(idx)
        }
    }

    pub fn get_function(&self, handle: Handle) -> Option<&crate::value::Function> {
        match self.objects.get(handle.0)? {
            Some(Object::Function(f)) => Some(f),
            _ => None,
        }
    }

    pub fn get_array(&self, handle: Handle) -> Option<&Vec<Value>> {
        match self.objects.get(handle.0)? {
            Some(Object::Array(arr)) => Some(arr),
            _ => None,
        }
    }

    pub fn get_array_mut(&mut self, handle: Handle) -> Option<&mut Vec<Value>> {
        match self.objects.get_mut(handle.0)? {
            Some(Object::Array(arr)) => Some(arr),
            _ => None,
        }
    }

    pub fn get_record(&self, handle: Handle) -> Option<&BTreeMap<String, Value>> {
        match self.objects.get(handle.0)? {
            Some(Object::Record(fields)) => Some(fields),
            _ => None,
        }
    }

    pub fn get_record_mut(&mut self, handle: Handle) -> Option<&mut BTreeMap<String, Value>> {
        match self.objects.get_mut(handle.0)? {
            Some(Object::Record(fields)) => Some(fields),
            _ => None,
        }
    }

    pub fn get_closure(&self, handle: Handle) -> Option<&Closure> {
        match self.objects.get(handle.0)? {
            Some(Object::Closure(c)) => Some(c),
            _ => None,
        }
    }

    pub fn get_upvalue(&self, handle: Handle) -> Option<&Upvalue> {
        match self.objects.get(handle.0)? {
            Some(Object::Upvalue(u)) => Some(u),
            _ => None,
        }
    }

    /// Name of the function behind a closure or bare function handle
    pub fn function_name(&self, handle: Handle) -> Option<&str> {
        let function = match self.get_closure(handle) {
            Some(closure) => self.get_function(closure.function)?,
            None => self.get_function(handle)?,
        };
        Some(&function.name)
    }

    pub fn live_objects(&self) -> usize {
        self.objects.iter().filter(|o| o.is_some()).count()
    }

    pub fn is_marked(&self, handle: Handle) -> bool {
        self.marked.contains(&handle.0)
    }

    pub fn should_collect(&self) -> bool {
        self.bytes_allocated > self.next_gc
    }

    pub fn mark(&mut self, handle: Handle) {
        if self.marked.contains(&handle.0) {
            return;
        }

        if self.objects.get(handle.0).and_then(|o| o.as_ref()).is_some() {
            self.marked.insert(handle.0);
            self.grey_stack.push(handle);
        }
    }

    pub fn trace_references(&mut self) {
        while let Some(handle) = self.grey_stack.pop() {
            // Children are collected first so `self.mark` can borrow mutably
            let children = if let Some(Some(obj)) = self.objects.get(handle.0) {
                obj.children()
            } else {
                Vec::new()
            };

            for child in children {
                self.mark(child);
            }
        }
    }

    pub fn sweep(&mut self) {
        let mut freed_bytes = 0;

        for i in 0..self.objects.len() {
            if !self.marked.contains(&i) {
                if let Some(obj) = self.objects[i].take() {
                    freed_bytes += obj.size_bytes();
                    self.free_list.push(i);
                }
            }
        }

        self.bytes_allocated = self.bytes_allocated.saturating_sub(freed_bytes);
        self.marked.clear();

        // Adjust threshold
        self.next_gc = std::cmp::max(self.bytes_allocated * 2, 1024 * 1024);
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sweep_frees_unmarked() {
        let mut heap = Heap::new();
        let kept = heap.alloc_array(vec![Value::Number(1.0)]);
        let _dropped = heap.alloc_array(vec![Value::Number(2.0)]);

        heap.mark(kept);
        heap.trace_references();
        heap.sweep();

        assert_eq!(heap.live_objects(), 1);
        assert!(heap.get_array(kept).is_some());
    }

    #[test]
    fn test_record_children_are_traced() {
        let mut heap = Heap::new();
        let inner = heap.alloc_array(vec![]);
        let mut fields = BTreeMap::new();
        fields.insert("items".to_string(), Value::Array(inner));
        let record = heap.alloc_record(fields);

        heap.mark(record);
        heap.trace_references();
        heap.sweep();

        assert!(heap.get_array(inner).is_some());
        assert!(heap.get_record(record).is_some());
    }

    #[test]
    fn test_freed_slot_is_reused() {
        let mut heap = Heap::new();
        let first = heap.alloc_array(vec![]);
        heap.sweep();
        let second = heap.alloc_record(BTreeMap::new());
        assert_eq!(first, second);
    }
}
