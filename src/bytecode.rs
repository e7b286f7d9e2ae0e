//! Bytecode instructions for the gscript VM
//!
//! A stack-based instruction set. Operands are big-endian u16 unless noted.

use std::fmt;

/// Opcodes for the VM
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    // Constants and literals
    Constant,       // Push constant from pool
    Nil,            // Push nil
    True,           // Push true
    False,          // Push false

    // Stack manipulation
    Pop,            // Pop top of stack

    // Variables
    DefineGlobal,   // Define immutable global (name index)
    DefineVar,      // Define mutable global (name index)
    GetGlobal,      // Get global variable
    SetGlobal,      // Set global variable
    GetLocal,       // Get local variable (stack offset)
    SetLocal,       // Set local variable

    // Arithmetic
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
    Negate,         // Unary -

    // Comparison
    Equal,
    NotEqual,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,

    // Logical
    Not,            // Unary !

    // Control flow
    Jump,           // Unconditional jump
    JumpIfFalse,    // Jump if top of stack is falsy
    JumpIfTrue,     // Jump if top of stack is truthy
    Loop,           // Jump backwards

    // Functions
    Call,           // Call function (u8 arg count)
    Return,         // Return from function
    Closure,        // Create closure (function index, u8 capture count, capture pairs)

    GetUpvalue,     // Get upvalue (index)
    SetUpvalue,     // Set upvalue (index)
    CloseUpvalue,   // Close upvalue (hoist)

    // Built-ins
    Print,          // Print (u8 arg count)
    Len,            // Length of array, string or record

    // Collections
    Array,          // Create array (element count)
    Record,         // Create record (field count, key/value pairs on stack)
    Index,          // container[index]
    SetIndex,       // container[index] = value
    GetProperty,    // Get property (name index)
    SetProperty,    // Set property (name index)
}

impl OpCode {
    const ALL: [OpCode; 42] = [
        OpCode::Constant, OpCode::Nil, OpCode::True, OpCode::False, OpCode::Pop,
        OpCode::DefineGlobal, OpCode::DefineVar, OpCode::GetGlobal, OpCode::SetGlobal,
        OpCode::GetLocal, OpCode::SetLocal,
        OpCode::Add, OpCode::Subtract, OpCode::Multiply, OpCode::Divide, OpCode::Modulo,
        OpCode::Negate,
        OpCode::Equal, OpCode::NotEqual, OpCode::Less, OpCode::LessEqual, OpCode::Greater,
        OpCode::GreaterEqual, OpCode::Not,
        OpCode::Jump, OpCode::JumpIfFalse, OpCode::JumpIfTrue, OpCode::Loop,
        OpCode::Call, OpCode::Return, OpCode::Closure,
        OpCode::GetUpvalue, OpCode::SetUpvalue, OpCode::CloseUpvalue,
        OpCode::Print, OpCode::Len,
        OpCode::Array, OpCode::Record, OpCode::Index, OpCode::SetIndex,
        OpCode::GetProperty, OpCode::SetProperty,
    ];
}

impl TryFrom<u8> for OpCode {
    type Error = u8;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        OpCode::ALL.get(byte as usize).copied().ok_or(byte)
    }
}

impl From<OpCode> for u8 {
    fn from(op: OpCode) -> Self {
        op as u8
    }
}

/// A chunk of bytecode with associated data
#[derive(Debug, Clone)]
pub struct Chunk {
    /// The bytecode instructions
    pub code: Vec<u8>,

    /// Constant pool
    pub constants: Vec<crate::value::Value>,

    /// Line numbers for each instruction (for error reporting)
    pub lines: Vec<usize>,

    /// Global and property names referenced by the code
    pub names: Vec<String>,
}

impl Chunk {
    pub fn new() -> Self {
        Self {
            code: Vec::new(),
            constants: Vec::new(),
            lines: Vec::new(),
            names: Vec::new(),
        }
    }

    /// Write an opcode to the chunk
    pub fn write(&mut self, op: OpCode, line: usize) {
        self.code.push(op as u8);
        self.lines.push(line);
    }

    /// Write a raw byte (operand)
    pub fn write_byte(&mut self, byte: u8, line: usize) {
        self.code.push(byte);
        self.lines.push(line);
    }

    /// Write a 16-bit operand
    pub fn write_u16(&mut self, value: u16, line: usize) {
        self.write_byte((value >> 8) as u8, line);
        self.write_byte(value as u8, line);
    }

    /// Add a constant and return its index, or `None` when the pool is full
    pub fn add_constant(&mut self, value: crate::value::Value) -> Option<u16> {
        let idx = u16::try_from(self.constants.len()).ok()?;
        self.constants.push(value);
        Some(idx)
    }

    /// Add a name and return its index, or `None` when the table is full
    pub fn add_name(&mut self, name: &str) -> Option<u16> {
        if let Some(idx) = self.names.iter().position(|n| n == name) {
            return u16::try_from(idx).ok();
        }
        let idx = u16::try_from(self.names.len()).ok()?;
        self.names.push(name.to_string());
        Some(idx)
    }

    /// Read a 16-bit value at offset
    pub fn read_u16(&self, offset: usize) -> u16 {
        ((self.code[offset] as u16) << 8) | (self.code[offset + 1] as u16)
    }

    /// Get current code length (for jump patching)
    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    /// Line of the instruction byte at `offset`
    pub fn line_at(&self, offset: usize) -> Option<usize> {
        self.lines.get(offset).copied()
    }

    /// Patch a jump instruction at offset; false if the distance does not fit
    pub fn patch_jump(&mut self, offset: usize) -> bool {
        let jump = self.code.len() - offset - 2;
        let Ok(jump) = u16::try_from(jump) else {
            return false;
        };
        self.code[offset] = (jump >> 8) as u8;
        self.code[offset + 1] = jump as u8;
        true
    }

    /// Disassemble for debugging
    pub fn disassemble(&self, name: &str) -> String {
        let mut result = format!("== {} ==\n", name);
        let mut offset = 0;

        while offset < self.code.len() {
            let (s, new_offset) = self.disassemble_instruction(offset);
            result.push_str(&s);
            result.push('\n');
            offset = new_offset;
        }

        result
    }

    fn disassemble_instruction(&self, offset: usize) -> (String, usize) {
        let line = self.lines.get(offset).copied().unwrap_or(0);
        let Ok(op) = OpCode::try_from(self.code[offset]) else {
            return (format!("{:04} {:4} <bad opcode {}>", offset, line, self.code[offset]), offset + 1);
        };

        let (instr, new_offset) = match op {
            OpCode::Constant => {
                let idx = self.read_u16(offset + 1);
                let val = &self.constants[idx as usize];
                (format!("CONSTANT {:04} '{}'", idx, val), offset + 3)
            }
            OpCode::DefineGlobal | OpCode::DefineVar | OpCode::GetGlobal | OpCode::SetGlobal
            | OpCode::GetProperty | OpCode::SetProperty => {
                let idx = self.read_u16(offset + 1);
                let name = &self.names[idx as usize];
                (format!("{:?} {:04} '{}'", op, idx, name), offset + 3)
            }
            OpCode::GetLocal | OpCode::SetLocal | OpCode::GetUpvalue | OpCode::SetUpvalue => {
                let slot = self.read_u16(offset + 1);
                (format!("{:?} {:04}", op, slot), offset + 3)
            }
            OpCode::Jump | OpCode::JumpIfFalse | OpCode::JumpIfTrue => {
                let jump = self.read_u16(offset + 1);
                (format!("{:?} -> {:04}", op, offset + 3 + jump as usize), offset + 3)
            }
            OpCode::Loop => {
                let jump = self.read_u16(offset + 1);
                (format!("{:?} -> {:04}", op, offset + 3 - jump as usize), offset + 3)
            }
            OpCode::Call | OpCode::Print => {
                let count = self.code[offset + 1];
                (format!("{:?} ({})", op, count), offset + 2)
            }
            OpCode::Array | OpCode::Record => {
                let count = self.read_u16(offset + 1);
                (format!("{:?} ({})", op, count), offset + 3)
            }
            OpCode::Closure => {
                let idx = self.read_u16(offset + 1);
                let count = self.code[offset + 3] as usize;
                let captures = (0..count)
                    .map(|i| {
                        let kind = if self.code[offset + 4 + i * 2] != 0 { "local" } else { "upvalue" };
                        format!("{} {}", kind, self.code[offset + 5 + i * 2])
                    })
                    .collect::<Vec<_>>();
                (format!("CLOSURE {:04} [{}]", idx, captures.join(", ")), offset + 4 + count * 2)
            }
            _ => (format!("{:?}", op), offset + 1),
        };

        (format!("{:04} {:4} {}", offset, line, instr), new_offset)
    }
}

impl Default for Chunk {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.disassemble("chunk"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    #[test]
    fn test_chunk_write() {
        let mut chunk = Chunk::new();
        chunk.write(OpCode::Constant, 1);
        let idx = chunk.add_constant(Value::Number(42.0)).unwrap();
        chunk.write_u16(idx, 1);
        chunk.write(OpCode::Return, 1);

        assert_eq!(chunk.code.len(), 4);
        assert_eq!(chunk.constants.len(), 1);
    }

    #[test]
    fn test_opcode_byte_round_trip() {
        for op in OpCode::ALL {
            assert_eq!(OpCode::try_from(u8::from(op)), Ok(op));
        }
        assert!(OpCode::try_from(OpCode::ALL.len() as u8).is_err());
    }

    #[test]
    fn test_names_are_deduplicated() {
        let mut chunk = Chunk::new();
        let a = chunk.add_name("Deploy");
        let b = chunk.add_name("Deploy");
        assert_eq!(a, b);
        assert_eq!(chunk.names.len(), 1);
    }

    #[test]
    fn test_disassemble() {
        let mut chunk = Chunk::new();
        chunk.write(OpCode::Constant, 1);
        let idx = chunk.add_constant(Value::Number(1.5)).unwrap();
        chunk.write_u16(idx, 1);
        chunk.write(OpCode::Return, 2);

        let disasm = chunk.disassemble("test");
        assert!(disasm.contains("CONSTANT"));
        assert!(disasm.contains("1.5"));
    }
}
