//! Compiler: AST → Bytecode
//!
//! Compiles the Abstract Syntax Tree into bytecode for the VM.

use crate::ast::{BinaryOp, Expr, LogicalOp, Program, Stmt, UnaryOp};
use crate::bytecode::{Chunk, OpCode};
use crate::error::{ErrorKind, Result, ScriptError};
use crate::gc::Heap;
use crate::token::Span;
use crate::value::{Function, Value};
use std::rc::Rc;

/// Name given to the top-level function of every script
pub const SCRIPT_FUNCTION: &str = "<script>";

/// Local variable in scope
#[derive(Debug, Clone)]
struct Local {
    name: String,
    depth: usize,
    mutable: bool,
    captured: bool,
}

/// Upvalue being captured
#[derive(Debug, Clone, Copy)]
struct Upvalue {
    index: u8,
    is_local: bool,
    mutable: bool,
}

/// Jump targets of the innermost enclosing loop
#[derive(Debug)]
struct LoopContext {
    start: usize,
    exits: Vec<usize>,
    /// Scope depth outside the loop body; deeper locals unwind on break/continue
    depth: usize,
}

/// Function being compiled
#[derive(Debug)]
struct FunctionCompiler {
    chunk: Chunk,
    locals: Vec<Local>,
    upvalues: Vec<Upvalue>,
    scope_depth: usize,
    loops: Vec<LoopContext>,
}

impl FunctionCompiler {
    fn new() -> Self {
        Self {
            chunk: Chunk::new(),
            // Slot 0 is ALWAYS reserved for the closure/function itself
            locals: vec![Local {
                name: String::new(),
                depth: 0,
                mutable: false,
                captured: false,
            }],
            upvalues: Vec::new(),
            scope_depth: 0,
            loops: Vec::new(),
        }
    }
}

/// The bytecode compiler
pub struct Compiler {
    /// Stack of function compilers (for nested functions)
    compilers: Vec<FunctionCompiler>,
}

impl Compiler {
    pub fn new() -> Self {
        Self {
            compilers: vec![FunctionCompiler::new()],
        }
    }

    /// Compile a program to the bytecode of its top-level function.
    ///
    /// Nested functions are allocated on `heap` and referenced from the
    /// returned chunk's constant pool. The value of a trailing expression
    /// statement becomes the script's result.
    pub fn compile(&mut self, program: &Program, heap: &mut Heap) -> Result<Chunk> {
        self.compilers = vec![FunctionCompiler::new()];

        let len = program.statements.len();
        for (i, stmt) in program.statements.iter().enumerate() {
            match stmt {
                Stmt::Expr { expr } if i == len - 1 => self.compile_expr(expr, heap)?,
                _ => {
                    self.compile_stmt(stmt, heap)?;
                    if i == len - 1 {
                        self.emit(OpCode::Nil, 0);
                    }
                }
            }
        }

        if program.statements.is_empty() {
            self.emit(OpCode::Nil, 0);
        }

        self.emit(OpCode::Return, 0);

        Ok(std::mem::take(&mut self.current().chunk))
    }

    fn current(&mut self) -> &mut FunctionCompiler {
        self.compilers.last_mut().expect("compiler stack is never empty")
    }

    fn emit(&mut self, op: OpCode, line: usize) {
        self.current().chunk.write(op, line);
    }

    fn emit_byte(&mut self, byte: u8, line: usize) {
        self.current().chunk.write_byte(byte, line);
    }

    fn emit_u16(&mut self, value: u16, line: usize) {
        self.current().chunk.write_u16(value, line);
    }

    fn emit_with_name(&mut self, op: OpCode, name: &str, line: usize) -> Result<()> {
        let idx = self.current().chunk.add_name(name)
            .ok_or_else(|| limit("name table", line))?;
        self.emit(op, line);
        self.emit_u16(idx, line);
        Ok(())
    }

    fn add_constant(&mut self, value: Value, line: usize) -> Result<u16> {
        self.current().chunk.add_constant(value)
            .ok_or_else(|| limit("constant pool", line))
    }

    fn emit_constant(&mut self, value: Value, line: usize) -> Result<()> {
        let idx = self.add_constant(value, line)?;
        self.emit(OpCode::Constant, line);
        self.emit_u16(idx, line);
        Ok(())
    }

    fn emit_count(&mut self, op: OpCode, count: usize, line: usize) -> Result<()> {
        let count = u16::try_from(count).map_err(|_| limit("literal size", line))?;
        self.emit(op, line);
        self.emit_u16(count, line);
        Ok(())
    }

    fn emit_slot(&mut self, op: OpCode, slot: usize, line: usize) -> Result<()> {
        let slot = u16::try_from(slot).map_err(|_| limit("local slot", line))?;
        self.emit(op, line);
        self.emit_u16(slot, line);
        Ok(())
    }

    fn emit_jump(&mut self, op: OpCode, line: usize) -> usize {
        self.emit(op, line);
        self.emit_u16(0xFFFF, line);  // Placeholder
        self.current().chunk.len() - 2
    }

    fn patch_jump(&mut self, offset: usize, line: usize) -> Result<()> {
        if self.current().chunk.patch_jump(offset) {
            Ok(())
        } else {
            Err(limit("jump distance", line))
        }
    }

    fn emit_loop(&mut self, loop_start: usize, line: usize) -> Result<()> {
        self.emit(OpCode::Loop, line);
        let offset = self.current().chunk.len() - loop_start + 2;
        let offset = u16::try_from(offset).map_err(|_| limit("loop body", line))?;
        self.emit_u16(offset, line);
        Ok(())
    }

    // ==================== Statements ====================

    fn compile_stmt(&mut self, stmt: &Stmt, heap: &mut Heap) -> Result<()> {
        match stmt {
            Stmt::Expr { expr } => {
                self.compile_expr(expr, heap)?;
                self.emit(OpCode::Pop, expr.span().line);
            }

            Stmt::Var { name, value, span } => {
                match value {
                    Some(value) => self.compile_expr(value, heap)?,
                    None => self.emit(OpCode::Nil, span.line),
                }
                self.declare(name, true, span.line)?;
            }

            Stmt::Let { name, value, span } => {
                self.compile_expr(value, heap)?;
                self.declare(name, false, span.line)?;
            }

            Stmt::Block { stmts, .. } => {
                self.begin_scope();
                for stmt in stmts {
                    self.compile_stmt(stmt, heap)?;
                }
                self.end_scope();
            }

            Stmt::If { condition, then_branch, else_branch, span } => {
                self.compile_expr(condition, heap)?;

                // Jump over then branch if false
                let then_jump = self.emit_jump(OpCode::JumpIfFalse, span.line);
                self.emit(OpCode::Pop, span.line);  // Pop condition

                self.compile_stmt(then_branch, heap)?;

                // Jump over else branch
                let else_jump = self.emit_jump(OpCode::Jump, span.line);

                self.patch_jump(then_jump, span.line)?;
                self.emit(OpCode::Pop, span.line);  // Pop condition

                if let Some(else_stmt) = else_branch {
                    self.compile_stmt(else_stmt, heap)?;
                }

                self.patch_jump(else_jump, span.line)?;
            }

            Stmt::While { condition, body, span } => {
                let loop_start = self.current().chunk.len();
                self.begin_loop(loop_start);

                self.compile_expr(condition, heap)?;
                let exit_jump = self.emit_jump(OpCode::JumpIfFalse, span.line);
                self.emit(OpCode::Pop, span.line);

                self.compile_stmt(body, heap)?;
                self.emit_loop(loop_start, span.line)?;

                self.patch_jump(exit_jump, span.line)?;
                self.emit(OpCode::Pop, span.line);

                self.end_loop(span.line)?;
            }

            Stmt::For { var, iterable, body, span } => {
                self.compile_for(var, iterable, body, *span, heap)?;
            }

            Stmt::Function { name, params, body, span } => {
                let global = self.current().scope_depth == 0;
                if !global {
                    // Declared before the body so the function can recurse
                    self.add_local(name.clone(), false);
                }

                self.compile_function(name, params, body, *span, heap)?;

                if global {
                    self.emit_with_name(OpCode::DefineGlobal, name, span.line)?;
                }
            }

            Stmt::Return { value, span } => {
                if let Some(expr) = value {
                    self.compile_expr(expr, heap)?;
                } else {
                    self.emit(OpCode::Nil, span.line);
                }
                self.emit(OpCode::Return, span.line);
            }

            Stmt::Break { span } => {
                let Some(depth) = self.current().loops.last().map(|l| l.depth) else {
                    return Err(ScriptError::new(ErrorKind::BreakOutsideLoop, Some(*span)));
                };
                self.unwind_locals(depth, span.line);
                let exit = self.emit_jump(OpCode::Jump, span.line);
                if let Some(innermost) = self.current().loops.last_mut() {
                    innermost.exits.push(exit);
                }
            }

            Stmt::Continue { span } => {
                let Some((start, depth)) = self.current().loops.last().map(|l| (l.start, l.depth)) else {
                    return Err(ScriptError::new(ErrorKind::ContinueOutsideLoop, Some(*span)));
                };
                self.unwind_locals(depth, span.line);
                self.emit_loop(start, span.line)?;
            }
        }

        Ok(())
    }

    /// `for x in items { }` walks `items` by index:
    ///
    /// ```text
    /// __iter__ = items; __idx__ = -1; x = nil
    /// loop: __idx__ = __idx__ + 1
    ///       if !(len(__iter__) > __idx__) goto exit
    ///       x = __iter__[__idx__]; body; goto loop
    /// ```
    ///
    /// The increment sits at the top of the loop so `continue` advances.
    fn compile_for(&mut self, var: &str, iterable: &Expr, body: &Stmt, span: Span, heap: &mut Heap) -> Result<()> {
        let line = span.line;
        self.begin_scope();

        self.compile_expr(iterable, heap)?;
        let iter_slot = self.add_local("__iter__".to_string(), false);

        self.emit_constant(Value::Number(-1.0), line)?;
        let idx_slot = self.add_local("__idx__".to_string(), true);

        self.emit(OpCode::Nil, line);
        let var_slot = self.add_local(var.to_string(), true);

        let loop_start = self.current().chunk.len();
        self.begin_loop(loop_start);

        // __idx__ = __idx__ + 1
        self.emit_slot(OpCode::GetLocal, idx_slot, line)?;
        self.emit_constant(Value::Number(1.0), line)?;
        self.emit(OpCode::Add, line);
        self.emit_slot(OpCode::SetLocal, idx_slot, line)?;
        self.emit(OpCode::Pop, line);

        // len(__iter__) > __idx__
        self.emit_slot(OpCode::GetLocal, iter_slot, line)?;
        self.emit(OpCode::Len, line);
        self.emit_slot(OpCode::GetLocal, idx_slot, line)?;
        self.emit(OpCode::Greater, line);

        let exit_jump = self.emit_jump(OpCode::JumpIfFalse, line);
        self.emit(OpCode::Pop, line);

        // x = __iter__[__idx__]
        self.emit_slot(OpCode::GetLocal, iter_slot, line)?;
        self.emit_slot(OpCode::GetLocal, idx_slot, line)?;
        self.emit(OpCode::Index, line);
        self.emit_slot(OpCode::SetLocal, var_slot, line)?;
        self.emit(OpCode::Pop, line);

        self.compile_stmt(body, heap)?;
        self.emit_loop(loop_start, line)?;

        self.patch_jump(exit_jump, line)?;
        self.emit(OpCode::Pop, line);

        self.end_loop(line)?;
        self.end_scope();
        Ok(())
    }

    fn compile_function(
        &mut self,
        name: &str,
        params: &[String],
        body: &[Stmt],
        span: Span,
        heap: &mut Heap,
    ) -> Result<()> {
        if params.len() > u8::MAX as usize {
            return Err(limit("parameter list", span.line));
        }

        self.compilers.push(FunctionCompiler::new());
        self.begin_scope();

        for param in params {
            self.add_local(param.clone(), true);
        }

        for stmt in body {
            self.compile_stmt(stmt, heap)?;
        }

        // Implicit return nil
        self.emit(OpCode::Nil, span.line);
        self.emit(OpCode::Return, span.line);

        let func_compiler = self.compilers.pop().expect("function compiler was pushed above");
        let upvalues = func_compiler.upvalues;

        let function = Function::new(
            name.to_string(),
            params.to_vec(),
            Rc::new(func_compiler.chunk),
            upvalues.len(),
        );
        let handle = heap.alloc_function(function);

        let func_idx = self.add_constant(Value::Function(handle), span.line)?;
        self.emit(OpCode::Closure, span.line);
        self.emit_u16(func_idx, span.line);
        // add_upvalue keeps the count within a byte
        self.emit_byte(upvalues.len() as u8, span.line);
        for upvalue in upvalues {
            self.emit_byte(u8::from(upvalue.is_local), span.line);
            self.emit_byte(upvalue.index, span.line);
        }
        Ok(())
    }

    /// Bind the value on top of the stack to `name` in the current scope
    fn declare(&mut self, name: &str, mutable: bool, line: usize) -> Result<()> {
        if self.current().scope_depth == 0 {
            let op = if mutable { OpCode::DefineVar } else { OpCode::DefineGlobal };
            self.emit_with_name(op, name, line)
        } else {
            self.add_local(name.to_string(), mutable);
            Ok(())
        }
    }

    // ==================== Expressions ====================

    fn compile_expr(&mut self, expr: &Expr, heap: &mut Heap) -> Result<()> {
        match expr {
            Expr::Number { value, span } => {
                self.emit_constant(Value::Number(*value), span.line)?;
            }

            Expr::String { value, span } => {
                self.emit_constant(Value::String(value.clone()), span.line)?;
            }

            Expr::Bool { value, span } => {
                self.emit(if *value { OpCode::True } else { OpCode::False }, span.line);
            }

            Expr::Nil { span } => {
                self.emit(OpCode::Nil, span.line);
            }

            Expr::Ident { name, span } => self.compile_variable(name, *span)?,

            Expr::Assign { name, value, span } => self.compile_assign(name, value, *span, heap)?,

            Expr::Array { elements, span } => {
                for element in elements {
                    self.compile_expr(element, heap)?;
                }
                self.emit_count(OpCode::Array, elements.len(), span.line)?;
            }

            Expr::Record { fields, span } => {
                for (key, value) in fields {
                    self.emit_constant(Value::String(key.clone()), span.line)?;
                    self.compile_expr(value, heap)?;
                }
                self.emit_count(OpCode::Record, fields.len(), span.line)?;
            }

            Expr::Binary { .. } | Expr::Logical { .. } => self.compile_operator_chain(expr, heap)?,

            Expr::Unary { op, operand, span } => {
                self.compile_expr(operand, heap)?;
                match op {
                    UnaryOp::Neg => self.emit(OpCode::Negate, span.line),
                    UnaryOp::Not => self.emit(OpCode::Not, span.line),
                }
            }

            Expr::Grouping { expr, .. } => {
                self.compile_expr(expr, heap)?;
            }

            Expr::Call { callee, args, span } => self.compile_call(callee, args, *span, heap)?,

            Expr::Get { object, name, span } => {
                self.compile_expr(object, heap)?;
                self.emit_with_name(OpCode::GetProperty, name, span.line)?;
            }

            Expr::Set { object, name, value, span } => {
                self.compile_expr(object, heap)?;
                self.compile_expr(value, heap)?;
                self.emit_with_name(OpCode::SetProperty, name, span.line)?;
            }

            Expr::Index { object, index, span } => {
                self.compile_expr(object, heap)?;
                self.compile_expr(index, heap)?;
                self.emit(OpCode::Index, span.line);
            }

            Expr::SetIndex { object, index, value, span } => {
                self.compile_expr(object, heap)?;
                self.compile_expr(index, heap)?;
                self.compile_expr(value, heap)?;
                self.emit(OpCode::SetIndex, span.line);
            }
        }

        Ok(())
    }

    fn compile_variable(&mut self, name: &str, span: Span) -> Result<()> {
        if let Some(slot) = self.resolve_local(name) {
            self.emit_slot(OpCode::GetLocal, slot, span.line)
        } else if let Some(idx) = self.resolve_upvalue(self.compilers.len() - 1, name, span)? {
            self.emit_slot(OpCode::GetUpvalue, idx, span.line)
        } else {
            self.emit_with_name(OpCode::GetGlobal, name, span.line)
        }
    }

    fn compile_assign(&mut self, name: &str, value: &Expr, span: Span, heap: &mut Heap) -> Result<()> {
        self.compile_expr(value, heap)?;

        let immutable = || ScriptError::new(ErrorKind::ImmutableVariable(name.to_string()), Some(span));
        if let Some(slot) = self.resolve_local(name) {
            if !self.current().locals[slot].mutable {
                return Err(immutable());
            }
            self.emit_slot(OpCode::SetLocal, slot, span.line)
        } else if let Some(idx) = self.resolve_upvalue(self.compilers.len() - 1, name, span)? {
            if !self.current().upvalues[idx].mutable {
                return Err(immutable());
            }
            self.emit_slot(OpCode::SetUpvalue, idx, span.line)
        } else {
            // Global mutability is checked when the assignment runs
            self.emit_with_name(OpCode::SetGlobal, name, span.line)
        }
    }

    /// Binary and logical operators nest on their left operand. The left
    /// spine is walked with a loop so long chains like `a + b + c + ...`
    /// do not recurse once per operator.
    fn compile_operator_chain(&mut self, expr: &Expr, heap: &mut Heap) -> Result<()> {
        let mut spine = Vec::new();
        let mut leftmost = expr;
        while let Expr::Binary { left, .. } | Expr::Logical { left, .. } = leftmost {
            spine.push(leftmost);
            leftmost = &**left;
        }

        self.compile_expr(leftmost, heap)?;

        for node in spine.into_iter().rev() {
            if let Expr::Binary { op, right, span, .. } = node {
                self.compile_expr(right, heap)?;
                self.emit(binary_opcode(*op), span.line);
            } else if let Expr::Logical { op, right, span, .. } = node {
                let jump_op = match op {
                    LogicalOp::And => OpCode::JumpIfFalse,
                    LogicalOp::Or => OpCode::JumpIfTrue,
                };
                let jump = self.emit_jump(jump_op, span.line);
                self.emit(OpCode::Pop, span.line);
                self.compile_expr(right, heap)?;
                self.patch_jump(jump, span.line)?;
            }
        }
        Ok(())
    }

    fn compile_call(&mut self, callee: &Expr, args: &[Expr], span: Span, heap: &mut Heap) -> Result<()> {
        let arg_count = u8::try_from(args.len()).map_err(|_| limit("argument list", span.line))?;

        let is_print = matches!(callee, Expr::Ident { name, .. } if name == "print");
        if !is_print {
            self.compile_expr(callee, heap)?;
        }
        for arg in args {
            self.compile_expr(arg, heap)?;
        }
        self.emit(if is_print { OpCode::Print } else { OpCode::Call }, span.line);
        self.emit_byte(arg_count, span.line);
        Ok(())
    }

    // ==================== Scope Management ====================

    fn begin_scope(&mut self) {
        self.current().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.current().scope_depth -= 1;
        let depth = self.current().scope_depth;
        self.unwind_locals(depth, 0);

        let compiler = self.current();
        while compiler.locals.last().map_or(false, |local| local.depth > depth) {
            compiler.locals.pop();
        }
    }

    /// Emit pops for every local deeper than `depth` without forgetting them
    fn unwind_locals(&mut self, depth: usize, line: usize) {
        let captured: Vec<bool> = self.current().locals.iter()
            .rev()
            .take_while(|local| local.depth > depth)
            .map(|local| local.captured)
            .collect();

        for captured in captured {
            self.emit(if captured { OpCode::CloseUpvalue } else { OpCode::Pop }, line);
        }
    }

    fn begin_loop(&mut self, start: usize) {
        let depth = self.current().scope_depth;
        self.current().loops.push(LoopContext { start, exits: Vec::new(), depth });
    }

    fn end_loop(&mut self, line: usize) -> Result<()> {
        if let Some(finished) = self.current().loops.pop() {
            for exit in finished.exits {
                self.patch_jump(exit, line)?;
            }
        }
        Ok(())
    }

    fn add_local(&mut self, name: String, mutable: bool) -> usize {
        let compiler = self.current();
        let depth = compiler.scope_depth;
        compiler.locals.push(Local { name, depth, mutable, captured: false });
        compiler.locals.len() - 1
    }

    fn resolve_local(&mut self, name: &str) -> Option<usize> {
        self.current().locals.iter().rposition(|local| local.name == name)
    }

    fn resolve_upvalue(&mut self, compiler_idx: usize, name: &str, span: Span) -> Result<Option<usize>> {
        // Base case: top-level compiler has no upvalues
        if compiler_idx == 0 {
            return Ok(None);
        }

        let parent_idx = compiler_idx - 1;

        let parent = &mut self.compilers[parent_idx];
        if let Some(index) = parent.locals.iter().rposition(|local| local.name == name) {
            // Found local in parent -> capture it
            parent.locals[index].captured = true;
            let mutable = parent.locals[index].mutable;
            let index = u8::try_from(index).map_err(|_| limit("captured local slot", span.line))?;
            return self.add_upvalue(compiler_idx, index, true, mutable, span).map(Some);
        }

        // Recursive step: resolve upvalue in parent's parent
        if let Some(index) = self.resolve_upvalue(parent_idx, name, span)? {
            let mutable = self.compilers[parent_idx].upvalues[index].mutable;
            // add_upvalue keeps indexes within a byte
            return self.add_upvalue(compiler_idx, index as u8, false, mutable, span).map(Some);
        }

        Ok(None)
    }

    fn add_upvalue(&mut self, compiler_idx: usize, index: u8, is_local: bool, mutable: bool, span: Span) -> Result<usize> {
        let compiler = &mut self.compilers[compiler_idx];

        if let Some(existing) = compiler.upvalues.iter()
            .position(|u| u.index == index && u.is_local == is_local)
        {
            return Ok(existing);
        }

        if compiler.upvalues.len() >= u8::MAX as usize {
            return Err(limit("captured variable list", span.line));
        }

        compiler.upvalues.push(Upvalue { index, is_local, mutable });
        Ok(compiler.upvalues.len() - 1)
    }
}

impl Default for Compiler {
    fn default() -> Self {
        Self::new()
    }
}

fn binary_opcode(op: BinaryOp) -> OpCode {
    match op {
        BinaryOp::Add => OpCode::Add,
        BinaryOp::Sub => OpCode::Subtract,
        BinaryOp::Mul => OpCode::Multiply,
        BinaryOp::Div => OpCode::Divide,
        BinaryOp::Mod => OpCode::Modulo,
        BinaryOp::Eq => OpCode::Equal,
        BinaryOp::Ne => OpCode::NotEqual,
        BinaryOp::Lt => OpCode::Less,
        BinaryOp::Le => OpCode::LessEqual,
        BinaryOp::Gt => OpCode::Greater,
        BinaryOp::Ge => OpCode::GreaterEqual,
    }
}

fn limit(what: &'static str, line: usize) -> ScriptError {
    ScriptError::new(ErrorKind::LimitExceeded(what), Some(Span::new(0, 0, line, 0)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::Lexer;
    use crate::parser::Parser;

    fn try_compile(source: &str, heap: &mut Heap) -> Result<Chunk> {
        let tokens = Lexer::new(source).tokenize()?;
        let program = Parser::new(tokens).parse()?;
        Compiler::new().compile(&program, heap)
    }

    fn compile(source: &str, heap: &mut Heap) -> Chunk {
        try_compile(source, heap).unwrap()
    }

    #[test]
    fn test_compile_number() {
        let mut heap = Heap::new();
        let chunk = compile("42", &mut heap);
        assert_eq!(chunk.constants[0], Value::Number(42.0));
        assert_eq!(chunk.code.last(), Some(&(OpCode::Return as u8)));
    }

    #[test]
    fn test_compile_let_and_var_globals() {
        let mut heap = Heap::new();
        let chunk = compile("let x = 10\nvar y", &mut heap);
        assert!(chunk.names.contains(&"x".to_string()));
        assert!(chunk.names.contains(&"y".to_string()));
        assert!(chunk.code.contains(&(OpCode::DefineGlobal as u8)));
        assert!(chunk.code.contains(&(OpCode::DefineVar as u8)));
    }

    #[test]
    fn test_compile_if_stmt() {
        let mut heap = Heap::new();
        let chunk = compile("if true { 1 }", &mut heap);
        assert!(chunk.code.iter().any(|&b| b == OpCode::JumpIfFalse as u8));
    }

    #[test]
    fn test_function_prototype_in_constants() {
        let mut heap = Heap::new();
        let chunk = compile("fn Deploy() { return true }", &mut heap);
        let handle = chunk.constants.iter().find_map(|c| match c {
            Value::Function(h) => Some(*h),
            _ => None,
        });
        let function = heap.get_function(handle.unwrap()).unwrap();
        assert_eq!(function.name, "Deploy");
    }

    #[test]
    fn test_assign_to_local_let_is_rejected() {
        let mut heap = Heap::new();
        let err = try_compile("fn f() { let x = 1\n x = 2 }", &mut heap).unwrap_err();
        assert!(matches!(err.kind, ErrorKind::ImmutableVariable(ref n) if n == "x"));
        assert_eq!(err.span.map(|s| s.line), Some(2));
    }

    #[test]
    fn test_assign_to_captured_let_is_rejected() {
        let mut heap = Heap::new();
        let err = try_compile("fn outer() { let x = 1\n fn inner() { x = 2 } }", &mut heap).unwrap_err();
        assert!(matches!(err.kind, ErrorKind::ImmutableVariable(_)));
    }

    #[test]
    fn test_break_outside_loop() {
        let mut heap = Heap::new();
        let err = try_compile("break", &mut heap).unwrap_err();
        assert!(matches!(err.kind, ErrorKind::BreakOutsideLoop));
        assert!(err.is_syntax());
    }

    /// A function nested two levels deep that reads `captures` of its
    /// enclosing locals, plus the outermost `g` when `with_outer` is set
    fn capturing_source(captures: usize, with_outer: bool) -> String {
        let locals: String = (1..=captures).map(|i| format!("let v{} = {}\n", i, i)).collect();
        let mut names: Vec<String> = (1..=captures).map(|i| format!("v{}", i)).collect();
        if with_outer {
            names.push("g".to_string());
        }
        format!(
            "fn a() {{\nlet g = 0\nfn b() {{\n{}fn c() {{ return [{}] }}\n}}\n}}",
            locals,
            names.join(", ")
        )
    }

    #[test]
    fn test_captured_variable_limit() {
        let mut heap = Heap::new();
        assert!(try_compile(&capturing_source(255, false), &mut heap).is_ok());

        let err = try_compile(&capturing_source(255, true), &mut heap).unwrap_err();
        assert!(matches!(err.kind, ErrorKind::LimitExceeded("captured variable list")));
    }
}
