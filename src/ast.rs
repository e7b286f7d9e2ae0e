//! Abstract Syntax Tree definitions
//!
//! Represents the structure of programs after parsing.

use crate::token::Span;

/// Expression nodes
#[derive(Debug, Clone)]
pub enum Expr {
    /// Number literal: 42, 3.14
    Number { value: f64, span: Span },

    /// String literal: "hello"
    String { value: String, span: Span },

    /// Boolean literal: true, false
    Bool { value: bool, span: Span },

    /// Nil literal
    Nil { span: Span },

    /// Variable reference: foo
    Ident { name: String, span: Span },

    /// Array literal: [a, b, c]
    Array { elements: Vec<Expr>, span: Span },

    /// Record literal: { name: value, "key": value }
    Record { fields: Vec<(String, Expr)>, span: Span },

    /// Binary operation: a + b, x * y
    Binary {
        left: Box<Expr>,
        op: BinaryOp,
        right: Box<Expr>,
        span: Span,
    },

    /// Unary operation: -x, !y
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
        span: Span,
    },

    /// Function call: foo(a, b)
    Call {
        callee: Box<Expr>,
        args: Vec<Expr>,
        span: Span,
    },

    /// Grouping: (expr)
    Grouping { expr: Box<Expr>, span: Span },

    /// Logical and/or: a and b, x || y
    Logical {
        left: Box<Expr>,
        op: LogicalOp,
        right: Box<Expr>,
        span: Span,
    },

    /// Variable assignment: x = value
    Assign {
        name: String,
        value: Box<Expr>,
        span: Span,
    },

    /// Property access: obj.prop
    Get {
        object: Box<Expr>,
        name: String,
        span: Span,
    },

    /// Property assignment: obj.prop = value
    Set {
        object: Box<Expr>,
        name: String,
        value: Box<Expr>,
        span: Span,
    },

    /// Index access: items[i]
    Index {
        object: Box<Expr>,
        index: Box<Expr>,
        span: Span,
    },

    /// Index assignment: items[i] = value
    SetIndex {
        object: Box<Expr>,
        index: Box<Expr>,
        value: Box<Expr>,
        span: Span,
    },
}

impl Expr {
    pub fn span(&self) -> Span {
        match self {
            Expr::Number { span, .. } => *span,
            Expr::String { span, .. } => *span,
            Expr::Bool { span, .. } => *span,
            Expr::Nil { span } => *span,
            Expr::Ident { span, .. } => *span,
            Expr::Array { span, .. } => *span,
            Expr::Record { span, .. } => *span,
            Expr::Binary { span, .. } => *span,
            Expr::Unary { span, .. } => *span,
            Expr::Call { span, .. } => *span,
            Expr::Grouping { span, .. } => *span,
            Expr::Logical { span, .. } => *span,
            Expr::Assign { span, .. } => *span,
            Expr::Get { span, .. } => *span,
            Expr::Set { span, .. } => *span,
            Expr::Index { span, .. } => *span,
            Expr::SetIndex { span, .. } => *span,
        }
    }

    /// Visit every identifier referenced by this expression
    pub fn walk_idents<'a>(&'a self, visit: &mut dyn FnMut(&'a str)) {
        match self {
            Expr::Ident { name, .. } => visit(name),
            Expr::Assign { name, value, .. } => {
                visit(name);
                value.walk_idents(visit);
            }
            Expr::Array { elements, .. } => {
                elements.iter().for_each(|e| e.walk_idents(visit));
            }
            Expr::Record { fields, .. } => {
                fields.iter().for_each(|(_, e)| e.walk_idents(visit));
            }
            Expr::Binary { left, right, .. } | Expr::Logical { left, right, .. } => {
                left.walk_idents(visit);
                right.walk_idents(visit);
            }
            Expr::Unary { operand, .. } => operand.walk_idents(visit),
            Expr::Call { callee, args, .. } => {
                callee.walk_idents(visit);
                args.iter().for_each(|e| e.walk_idents(visit));
            }
            Expr::Grouping { expr, .. } => expr.walk_idents(visit),
            Expr::Get { object, .. } => object.walk_idents(visit),
            Expr::Set { object, value, .. } => {
                object.walk_idents(visit);
                value.walk_idents(visit);
            }
            Expr::Index { object, index, .. } => {
                object.walk_idents(visit);
                index.walk_idents(visit);
            }
            Expr::SetIndex { object, index, value, .. } => {
                object.walk_idents(visit);
                index.walk_idents(visit);
                value.walk_idents(visit);
            }
            Expr::Number { .. } | Expr::String { .. } | Expr::Bool { .. } | Expr::Nil { .. } => {}
        }
    }
}

/// Binary operators
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BinaryOp {
    Add,      // +
    Sub,      // -
    Mul,      // *
    Div,      // /
    Mod,      // %
    Eq,       // ==
    Ne,       // !=
    Lt,       // <
    Le,       // <=
    Gt,       // >
    Ge,       // >=
}

impl std::fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BinaryOp::Add => write!(f, "+"),
            BinaryOp::Sub => write!(f, "-"),
            BinaryOp::Mul => write!(f, "*"),
            BinaryOp::Div => write!(f, "/"),
            BinaryOp::Mod => write!(f, "%"),
            BinaryOp::Eq => write!(f, "=="),
            BinaryOp::Ne => write!(f, "!="),
            BinaryOp::Lt => write!(f, "<"),
            BinaryOp::Le => write!(f, "<="),
            BinaryOp::Gt => write!(f, ">"),
            BinaryOp::Ge => write!(f, ">="),
        }
    }
}

/// Unary operators
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UnaryOp {
    Neg,  // -
    Not,  // !
}

/// Logical operators
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LogicalOp {
    And,
    Or,
}

/// Statement nodes
#[derive(Debug, Clone)]
pub enum Stmt {
    /// Expression statement
    Expr { expr: Expr },

    /// Mutable binding: var x = expr
    Var {
        name: String,
        value: Option<Expr>,
        span: Span,
    },

    /// Immutable binding: let x = expr
    Let {
        name: String,
        value: Expr,
        span: Span,
    },

    /// Block: { stmt* }
    Block { stmts: Vec<Stmt>, span: Span },

    /// If statement: if cond { } else { }
    If {
        condition: Expr,
        then_branch: Box<Stmt>,
        else_branch: Option<Box<Stmt>>,
        span: Span,
    },

    /// While loop: while cond { }
    While {
        condition: Expr,
        body: Box<Stmt>,
        span: Span,
    },

    /// For loop: for x in iter { }
    For {
        var: String,
        iterable: Expr,
        body: Box<Stmt>,
        span: Span,
    },

    /// Function definition: fn name(params) { }
    Function {
        name: String,
        params: Vec<String>,
        body: Vec<Stmt>,
        span: Span,
    },

    /// Return statement: return expr
    Return { value: Option<Expr>, span: Span },

    Break { span: Span },

    Continue { span: Span },
}

impl Stmt {
    /// Name introduced by a declaration statement
    pub fn declared_name(&self) -> Option<&str> {
        match self {
            Stmt::Var { name, .. } | Stmt::Let { name, .. } | Stmt::Function { name, .. } => {
                Some(name)
            }
            _ => None,
        }
    }

    /// Visit every identifier referenced anywhere in this statement
    pub fn walk_idents<'a>(&'a self, visit: &mut dyn FnMut(&'a str)) {
        match self {
            Stmt::Expr { expr } => expr.walk_idents(visit),
            Stmt::Var { value, .. } => {
                if let Some(value) = value {
                    value.walk_idents(visit);
                }
            }
            Stmt::Let { value, .. } => value.walk_idents(visit),
            Stmt::Block { stmts, .. } => stmts.iter().for_each(|s| s.walk_idents(visit)),
            Stmt::If { condition, then_branch, else_branch, .. } => {
                condition.walk_idents(visit);
                then_branch.walk_idents(visit);
                if let Some(else_branch) = else_branch {
                    else_branch.walk_idents(visit);
                }
            }
            Stmt::While { condition, body, .. } => {
                condition.walk_idents(visit);
                body.walk_idents(visit);
            }
            Stmt::For { iterable, body, .. } => {
                iterable.walk_idents(visit);
                body.walk_idents(visit);
            }
            Stmt::Function { body, .. } => body.iter().for_each(|s| s.walk_idents(visit)),
            Stmt::Return { value, .. } => {
                if let Some(value) = value {
                    value.walk_idents(visit);
                }
            }
            Stmt::Break { .. } | Stmt::Continue { .. } => {}
        }
    }
}

/// A complete program
#[derive(Debug, Clone)]
pub struct Program {
    pub statements: Vec<Stmt>,
}

impl Program {
    pub fn new(statements: Vec<Stmt>) -> Self {
        Self { statements }
    }
}
