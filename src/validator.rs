//! Syntax validation without execution
//!
//! [`validate`] runs the front end and the bytecode compiler against a
//! scratch heap, so everything the language rejects before running a single
//! statement is reported here, and nothing is evaluated.

use std::collections::BTreeSet;

use crate::ast::Program;
use crate::compiler::Compiler;
use crate::error::ScriptError;
use crate::gc::Heap;
use crate::lexer::Lexer;
use crate::parser::Parser;

/// A parsed script
#[derive(Debug, Clone)]
pub struct Script {
    source: String,
    program: Program,
    declarations: Vec<String>,
}

impl Script {
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    /// Top-level `var`, `let` and `fn` names, in declaration order
    pub fn declarations(&self) -> &[String] {
        &self.declarations
    }

    /// Every identifier the script mentions, at any depth
    pub fn referenced_identifiers(&self) -> BTreeSet<&str> {
        let mut names = BTreeSet::new();
        for stmt in &self.program.statements {
            stmt.walk_idents(&mut |name| {
                names.insert(name);
            });
        }
        names
    }
}

/// Check `source` for syntax errors
pub fn validate(source: &str) -> Result<Script, ScriptError> {
    let program = parse(source).map_err(|e| e.with_source(source))?;

    Compiler::new()
        .compile(&program, &mut Heap::new())
        .map_err(|e| e.with_source(source))?;

    let mut declarations: Vec<String> = Vec::new();
    for name in program.statements.iter().filter_map(|stmt| stmt.declared_name()) {
        if !declarations.iter().any(|d| d == name) {
            declarations.push(name.to_string());
        }
    }

    Ok(Script {
        source: source.to_string(),
        program,
        declarations,
    })
}

fn parse(source: &str) -> Result<Program, ScriptError> {
    let tokens = Lexer::new(source).tokenize()?;
    Parser::new(tokens).parse()
}
