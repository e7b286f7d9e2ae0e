//! Parser for the gscript language
//!
//! Converts tokens into an Abstract Syntax Tree.

use crate::ast::{BinaryOp, Expr, LogicalOp, Program, Stmt, UnaryOp};
use crate::error::{ErrorKind, Result, ScriptError};
use crate::token::{Token, TokenKind};

/// Deepest nesting of blocks, groupings and operands a script may use
pub const MAX_NESTING_DEPTH: usize = 64;

/// Longest run of binary operators at one precedence level
pub const MAX_OPERATOR_CHAIN: usize = 256;

/// The parser state
pub struct Parser {
    tokens: Vec<Token>,
    current: usize,
    depth: usize,
}

impl Parser {
    /// Create a new parser from tokens
    pub fn new(tokens: Vec<Token>) -> Self {
        Self { tokens, current: 0, depth: 0 }
    }

    /// Parse the tokens into a program
    pub fn parse(&mut self) -> Result<Program> {
        let mut statements = Vec::new();

        self.skip_terminators();
        while !self.is_at_end() {
            statements.push(self.declaration()?);
            self.skip_terminators();
        }

        Ok(Program::new(statements))
    }

    // ==================== Declarations ====================

    fn declaration(&mut self) -> Result<Stmt> {
        if self.check(&TokenKind::Var) {
            self.var_declaration()
        } else if self.check(&TokenKind::Let) {
            self.let_declaration()
        } else if self.check(&TokenKind::Fn) {
            self.function_declaration()
        } else {
            self.statement()
        }
    }

    fn var_declaration(&mut self) -> Result<Stmt> {
        let span = self.advance().span; // consume 'var'

        let name = self.expect_ident("expected variable name")?;

        let value = if self.match_token(&TokenKind::Equal) {
            Some(self.expression()?)
        } else {
            None
        };
        self.end_statement()?;

        Ok(Stmt::Var { name, value, span })
    }

    fn let_declaration(&mut self) -> Result<Stmt> {
        let span = self.advance().span; // consume 'let'

        let name = self.expect_ident("expected variable name")?;
        self.expect(&TokenKind::Equal, "expected '=' after variable name")?;

        let value = self.expression()?;
        self.end_statement()?;

        Ok(Stmt::Let { name, value, span })
    }

    fn function_declaration(&mut self) -> Result<Stmt> {
        let span = self.advance().span; // consume 'fn'

        let name = self.expect_ident("expected function name")?;

        self.expect(&TokenKind::LeftParen, "expected '(' after function name")?;

        let mut params = Vec::new();
        self.skip_newlines();
        if !self.check(&TokenKind::RightParen) {
            loop {
                self.skip_newlines();
                params.push(self.expect_ident("expected parameter name")?);
                self.skip_newlines();
                if !self.match_token(&TokenKind::Comma) {
                    break;
                }
            }
        }

        self.expect(&TokenKind::RightParen, "expected ')' after parameters")?;

        self.skip_newlines();
        self.expect(&TokenKind::LeftBrace, "expected '{' before function body")?;

        let body = self.block_statements()?;

        Ok(Stmt::Function { name, params, body, span })
    }

    // ==================== Statements ====================

    fn statement(&mut self) -> Result<Stmt> {
        if self.check(&TokenKind::If) {
            self.if_statement()
        } else if self.check(&TokenKind::While) {
            self.while_statement()
        } else if self.check(&TokenKind::For) {
            self.for_statement()
        } else if self.check(&TokenKind::Return) {
            self.return_statement()
        } else if self.check(&TokenKind::Break) {
            let span = self.advance().span;
            self.end_statement()?;
            Ok(Stmt::Break { span })
        } else if self.check(&TokenKind::Continue) {
            let span = self.advance().span;
            self.end_statement()?;
            Ok(Stmt::Continue { span })
        } else if self.check(&TokenKind::LeftBrace) {
            let span = self.advance().span;
            let stmts = self.block_statements()?;
            Ok(Stmt::Block { stmts, span })
        } else {
            let expr = self.expression()?;
            self.end_statement()?;
            Ok(Stmt::Expr { expr })
        }
    }

    fn if_statement(&mut self) -> Result<Stmt> {
        let span = self.advance().span; // consume 'if'

        let condition = self.expression()?;

        self.skip_newlines();
        self.expect(&TokenKind::LeftBrace, "expected '{' after if condition")?;

        let then_stmts = self.block_statements()?;
        let then_branch = Box::new(Stmt::Block { stmts: then_stmts, span });

        // Peek past newlines for an `else` without consuming a bare terminator
        let checkpoint = self.current;
        self.skip_newlines();

        let else_branch = if self.match_token(&TokenKind::Else) {
            self.skip_newlines();
            if self.check(&TokenKind::If) {
                Some(Box::new(self.if_statement()?))
            } else {
                self.expect(&TokenKind::LeftBrace, "expected '{' after else")?;
                let else_stmts = self.block_statements()?;
                Some(Box::new(Stmt::Block { stmts: else_stmts, span }))
            }
        } else {
            self.current = checkpoint;
            None
        };

        Ok(Stmt::If { condition, then_branch, else_branch, span })
    }

    fn while_statement(&mut self) -> Result<Stmt> {
        let span = self.advance().span; // consume 'while'

        let condition = self.expression()?;

        self.skip_newlines();
        self.expect(&TokenKind::LeftBrace, "expected '{' after while condition")?;

        let body_stmts = self.block_statements()?;
        let body = Box::new(Stmt::Block { stmts: body_stmts, span });

        Ok(Stmt::While { condition, body, span })
    }

    fn for_statement(&mut self) -> Result<Stmt> {
        let span = self.advance().span; // consume 'for'

        let parenthesized = self.match_token(&TokenKind::LeftParen);
        if self.check(&TokenKind::Var) || self.check(&TokenKind::Let) {
            self.advance();
        }
        let var = self.expect_ident("expected variable name in for loop")?;
        self.expect(&TokenKind::In, "expected 'in' after loop variable")?;

        let iterable = self.expression()?;
        if parenthesized {
            self.expect(&TokenKind::RightParen, "expected ')' after for clause")?;
        }

        self.skip_newlines();
        self.expect(&TokenKind::LeftBrace, "expected '{' after for clause")?;

        let body_stmts = self.block_statements()?;
        let body = Box::new(Stmt::Block { stmts: body_stmts, span });

        Ok(Stmt::For { var, iterable, body, span })
    }

    fn return_statement(&mut self) -> Result<Stmt> {
        let span = self.advance().span; // consume 'return'

        let value = if self.at_terminator() || self.check(&TokenKind::RightBrace) {
            None
        } else {
            Some(self.expression()?)
        };

        self.end_statement()?;
        Ok(Stmt::Return { value, span })
    }

    fn block_statements(&mut self) -> Result<Vec<Stmt>> {
        self.nested(Self::block_body)
    }

    fn block_body(&mut self) -> Result<Vec<Stmt>> {
        let mut stmts = Vec::new();

        self.skip_terminators();

        while !self.check(&TokenKind::RightBrace) && !self.is_at_end() {
            stmts.push(self.declaration()?);
            self.skip_terminators();
        }

        self.expect(&TokenKind::RightBrace, "expected '}' after block")?;

        Ok(stmts)
    }

    /// A statement ends at a newline, `;`, a closing brace, or end of input
    fn end_statement(&mut self) -> Result<()> {
        if self.at_terminator() || self.check(&TokenKind::RightBrace) {
            self.skip_terminators();
            Ok(())
        } else {
            Err(ScriptError::new(
                ErrorKind::UnexpectedToken(format!("{}", self.peek().kind)),
                Some(self.peek().span),
            ))
        }
    }

    // ==================== Expressions ====================

    fn expression(&mut self) -> Result<Expr> {
        self.nested(Self::assignment)
    }

    fn assignment(&mut self) -> Result<Expr> {
        let expr = self.or_expr()?;

        if self.match_token(&TokenKind::Equal) {
            let equals = self.previous().span;
            self.skip_newlines();
            let value = Box::new(self.nested(Self::assignment)?);

            return match expr {
                Expr::Ident { name, span } => Ok(Expr::Assign { name, value, span }),
                Expr::Get { object, name, span } => Ok(Expr::Set { object, name, value, span }),
                Expr::Index { object, index, span } => {
                    Ok(Expr::SetIndex { object, index, value, span })
                }
                _ => Err(ScriptError::new(ErrorKind::InvalidAssignmentTarget, Some(equals))),
            };
        }

        Ok(expr)
    }

    fn or_expr(&mut self) -> Result<Expr> {
        let mut left = self.and_expr()?;
        let mut chain = 0;

        while self.match_token(&TokenKind::Or) {
            self.extend_chain(&mut chain)?;
            self.skip_newlines();
            let right = self.and_expr()?;
            let span = left.span().to(right.span());
            left = Expr::Logical {
                left: Box::new(left),
                op: LogicalOp::Or,
                right: Box::new(right),
                span,
            };
        }

        Ok(left)
    }

    fn and_expr(&mut self) -> Result<Expr> {
        let mut left = self.equality()?;
        let mut chain = 0;

        while self.match_token(&TokenKind::And) {
            self.extend_chain(&mut chain)?;
            self.skip_newlines();
            let right = self.equality()?;
            let span = left.span().to(right.span());
            left = Expr::Logical {
                left: Box::new(left),
                op: LogicalOp::And,
                right: Box::new(right),
                span,
            };
        }

        Ok(left)
    }

    fn equality(&mut self) -> Result<Expr> {
        self.binary_level(Self::comparison, &[
            (TokenKind::EqualEqual, BinaryOp::Eq),
            (TokenKind::BangEqual, BinaryOp::Ne),
        ])
    }

    fn comparison(&mut self) -> Result<Expr> {
        self.binary_level(Self::term, &[
            (TokenKind::Less, BinaryOp::Lt),
            (TokenKind::LessEqual, BinaryOp::Le),
            (TokenKind::Greater, BinaryOp::Gt),
            (TokenKind::GreaterEqual, BinaryOp::Ge),
        ])
    }

    fn term(&mut self) -> Result<Expr> {
        self.binary_level(Self::factor, &[
            (TokenKind::Plus, BinaryOp::Add),
            (TokenKind::Minus, BinaryOp::Sub),
        ])
    }

    fn factor(&mut self) -> Result<Expr> {
        self.binary_level(Self::unary, &[
            (TokenKind::Star, BinaryOp::Mul),
            (TokenKind::Slash, BinaryOp::Div),
            (TokenKind::Percent, BinaryOp::Mod),
        ])
    }

    /// One left-associative precedence level
    fn binary_level(
        &mut self,
        operand: fn(&mut Self) -> Result<Expr>,
        ops: &[(TokenKind, BinaryOp)],
    ) -> Result<Expr> {
        let mut left = operand(self)?;
        let mut chain = 0;

        'outer: loop {
            for (kind, op) in ops {
                if self.match_token(kind) {
                    self.extend_chain(&mut chain)?;
                    self.skip_newlines();
                    let right = operand(self)?;
                    let span = left.span().to(right.span());
                    left = Expr::Binary {
                        left: Box::new(left),
                        op: *op,
                        right: Box::new(right),
                        span,
                    };
                    continue 'outer;
                }
            }
            break;
        }

        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr> {
        if self.match_token(&TokenKind::Minus) {
            let span = self.previous().span;
            let operand = self.nested(Self::unary)?;
            return Ok(Expr::Unary {
                op: UnaryOp::Neg,
                operand: Box::new(operand),
                span,
            });
        }

        if self.match_token(&TokenKind::Bang) {
            let span = self.previous().span;
            let operand = self.nested(Self::unary)?;
            return Ok(Expr::Unary {
                op: UnaryOp::Not,
                operand: Box::new(operand),
                span,
            });
        }

        self.call()
    }

    fn call(&mut self) -> Result<Expr> {
        let mut expr = self.primary()?;
        let mut postfix = 0;

        loop {
            // Each access wraps the previous one, so the chain nests
            if self.check(&TokenKind::LeftParen) || self.check(&TokenKind::Dot) || self.check(&TokenKind::LeftBracket) {
                postfix += 1;
                if self.depth + postfix > MAX_NESTING_DEPTH {
                    return Err(self.too_deep("nesting depth"));
                }
            }

            if self.match_token(&TokenKind::LeftParen) {
                expr = self.finish_call(expr)?;
            } else if self.match_token(&TokenKind::Dot) {
                let name = self.expect_ident("expected property name after '.'")?;
                let span = expr.span().to(self.previous().span);
                expr = Expr::Get { object: Box::new(expr), name, span };
            } else if self.match_token(&TokenKind::LeftBracket) {
                self.skip_newlines();
                let index = self.expression()?;
                self.skip_newlines();
                let end = self.expect(&TokenKind::RightBracket, "expected ']' after index")?.span;
                let span = expr.span().to(end);
                expr = Expr::Index { object: Box::new(expr), index: Box::new(index), span };
            } else {
                break;
            }
        }

        Ok(expr)
    }

    fn finish_call(&mut self, callee: Expr) -> Result<Expr> {
        let args = self.delimited(&TokenKind::RightParen, Self::expression)?;
        let end_span = self.expect(&TokenKind::RightParen, "expected ')' after arguments")?.span;

        let span = callee.span().to(end_span);
        Ok(Expr::Call {
            callee: Box::new(callee),
            args,
            span,
        })
    }

    fn primary(&mut self) -> Result<Expr> {
        let token = self.peek().clone();

        match &token.kind {
            TokenKind::Number(n) => {
                let value = *n;
                self.advance();
                Ok(Expr::Number { value, span: token.span })
            }
            TokenKind::String(s) => {
                let value = s.clone();
                self.advance();
                Ok(Expr::String { value, span: token.span })
            }
            TokenKind::True => {
                self.advance();
                Ok(Expr::Bool { value: true, span: token.span })
            }
            TokenKind::False => {
                self.advance();
                Ok(Expr::Bool { value: false, span: token.span })
            }
            TokenKind::Nil => {
                self.advance();
                Ok(Expr::Nil { span: token.span })
            }
            TokenKind::Ident(name) => {
                let name = name.clone();
                self.advance();
                Ok(Expr::Ident { name, span: token.span })
            }
            TokenKind::LeftParen => {
                self.advance();
                self.skip_newlines();
                let expr = self.expression()?;
                self.skip_newlines();
                self.expect(&TokenKind::RightParen, "expected ')' after expression")?;
                Ok(Expr::Grouping { expr: Box::new(expr), span: token.span })
            }
            TokenKind::LeftBracket => {
                self.advance();
                let elements = self.delimited(&TokenKind::RightBracket, Self::expression)?;
                let end = self.expect(&TokenKind::RightBracket, "expected ']' after array elements")?.span;
                Ok(Expr::Array { elements, span: token.span.to(end) })
            }
            TokenKind::LeftBrace => {
                self.advance();
                let fields = self.delimited(&TokenKind::RightBrace, Self::record_field)?;
                let end = self.expect(&TokenKind::RightBrace, "expected '}' after record fields")?.span;
                Ok(Expr::Record { fields, span: token.span.to(end) })
            }
            _ => Err(ScriptError::new(
                ErrorKind::ExpectedExpression,
                Some(token.span),
            )),
        }
    }

    fn record_field(&mut self) -> Result<(String, Expr)> {
        let key = match &self.peek().kind {
            TokenKind::Ident(name) | TokenKind::String(name) => name.clone(),
            other => {
                return Err(ScriptError::new(
                    ErrorKind::ExpectedToken("record key".to_string(), format!("{}", other)),
                    Some(self.peek().span),
                ))
            }
        };
        self.advance();
        self.expect(&TokenKind::Colon, "expected ':' after record key")?;
        self.skip_newlines();
        Ok((key, self.expression()?))
    }

    /// Comma-separated items up to (not including) `close`; newlines and a
    /// trailing comma are allowed
    fn delimited<T>(
        &mut self,
        close: &TokenKind,
        item: fn(&mut Self) -> Result<T>,
    ) -> Result<Vec<T>> {
        let mut items = Vec::new();
        self.skip_newlines();

        while !self.check(close) {
            items.push(item(self)?);
            self.skip_newlines();
            if !self.match_token(&TokenKind::Comma) {
                break;
            }
            self.skip_newlines();
        }

        Ok(items)
    }

    // ==================== Helpers ====================

    // ==================== Limits ====================

    /// Run `parse` one nesting level deeper
    fn nested<T>(&mut self, parse: fn(&mut Self) -> Result<T>) -> Result<T> {
        if self.depth >= MAX_NESTING_DEPTH {
            return Err(self.too_deep("nesting depth"));
        }
        self.depth += 1;
        let result = parse(self);
        self.depth -= 1;
        result
    }

    fn extend_chain(&self, chain: &mut usize) -> Result<()> {
        *chain += 1;
        if *chain > MAX_OPERATOR_CHAIN {
            return Err(self.too_deep("operator chain"));
        }
        Ok(())
    }

    fn too_deep(&self, what: &'static str) -> ScriptError {
        ScriptError::new(ErrorKind::LimitExceeded(what), Some(self.peek().span))
    }

    fn peek(&self) -> &Token {
        &self.tokens[self.current]
    }

    fn previous(&self) -> &Token {
        &self.tokens[self.current - 1]
    }

    fn is_at_end(&self) -> bool {
        matches!(self.peek().kind, TokenKind::Eof)
    }

    fn at_terminator(&self) -> bool {
        self.check(&TokenKind::Newline) || self.check(&TokenKind::Semicolon) || self.is_at_end()
    }

    fn advance(&mut self) -> &Token {
        if !self.is_at_end() {
            self.current += 1;
        }
        self.previous()
    }

    fn check(&self, kind: &TokenKind) -> bool {
        std::mem::discriminant(&self.peek().kind) == std::mem::discriminant(kind)
    }

    fn match_token(&mut self, kind: &TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: &TokenKind, message: &str) -> Result<&Token> {
        if self.check(kind) {
            Ok(self.advance())
        } else {
            Err(ScriptError::new(
                ErrorKind::ExpectedToken(message.to_string(), format!("{}", self.peek().kind)),
                Some(self.peek().span),
            ))
        }
    }

    fn expect_ident(&mut self, message: &str) -> Result<String> {
        if let TokenKind::Ident(name) = &self.peek().kind {
            let name = name.clone();
            self.advance();
            Ok(name)
        } else {
            Err(ScriptError::new(
                ErrorKind::ExpectedToken(message.to_string(), format!("{}", self.peek().kind)),
                Some(self.peek().span),
            ))
        }
    }

    fn skip_newlines(&mut self) {
        while self.match_token(&TokenKind::Newline) {}
    }

    fn skip_terminators(&mut self) {
        while self.match_token(&TokenKind::Newline) || self.match_token(&TokenKind::Semicolon) {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::Lexer;

    fn parse(source: &str) -> Program {
        let mut lexer = Lexer::new(source);
        let tokens = lexer.tokenize().unwrap();
        let mut parser = Parser::new(tokens);
        parser.parse().unwrap()
    }

    fn parse_err(source: &str) -> ScriptError {
        let tokens = Lexer::new(source).tokenize().unwrap();
        Parser::new(tokens).parse().unwrap_err()
    }

    #[test]
    fn test_var_statement_with_semicolons() {
        let program = parse("var x = 42; var y = \"a\";");
        assert_eq!(program.statements.len(), 2);
        match &program.statements[0] {
            Stmt::Var { name, value, .. } => {
                assert_eq!(name, "x");
                assert!(value.is_some());
            }
            _ => panic!("expected var statement"),
        }
    }

    #[test]
    fn test_function() {
        let program = parse("function add(a, b) { return a + b }");
        assert_eq!(program.statements.len(), 1);
        match &program.statements[0] {
            Stmt::Function { name, params, .. } => {
                assert_eq!(name, "add");
                assert_eq!(params, &["a", "b"]);
            }
            _ => panic!("expected function"),
        }
    }

    #[test]
    fn test_if_else_across_lines() {
        let program = parse("if x > 0 {\n print(x)\n}\nelse {\n print(0)\n}");
        assert_eq!(program.statements.len(), 1);
        match &program.statements[0] {
            Stmt::If { else_branch, .. } => assert!(else_branch.is_some()),
            _ => panic!("expected if statement"),
        }
    }

    #[test]
    fn test_multiline_array_literal() {
        let program = parse("var bytes = [\n  60, 104,\n  116,\n];");
        match &program.statements[0] {
            Stmt::Var { value: Some(Expr::Array { elements, .. }), .. } => {
                assert_eq!(elements.len(), 3);
            }
            other => panic!("expected array literal, got {:?}", other),
        }
    }

    #[test]
    fn test_record_and_access() {
        let program = parse("var r = { name: \"x\", \"two words\": 2 }\nr.name = r[\"two words\"]");
        assert_eq!(program.statements.len(), 2);
        match &program.statements[1] {
            Stmt::Expr { expr: Expr::Set { name, value, .. } } => {
                assert_eq!(name, "name");
                assert!(matches!(value.as_ref(), Expr::Index { .. }));
            }
            other => panic!("expected property set, got {:?}", other),
        }
    }

    #[test]
    fn test_assignment_targets() {
        let program = parse("x = 1\nitems[0] = 2");
        assert!(matches!(program.statements[0], Stmt::Expr { expr: Expr::Assign { .. } }));
        assert!(matches!(program.statements[1], Stmt::Expr { expr: Expr::SetIndex { .. } }));
    }

    #[test]
    fn test_invalid_assignment_target() {
        let err = parse_err("1 + 2 = 3");
        assert!(matches!(err.kind, ErrorKind::InvalidAssignmentTarget));
    }

    #[test]
    fn test_missing_expression_reports_position() {
        let err = parse_err("var ok = 1\nvar x = ;");
        assert!(matches!(err.kind, ErrorKind::ExpectedExpression));
        assert_eq!(err.span.map(|s| s.line), Some(2));
    }

    #[test]
    fn test_two_expressions_on_one_line_rejected() {
        let err = parse_err("var x = 1 2");
        assert!(matches!(err.kind, ErrorKind::UnexpectedToken(_)));
    }

    #[test]
    fn test_for_in_with_parens() {
        let program = parse("for (var item in items) { print(item) }");
        assert!(matches!(program.statements[0], Stmt::For { .. }));
    }

    #[test]
    fn test_deep_grouping_is_rejected() {
        let source = format!("var x = {}1{}", "(".repeat(10_000), ")".repeat(10_000));
        let err = parse_err(&source);
        assert!(matches!(err.kind, ErrorKind::LimitExceeded("nesting depth")));
        assert!(err.is_syntax());
    }

    #[test]
    fn test_moderate_nesting_is_accepted() {
        let source = format!("var x = {}1{}", "(".repeat(30), ")".repeat(30));
        parse(&source);
        parse(&format!("var y = {}1", "-".repeat(30)));
    }

    #[test]
    fn test_deep_blocks_and_unary_are_rejected() {
        let blocks = format!("{}{}", "{".repeat(1_000), "}".repeat(1_000));
        assert!(matches!(parse_err(&blocks).kind, ErrorKind::LimitExceeded(_)));

        let negations = format!("var x = {}1", "!".repeat(1_000));
        assert!(matches!(parse_err(&negations).kind, ErrorKind::LimitExceeded(_)));
    }

    #[test]
    fn test_long_postfix_chain_is_rejected() {
        let source = format!("x{}", ".a".repeat(1_000));
        assert!(matches!(parse_err(&source).kind, ErrorKind::LimitExceeded("nesting depth")));
    }

    #[test]
    fn test_operator_chain_limit() {
        let within = vec!["1"; MAX_OPERATOR_CHAIN + 1].join(" + ");
        parse(&within);

        let beyond = vec!["1"; MAX_OPERATOR_CHAIN + 2].join(" + ");
        assert!(matches!(parse_err(&beyond).kind, ErrorKind::LimitExceeded("operator chain")));
    }
}
