//! Lexer for the gscript language
//!
//! Converts source code into a stream of tokens.

use crate::error::{ErrorKind, Result, ScriptError};
use crate::token::{lookup_keyword, Span, Token, TokenKind};

/// The lexer state
pub struct Lexer<'a> {
    source: &'a str,
    chars: std::iter::Peekable<std::str::CharIndices<'a>>,
    current_pos: usize,
    line: usize,
    column: usize,
}

impl<'a> Lexer<'a> {
    /// Create a new lexer from source code
    pub fn new(source: &'a str) -> Self {
        Self {
            source,
            chars: source.char_indices().peekable(),
            current_pos: 0,
            line: 1,
            column: 1,
        }
    }

    /// Tokenize the entire source
    pub fn tokenize(&mut self) -> Result<Vec<Token>> {
        let mut tokens = Vec::new();

        while let Some(token) = self.next_token()? {
            tokens.push(token);
        }

        tokens.push(Token::new(
            TokenKind::Eof,
            Span::new(self.current_pos, self.current_pos, self.line, self.column),
            String::new(),
        ));

        Ok(tokens)
    }

    fn next_token(&mut self) -> Result<Option<Token>> {
        self.skip_whitespace_and_comments()?;

        let Some(&(start_pos, ch)) = self.chars.peek() else {
            return Ok(None);
        };

        let start_line = self.line;
        let start_column = self.column;

        let kind = match ch {
            '(' => { self.advance(); TokenKind::LeftParen }
            ')' => { self.advance(); TokenKind::RightParen }
            '{' => { self.advance(); TokenKind::LeftBrace }
            '}' => { self.advance(); TokenKind::RightBrace }
            '[' => { self.advance(); TokenKind::LeftBracket }
            ']' => { self.advance(); TokenKind::RightBracket }
            ',' => { self.advance(); TokenKind::Comma }
            ';' => { self.advance(); TokenKind::Semicolon }
            ':' => { self.advance(); TokenKind::Colon }
            '.' => { self.advance(); TokenKind::Dot }
            '+' => { self.advance(); TokenKind::Plus }
            '-' => { self.advance(); TokenKind::Minus }
            '*' => { self.advance(); TokenKind::Star }
            '/' => { self.advance(); TokenKind::Slash }
            '%' => { self.advance(); TokenKind::Percent }

            '=' => {
                self.advance();
                if self.match_char('=') {
                    // `===` reads the same as `==`
                    self.match_char('=');
                    TokenKind::EqualEqual
                } else {
                    TokenKind::Equal
                }
            }
            '!' => {
                self.advance();
                if self.match_char('=') {
                    self.match_char('=');
                    TokenKind::BangEqual
                } else {
                    TokenKind::Bang
                }
            }
            '<' => {
                self.advance();
                if self.match_char('=') { TokenKind::LessEqual } else { TokenKind::Less }
            }
            '>' => {
                self.advance();
                if self.match_char('=') { TokenKind::GreaterEqual } else { TokenKind::Greater }
            }
            '&' | '|' => {
                self.advance();
                if !self.match_char(ch) {
                    return Err(ScriptError::new(
                        ErrorKind::UnexpectedCharacter(ch),
                        Some(Span::new(start_pos, self.current_pos, start_line, start_column)),
                    ));
                }
                if ch == '&' { TokenKind::And } else { TokenKind::Or }
            }

            '\n' => {
                self.advance();
                self.line += 1;
                self.column = 1;
                TokenKind::Newline
            }

            '"' | '\'' => self.scan_string(ch)?,

            c if c.is_ascii_digit() => self.scan_number()?,

            c if c.is_alphabetic() || c == '_' => self.scan_identifier(),

            _ => {
                self.advance();
                return Err(ScriptError::new(
                    ErrorKind::UnexpectedCharacter(ch),
                    Some(Span::new(start_pos, self.current_pos, start_line, start_column)),
                ));
            }
        };

        let lexeme = self.source[start_pos..self.current_pos].to_string();

        Ok(Some(Token::new(
            kind,
            Span::new(start_pos, self.current_pos, start_line, start_column),
            lexeme,
        )))
    }

    fn advance(&mut self) -> Option<char> {
        if let Some((pos, ch)) = self.chars.next() {
            self.current_pos = pos + ch.len_utf8();
            self.column += 1;
            Some(ch)
        } else {
            None
        }
    }

    fn match_char(&mut self, expected: char) -> bool {
        if self.peek_char() == Some(expected) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn peek_char(&mut self) -> Option<char> {
        self.chars.peek().map(|&(_, ch)| ch)
    }

    /// Skip whitespace (except newlines) and comments
    fn skip_whitespace_and_comments(&mut self) -> Result<()> {
        while let Some(&(_, ch)) = self.chars.peek() {
            match ch {
                ' ' | '\t' | '\r' => {
                    self.advance();
                }

                '/' if self.source[self.current_pos..].starts_with("//") => {
                    while let Some(&(_, c)) = self.chars.peek() {
                        if c == '\n' {
                            break;
                        }
                        self.advance();
                    }
                }

                '/' if self.source[self.current_pos..].starts_with("/*") => {
                    self.skip_block_comment()?;
                }

                _ => break,
            }
        }
        Ok(())
    }

    fn skip_block_comment(&mut self) -> Result<()> {
        let span = Span::new(self.current_pos, self.current_pos + 2, self.line, self.column);
        self.advance();
        self.advance();

        while let Some(c) = self.advance() {
            match c {
                '*' if self.peek_char() == Some('/') => {
                    self.advance();
                    return Ok(());
                }
                '\n' => {
                    self.line += 1;
                    self.column = 1;
                }
                _ => {}
            }
        }

        Err(ScriptError::new(ErrorKind::UnterminatedComment, Some(span)))
    }

    /// Scan a string literal delimited by `quote`
    fn scan_string(&mut self, quote: char) -> Result<TokenKind> {
        let start_line = self.line;
        let start_column = self.column;
        let start_pos = self.current_pos;

        self.advance();

        let mut value = String::new();

        loop {
            match self.peek_char() {
                Some(c) if c == quote => {
                    self.advance();
                    return Ok(TokenKind::String(value));
                }
                Some('\\') => {
                    self.advance();
                    match self.peek_char() {
                        Some('n') => { self.advance(); value.push('\n'); }
                        Some('t') => { self.advance(); value.push('\t'); }
                        Some('r') => { self.advance(); value.push('\r'); }
                        Some('0') => { self.advance(); value.push('\0'); }
                        Some(c) => { self.advance(); value.push(c); }
                        None => break,
                    }
                }
                Some('\n') => {
                    value.push('\n');
                    self.advance();
                    self.line += 1;
                    self.column = 1;
                }
                Some(c) => {
                    value.push(c);
                    self.advance();
                }
                None => break,
            }
        }

        Err(ScriptError::new(
            ErrorKind::UnterminatedString,
            Some(Span::new(start_pos, self.current_pos, start_line, start_column)),
        ))
    }

    fn scan_number(&mut self) -> Result<TokenKind> {
        let start = self.current_pos;
        let column = self.column;

        while matches!(self.peek_char(), Some(c) if c.is_ascii_digit()) {
            self.advance();
        }

        // Only treat '.' as a decimal point when a digit follows
        if self.peek_char() == Some('.') {
            let remaining = &self.source[self.current_pos..];
            if remaining.chars().nth(1).map_or(false, |c| c.is_ascii_digit()) {
                self.advance();
                while matches!(self.peek_char(), Some(c) if c.is_ascii_digit()) {
                    self.advance();
                }
            }
        }

        let text = &self.source[start..self.current_pos];
        text.parse::<f64>().map(TokenKind::Number).map_err(|_| {
            ScriptError::new(
                ErrorKind::InvalidNumber(text.to_string()),
                Some(Span::new(start, self.current_pos, self.line, column)),
            )
        })
    }

    fn scan_identifier(&mut self) -> TokenKind {
        let start = self.current_pos;

        while matches!(self.peek_char(), Some(c) if c.is_alphanumeric() || c == '_') {
            self.advance();
        }

        let text = &self.source[start..self.current_pos];
        lookup_keyword(text).unwrap_or_else(|| TokenKind::Ident(text.to_string()))
    }
}
