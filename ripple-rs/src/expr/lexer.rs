//! Expression tokenizer.
//!
//! Produces a flat token list. Literal tokens carry their decoded value;
//! identifiers swallow embedded dots so `a.b.c` is one path token, except
//! that a trailing `.name` immediately followed by `(` is split off so
//! method calls see their receiver.

use crate::error::LexError;
use crate::value::Value;

// ── Token ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Number,
    String,
    Identifier,
    Operator,
    Punctuation,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    /// Raw source text (string tokens keep their quotes and escapes).
    pub text: String,
    pub kind: TokenKind,
    /// Decoded value for number, string and constant-identifier tokens.
    pub value: Option<Value>,
    /// `true` for literal tokens whose value never changes.
    pub constant: bool,
    /// Character offset of the token start.
    pub pos: usize,
}

impl Token {
    /// Whether this is the operator, punctuation or identifier `text`.
    pub fn is(&self, text: &str) -> bool {
        !matches!(self.kind, TokenKind::Number | TokenKind::String) && self.text == text
    }
}

/// Identifiers that lex to constant literals.
fn constant_ident(name: &str) -> Option<Value> {
    match name {
        "null" => Some(Value::Null),
        "true" => Some(Value::Bool(true)),
        "false" => Some(Value::Bool(false)),
        "undefined" => Some(Value::Undefined),
        _ => None,
    }
}

fn is_ws(c: char) -> bool {
    matches!(c, ' ' | '\r' | '\t' | '\n' | '\u{000B}' | '\u{00A0}')
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_' || c == '$'
}

fn is_ident_char(c: char) -> bool {
    is_ident_start(c) || c.is_ascii_digit()
}

// ── Lexer ─────────────────────────────────────────────────────────────────────

struct Lexer {
    src: Vec<char>,
    pos: usize,
    tokens: Vec<Token>,
}

impl Lexer {
    fn new(src: &str) -> Self {
        Lexer {
            src: src.chars().collect(),
            pos: 0,
            tokens: Vec::new(),
        }
    }

    fn peek(&self) -> Option<char> {
        self.src.get(self.pos).copied()
    }

    fn peek2(&self) -> Option<char> {
        self.src.get(self.pos + 1).copied()
    }

    fn advance(&mut self) -> Option<char> {
        let ch = self.peek();
        if ch.is_some() {
            self.pos += 1;
        }
        ch
    }

    fn eat(&mut self, ch: char) -> bool {
        if self.peek() == Some(ch) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn skip_ws(&mut self) {
        while self.peek().is_some_and(is_ws) {
            self.pos += 1;
        }
    }

    fn slice(&self, start: usize, end: usize) -> String {
        self.src[start..end].iter().collect()
    }

    fn push(&mut self, kind: TokenKind, start: usize, end: usize, value: Option<Value>) {
        let constant = value.is_some();
        self.tokens.push(Token {
            text: self.slice(start, end),
            kind,
            value,
            constant,
            pos: start,
        });
    }

    fn read_number(&mut self) -> Result<(), LexError> {
        let start = self.pos;
        let mut text = String::new();
        let mut seen_dot = false;
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() {
                text.push(c);
            } else if c == '.' && !seen_dot {
                seen_dot = true;
                text.push(c);
            } else {
                break;
            }
            self.pos += 1;
        }
        if matches!(self.peek(), Some('e' | 'E')) {
            let exp_pos = self.pos;
            self.pos += 1;
            text.push('e');
            if let Some(sign @ ('+' | '-')) = self.peek() {
                text.push(sign);
                self.pos += 1;
            }
            if !self.peek().is_some_and(|c| c.is_ascii_digit()) {
                return Err(LexError::InvalidExponent { pos: exp_pos });
            }
            while let Some(c) = self.peek().filter(char::is_ascii_digit) {
                text.push(c);
                self.pos += 1;
            }
        }
        let n: f64 = text.parse().unwrap_or(f64::NAN);
        self.push(TokenKind::Number, start, self.pos, Some(Value::Number(n)));
        Ok(())
    }

    fn read_string(&mut self, quote: char) -> Result<(), LexError> {
        let start = self.pos;
        self.pos += 1;
        let mut decoded = String::new();
        loop {
            match self.advance() {
                None => return Err(LexError::UnterminatedString { pos: start }),
                Some(c) if c == quote => break,
                Some('\\') => {
                    let escape_pos = self.pos - 1;
                    match self.advance() {
                        None => return Err(LexError::UnterminatedString { pos: start }),
                        Some('u') => decoded.push(self.read_unicode_escape(escape_pos)?),
                        Some('n') => decoded.push('\n'),
                        Some('f') => decoded.push('\u{000C}'),
                        Some('r') => decoded.push('\r'),
                        Some('t') => decoded.push('\t'),
                        Some('v') => decoded.push('\u{000B}'),
                        Some(c) => decoded.push(c),
                    }
                }
                Some(c) => decoded.push(c),
            }
        }
        self.push(TokenKind::String, start, self.pos, Some(Value::from(decoded)));
        Ok(())
    }

    /// Exactly four hex digits after `\u`.
    fn read_unicode_escape(&mut self, escape_pos: usize) -> Result<char, LexError> {
        let invalid = LexError::InvalidUnicodeEscape { pos: escape_pos };
        let hex = self.src.get(self.pos..self.pos + 4).ok_or(invalid.clone())?;
        if !hex.iter().all(char::is_ascii_hexdigit) {
            return Err(invalid);
        }
        let hex: String = hex.iter().collect();
        let ch = u32::from_str_radix(&hex, 16)
            .ok()
            .and_then(char::from_u32)
            .ok_or(invalid)?;
        self.pos += 4;
        Ok(ch)
    }

    fn read_ident(&mut self) {
        let start = self.pos;
        let mut last_dot = None;
        while let Some(c) = self.peek() {
            if is_ident_char(c) {
                self.pos += 1;
            } else if c == '.' && self.peek2().is_some_and(is_ident_start) {
                last_dot = Some(self.pos);
                self.pos += 1;
            } else {
                break;
            }
        }
        let end = self.pos;

        // `recv.method (` lexes as `recv` `.` `method`.
        if let Some(dot) = last_dot {
            let mut look = end;
            while self.src.get(look).copied().is_some_and(is_ws) {
                look += 1;
            }
            if self.src.get(look) == Some(&'(') {
                self.push_ident(start, dot);
                self.push(TokenKind::Punctuation, dot, dot + 1, None);
                self.push_ident(dot + 1, end);
                return;
            }
        }
        self.push_ident(start, end);
    }

    fn push_ident(&mut self, start: usize, end: usize) {
        let value = constant_ident(&self.slice(start, end));
        self.push(TokenKind::Identifier, start, end, value);
    }

    fn read_operator(&mut self, first: char) -> Result<(), LexError> {
        let start = self.pos;
        self.pos += 1;
        match first {
            '=' | '!' => {
                if self.eat('=') {
                    self.eat('=');
                }
            }
            '<' | '>' => {
                self.eat('=');
            }
            '&' | '|' => {
                if !self.eat(first) {
                    return Err(LexError::UnexpectedChar { ch: first, pos: start });
                }
            }
            _ => {}
        }
        self.push(TokenKind::Operator, start, self.pos, None);
        Ok(())
    }

    fn tokenize(mut self) -> Result<Vec<Token>, LexError> {
        loop {
            self.skip_ws();
            let Some(ch) = self.peek() else { break };
            match ch {
                '0'..='9' => self.read_number()?,
                '.' if self.peek2().is_some_and(|c| c.is_ascii_digit()) => self.read_number()?,
                '\'' | '"' => self.read_string(ch)?,
                c if is_ident_start(c) => self.read_ident(),
                '.' | '[' | ']' | '(' | ')' | '{' | '}' | ',' | ':' | ';' => {
                    self.push(TokenKind::Punctuation, self.pos, self.pos + 1, None);
                    self.pos += 1;
                }
                '+' | '-' | '*' | '/' | '%' | '=' | '!' | '<' | '>' | '&' | '|' | '?' => {
                    self.read_operator(ch)?
                }
                c => return Err(LexError::UnexpectedChar { ch: c, pos: self.pos }),
            }
        }
        Ok(self.tokens)
    }
}

/// Tokenize an expression source string.
pub fn lex(text: &str) -> Result<Vec<Token>, LexError> {
    Lexer::new(text).tokenize()
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn texts(src: &str) -> Vec<String> {
        lex(src).unwrap().into_iter().map(|t| t.text).collect()
    }

    fn number(src: &str) -> f64 {
        let tokens = lex(src).unwrap();
        assert_eq!(tokens.len(), 1, "{src} should lex to one token");
        tokens[0].value.as_ref().unwrap().as_number().unwrap()
    }

    #[test]
    fn numbers() {
        assert_eq!(number("42"), 42.0);
        assert_eq!(number("4.2"), 4.2);
        assert_eq!(number(".42"), 0.42);
        assert_eq!(number("42e3"), 42000.0);
        assert_eq!(number(".42e2"), 42.0);
        assert_eq!(number("4200e-2"), 42.0);
        assert_eq!(number(".42e+2"), 42.0);
        assert_eq!(number(".42E2"), 42.0);
    }

    #[test]
    fn invalid_exponent() {
        assert_eq!(lex("42e-"), Err(LexError::InvalidExponent { pos: 2 }));
        assert!(matches!(lex("42e-a"), Err(LexError::InvalidExponent { .. })));
    }

    #[test]
    fn strings_keep_raw_text_and_decode_value() {
        let tokens = lex("\"a\\n\u{00A0}\"").unwrap();
        assert_eq!(tokens[0].text, "\"a\\n\u{00A0}\"");
        assert_eq!(tokens[0].value, Some(Value::from("a\n\u{00A0}")));
        assert!(tokens[0].constant);
    }

    #[test]
    fn escaped_quotes_and_backslashes() {
        let tokens = lex(r#"'it\'s \\ "fine"'"#).unwrap();
        assert_eq!(tokens[0].value, Some(Value::from(r#"it's \ "fine""#)));
    }

    #[test]
    fn string_errors() {
        assert!(matches!(lex(r#""abc'"#), Err(LexError::UnterminatedString { pos: 0 })));
        assert!(matches!(
            lex(r#""\u00T0""#),
            Err(LexError::InvalidUnicodeEscape { .. })
        ));
        assert!(matches!(lex(r#""\u00""#), Err(LexError::InvalidUnicodeEscape { .. })));
    }

    #[test]
    fn dotted_identifiers_are_one_token() {
        assert_eq!(texts("a.b.c"), ["a.b.c"]);
        assert_eq!(texts("a . b"), ["a", ".", "b"]);
    }

    #[test]
    fn method_call_splits_receiver() {
        assert_eq!(texts("a.b.c()"), ["a.b", ".", "c", "(", ")"]);
        assert_eq!(texts("obj.fn   ()"), ["obj", ".", "fn", "(", ")"]);
        assert_eq!(texts("fn()"), ["fn", "(", ")"]);
    }

    #[test]
    fn constant_identifiers() {
        let tokens = lex("null true false undefined other").unwrap();
        let constants: Vec<bool> = tokens.iter().map(|t| t.constant).collect();
        assert_eq!(constants, [true, true, true, true, false]);
        assert_eq!(tokens[3].value, Some(Value::Undefined));
    }

    #[test]
    fn operators() {
        assert_eq!(
            texts("a === b !== c == d != e <= f >= g && h || !i"),
            [
                "a", "===", "b", "!==", "c", "==", "d", "!=", "e", "<=", "f", ">=", "g", "&&",
                "h", "||", "!", "i"
            ]
        );
        assert_eq!(texts("a=1;b?c:d"), ["a", "=", "1", ";", "b", "?", "c", ":", "d"]);
    }

    #[test]
    fn whitespace_variants_are_skipped() {
        assert_eq!(texts(" \n42\u{00A0}"), ["42"]);
    }

    #[test]
    fn unexpected_characters() {
        assert_eq!(lex("a # b"), Err(LexError::UnexpectedChar { ch: '#', pos: 2 }));
        assert_eq!(lex("a & b"), Err(LexError::UnexpectedChar { ch: '&', pos: 2 }));
    }
}
