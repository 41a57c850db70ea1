//! Recursive-descent parser producing the expression syntax tree.
//!
//! Precedence (lowest → highest):
//!   statements  →  assignment  →  ternary  →  or  →  and  →  equality  →
//!   relational  →  additive  →  multiplicative  →  unary  →  postfix  →  primary

use std::fmt;

use crate::error::ParseError;
use crate::value::Value;

use super::lexer::{Token, TokenKind};

// ── AST ───────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Plus,
    Minus,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    Ne,
    StrictEq,
    StrictNe,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalOp {
    And,
    Or,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Array(Vec<Expr>),
    Object(Vec<(String, Expr)>),
    /// Identifier path `a.b.c`, resolved against locals then scope.
    Path(Vec<String>),
    Member(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    Call(Box<Expr>, Vec<Expr>),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    Logical(LogicalOp, Box<Expr>, Box<Expr>),
    Ternary(Box<Expr>, Box<Expr>, Box<Expr>),
    Assign(Box<Expr>, Box<Expr>),
    Statements(Vec<Expr>),
}

impl Expr {
    /// Whether this node denotes a writable location.
    pub fn is_assignable(&self) -> bool {
        matches!(self, Expr::Path(_) | Expr::Member(..) | Expr::Index(..))
    }

    /// Literal primitive, array or object.
    pub fn is_literal(&self) -> bool {
        matches!(self, Expr::Literal(_) | Expr::Array(_) | Expr::Object(_))
    }

    /// Height of the tree; a leaf is 1.
    pub fn depth(&self) -> usize {
        let children = match self {
            Expr::Literal(_) | Expr::Path(_) => return 1,
            Expr::Array(items) | Expr::Statements(items) => items.iter().map(Expr::depth).max(),
            Expr::Object(entries) => entries.iter().map(|(_, v)| v.depth()).max(),
            Expr::Member(object, _) | Expr::Unary(_, object) => Some(object.depth()),
            Expr::Call(callee, args) => args.iter().map(Expr::depth).chain([callee.depth()]).max(),
            Expr::Index(l, r) | Expr::Binary(_, l, r) | Expr::Logical(_, l, r) | Expr::Assign(l, r) => {
                Some(l.depth().max(r.depth()))
            }
            Expr::Ternary(c, t, e) => Some(c.depth().max(t.depth()).max(e.depth())),
        };
        1 + children.unwrap_or(0)
    }
}

impl UnaryOp {
    fn symbol(self) -> &'static str {
        match self {
            UnaryOp::Plus => "+",
            UnaryOp::Minus => "-",
            UnaryOp::Not => "!",
        }
    }
}

impl BinOp {
    fn symbol(self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Rem => "%",
            BinOp::Eq => "==",
            BinOp::Ne => "!=",
            BinOp::StrictEq => "===",
            BinOp::StrictNe => "!==",
            BinOp::Lt => "<",
            BinOp::Le => "<=",
            BinOp::Gt => ">",
            BinOp::Ge => ">=",
        }
    }
}

fn write_list(f: &mut fmt::Formatter<'_>, items: &[Expr]) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{item}")?;
    }
    Ok(())
}

/// Renders a normalized form of the source, used in error messages.
impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Literal(Value::Str(s)) => write!(f, "{s:?}"),
            Expr::Literal(v) => write!(f, "{v}"),
            Expr::Array(items) => {
                f.write_str("[")?;
                write_list(f, items)?;
                f.write_str("]")
            }
            Expr::Object(entries) => {
                f.write_str("{")?;
                for (i, (k, v)) in entries.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{k}: {v}")?;
                }
                f.write_str("}")
            }
            Expr::Path(segments) => f.write_str(&segments.join(".")),
            Expr::Member(object, name) => write!(f, "{object}.{name}"),
            Expr::Index(object, key) => write!(f, "{object}[{key}]"),
            Expr::Call(callee, args) => {
                write!(f, "{callee}(")?;
                write_list(f, args)?;
                f.write_str(")")
            }
            Expr::Unary(op, operand) => write!(f, "{}{operand}", op.symbol()),
            Expr::Binary(op, l, r) => write!(f, "({l} {} {r})", op.symbol()),
            Expr::Logical(LogicalOp::And, l, r) => write!(f, "({l} && {r})"),
            Expr::Logical(LogicalOp::Or, l, r) => write!(f, "({l} || {r})"),
            Expr::Ternary(c, t, e) => write!(f, "({c} ? {t} : {e})"),
            Expr::Assign(target, value) => write!(f, "{target} = {value}"),
            Expr::Statements(stmts) => {
                for (i, stmt) in stmts.iter().enumerate() {
                    if i > 0 {
                        f.write_str("; ")?;
                    }
                    write!(f, "{stmt}")?;
                }
                Ok(())
            }
        }
    }
}

// ── Parser ────────────────────────────────────────────────────────────────────

/// Deepest syntax tree, and deepest parser recursion, accepted.
pub const MAX_DEPTH: usize = 100;

pub struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
    nesting: usize,
}

impl<'a> Parser<'a> {
    pub fn new(tokens: &'a [Token]) -> Self {
        Parser {
            tokens,
            pos: 0,
            nesting: 0,
        }
    }

    /// Run `f` one recursion level down.
    fn nested<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T, ParseError>) -> Result<T, ParseError> {
        if self.nesting >= MAX_DEPTH {
            return Err(ParseError::TooDeep { max: MAX_DEPTH });
        }
        self.nesting += 1;
        let result = f(self);
        self.nesting -= 1;
        result
    }

    fn peek(&self) -> Option<&'a Token> {
        self.tokens.get(self.pos)
    }

    fn peek_is(&self, text: &str) -> bool {
        self.peek().is_some_and(|t| t.is(text))
    }

    fn advance(&mut self) -> Option<&'a Token> {
        let t = self.tokens.get(self.pos);
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn eat(&mut self, text: &str) -> bool {
        if self.peek_is(text) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn eat_any(&mut self, ops: &[&str]) -> Option<&'a Token> {
        let t = self.peek()?;
        if ops.iter().any(|op| t.is(op)) {
            self.pos += 1;
            Some(t)
        } else {
            None
        }
    }

    fn expect(&mut self, text: &str) -> Result<(), ParseError> {
        match self.advance() {
            Some(t) if t.is(text) => Ok(()),
            Some(t) => Err(ParseError::Expected {
                expected: text.into(),
                found: t.text.clone(),
                pos: t.pos,
            }),
            None => Err(ParseError::UnexpectedEnd {
                expected: text.into(),
            }),
        }
    }

    /// Parse the whole token stream.
    pub fn parse(mut self) -> Result<Expr, ParseError> {
        let expr = self.parse_statements()?;
        match self.peek() {
            Some(t) => Err(ParseError::UnexpectedToken {
                found: t.text.clone(),
                pos: t.pos,
            }),
            None => Ok(expr),
        }
    }

    // ── Grammar ───────────────────────────────────────────────────────────────

    fn parse_statements(&mut self) -> Result<Expr, ParseError> {
        let mut stmts = Vec::new();
        loop {
            if self.peek().is_none() || self.peek_is(")") {
                break;
            }
            if self.eat(";") {
                continue;
            }
            stmts.push(self.parse_assignment()?);
            if !self.eat(";") {
                break;
            }
        }
        match stmts.len() {
            0 => Ok(Expr::Literal(Value::Undefined)),
            1 => Ok(stmts.remove(0)),
            _ => bounded(Expr::Statements(stmts)),
        }
    }

    fn parse_assignment(&mut self) -> Result<Expr, ParseError> {
        self.nested(Self::parse_assignment_inner)
    }

    fn parse_assignment_inner(&mut self) -> Result<Expr, ParseError> {
        let lhs = self.parse_ternary()?;
        if !self.eat("=") {
            return Ok(lhs);
        }
        if !lhs.is_assignable() {
            return Err(ParseError::NotAssignable {
                text: lhs.to_string(),
            });
        }
        let rhs = self.parse_assignment()?;
        bounded(Expr::Assign(Box::new(lhs), Box::new(rhs)))
    }

    fn parse_ternary(&mut self) -> Result<Expr, ParseError> {
        let cond = self.parse_or()?;
        if !self.eat("?") {
            return Ok(cond);
        }
        let then = self.parse_assignment()?;
        self.expect(":")?;
        let else_ = self.parse_assignment()?;
        bounded(Expr::Ternary(
            Box::new(cond),
            Box::new(then),
            Box::new(else_),
        ))
    }

    fn parse_or(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_and()?;
        while self.eat("||") {
            let rhs = self.parse_and()?;
            lhs = bounded(Expr::Logical(LogicalOp::Or, Box::new(lhs), Box::new(rhs)))?;
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_equality()?;
        while self.eat("&&") {
            let rhs = self.parse_equality()?;
            lhs = bounded(Expr::Logical(LogicalOp::And, Box::new(lhs), Box::new(rhs)))?;
        }
        Ok(lhs)
    }

    fn parse_equality(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_relational()?;
        while let Some(t) = self.eat_any(&["==", "!=", "===", "!=="]) {
            let op = match t.text.as_str() {
                "==" => BinOp::Eq,
                "!=" => BinOp::Ne,
                "===" => BinOp::StrictEq,
                _ => BinOp::StrictNe,
            };
            let rhs = self.parse_relational()?;
            lhs = bounded(Expr::Binary(op, Box::new(lhs), Box::new(rhs)))?;
        }
        Ok(lhs)
    }

    fn parse_relational(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_additive()?;
        while let Some(t) = self.eat_any(&["<", ">", "<=", ">="]) {
            let op = match t.text.as_str() {
                "<" => BinOp::Lt,
                ">" => BinOp::Gt,
                "<=" => BinOp::Le,
                _ => BinOp::Ge,
            };
            let rhs = self.parse_additive()?;
            lhs = bounded(Expr::Binary(op, Box::new(lhs), Box::new(rhs)))?;
        }
        Ok(lhs)
    }

    fn parse_additive(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_multiplicative()?;
        while let Some(t) = self.eat_any(&["+", "-"]) {
            let op = if t.is("+") { BinOp::Add } else { BinOp::Sub };
            let rhs = self.parse_multiplicative()?;
            lhs = bounded(Expr::Binary(op, Box::new(lhs), Box::new(rhs)))?;
        }
        Ok(lhs)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_unary()?;
        while let Some(t) = self.eat_any(&["*", "/", "%"]) {
            let op = match t.text.as_str() {
                "*" => BinOp::Mul,
                "/" => BinOp::Div,
                _ => BinOp::Rem,
            };
            let rhs = self.parse_unary()?;
            lhs = bounded(Expr::Binary(op, Box::new(lhs), Box::new(rhs)))?;
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr, ParseError> {
        if let Some(t) = self.eat_any(&["+", "-", "!"]) {
            let op = match t.text.as_str() {
                "+" => UnaryOp::Plus,
                "-" => UnaryOp::Minus,
                _ => UnaryOp::Not,
            };
            let operand = self.nested(Self::parse_unary)?;
            return bounded(Expr::Unary(op, Box::new(operand)));
        }
        let primary = self.parse_primary()?;
        self.parse_postfix(primary)
    }

    fn parse_postfix(&mut self, mut expr: Expr) -> Result<Expr, ParseError> {
        loop {
            if self.eat(".") {
                let name = self.expect_identifier()?;
                // `a . b.c` arrives as a dotted identifier token.
                for segment in name.split('.') {
                    expr = bounded(Expr::Member(Box::new(expr), segment.to_string()))?;
                }
            } else if self.eat("[") {
                let key = self.parse_assignment()?;
                self.expect("]")?;
                expr = bounded(Expr::Index(Box::new(expr), Box::new(key)))?;
            } else if self.eat("(") {
                let args = self.parse_list(")")?;
                expr = bounded(Expr::Call(Box::new(expr), args))?;
            } else {
                return Ok(expr);
            }
        }
    }

    fn parse_primary(&mut self) -> Result<Expr, ParseError> {
        let Some(token) = self.advance() else {
            return Err(ParseError::UnexpectedEnd {
                expected: "an expression".into(),
            });
        };
        match token.kind {
            TokenKind::Number | TokenKind::String => {
                Ok(Expr::Literal(token.value.clone().unwrap_or_default()))
            }
            TokenKind::Identifier => match &token.value {
                Some(v) if token.constant => Ok(Expr::Literal(v.clone())),
                _ => Ok(Expr::Path(token.text.split('.').map(String::from).collect())),
            },
            _ if token.is("(") => {
                let inner = self.parse_statements()?;
                self.expect(")")?;
                Ok(inner)
            }
            _ if token.is("[") => bounded(Expr::Array(self.parse_list("]")?)),
            _ if token.is("{") => self.parse_object(),
            _ => Err(ParseError::UnexpectedToken {
                found: token.text.clone(),
                pos: token.pos,
            }),
        }
    }

    /// Comma-separated assignments up to `close`; a trailing comma is allowed.
    fn parse_list(&mut self, close: &str) -> Result<Vec<Expr>, ParseError> {
        let mut items = Vec::new();
        loop {
            if self.peek_is(close) {
                break;
            }
            items.push(self.parse_assignment()?);
            if !self.eat(",") {
                break;
            }
        }
        self.expect(close)?;
        Ok(items)
    }

    fn parse_object(&mut self) -> Result<Expr, ParseError> {
        let mut entries = Vec::new();
        loop {
            if self.peek_is("}") {
                break;
            }
            let key = self.parse_object_key()?;
            self.expect(":")?;
            entries.push((key, self.parse_assignment()?));
            if !self.eat(",") {
                break;
            }
        }
        self.expect("}")?;
        bounded(Expr::Object(entries))
    }

    fn parse_object_key(&mut self) -> Result<String, ParseError> {
        match self.advance() {
            Some(t) if t.kind == TokenKind::Identifier => Ok(t.text.clone()),
            Some(t) if matches!(t.kind, TokenKind::String | TokenKind::Number) => Ok(t
                .value
                .as_ref()
                .map(Value::property_key)
                .unwrap_or_else(|| t.text.clone())),
            Some(t) => Err(ParseError::UnexpectedToken {
                found: t.text.clone(),
                pos: t.pos,
            }),
            None => Err(ParseError::UnexpectedEnd {
                expected: "}".into(),
            }),
        }
    }

    fn expect_identifier(&mut self) -> Result<&'a str, ParseError> {
        match self.advance() {
            Some(t) if t.kind == TokenKind::Identifier => Ok(&t.text),
            Some(t) => Err(ParseError::Expected {
                expected: "identifier".into(),
                found: t.text.clone(),
                pos: t.pos,
            }),
            None => Err(ParseError::UnexpectedEnd {
                expected: "identifier".into(),
            }),
        }
    }
}

/// Reject a freshly built node whose tree is too deep. Its children were
/// checked when they were built, so `depth` never recurses past the limit.
fn bounded(expr: Expr) -> Result<Expr, ParseError> {
    if expr.depth() > MAX_DEPTH {
        return Err(ParseError::TooDeep { max: MAX_DEPTH });
    }
    Ok(expr)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::lexer::lex;

    fn ast(src: &str) -> Expr {
        let tokens = lex(src).unwrap();
        Parser::new(&tokens).parse().unwrap()
    }

    fn parse_err(src: &str) -> ParseError {
        let tokens = lex(src).unwrap();
        Parser::new(&tokens).parse().unwrap_err()
    }

    fn path(segments: &[&str]) -> Expr {
        Expr::Path(segments.iter().map(|s| s.to_string()).collect())
    }

    #[test]
    fn empty_source_is_undefined() {
        assert_eq!(ast(""), Expr::Literal(Value::Undefined));
        assert_eq!(ast("  ;; "), Expr::Literal(Value::Undefined));
    }

    #[test]
    fn dotted_path() {
        assert_eq!(ast("a.b.c"), path(&["a", "b", "c"]));
    }

    #[test]
    fn method_call_has_member_callee() {
        let expected = Expr::Call(
            Box::new(Expr::Member(Box::new(path(&["a", "b"])), "c".into())),
            vec![Expr::Literal(Value::from(1))],
        );
        assert_eq!(ast("a.b.c(1)"), expected);
    }

    #[test]
    fn precedence_renders_through_display() {
        assert_eq!(ast("2 + 3 * 5").to_string(), "(2 + (3 * 5))");
        assert_eq!(ast("false && true || true").to_string(), "((false && true) || true)");
        assert_eq!(ast("2 == \"2\" > 2").to_string(), "(2 == (\"2\" > 2))");
        assert_eq!(ast("-a.b").to_string(), "-a.b");
        assert_eq!(ast("a ? b : c ? d : e").to_string(), "(a ? b : (c ? d : e))");
    }

    #[test]
    fn postfix_chain() {
        assert_eq!(
            ast(r#"a["b"].c[d](1)()"#).to_string(),
            r#"a["b"].c[d](1)()"#
        );
    }

    #[test]
    fn literals_allow_trailing_commas() {
        assert_eq!(
            ast("[1, 2, ]"),
            Expr::Array(vec![Expr::Literal(Value::from(1)), Expr::Literal(Value::from(2))])
        );
        assert_eq!(
            ast(r#"{a: 1, "b c": 2, 3: x,}"#).to_string(),
            "{a: 1, b c: 2, 3: x}"
        );
    }

    #[test]
    fn statements() {
        let Expr::Statements(stmts) = ast("a = 1; b = 2; a + b") else {
            panic!("expected statements");
        };
        assert_eq!(stmts.len(), 3);
        assert!(matches!(stmts[0], Expr::Assign(..)));
    }

    #[test]
    fn assignment_is_right_associative() {
        assert_eq!(ast("a = b = 1").to_string(), "a = b = 1");
    }

    #[test]
    fn non_assignable_targets() {
        assert_eq!(
            parse_err("1 = 2"),
            ParseError::NotAssignable { text: "1".into() }
        );
        assert!(matches!(parse_err("f() = 2"), ParseError::NotAssignable { .. }));
    }

    #[test]
    fn deep_nesting_is_rejected() {
        let too_deep = ParseError::TooDeep { max: MAX_DEPTH };
        let parens = format!("{}1{}", "(".repeat(50_000), ")".repeat(50_000));
        assert_eq!(parse_err(&parens), too_deep);
        let brackets = format!("{}{}", "[".repeat(50_000), "]".repeat(50_000));
        assert_eq!(parse_err(&brackets), too_deep);
        let negations = format!("{}a", "!".repeat(50_000));
        assert_eq!(parse_err(&negations), too_deep);
        let sum = vec!["1"; 10_000].join(" + ");
        assert_eq!(parse_err(&sum), too_deep);
        let calls = "f".to_string() + &"()".repeat(10_000);
        assert_eq!(parse_err(&calls), too_deep);
    }

    #[test]
    fn moderate_nesting_parses() {
        let parens = format!("{}1{}", "(".repeat(50), ")".repeat(50));
        assert_eq!(ast(&parens), Expr::Literal(Value::from(1)));
        let sum = vec!["a"; 50].join(" + ");
        assert_eq!(ast(&sum).depth(), 50);
    }

    #[test]
    fn unexpected_tokens() {
        assert!(matches!(parse_err("a b"), ParseError::UnexpectedToken { pos: 2, .. }));
        assert!(matches!(parse_err("[1, 2"), ParseError::UnexpectedEnd { .. }));
        assert!(matches!(parse_err("a ? b"), ParseError::UnexpectedEnd { .. }));
        assert!(matches!(parse_err(")"), ParseError::UnexpectedToken { .. }));
        assert!(matches!(parse_err("a."), ParseError::UnexpectedEnd { .. }));
    }
}
