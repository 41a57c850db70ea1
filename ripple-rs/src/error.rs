//! Error taxonomy for compiling, evaluating and digesting expressions.
//!
//! Each failure class has its own enum so callers can match on exactly what
//! went wrong; [`Error`] wraps them all for the public scope API.

use thiserror::Error;

use crate::scope::Phase;

/// Malformed source text rejected by the lexer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LexError {
    #[error("unexpected next character '{ch}' at column {pos}")]
    UnexpectedChar { ch: char, pos: usize },

    #[error("unmatched quote starting at column {pos}")]
    UnterminatedString { pos: usize },

    #[error("invalid unicode escape at column {pos}")]
    InvalidUnicodeEscape { pos: usize },

    #[error("invalid exponent at column {pos}")]
    InvalidExponent { pos: usize },
}

/// A token stream that does not match the expression grammar.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("unexpected token '{found}' at column {pos}")]
    UnexpectedToken { found: String, pos: usize },

    #[error("expected '{expected}' but reached the end of the expression")]
    UnexpectedEnd { expected: String },

    #[error("expected '{expected}' but found '{found}' at column {pos}")]
    Expected {
        expected: String,
        found: String,
        pos: usize,
    },

    #[error("'{text}' is not assignable")]
    NotAssignable { text: String },

    #[error("expression nests deeper than {max} levels")]
    TooDeep { max: usize },
}

/// A guard violation: the expression tried to reach a capability-bearing
/// member, object or function.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SecurityError {
    #[error("referencing \"{name}\" in expressions is disallowed")]
    Member { name: String },

    #[error("referencing the global object in expressions is disallowed")]
    Window,

    #[error("referencing DOM nodes in expressions is disallowed")]
    DomNode,

    #[error("referencing a constructor in expressions is disallowed")]
    Constructor,

    #[error("referencing {name} in expressions is disallowed")]
    Invoker { name: &'static str },
}

/// Failure while running a compiled expression or a user callback.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EvalError {
    #[error(transparent)]
    Security(#[from] SecurityError),

    #[error("{callee} is not a function")]
    NotAFunction { callee: String },

    #[error("expression is not assignable")]
    NotAssignable,

    #[error("invalid array length {length}")]
    InvalidArrayLength { length: f64 },

    /// Raised by user code (watch functions, listeners, native functions).
    #[error("{0}")]
    Raised(String),
}

impl EvalError {
    /// Build a user-level failure.
    pub fn raise(message: impl Into<String>) -> Self {
        EvalError::Raised(message.into())
    }
}

/// Failure of the digest scheduler itself.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DigestError {
    #[error("{ttl} digest iterations reached")]
    IterationLimit { ttl: usize },

    #[error("{phase} already in progress")]
    PhaseInProgress { phase: Phase },
}

/// Umbrella error returned by the public scope and compile API.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    #[error(transparent)]
    Lex(#[from] LexError),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Security(#[from] SecurityError),

    #[error(transparent)]
    Eval(#[from] EvalError),

    #[error(transparent)]
    Digest(#[from] DigestError),
}

impl Error {
    /// `true` for guard violations, whether caught while compiling a static
    /// member name or while evaluating.
    pub fn is_security(&self) -> bool {
        matches!(self, Error::Security(_) | Error::Eval(EvalError::Security(_)))
    }
}
