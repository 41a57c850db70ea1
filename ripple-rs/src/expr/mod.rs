//! Expression engine: lexer, safety guards, parser and compiler.
//!
//! ```text
//! "a.b + 1"  ──lex──▶  [Token]  ──parse──▶  Expr  ──compile──▶  Expression
//! ```

pub mod compile;
pub mod expression;
pub mod guard;
pub mod lexer;
pub mod parser;

pub use expression::{parse, Expression, ExpressionCache, IntoExpression};
