//! Expression compiler and dirty-checking scope runtime.
//!
//! Template bindings are small expressions (`user.name`, `items.length > 0`,
//! `total = price * qty`) evaluated against a [`Scope`]. Scopes form a tree;
//! a digest re-evaluates every watched expression until nothing changes and
//! calls listeners for the values that did.
//!
//! ```rust,ignore
//! use ripple::{Scope, Value};
//!
//! let scope = Scope::new();
//! scope.set("price", 3);
//! scope.set("qty", 2);
//! scope.watch("price * qty", |total, _, _| {
//!     println!("total is {total}");
//!     Ok(())
//! }, false)?;
//! scope.digest()?;
//! ```

pub mod config;
pub mod error;
pub mod expr;
pub mod scheduler;
pub mod scope;
pub mod value;

pub use config::DigestConfig;
pub use error::{DigestError, Error, EvalError, LexError, ParseError, SecurityError};
pub use expr::{parse, Expression, ExpressionCache, IntoExpression};
pub use scheduler::Scheduler;
pub use scope::{Deregistration, Event, Phase, Scope};
pub use value::{Array, Function, FunctionKind, Object, Value};
