//! Compiled expressions and the compile cache.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use crate::error::{Error, EvalError};
use crate::scope::Scope;
use crate::value::Value;

use super::compile::compile;
use super::lexer::lex;
use super::parser::Parser;

/// Evaluator signature: `(scope, locals) -> value`.
pub type EvalFn = dyn Fn(&Value, Option<&Value>) -> Result<Value, EvalError>;

/// Assignment signature: `(scope, value, locals) -> value`.
pub type AssignFn = dyn Fn(&Value, Value, Option<&Value>) -> Result<Value, EvalError>;

/// Marker that flags a one-time expression.
const ONE_TIME_PREFIX: &str = "::";

// ── Expression ────────────────────────────────────────────────────────────────

/// A compiled, reusable evaluator plus its metadata. Cloning is cheap and
/// shares the compiled closures.
#[derive(Clone)]
pub struct Expression {
    source: Rc<str>,
    eval: Rc<EvalFn>,
    assign: Option<Rc<AssignFn>>,
    constant: bool,
    literal: bool,
    one_time: bool,
    inputs: Option<Rc<[Expression]>>,
}

impl Expression {
    /// Wrap an evaluator closure. Such expressions are never constant.
    pub fn from_fn(
        f: impl Fn(&Value, Option<&Value>) -> Result<Value, EvalError> + 'static,
    ) -> Self {
        Expression {
            source: Rc::from(""),
            eval: Rc::new(f),
            assign: None,
            constant: false,
            literal: false,
            one_time: false,
            inputs: None,
        }
    }

    /// Wrap a closure over the owning scope, the usual shape of a watch
    /// function. Evaluated against anything but a scope it yields `undefined`.
    pub fn from_scope_fn(f: impl Fn(&Scope) -> Result<Value, EvalError> + 'static) -> Self {
        Expression::from_fn(move |scope, _| match scope {
            Value::Scope(s) => f(s),
            _ => Ok(Value::Undefined),
        })
    }

    /// Evaluate against `scope`, consulting `locals` first for the leading
    /// identifier of each path.
    pub fn call(&self, scope: &Value, locals: Option<&Value>) -> Result<Value, EvalError> {
        (self.eval)(scope, locals)
    }

    pub(crate) fn eval_in(&self, scope: &Scope) -> Result<Value, EvalError> {
        self.call(&Value::Scope(scope.clone()), None)
    }

    /// Write `value` into the location this expression denotes.
    pub fn assign(
        &self,
        scope: &Value,
        value: Value,
        locals: Option<&Value>,
    ) -> Result<Value, EvalError> {
        match &self.assign {
            Some(assign) => assign(scope, value, locals),
            None => Err(EvalError::NotAssignable),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn is_assignable(&self) -> bool {
        self.assign.is_some()
    }

    /// The value can never change between evaluations.
    pub fn is_constant(&self) -> bool {
        self.constant
    }

    /// A literal primitive, array or object.
    pub fn is_literal(&self) -> bool {
        self.literal
    }

    /// Source carried the `::` marker.
    pub fn is_one_time(&self) -> bool {
        self.one_time
    }

    /// Leaf sub-expressions the value is computed from, when the expression
    /// decomposes into any.
    pub fn inputs(&self) -> Option<&[Expression]> {
        self.inputs.as_deref()
    }
}

impl fmt::Debug for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Expression")
            .field("source", &self.source)
            .field("constant", &self.constant)
            .field("literal", &self.literal)
            .field("one_time", &self.one_time)
            .field("inputs", &self.inputs.as_ref().map(|i| i.len()))
            .finish()
    }
}

/// Compile expression source. A leading `::` marks a one-time expression;
/// empty source compiles to a constant `undefined`.
pub fn parse(text: &str) -> Result<Expression, Error> {
    let trimmed = text.trim();
    let (one_time, body) = match trimmed.strip_prefix(ONE_TIME_PREFIX) {
        Some(rest) => (true, rest),
        None => (false, trimmed),
    };
    let tokens = lex(body)?;
    let ast = Parser::new(&tokens).parse()?;
    let compiled = compile(&ast)?;

    let source: Rc<str> = Rc::from(text);
    let inputs = compiled.to_watch.map(|leaves| {
        leaves
            .into_iter()
            .map(|eval| Expression {
                source: source.clone(),
                eval,
                assign: None,
                constant: false,
                literal: false,
                one_time: false,
                inputs: None,
            })
            .collect::<Rc<[_]>>()
    });
    Ok(Expression {
        source,
        eval: compiled.eval,
        assign: compiled.assign,
        constant: compiled.constant,
        literal: ast.is_literal(),
        one_time,
        inputs,
    })
}

// ── Cache ─────────────────────────────────────────────────────────────────────

/// Memoizes compiled expressions by exact source text.
#[derive(Debug)]
pub struct ExpressionCache {
    enabled: bool,
    entries: RefCell<HashMap<String, Expression>>,
}

impl ExpressionCache {
    pub fn new(enabled: bool) -> Self {
        ExpressionCache {
            enabled,
            entries: RefCell::new(HashMap::new()),
        }
    }

    pub fn compile(&self, text: &str) -> Result<Expression, Error> {
        if !self.enabled {
            return parse(text);
        }
        if let Some(hit) = self.entries.borrow().get(text) {
            return Ok(hit.clone());
        }
        let expr = parse(text)?;
        self.entries
            .borrow_mut()
            .insert(text.to_string(), expr.clone());
        Ok(expr)
    }

    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }
}

// ── IntoExpression ────────────────────────────────────────────────────────────

/// Anything a scope operation accepts where an expression is expected:
/// source text or an already compiled [`Expression`].
pub trait IntoExpression {
    fn into_expression(self, cache: &ExpressionCache) -> Result<Expression, Error>;
}

impl IntoExpression for Expression {
    fn into_expression(self, _: &ExpressionCache) -> Result<Expression, Error> {
        Ok(self)
    }
}

impl IntoExpression for &Expression {
    fn into_expression(self, _: &ExpressionCache) -> Result<Expression, Error> {
        Ok(self.clone())
    }
}

impl IntoExpression for &str {
    fn into_expression(self, cache: &ExpressionCache) -> Result<Expression, Error> {
        cache.compile(self)
    }
}

impl IntoExpression for String {
    fn into_expression(self, cache: &ExpressionCache) -> Result<Expression, Error> {
        cache.compile(&self)
    }
}

impl IntoExpression for &String {
    fn into_expression(self, cache: &ExpressionCache) -> Result<Expression, Error> {
        cache.compile(self)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
