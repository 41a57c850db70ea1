//! Syntax tree → evaluator closures.
//!
//! Every node compiles to a closure over `(scope, locals)`. Nodes also carry
//! whether they are constant and, for the watch machinery, which leaf
//! sub-expressions their value depends on.

use std::rc::Rc;

use crate::error::{EvalError, SecurityError};
use crate::value::{Object, Value};

use super::expression::{AssignFn, EvalFn};
use super::guard::{ensure_safe_member_name, ensure_safe_object};
use super::parser::{BinOp, Expr, LogicalOp, UnaryOp};

/// Resolves a callee to `(this, function)`.
type CalleeFn = dyn Fn(&Value, Option<&Value>) -> Result<(Value, Value), EvalError>;

pub(crate) struct Compiled {
    pub eval: Rc<EvalFn>,
    pub assign: Option<Rc<AssignFn>>,
    pub constant: bool,
    /// Leaf inputs this node's value is computed from. `None` when the node
    /// has to be watched as a whole.
    pub to_watch: Option<Vec<Rc<EvalFn>>>,
}

impl Compiled {
    fn new(eval: impl Fn(&Value, Option<&Value>) -> Result<Value, EvalError> + 'static) -> Self {
        Compiled {
            eval: Rc::new(eval),
            assign: None,
            constant: false,
            to_watch: None,
        }
    }

    fn with_assign(
        mut self,
        assign: impl Fn(&Value, Value, Option<&Value>) -> Result<Value, EvalError> + 'static,
    ) -> Self {
        self.assign = Some(Rc::new(assign));
        self
    }

    fn constant_if(mut self, constant: bool) -> Self {
        self.constant = constant;
        self
    }

    fn watching(mut self, leaves: Vec<Rc<EvalFn>>) -> Self {
        self.to_watch = Some(leaves);
        self
    }

    /// The inputs a parent should watch on behalf of this node.
    fn leaves(&self) -> Vec<Rc<EvalFn>> {
        match &self.to_watch {
            Some(leaves) => leaves.clone(),
            None => vec![self.eval.clone()],
        }
    }
}

/// Compile a syntax tree. Static member names are checked here; everything
/// else is guarded at evaluation time.
pub(crate) fn compile(expr: &Expr) -> Result<Compiled, SecurityError> {
    let compiled = match expr {
        Expr::Literal(v) => {
            let v = v.clone();
            Compiled::new(move |_, _| Ok(v.clone()))
                .constant_if(true)
                .watching(Vec::new())
        }
        Expr::Array(items) => compile_array(items)?,
        Expr::Object(entries) => compile_object(entries)?,
        Expr::Path(segments) => compile_path(segments)?,
        Expr::Member(object, name) => {
            ensure_safe_member_name(name)?;
            compile_field(compile(object)?, Key::Static(name.clone()))
        }
        Expr::Index(object, key) => {
            compile_field(compile(object)?, Key::Computed(compile(key)?.eval))
        }
        Expr::Call(callee, args) => compile_call(callee, args)?,
        Expr::Unary(op, operand) => compile_unary(*op, compile(operand)?),
        Expr::Binary(op, lhs, rhs) => compile_binary(*op, compile(lhs)?, compile(rhs)?),
        Expr::Logical(op, lhs, rhs) => compile_logical(*op, compile(lhs)?, compile(rhs)?),
        Expr::Ternary(cond, then, else_) => {
            compile_ternary(compile(cond)?, compile(then)?, compile(else_)?)
        }
        Expr::Assign(target, value) => compile_assign(compile(target)?, compile(value)?),
        Expr::Statements(stmts) => compile_statements(stmts)?,
    };
    Ok(fold_constant(expr, compiled))
}

/// Pre-evaluate constant scalar nodes. Array and object literals stay
/// live so every evaluation yields a fresh container.
fn fold_constant(expr: &Expr, compiled: Compiled) -> Compiled {
    if !compiled.constant || matches!(expr, Expr::Literal(_) | Expr::Array(_) | Expr::Object(_)) {
        return compiled;
    }
    match (compiled.eval)(&Value::Undefined, None) {
        Ok(v) => Compiled::new(move |_, _| Ok(v.clone()))
            .constant_if(true)
            .watching(Vec::new()),
        Err(_) => compiled,
    }
}

// ── Literals ──────────────────────────────────────────────────────────────────

fn compile_array(items: &[Expr]) -> Result<Compiled, SecurityError> {
    let items: Vec<Compiled> = items.iter().map(compile).collect::<Result<_, _>>()?;
    let constant = items.iter().all(|c| c.constant);
    let leaves = items.iter().flat_map(Compiled::leaves).collect();
    let evals: Vec<Rc<EvalFn>> = items.into_iter().map(|c| c.eval).collect();
    Ok(Compiled::new(move |scope, locals| {
        let values = evals
            .iter()
            .map(|eval| eval(scope, locals))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Value::from(values))
    })
    .constant_if(constant)
    .watching(leaves))
}

fn compile_object(entries: &[(String, Expr)]) -> Result<Compiled, SecurityError> {
    let mut constant = true;
    let mut leaves = Vec::new();
    let mut evals = Vec::with_capacity(entries.len());
    for (key, value) in entries {
        let value = compile(value)?;
        constant &= value.constant;
        leaves.extend(value.leaves());
        evals.push((key.clone(), value.eval));
    }
    Ok(Compiled::new(move |scope, locals| {
        let object = Object::new();
        for (key, eval) in &evals {
            object.insert(key.clone(), eval(scope, locals)?);
        }
        Ok(Value::Object(object))
    })
    .constant_if(constant)
    .watching(leaves))
}

// ── Paths and members ─────────────────────────────────────────────────────────

/// Locals shadow the scope only for the first path segment.
fn path_root<'v>(scope: &'v Value, locals: Option<&'v Value>, first: &str) -> &'v Value {
    match locals {
        Some(l) if l.has_own(first) => l,
        _ => scope,
    }
}

fn read_path(segments: &[String], scope: &Value, locals: Option<&Value>) -> Result<Value, EvalError> {
    let Some((first, rest)) = segments.split_first() else {
        return Ok(Value::Undefined);
    };
    let mut current = path_root(scope, locals, first).get_member(first);
    ensure_safe_object(&current)?;
    for segment in rest {
        if current.is_nullish() {
            return Ok(Value::Undefined);
        }
        current = current.get_member(segment);
        ensure_safe_object(&current)?;
    }
    Ok(current)
}

/// Write through a path, creating missing intermediate objects.
fn write_path(
    segments: &[String],
    scope: &Value,
    value: Value,
    locals: Option<&Value>,
) -> Result<Value, EvalError> {
    let Some((last, init)) = segments.split_last() else {
        return Err(EvalError::NotAssignable);
    };
    let first = init.first().unwrap_or(last);
    let mut target = path_root(scope, locals, first).clone();
    for segment in init {
        let mut next = target.get_member(segment);
        if next.is_nullish() {
            next = Value::Object(Object::new());
            target.set_member(segment, next.clone())?;
        }
        ensure_safe_object(&next)?;
        target = next;
    }
    target.set_member(last, value.clone())?;
    Ok(value)
}

fn compile_path(segments: &[String]) -> Result<Compiled, SecurityError> {
    for segment in segments {
        ensure_safe_member_name(segment)?;
    }
    let segments: Rc<[String]> = segments.into();
    let getter = segments.clone();
    Ok(
        Compiled::new(move |scope, locals| read_path(&getter, scope, locals))
            .with_assign(move |scope, value, locals| write_path(&segments, scope, value, locals)),
    )
}

enum Key {
    Static(String),
    Computed(Rc<EvalFn>),
}

impl Key {
    fn resolve(&self, scope: &Value, locals: Option<&Value>) -> Result<String, EvalError> {
        match self {
            Key::Static(name) => Ok(name.clone()),
            Key::Computed(eval) => {
                let key = eval(scope, locals)?.property_key();
                ensure_safe_member_name(&key)?;
                Ok(key)
            }
        }
    }
}

/// `object.name` and `object[key]`.
fn compile_field(object: Compiled, key: Key) -> Compiled {
    let key = Rc::new(key);
    let object_eval = object.eval.clone();
    let getter_key = key.clone();
    let getter = move |scope: &Value, locals: Option<&Value>| {
        let target = object_eval(scope, locals)?;
        let name = getter_key.resolve(scope, locals)?;
        if target.is_nullish() {
            return Ok(Value::Undefined);
        }
        ensure_safe_object(&target)?;
        let value = target.get_member(&name);
        ensure_safe_object(&value)?;
        Ok(value)
    };

    let object_eval = object.eval;
    let object_assign = object.assign;
    Compiled::new(getter).with_assign(move |scope, value, locals| {
        let mut target = object_eval(scope, locals)?;
        let name = key.resolve(scope, locals)?;
        if target.is_nullish() {
            let Some(assign) = &object_assign else {
                return Err(EvalError::NotAssignable);
            };
            target = Value::Object(Object::new());
            assign(scope, target.clone(), locals)?;
        }
        ensure_safe_object(&target)?;
        target.set_member(&name, value.clone())?;
        Ok(value)
    })
}

// ── Calls ─────────────────────────────────────────────────────────────────────

/// Resolve the callee together with the `this` it should be invoked with.
fn compile_callee(callee: &Expr) -> Result<Rc<CalleeFn>, SecurityError> {
    let (object, key) = match callee {
        Expr::Path(segments) => match segments.split_last() {
            Some((last, init)) if !init.is_empty() => {
                ensure_safe_member_name(last)?;
                (compile_path(init)?.eval, Key::Static(last.clone()))
            }
            _ => {
                let single = compile_path(segments)?.eval;
                return Ok(Rc::new(move |scope: &Value, locals: Option<&Value>| {
                    Ok((scope.clone(), single(scope, locals)?))
                }));
            }
        },
        Expr::Member(object, name) => {
            ensure_safe_member_name(name)?;
            (compile(object)?.eval, Key::Static(name.clone()))
        }
        Expr::Index(object, key) => (compile(object)?.eval, Key::Computed(compile(key)?.eval)),
        other => {
            let eval = compile(other)?.eval;
            return Ok(Rc::new(move |scope: &Value, locals: Option<&Value>| {
                Ok((Value::Undefined, eval(scope, locals)?))
            }));
        }
    };
    Ok(Rc::new(move |scope: &Value, locals: Option<&Value>| {
        let this = object(scope, locals)?;
        let name = key.resolve(scope, locals)?;
        if this.is_nullish() {
            return Ok((Value::Undefined, Value::Undefined));
        }
        ensure_safe_object(&this)?;
        let f = this.get_member(&name);
        Ok((this, f))
    }))
}

fn compile_call(callee: &Expr, args: &[Expr]) -> Result<Compiled, SecurityError> {
    let resolve = compile_callee(callee)?;
    let args: Vec<Rc<EvalFn>> = args
        .iter()
        .map(|a| compile(a).map(|c| c.eval))
        .collect::<Result<_, _>>()?;
    let describe = callee.to_string();
    Ok(Compiled::new(move |scope, locals| {
        let (this, f) = resolve(scope, locals)?;
        ensure_safe_object(&this)?;
        ensure_safe_object(&f)?;
        let func = match f {
            Value::Function(func) => func,
            v if v.is_nullish() => return Ok(Value::Undefined),
            _ => {
                return Err(EvalError::NotAFunction {
                    callee: describe.clone(),
                })
            }
        };
        let mut values = Vec::with_capacity(args.len());
        for arg in &args {
            let v = arg(scope, locals)?;
            ensure_safe_object(&v)?;
            values.push(v);
        }
        let result = func.invoke(&this, &values)?;
        ensure_safe_object(&result)?;
        Ok(result)
    }))
}

// ── Operators ─────────────────────────────────────────────────────────────────

fn compile_unary(op: UnaryOp, operand: Compiled) -> Compiled {
    let constant = operand.constant;
    let leaves = operand.leaves();
    let eval = operand.eval;
    Compiled::new(move |scope, locals| {
        let v = eval(scope, locals)?;
        Ok(match op {
            UnaryOp::Plus => v,
            UnaryOp::Minus => Value::Number(0.0).arith_sub(&v),
            UnaryOp::Not => Value::Bool(!v.truthy()),
        })
    })
    .constant_if(constant)
    .watching(leaves)
}

fn compile_binary(op: BinOp, lhs: Compiled, rhs: Compiled) -> Compiled {
    let constant = lhs.constant && rhs.constant;
    let mut leaves = lhs.leaves();
    leaves.extend(rhs.leaves());
    let (l, r) = (lhs.eval, rhs.eval);
    Compiled::new(move |scope, locals| {
        let a = l(scope, locals)?;
        let b = r(scope, locals)?;
        Ok(apply_binary(op, &a, &b))
    })
    .constant_if(constant)
    .watching(leaves)
}

fn apply_binary(op: BinOp, a: &Value, b: &Value) -> Value {
    use std::cmp::Ordering::{Equal, Greater, Less};
    match op {
        BinOp::Add => a.arith_add(b),
        BinOp::Sub => a.arith_sub(b),
        BinOp::Mul => a.arith_mul(b),
        BinOp::Div => a.arith_div(b),
        BinOp::Rem => a.arith_rem(b),
        BinOp::Eq => Value::Bool(a.loose_eq(b)),
        BinOp::Ne => Value::Bool(!a.loose_eq(b)),
        BinOp::StrictEq => Value::Bool(a.strict_eq(b)),
        BinOp::StrictNe => Value::Bool(!a.strict_eq(b)),
        BinOp::Lt => Value::Bool(matches!(a.compare(b), Some(Less))),
        BinOp::Le => Value::Bool(matches!(a.compare(b), Some(Less | Equal))),
        BinOp::Gt => Value::Bool(matches!(a.compare(b), Some(Greater))),
        BinOp::Ge => Value::Bool(matches!(a.compare(b), Some(Greater | Equal))),
    }
}

fn compile_logical(op: LogicalOp, lhs: Compiled, rhs: Compiled) -> Compiled {
    let constant = lhs.constant && rhs.constant;
    let (l, r) = (lhs.eval, rhs.eval);
    Compiled::new(move |scope, locals| {
        let a = l(scope, locals)?;
        match (op, a.truthy()) {
            (LogicalOp::And, false) | (LogicalOp::Or, true) => Ok(a),
            _ => r(scope, locals),
        }
    })
    .constant_if(constant)
}

fn compile_ternary(cond: Compiled, then: Compiled, else_: Compiled) -> Compiled {
    let constant = cond.constant && then.constant && else_.constant;
    let (c, t, e) = (cond.eval, then.eval, else_.eval);
    Compiled::new(move |scope, locals| {
        if c(scope, locals)?.truthy() {
            t(scope, locals)
        } else {
            e(scope, locals)
        }
    })
    .constant_if(constant)
}

fn compile_assign(target: Compiled, value: Compiled) -> Compiled {
    let assign = target.assign;
    let value = value.eval;
    Compiled::new(move |scope, locals| {
        let v = value(scope, locals)?;
        match &assign {
            Some(assign) => assign(scope, v, locals),
            None => Err(EvalError::NotAssignable),
        }
    })
}

fn compile_statements(stmts: &[Expr]) -> Result<Compiled, SecurityError> {
    let compiled: Vec<Compiled> = stmts.iter().map(compile).collect::<Result<_, _>>()?;
    let constant = compiled.iter().all(|c| c.constant);
    let evals: Vec<Rc<EvalFn>> = compiled.into_iter().map(|c| c.eval).collect();
    Ok(Compiled::new(move |scope, locals| {
        let mut last = Value::Undefined;
        for eval in &evals {
            last = eval(scope, locals)?;
        }
        Ok(last)
    })
    .constant_if(constant))
}
