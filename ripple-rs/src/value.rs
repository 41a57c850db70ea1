//! Runtime value model shared by expressions and scopes.
//!
//! Expressions are dynamically typed. Primitives compare by value; arrays,
//! objects, functions and scopes are shared handles that compare by
//! identity, which is what lets the digest loop tell "the same array,
//! mutated" apart from "a new array".

use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::rc::Rc;

use indexmap::IndexMap;

use crate::error::EvalError;
use crate::scope::Scope;

/// Signature of a native function callable from expressions: `(this, args)`.
pub type NativeFn = dyn Fn(&Value, &[Value]) -> Result<Value, EvalError>;

// ── Value ─────────────────────────────────────────────────────────────────────

/// A dynamically typed expression value.
#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    Str(Rc<str>),
    Array(Array),
    Object(Object),
    Function(Function),
    Scope(Scope),
}

impl Value {
    pub fn str(s: impl AsRef<str>) -> Self {
        Value::Str(Rc::from(s.as_ref()))
    }

    pub fn array(items: impl IntoIterator<Item = Value>) -> Self {
        Value::Array(Array::from_vec(items.into_iter().collect()))
    }

    pub fn object<K: Into<String>>(entries: impl IntoIterator<Item = (K, Value)>) -> Self {
        Value::Object(entries.into_iter().collect())
    }

    /// Wrap a native closure as a callable value.
    pub fn function(
        name: impl Into<String>,
        f: impl Fn(&Value, &[Value]) -> Result<Value, EvalError> + 'static,
    ) -> Self {
        Value::Function(Function::new(name, f))
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }

    pub fn is_defined(&self) -> bool {
        !self.is_undefined()
    }

    /// `null` or `undefined`.
    pub fn is_nullish(&self) -> bool {
        matches!(self, Value::Undefined | Value::Null)
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&Array> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&Object> {
        match self {
            Value::Object(o) => Some(o),
            _ => None,
        }
    }

    pub fn as_function(&self) -> Option<&Function> {
        match self {
            Value::Function(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_scope(&self) -> Option<&Scope> {
        match self {
            Value::Scope(s) => Some(s),
            _ => None,
        }
    }

    /// Name of the type, for diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::Str(_) => "string",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
            Value::Function(_) => "function",
            Value::Scope(_) => "scope",
        }
    }

    // ── Coercions ─────────────────────────────────────────────────────────────

    /// JS truthiness: `undefined`, `null`, `false`, `0`, `NaN` and `""` are falsy.
    pub fn truthy(&self) -> bool {
        match self {
            Value::Undefined | Value::Null => false,
            Value::Bool(b) => *b,
            Value::Number(n) => *n != 0.0 && !n.is_nan(),
            Value::Str(s) => !s.is_empty(),
            _ => true,
        }
    }

    pub fn to_number(&self) -> f64 {
        match self {
            Value::Undefined => f64::NAN,
            Value::Null => 0.0,
            Value::Bool(b) => f64::from(u8::from(*b)),
            Value::Number(n) => *n,
            Value::Str(s) => parse_numeric_str(s),
            Value::Array(_) => parse_numeric_str(&self.to_js_string()),
            Value::Object(_) | Value::Function(_) | Value::Scope(_) => f64::NAN,
        }
    }

    pub fn to_js_string(&self) -> String {
        self.to_js_string_in(&mut Vec::new())
    }

    /// `joining` holds the arrays currently being joined; an array nested
    /// inside itself joins as the empty string.
    fn to_js_string_in(&self, joining: &mut Vec<usize>) -> String {
        match self {
            Value::Undefined => "undefined".into(),
            Value::Null => "null".into(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => format_number(*n),
            Value::Str(s) => s.to_string(),
            Value::Array(a) => {
                if joining.contains(&a.addr()) {
                    return String::new();
                }
                joining.push(a.addr());
                let joined = a
                    .to_vec()
                    .iter()
                    .map(|v| if v.is_nullish() { String::new() } else { v.to_js_string_in(joining) })
                    .collect::<Vec<_>>()
                    .join(",");
                joining.pop();
                joined
            }
            Value::Object(_) | Value::Scope(_) => "[object Object]".into(),
            Value::Function(f) => format!("function {}() {{ [native code] }}", f.name()),
        }
    }

    /// Key used when this value indexes into an object (`obj[key]`).
    pub fn property_key(&self) -> String {
        match self {
            Value::Str(s) => s.to_string(),
            other => other.to_js_string(),
        }
    }

    // ── Equality ──────────────────────────────────────────────────────────────

    /// Identity comparison used by watchers: reference identity for shared
    /// values, value identity for primitives, and `NaN` equal to `NaN`.
    pub fn identical(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Number(a), Value::Number(b)) => a == b || (a.is_nan() && b.is_nan()),
            _ => self.strict_eq(other),
        }
    }

    /// `===`
    pub fn strict_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Undefined, Value::Undefined) | (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a.ptr_eq(b),
            (Value::Object(a), Value::Object(b)) => a.ptr_eq(b),
            (Value::Function(a), Value::Function(b)) => a.ptr_eq(b),
            (Value::Scope(a), Value::Scope(b)) => a.ptr_eq(b),
            _ => false,
        }
    }

    /// `==`
    pub fn loose_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (a, b) if a.is_nullish() || b.is_nullish() => a.is_nullish() && b.is_nullish(),
            (Value::Number(_), Value::Str(_)) | (Value::Str(_), Value::Number(_)) => {
                self.to_number() == other.to_number()
            }
            (Value::Bool(b), _) => Value::Number(f64::from(u8::from(*b))).loose_eq(other),
            (_, Value::Bool(b)) => self.loose_eq(&Value::Number(f64::from(u8::from(*b)))),
            (a, b) if a.is_shared() && !b.is_shared() => Value::str(a.to_js_string()).loose_eq(b),
            (a, b) if !a.is_shared() && b.is_shared() => a.loose_eq(&Value::str(b.to_js_string())),
            _ => self.strict_eq(other),
        }
    }

    /// Structural comparison (used when a watch compares by value).
    ///
    /// Cycles are fine: a pair of containers already being compared further
    /// up counts as equal.
    pub fn deep_eq(&self, other: &Value) -> bool {
        self.deep_eq_in(other, &mut HashSet::new())
    }

    fn deep_eq_in(&self, other: &Value, comparing: &mut HashSet<(usize, usize)>) -> bool {
        match (self, other) {
            (Value::Number(a), Value::Number(b)) => a == b || (a.is_nan() && b.is_nan()),
            (Value::Array(a), Value::Array(b)) => {
                if a.ptr_eq(b) || !comparing.insert((a.addr(), b.addr())) {
                    return true;
                }
                let (a, b) = (a.to_vec(), b.to_vec());
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.deep_eq_in(y, comparing))
            }
            (Value::Object(a), Value::Object(b)) => {
                if a.ptr_eq(b) || !comparing.insert((a.addr(), b.addr())) {
                    return true;
                }
                let (a, b) = (a.entries(), b.entries_map());
                a.len() == b.len()
                    && a.iter()
                        .all(|(k, v)| b.get(k).is_some_and(|w| v.deep_eq_in(w, comparing)))
            }
            _ => self.strict_eq(other),
        }
    }

    /// Recursive copy of arrays and objects; other values are shared. A
    /// container reached twice is copied once, so cycles survive the copy.
    pub fn deep_clone(&self) -> Value {
        self.deep_clone_in(&mut HashMap::new())
    }

    fn deep_clone_in(&self, copies: &mut HashMap<usize, Value>) -> Value {
        match self {
            Value::Array(a) => {
                if let Some(copy) = copies.get(&a.addr()) {
                    return copy.clone();
                }
                let copy = Array::new();
                copies.insert(a.addr(), Value::Array(copy.clone()));
                for item in a.to_vec() {
                    copy.push(item.deep_clone_in(copies));
                }
                Value::Array(copy)
            }
            Value::Object(o) => {
                if let Some(copy) = copies.get(&o.addr()) {
                    return copy.clone();
                }
                let copy = Object::new();
                copies.insert(o.addr(), Value::Object(copy.clone()));
                for (k, v) in o.entries() {
                    copy.insert(k, v.deep_clone_in(copies));
                }
                Value::Object(copy)
            }
            other => other.clone(),
        }
    }

    /// One-level copy of arrays and objects; other values are shared.
    pub fn shallow_clone(&self) -> Value {
        match self {
            Value::Array(a) => Value::array(a.to_vec()),
            Value::Object(o) => Value::Object(o.entries().into_iter().collect()),
            other => other.clone(),
        }
    }

    fn is_shared(&self) -> bool {
        matches!(
            self,
            Value::Array(_) | Value::Object(_) | Value::Function(_) | Value::Scope(_)
        )
    }

    // ── Members ───────────────────────────────────────────────────────────────

    /// Read a member the way an expression does. Missing members, and any
    /// member of a primitive without one, read as `undefined`.
    pub fn get_member(&self, key: &str) -> Value {
        match self {
            Value::Object(o) => o.get(key).unwrap_or_default(),
            Value::Scope(s) => s.get(key),
            Value::Array(a) => {
                if key == "length" {
                    Value::Number(a.len() as f64)
                } else {
                    array_index(key).map(|i| a.get(i)).unwrap_or_default()
                }
            }
            Value::Str(s) => {
                if key == "length" {
                    Value::Number(s.chars().count() as f64)
                } else {
                    array_index(key)
                        .and_then(|i| s.chars().nth(i))
                        .map(|c| Value::str(c.to_string()))
                        .unwrap_or_default()
                }
            }
            Value::Function(f) => match key {
                "name" => Value::str(f.name()),
                "call" => Value::Function(Function::invoker(FunctionKind::Call)),
                "apply" => Value::Function(Function::invoker(FunctionKind::Apply)),
                "bind" => Value::Function(Function::invoker(FunctionKind::Bind)),
                _ => Value::Undefined,
            },
            _ => Value::Undefined,
        }
    }

    /// Write a member. Writes to primitives are silently ignored.
    ///
    /// Arrays are dense, so an index or `length` past [`Array::MAX_LENGTH`]
    /// fails instead of allocating.
    pub fn set_member(&self, key: &str, value: Value) -> Result<(), EvalError> {
        match self {
            Value::Object(o) => o.insert(key, value),
            Value::Scope(s) => s.set(key, value),
            Value::Array(a) => {
                if key == "length" {
                    let n = value.to_number();
                    if !(n >= 0.0 && n.fract() == 0.0 && n <= Array::MAX_LENGTH as f64) {
                        return Err(EvalError::InvalidArrayLength { length: n });
                    }
                    a.resize(n as usize)?;
                } else if let Some(i) = array_index(key) {
                    a.set(i, value)?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Whether `key` is an own (non-delegated) member.
    pub fn has_own(&self, key: &str) -> bool {
        match self {
            Value::Object(o) => o.contains_key(key),
            Value::Scope(s) => s.has_own(key),
            Value::Array(a) => key == "length" || array_index(key).is_some_and(|i| i < a.len()),
            _ => false,
        }
    }

    /// Arrays, and objects that look like one: `length` is 0, or a positive
    /// number `n` with key `n - 1` present.
    pub fn is_array_like(&self) -> bool {
        match self {
            Value::Array(_) => true,
            Value::Object(o) => match o.get("length") {
                Some(Value::Number(n)) if n == 0.0 => true,
                Some(Value::Number(n)) if n > 0.0 && n.fract() == 0.0 => {
                    o.contains_key(&format_number(n - 1.0))
                }
                _ => false,
            },
            _ => false,
        }
    }

    // ── Arithmetic helpers ────────────────────────────────────────────────────

    /// `+`: a missing operand counts as zero; both missing stays undefined.
    pub fn arith_add(&self, rhs: &Value) -> Value {
        match (self.is_undefined(), rhs.is_undefined()) {
            (true, true) => Value::Undefined,
            (false, true) => self.js_add(&Value::Number(0.0)),
            (true, false) => Value::Number(0.0).js_add(rhs),
            (false, false) => self.js_add(rhs),
        }
    }

    /// `-`: a missing operand counts as zero.
    pub fn arith_sub(&self, rhs: &Value) -> Value {
        Value::Number(or_zero(self).to_number() - or_zero(rhs).to_number())
    }

    pub fn arith_mul(&self, rhs: &Value) -> Value {
        Value::Number(self.to_number() * rhs.to_number())
    }

    pub fn arith_div(&self, rhs: &Value) -> Value {
        Value::Number(self.to_number() / rhs.to_number())
    }

    pub fn arith_rem(&self, rhs: &Value) -> Value {
        Value::Number(self.to_number() % rhs.to_number())
    }

    /// Relational comparison: strings compare lexically, everything else
    /// numerically. `None` when either side is `NaN`.
    pub fn compare(&self, rhs: &Value) -> Option<Ordering> {
        match (self, rhs) {
            (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
            _ => self.to_number().partial_cmp(&rhs.to_number()),
        }
    }

    fn js_add(&self, rhs: &Value) -> Value {
        let stringy = |v: &Value| matches!(v, Value::Str(_)) || v.is_shared();
        if stringy(self) || stringy(rhs) {
            Value::str(format!("{}{}", self.to_js_string(), rhs.to_js_string()))
        } else {
            Value::Number(self.to_number() + rhs.to_number())
        }
    }
}

fn or_zero(v: &Value) -> &Value {
    const ZERO: &Value = &Value::Number(0.0);
    if v.is_undefined() {
        ZERO
    } else {
        v
    }
}

fn checked_length(len: Option<usize>) -> Result<usize, EvalError> {
    match len {
        Some(len) if len <= Array::MAX_LENGTH => Ok(len),
        Some(len) => Err(EvalError::InvalidArrayLength { length: len as f64 }),
        None => Err(EvalError::InvalidArrayLength { length: f64::INFINITY }),
    }
}

fn array_index(key: &str) -> Option<usize> {
    let i: usize = key.parse().ok()?;
    (i.to_string() == key).then_some(i)
}

fn parse_numeric_str(s: &str) -> f64 {
    let t = s.trim();
    if t.is_empty() {
        0.0
    } else {
        t.parse().unwrap_or(f64::NAN)
    }
}

/// Format a number the way JS prints it for the common cases.
pub(crate) fn format_number(n: f64) -> String {
    if n.is_nan() {
        "NaN".into()
    } else if n.is_infinite() {
        (if n > 0.0 { "Infinity" } else { "-Infinity" }).into()
    } else if n == 0.0 {
        "0".into()
    } else {
        format!("{n}")
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_js_string())
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Undefined => write!(f, "undefined"),
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Number(n) => write!(f, "{}", format_number(*n)),
            Value::Str(s) => write!(f, "{s:?}"),
            Value::Array(a) => f.debug_list().entries(a.to_vec()).finish(),
            Value::Object(o) => f.debug_map().entries(o.entries()).finish(),
            Value::Function(func) => write!(f, "function {}", func.name()),
            Value::Scope(s) => write!(f, "Scope(#{})", s.id()),
        }
    }
}

/// Structural equality, so tests can compare expected values directly.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.deep_eq(other)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(f64::from(n))
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n as f64)
    }
}

impl From<usize> for Value {
    fn from(n: usize) -> Self {
        Value::Number(n as f64)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::str(s)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(Rc::from(s))
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(Array::from_vec(items))
    }
}

impl From<Array> for Value {
    fn from(a: Array) -> Self {
        Value::Array(a)
    }
}

impl From<Object> for Value {
    fn from(o: Object) -> Self {
        Value::Object(o)
    }
}

impl From<Function> for Value {
    fn from(f: Function) -> Self {
        Value::Function(f)
    }
}

impl From<Scope> for Value {
    fn from(s: Scope) -> Self {
        Value::Scope(s)
    }
}

// ── Array ─────────────────────────────────────────────────────────────────────

/// Shared, mutable list. Clones share storage.
#[derive(Clone, Default)]
pub struct Array(Rc<RefCell<Vec<Value>>>);

impl Array {
    /// Longest list an index write or `length` assignment may grow to.
    pub const MAX_LENGTH: usize = 1 << 20;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_vec(items: Vec<Value>) -> Self {
        Array(Rc::new(RefCell::new(items)))
    }

    pub fn len(&self) -> usize {
        self.0.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.borrow().is_empty()
    }

    /// Element at `i`, or `undefined` past the end.
    pub fn get(&self, i: usize) -> Value {
        self.0.borrow().get(i).cloned().unwrap_or_default()
    }

    /// Store at `i`, padding with `undefined` when writing past the end.
    pub fn set(&self, i: usize, value: Value) -> Result<(), EvalError> {
        let mut items = self.0.borrow_mut();
        if i >= items.len() {
            let len = checked_length(i.checked_add(1))?;
            items.resize(len, Value::Undefined);
        }
        items[i] = value;
        Ok(())
    }

    pub fn push(&self, value: impl Into<Value>) {
        self.0.borrow_mut().push(value.into());
    }

    pub fn pop(&self) -> Option<Value> {
        self.0.borrow_mut().pop()
    }

    pub fn resize(&self, len: usize) -> Result<(), EvalError> {
        let len = checked_length(Some(len))?;
        self.0.borrow_mut().resize(len, Value::Undefined);
        Ok(())
    }

    /// Snapshot of the current elements.
    pub fn to_vec(&self) -> Vec<Value> {
        self.0.borrow().clone()
    }

    pub fn ptr_eq(&self, other: &Array) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    fn addr(&self) -> usize {
        Rc::as_ptr(&self.0) as usize
    }
}

// ── Object ────────────────────────────────────────────────────────────────────

/// Shared, mutable, insertion-ordered map. Clones share storage.
#[derive(Clone, Default)]
pub struct Object(Rc<RefCell<IndexMap<String, Value>>>);

impl Object {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.0.borrow().get(key).cloned()
    }

    pub fn insert(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.borrow_mut().insert(key.into(), value.into());
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.0.borrow_mut().shift_remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.borrow().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.borrow().is_empty()
    }

    pub fn keys(&self) -> Vec<String> {
        self.0.borrow().keys().cloned().collect()
    }

    /// Snapshot of the current entries, in insertion order.
    pub fn entries(&self) -> Vec<(String, Value)> {
        self.0
            .borrow()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub(crate) fn entries_map(&self) -> IndexMap<String, Value> {
        self.0.borrow().clone()
    }

    pub fn ptr_eq(&self, other: &Object) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    fn addr(&self) -> usize {
        Rc::as_ptr(&self.0) as usize
    }
}

impl<K: Into<String>> FromIterator<(K, Value)> for Object {
    fn from_iter<I: IntoIterator<Item = (K, Value)>>(iter: I) -> Self {
        let map = iter.into_iter().map(|(k, v)| (k.into(), v)).collect();
        Object(Rc::new(RefCell::new(map)))
    }
}

// ── Function ──────────────────────────────────────────────────────────────────

/// Capability class of a callable, consulted by the safety guards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionKind {
    /// Ordinary host function.
    Native,
    /// A constructor that can mint new code or objects (`Function`, `Object`).
    Constructor,
    /// The `call` invocation primitive.
    Call,
    /// The `apply` invocation primitive.
    Apply,
    /// The `bind` invocation primitive.
    Bind,
}

struct FunctionInner {
    name: String,
    kind: FunctionKind,
    body: Box<NativeFn>,
}

/// A native callable. Clones share identity.
#[derive(Clone)]
pub struct Function(Rc<FunctionInner>);

impl Function {
    pub fn new(
        name: impl Into<String>,
        body: impl Fn(&Value, &[Value]) -> Result<Value, EvalError> + 'static,
    ) -> Self {
        Self::with_kind(name, FunctionKind::Native, body)
    }

    pub fn with_kind(
        name: impl Into<String>,
        kind: FunctionKind,
        body: impl Fn(&Value, &[Value]) -> Result<Value, EvalError> + 'static,
    ) -> Self {
        Function(Rc::new(FunctionInner {
            name: name.into(),
            kind,
            body: Box::new(body),
        }))
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn kind(&self) -> FunctionKind {
        self.0.kind
    }

    pub fn invoke(&self, this: &Value, args: &[Value]) -> Result<Value, EvalError> {
        (self.0.body)(this, args)
    }

    pub fn ptr_eq(&self, other: &Function) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    /// The `call` / `apply` / `bind` primitive every function exposes.
    fn invoker(kind: FunctionKind) -> Function {
        match kind {
            FunctionKind::Call => Function::with_kind("call", kind, |this, args| {
                let target = callee_of(this)?;
                let (bound, rest) = args.split_first().unwrap_or((&Value::Undefined, &[]));
                target.invoke(bound, rest)
            }),
            FunctionKind::Apply => Function::with_kind("apply", kind, |this, args| {
                let target = callee_of(this)?;
                let bound = args.first().cloned().unwrap_or_default();
                let spread = args
                    .get(1)
                    .and_then(Value::as_array)
                    .map(Array::to_vec)
                    .unwrap_or_default();
                target.invoke(&bound, &spread)
            }),
            _ => Function::with_kind("bind", FunctionKind::Bind, |this, args| {
                let target = callee_of(this)?;
                let bound = args.first().cloned().unwrap_or_default();
                let name = format!("bound {}", target.name());
                Ok(Value::function(name, move |_, call_args| {
                    target.invoke(&bound, call_args)
                }))
            }),
        }
    }
}

fn callee_of(this: &Value) -> Result<Function, EvalError> {
    this.as_function().cloned().ok_or_else(|| EvalError::NotAFunction {
        callee: this.type_name().into(),
    })
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_numbers() {
        assert_eq!(Value::from(42).to_string(), "42");
        assert_eq!(Value::from(4.2).to_string(), "4.2");
        assert_eq!(Value::from(-0.0).to_string(), "0");
        assert_eq!(Value::from(f64::NAN).to_string(), "NaN");
        assert_eq!(Value::from(f64::INFINITY).to_string(), "Infinity");
    }

    #[test]
    fn display_compound() {
        let v = Value::array([Value::from(1), Value::Null, Value::from("x")]);
        assert_eq!(v.to_string(), "1,,x");
        assert_eq!(Value::object([("a", Value::from(1))]).to_string(), "[object Object]");
    }

    #[test]
    fn truthiness() {
        assert!(!Value::Undefined.truthy());
        assert!(!Value::Null.truthy());
        assert!(!Value::from(0).truthy());
        assert!(!Value::from(f64::NAN).truthy());
        assert!(!Value::from("").truthy());
        assert!(Value::from("0").truthy());
        assert!(Value::array([]).truthy());
    }

    #[test]
    fn add_treats_one_missing_operand_as_zero() {
        assert_eq!(Value::from(20).arith_add(&Value::Undefined), Value::from(20));
        assert_eq!(Value::Undefined.arith_add(&Value::from(22)), Value::from(22));
        assert!(Value::Undefined.arith_add(&Value::Undefined).is_undefined());
    }

    #[test]
    fn add_concatenates_strings() {
        assert_eq!(Value::from("a").arith_add(&Value::from(1)), Value::from("a1"));
        assert_eq!(Value::from(1).arith_add(&Value::from("b")), Value::from("1b"));
    }

    #[test]
    fn sub_treats_missing_as_zero() {
        assert_eq!(Value::Undefined.arith_sub(&Value::from(3)), Value::from(-3));
        assert_eq!(Value::Undefined.arith_sub(&Value::Undefined), Value::from(0));
    }

    #[test]
    fn other_arithmetic_does_not_coerce_missing() {
        assert!(Value::Undefined.arith_mul(&Value::from(2)).to_number().is_nan());
        assert_eq!(Value::from(7).arith_rem(&Value::from(2)), Value::from(1));
        assert_eq!(Value::from(1).arith_div(&Value::from(0)), Value::from(f64::INFINITY));
    }

    #[test]
    fn identical_handles_nan_and_references() {
        assert!(Value::from(f64::NAN).identical(&Value::from(f64::NAN)));
        assert!(!Value::from(f64::NAN).strict_eq(&Value::from(f64::NAN)));
        let a = Value::array([Value::from(1)]);
        let b = Value::array([Value::from(1)]);
        assert!(a.identical(&a.clone()));
        assert!(!a.identical(&b));
        assert!(a.deep_eq(&b));
    }

    #[test]
    fn loose_equality() {
        assert!(Value::Null.loose_eq(&Value::Undefined));
        assert!(Value::from(42).loose_eq(&Value::from("42")));
        assert!(Value::from(true).loose_eq(&Value::from(1)));
        assert!(!Value::Null.loose_eq(&Value::from(0)));
        assert!(!Value::from(42).strict_eq(&Value::from("42")));
    }

    #[test]
    fn deep_clone_detaches_nested_storage() {
        let inner = Value::array([Value::from(1)]);
        let outer = Value::object([("xs", inner.clone())]);
        let copy = outer.deep_clone();
        inner.as_array().unwrap().push(2);
        assert!(!outer.deep_eq(&copy));
        let shallow = outer.shallow_clone();
        assert!(outer.deep_eq(&shallow));
        assert!(!outer.identical(&shallow));
    }

    #[test]
    fn member_access() {
        let arr = Value::array([Value::from(1), Value::from(2)]);
        assert_eq!(arr.get_member("length"), Value::from(2));
        assert_eq!(arr.get_member("1"), Value::from(2));
        assert!(arr.get_member("01").is_undefined());
        assert_eq!(Value::from("abc").get_member("length"), Value::from(3));
        assert!(Value::from(1).get_member("x").is_undefined());
    }

    #[test]
    fn set_member_pads_arrays() {
        let arr = Value::array([]);
        arr.set_member("2", Value::from("c")).unwrap();
        assert_eq!(arr.get_member("length"), Value::from(3));
        assert!(arr.get_member("0").is_undefined());
    }

    #[test]
    fn oversized_array_writes_fail() {
        let arr = Value::array([Value::from(1)]);
        for key in ["18446744073709551615", "4000000000"] {
            assert!(matches!(
                arr.set_member(key, Value::from(1)),
                Err(EvalError::InvalidArrayLength { .. })
            ));
        }
        for length in [1e12, -1.0, 1.5, f64::NAN] {
            assert!(arr.set_member("length", Value::from(length)).is_err());
        }
        assert_eq!(arr.get_member("length"), Value::from(1));

        arr.set_member("length", Value::from(3)).unwrap();
        assert_eq!(arr.get_member("length"), Value::from(3));
        let last = (Array::MAX_LENGTH - 1).to_string();
        arr.set_member(&last, Value::from(2)).unwrap();
        assert_eq!(arr.get_member("length"), Value::from(Array::MAX_LENGTH));
    }

    #[test]
    fn cyclic_values_compare_and_clone() {
        let a = Value::object([("n", Value::from(1))]);
        a.set_member("self", a.clone()).unwrap();
        let list = Value::array([Value::from(1)]);
        list.as_array().unwrap().push(list.clone());

        let copy = a.deep_clone();
        assert!(!copy.identical(&a));
        assert!(copy.get_member("self").identical(&copy));
        assert!(a.deep_eq(&copy));

        assert_eq!(list.to_js_string(), "1,");

        let list_copy = list.deep_clone();
        assert!(list_copy.get_member("1").identical(&list_copy));
        assert!(list.deep_eq(&list_copy));

        copy.set_member("n", Value::from(2)).unwrap();
        assert!(!a.deep_eq(&copy));
    }

    #[test]
    fn array_like_objects() {
        let empty = Value::object([("length", Value::from(0))]);
        let listy = Value::object([("length", Value::from(2)), ("1", Value::from("b"))]);
        let impostor = Value::object([("length", Value::from(42)), ("other", Value::from(1))]);
        assert!(empty.is_array_like());
        assert!(listy.is_array_like());
        assert!(!impostor.is_array_like());
    }

    #[test]
    fn invokers_forward_this() {
        let f = Value::function("member", |this, _| Ok(this.get_member("m")));
        let target = Value::object([("m", Value::from(42))]);
        let call = f.get_member("call");
        let Value::Function(call) = call else { panic!("call is not a function") };
        assert_eq!(call.kind(), FunctionKind::Call);
        assert_eq!(call.invoke(&f, &[target]).unwrap(), Value::from(42));
    }
}
