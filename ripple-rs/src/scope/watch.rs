//! Watch registration.
//!
//! [`Scope::watch`] picks a strategy from the compiled expression:
//!
//! | Expression | Strategy |
//! |------------|----------|
//! | constant | fire once, then deregister |
//! | `::` one-time | deregister after a digest that leaves the value defined |
//! | operators and literals over inputs | re-evaluate only when an input changed |
//! | anything else | plain watcher |
//!
//! Group and collection watches are built on top of plain watchers.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use indexmap::IndexMap;

use crate::error::{Error, EvalError};
use crate::expr::{Expression, IntoExpression};
use crate::value::{Array, Value};

use super::{Scope, ScopeNode};

/// Listener signature: `(new_value, old_value, scope)`.
pub type WatchListener = dyn Fn(&Value, &Value, &Scope) -> Result<(), EvalError>;

type WatchFn = Box<dyn Fn(&Scope) -> Result<Value, EvalError>>;
type ListenerFn = Box<WatchListener>;

pub(super) struct Watcher {
    pub(super) watch: WatchFn,
    pub(super) listener: ListenerFn,
    pub(super) by_value: bool,
    /// `None` until the first pass, so the first value always counts as a
    /// change.
    pub(super) last: RefCell<Option<Value>>,
}

fn no_op(_: &Value, _: &Value, _: &Scope) -> Result<(), EvalError> {
    Ok(())
}

// ── Deregistration ────────────────────────────────────────────────────────────

/// Undoes a registration. Calling it more than once is harmless.
#[derive(Clone)]
pub struct Deregistration(Rc<dyn Fn()>);

impl Deregistration {
    pub(super) fn new(f: impl Fn() + 'static) -> Self {
        Deregistration(Rc::new(f))
    }

    fn watcher(scope: Weak<ScopeNode>, watcher: Weak<Watcher>) -> Self {
        Deregistration::new(move || {
            let Some(node) = scope.upgrade() else { return };
            node.watchers
                .borrow_mut()
                .retain(|w| !std::ptr::eq(Rc::as_ptr(w), watcher.as_ptr()));
            node.tree.set_last_dirty(None);
        })
    }

    pub fn deregister(&self) {
        (self.0)()
    }
}

impl fmt::Debug for Deregistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Deregistration")
    }
}

// ── Scope API ─────────────────────────────────────────────────────────────────

impl Scope {
    /// Run `listener` whenever the value of `expr` changes between digest
    /// passes. With `by_value` the comparison is structural and the stored
    /// value is a deep copy; otherwise it is identity.
    pub fn watch(
        &self,
        expr: impl IntoExpression,
        listener: impl Fn(&Value, &Value, &Scope) -> Result<(), EvalError> + 'static,
        by_value: bool,
    ) -> Result<Deregistration, Error> {
        let expr = self.compile(expr)?;
        Ok(self.watch_compiled(expr, Box::new(listener), by_value))
    }

    /// Watch without a listener. The expression still runs on every pass.
    pub fn watch_expression(
        &self,
        expr: impl IntoExpression,
        by_value: bool,
    ) -> Result<Deregistration, Error> {
        let expr = self.compile(expr)?;
        Ok(self.watch_compiled(expr, Box::new(no_op), by_value))
    }

    fn watch_compiled(&self, expr: Expression, listener: ListenerFn, by_value: bool) -> Deregistration {
        if expr.is_constant() {
            return self.watch_constant(expr, listener, by_value);
        }
        if expr.is_one_time() {
            return self.watch_one_time(expr, listener, by_value);
        }
        let inputs = expr.inputs().map(<[Expression]>::to_vec);
        match inputs {
            Some(inputs) => self.watch_inputs(expr, inputs, listener, by_value),
            None => self.watch_plain(expr, listener, by_value),
        }
    }

    /// Insert a watcher at the front of this scope's list. `build` receives
    /// the watcher's own deregistration handle.
    fn install(
        &self,
        by_value: bool,
        build: impl FnOnce(Deregistration) -> (WatchFn, ListenerFn),
    ) -> Deregistration {
        let scope = self.downgrade();
        let watcher = Rc::new_cyclic(|me: &Weak<Watcher>| {
            let (watch, listener) = build(Deregistration::watcher(scope.clone(), me.clone()));
            Watcher {
                watch,
                listener,
                by_value,
                last: RefCell::new(None),
            }
        });
        self.0.watchers.borrow_mut().insert(0, watcher.clone());
        self.0.tree.set_last_dirty(None);
        Deregistration::watcher(scope, Rc::downgrade(&watcher))
    }

    fn watch_plain(&self, expr: Expression, listener: ListenerFn, by_value: bool) -> Deregistration {
        self.install(by_value, move |_| {
            let watch: WatchFn = Box::new(move |scope| expr.eval_in(scope));
            (watch, listener)
        })
    }

    fn watch_constant(&self, expr: Expression, listener: ListenerFn, by_value: bool) -> Deregistration {
        self.install(by_value, move |unwatch| {
            let watch: WatchFn = Box::new(move |scope| expr.eval_in(scope));
            let listener: ListenerFn = Box::new(move |new, old, scope| {
                listener(new, old, scope)?;
                unwatch.deregister();
                Ok(())
            });
            (watch, listener)
        })
    }

    fn watch_one_time(&self, expr: Expression, listener: ListenerFn, by_value: bool) -> Deregistration {
        let literal = expr.is_literal();
        let last = Rc::new(RefCell::new(Value::Undefined));
        self.install(by_value, move |unwatch| {
            let watch: WatchFn = Box::new(move |scope| expr.eval_in(scope));
            let listener: ListenerFn = Box::new(move |new, old, scope| {
                *last.borrow_mut() = new.clone();
                listener(new, old, scope)?;
                if settled(new, literal) {
                    let last = last.clone();
                    let unwatch = unwatch.clone();
                    scope.post_digest(move || {
                        if settled(&last.borrow(), literal) {
                            unwatch.deregister();
                        }
                        Ok(())
                    });
                }
                Ok(())
            });
            (watch, listener)
        })
    }

    fn watch_inputs(
        &self,
        expr: Expression,
        inputs: Vec<Expression>,
        listener: ListenerFn,
        by_value: bool,
    ) -> Deregistration {
        let literal = expr.is_literal();
        let previous: RefCell<Vec<Option<Value>>> = RefCell::new(vec![None; inputs.len()]);
        let result = RefCell::new(Value::Undefined);
        self.install(by_value, move |_| {
            let watch: WatchFn = Box::new(move |scope| {
                let mut changed = false;
                for (input, old) in inputs.iter().zip(previous.borrow_mut().iter_mut()) {
                    let value = input.eval_in(scope)?;
                    if changed || input_changed(&value, old.as_ref(), literal) {
                        changed = true;
                        *old = Some(value);
                    }
                }
                if changed {
                    *result.borrow_mut() = expr.eval_in(scope)?;
                }
                Ok(result.borrow().clone())
            });
            (watch, listener)
        })
    }

    // ── Groups ────────────────────────────────────────────────────────────────

    /// Watch several expressions with one listener that receives arrays of
    /// their values. The listener runs at most once per digest, and on the
    /// first run gets the same array as both new and old values.
    ///
    /// With no expressions the listener runs once, on the next drain of the
    /// async queue, unless deregistered before then.
    pub fn watch_group<E: IntoExpression>(
        &self,
        exprs: impl IntoIterator<Item = E>,
        listener: impl Fn(&Value, &Value, &Scope) -> Result<(), EvalError> + 'static,
    ) -> Result<Deregistration, Error> {
        let exprs = exprs
            .into_iter()
            .map(|e| self.compile(e))
            .collect::<Result<Vec<_>, _>>()?;
        let listener: Rc<WatchListener> = Rc::new(listener);

        if exprs.is_empty() {
            let should_call = Rc::new(Cell::new(true));
            let pending = should_call.clone();
            self.eval_async(Expression::from_scope_fn(move |scope| {
                if pending.get() {
                    let values = Value::Array(Array::new());
                    listener(&values, &values, scope)?;
                }
                Ok(Value::Undefined)
            }))?;
            return Ok(Deregistration::new(move || should_call.set(false)));
        }

        let new_values = Array::from_vec(vec![Value::Undefined; exprs.len()]);
        let old_values = Array::from_vec(vec![Value::Undefined; exprs.len()]);
        let scheduled = Rc::new(Cell::new(false));
        let first_run = Cell::new(true);

        let react = {
            let (new_values, old_values) = (new_values.clone(), old_values.clone());
            let scheduled = scheduled.clone();
            Expression::from_scope_fn(move |scope| {
                let new = Value::Array(new_values.clone());
                let result = if first_run.replace(false) {
                    listener(&new, &new, scope)
                } else {
                    listener(&new, &Value::Array(old_values.clone()), scope)
                };
                scheduled.set(false);
                result.map(|()| Value::Undefined)
            })
        };

        let handles = exprs
            .into_iter()
            .enumerate()
            .map(|(i, expr)| {
                let (new_values, old_values) = (new_values.clone(), old_values.clone());
                let (scheduled, react) = (scheduled.clone(), react.clone());
                let listener: ListenerFn = Box::new(move |new, old, scope| {
                    new_values.set(i, new.clone())?;
                    old_values.set(i, old.clone())?;
                    if !scheduled.replace(true) {
                        scope.eval_async(&react).map_err(|e| EvalError::raise(e.to_string()))?;
                    }
                    Ok(())
                });
                self.watch_compiled(expr, listener, false)
            })
            .collect::<Vec<_>>();

        Ok(Deregistration::new(move || {
            for handle in &handles {
                handle.deregister();
            }
        }))
    }

    // ── Collections ───────────────────────────────────────────────────────────

    /// Watch the shallow contents of an array, array-like object or object.
    ///
    /// Arrays are compared element by element and objects key by key, so
    /// mutating a collection in place is noticed without a deep comparison.
    /// Other values fall back to identity. The old value handed to the
    /// listener is a shallow copy taken after the previous change, or the
    /// new value itself on the first run.
    pub fn watch_collection(
        &self,
        expr: impl IntoExpression,
        listener: impl Fn(&Value, &Value, &Scope) -> Result<(), EvalError> + 'static,
    ) -> Result<Deregistration, Error> {
        self.collection_watcher(expr, Box::new(listener), true)
    }

    /// Like [`Scope::watch_collection`] for a listener that only needs the
    /// new value, which skips the shallow copy.
    pub fn watch_collection_untracked(
        &self,
        expr: impl IntoExpression,
        listener: impl Fn(&Value, &Scope) -> Result<(), EvalError> + 'static,
    ) -> Result<Deregistration, Error> {
        self.collection_watcher(expr, Box::new(move |new, _, scope| listener(new, scope)), false)
    }

    fn collection_watcher(
        &self,
        expr: impl IntoExpression,
        listener: ListenerFn,
        track_old: bool,
    ) -> Result<Deregistration, Error> {
        let expr = self.compile(expr)?;
        let state = Rc::new(CollectionState::default());

        let watch: WatchFn = {
            let state = state.clone();
            Box::new(move |scope| {
                let value = expr.eval_in(scope)?;
                let count = state.observe(&value);
                *state.current.borrow_mut() = value;
                Ok(Value::Number(count as f64))
            })
        };
        let listener: ListenerFn = Box::new(move |_, _, scope| {
            let current = state.current.borrow().clone();
            if state.first_run.replace(false) {
                listener(&current, &current, scope)?;
            } else {
                let very_old = state.very_old.borrow().clone();
                listener(&current, &very_old, scope)?;
            }
            if track_old {
                *state.very_old.borrow_mut() = current.shallow_clone();
            }
            Ok(())
        });
        Ok(self.install(false, move |_| (watch, listener)))
    }
}

/// Whether an input of an inputs-watched expression needs a re-evaluation.
/// A literal only reads its inputs' identity, so the same container counts
/// as unchanged. Any other expression may read into a container, which can
/// change in place, so containers are always dirty there.
fn input_changed(value: &Value, old: Option<&Value>, literal: bool) -> bool {
    let Some(old) = old else { return true };
    if !value.identical(old) {
        return true;
    }
    !literal && matches!(value, Value::Array(_) | Value::Object(_) | Value::Scope(_))
}

/// One-time watches settle once their value is defined; literal ones wait
/// for every element or member as well.
fn settled(value: &Value, literal: bool) -> bool {
    if !literal {
        return value.is_defined();
    }
    match value {
        Value::Array(a) => a.to_vec().iter().all(Value::is_defined),
        Value::Object(o) => o.entries().iter().all(|(_, v)| v.is_defined()),
        other => other.is_defined(),
    }
}

// ── Collection tracking ───────────────────────────────────────────────────────

/// The watcher's private copy of the collection as last seen.
#[derive(Default)]
enum Snapshot {
    #[default]
    Unset,
    Scalar(Value),
    List(Vec<Value>),
    Map(IndexMap<String, Value>),
}

struct CollectionState {
    snapshot: RefCell<Snapshot>,
    changes: Cell<u64>,
    current: RefCell<Value>,
    very_old: RefCell<Value>,
    first_run: Cell<bool>,
}

impl Default for CollectionState {
    fn default() -> Self {
        CollectionState {
            snapshot: RefCell::new(Snapshot::Unset),
            changes: Cell::new(0),
            current: RefCell::new(Value::Undefined),
            very_old: RefCell::new(Value::Undefined),
            first_run: Cell::new(true),
        }
    }
}

impl CollectionState {
    /// Compare `value` with the snapshot, update the snapshot, and return the
    /// running change counter.
    fn observe(&self, value: &Value) -> u64 {
        let mut snapshot = self.snapshot.borrow_mut();
        let mut changed = 0;

        if value.is_array_like() {
            if !matches!(*snapshot, Snapshot::List(_)) {
                changed += 1;
                *snapshot = Snapshot::List(Vec::new());
            }
            if let Snapshot::List(old) = &mut *snapshot {
                let items = list_items(value);
                if items.len() != old.len() {
                    changed += 1;
                    old.resize(items.len(), Value::Undefined);
                }
                for (new, old) in items.into_iter().zip(old.iter_mut()) {
                    if !new.identical(old) {
                        changed += 1;
                        *old = new;
                    }
                }
            }
        } else if let Value::Object(obj) = value {
            if !matches!(*snapshot, Snapshot::Map(_)) {
                changed += 1;
                *snapshot = Snapshot::Map(IndexMap::new());
            }
            if let Snapshot::Map(old) = &mut *snapshot {
                let entries = obj.entries();
                for (key, new) in &entries {
                    match old.get_mut(key) {
                        Some(prev) => {
                            if !new.identical(prev) {
                                changed += 1;
                                *prev = new.clone();
                            }
                        }
                        None => {
                            changed += 1;
                            old.insert(key.clone(), new.clone());
                        }
                    }
                }
                if old.len() > entries.len() {
                    changed += 1;
                    old.retain(|key, _| obj.contains_key(key));
                }
            }
        } else {
            let same = matches!(&*snapshot, Snapshot::Scalar(prev) if prev.identical(value));
            if !same {
                changed += 1;
            }
            *snapshot = Snapshot::Scalar(value.clone());
        }

        self.changes.set(self.changes.get() + changed);
        self.changes.get()
    }
}

/// Elements of an array or an array-like object.
fn list_items(value: &Value) -> Vec<Value> {
    match value {
        Value::Array(a) => a.to_vec(),
        other => {
            let len = other.get_member("length").to_number();
            (0..len as usize)
                .map(|i| other.get_member(&i.to_string()))
                .collect()
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
