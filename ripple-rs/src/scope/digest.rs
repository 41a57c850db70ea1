//! Digest loop and deferred work.
//!
//! A digest drains the async queue, then makes one pass over every watcher
//! in the subtree, and repeats until a pass comes out clean with nothing
//! queued. A tree that keeps changing fails after `ttl` extra passes.

use std::time::Duration;

use crate::error::{DigestError, Error, EvalError};
use crate::expr::{Expression, IntoExpression};
use crate::value::Value;

use super::{Phase, Scope};

impl Scope {
    // ── Phase ─────────────────────────────────────────────────────────────────

    fn begin_phase(&self, phase: Phase) -> Result<(), DigestError> {
        match self.0.tree.phase.get() {
            Some(active) => Err(DigestError::PhaseInProgress { phase: active }),
            None => {
                self.0.tree.phase.set(Some(phase));
                Ok(())
            }
        }
    }

    fn clear_phase(&self) {
        self.0.tree.phase.set(None);
    }

    // ── Digest ────────────────────────────────────────────────────────────────

    /// Run watchers in this scope and its descendants until they settle.
    ///
    /// Post-digest callbacks run once the loop is done, including any they
    /// queue themselves.
    pub fn digest(&self) -> Result<(), Error> {
        let tree = &self.0.tree;
        let mut ttl = tree.config.ttl;
        tree.set_last_dirty(None);
        self.begin_phase(Phase::Digest)?;
        tracing::debug!(scope = self.id(), "digest start");

        if let Some(id) = tree.apply_async_id.take() {
            tree.scheduler.clear_timeout(id);
            self.flush_apply_async();
        }

        let mut passes = 0usize;
        loop {
            self.drain_async_queue();
            let dirty = self.digest_once();
            passes += 1;
            let pending = !tree.async_queue.borrow().is_empty();
            if !dirty && !pending {
                break;
            }
            if ttl == 0 {
                self.clear_phase();
                tracing::warn!(scope = self.id(), ttl = tree.config.ttl, "digest did not settle");
                return Err(DigestError::IterationLimit {
                    ttl: tree.config.ttl,
                }
                .into());
            }
            ttl -= 1;
        }

        self.clear_phase();
        tracing::debug!(scope = self.id(), passes, "digest done");
        self.drain_post_digest();
        Ok(())
    }

    fn drain_async_queue(&self) {
        let tree = &self.0.tree;
        loop {
            let next = tree.async_queue.borrow_mut().pop_front();
            let Some((node, expr)) = next else { break };
            let Some(scope) = Scope::upgrade(&node) else { continue };
            if let Err(e) = expr.eval_in(&scope) {
                tracing::error!(scope = scope.id(), error = %e, "async evaluation failed");
            }
        }
    }

    fn drain_post_digest(&self) {
        let tree = &self.0.tree;
        loop {
            let next = tree.post_digest_queue.borrow_mut().pop_front();
            let Some(callback) = next else { break };
            if let Err(e) = callback() {
                tracing::error!(scope = self.id(), error = %e, "post-digest callback failed");
            }
        }
    }

    /// One pass over the subtree. Returns `true` if any watcher was dirty.
    fn digest_once(&self) -> bool {
        let tree = self.0.tree.clone();
        let mut dirty = false;
        self.every_scope(&mut |scope| {
            // Newest watchers sit at the front, so walk from the back. The
            // list may shrink or grow underneath us.
            let mut index = scope.0.watchers.borrow().len();
            while index > 0 && !scope.is_destroyed() {
                index -= 1;
                let entry = scope.0.watchers.borrow().get(index).cloned();
                let Some(watcher) = entry else { continue };

                let new = match (watcher.watch)(scope) {
                    Ok(v) => v,
                    Err(e) => {
                        tracing::error!(scope = scope.id(), error = %e, "watch function failed");
                        continue;
                    }
                };
                let old = watcher.last.borrow().clone();
                let unchanged = old.as_ref().is_some_and(|old| {
                    if watcher.by_value {
                        new.deep_eq(old)
                    } else {
                        new.identical(old)
                    }
                });

                if unchanged {
                    if tree.is_last_dirty(&watcher) {
                        return false;
                    }
                    continue;
                }

                tree.set_last_dirty(Some(&watcher));
                let stored = if watcher.by_value {
                    new.deep_clone()
                } else {
                    new.clone()
                };
                *watcher.last.borrow_mut() = Some(stored);
                let old = old.unwrap_or_else(|| new.clone());
                match (watcher.listener)(&new, &old, scope) {
                    Ok(()) => dirty = true,
                    Err(e) => {
                        tracing::error!(scope = scope.id(), error = %e, "watch listener failed");
                    }
                }
            }
            true
        });
        tracing::trace!(scope = self.id(), dirty, "digest pass");
        dirty
    }

    /// Depth-first walk that stops as soon as `f` returns `false`. Scopes
    /// destroyed while the walk is under way are skipped.
    pub(super) fn every_scope(&self, f: &mut dyn FnMut(&Scope) -> bool) -> bool {
        if self.is_destroyed() {
            return true;
        }
        if !f(self) {
            return false;
        }
        let children = self.children();
        children.iter().all(|child| child.every_scope(f))
    }

    // ── Apply ─────────────────────────────────────────────────────────────────

    /// Evaluate `expr` in the apply phase, then digest from the root whether
    /// or not the evaluation failed.
    ///
    /// Fails without evaluating if the tree is already in a phase. A failed
    /// digest takes precedence over the evaluation result.
    pub fn apply(&self, expr: impl IntoExpression) -> Result<Value, Error> {
        self.begin_phase(Phase::Apply)?;
        let result = self
            .compile(expr)
            .and_then(|expr| expr.eval_in(self).map_err(Error::from));
        self.clear_phase();
        self.root().digest()?;
        result
    }

    /// Queue `expr` to run against this scope during the current or next
    /// digest. If nothing is digesting, one is scheduled.
    pub fn eval_async(&self, expr: impl IntoExpression) -> Result<(), Error> {
        let expr = self.compile(expr)?;
        let tree = &self.0.tree;
        if tree.phase.get().is_none() && tree.async_queue.borrow().is_empty() {
            let scope = self.downgrade();
            tree.scheduler.set_timeout(Duration::ZERO, move || {
                let Some(scope) = Scope::upgrade(&scope) else { return };
                if scope.0.tree.async_queue.borrow().is_empty() {
                    return;
                }
                if let Err(e) = scope.root().digest() {
                    tracing::error!(scope = scope.id(), error = %e, "scheduled digest failed");
                }
            });
        }
        tree.async_queue
            .borrow_mut()
            .push_back((self.downgrade(), expr));
        Ok(())
    }

    /// Queue `expr` for a later apply. Calls made before that apply fires
    /// share one digest.
    pub fn apply_async(&self, expr: impl IntoExpression) -> Result<(), Error> {
        let expr = self.compile(expr)?;
        let tree = &self.0.tree;
        tree.apply_async_queue
            .borrow_mut()
            .push_back((self.downgrade(), expr));
        if tree.apply_async_id.get().is_none() {
            let scope = self.downgrade();
            let id = tree.scheduler.set_timeout(Duration::ZERO, move || {
                let Some(scope) = Scope::upgrade(&scope) else { return };
                let flush = scope.clone();
                let run = Expression::from_scope_fn(move |_| {
                    flush.flush_apply_async();
                    Ok(Value::Undefined)
                });
                if let Err(e) = scope.apply(run) {
                    tracing::error!(scope = scope.id(), error = %e, "scheduled apply failed");
                }
            });
            tree.apply_async_id.set(Some(id));
        }
        Ok(())
    }

    fn flush_apply_async(&self) {
        let tree = &self.0.tree;
        loop {
            let next = tree.apply_async_queue.borrow_mut().pop_front();
            let Some((node, expr)) = next else { break };
            let Some(scope) = Scope::upgrade(&node) else { continue };
            if let Err(e) = expr.eval_in(&scope) {
                tracing::error!(scope = scope.id(), error = %e, "async apply failed");
            }
        }
        tree.apply_async_id.set(None);
    }

    /// Run `callback` once, after the next digest finishes.
    pub fn post_digest(&self, callback: impl FnOnce() -> Result<(), EvalError> + 'static) {
        self.0
            .tree
            .post_digest_queue
            .borrow_mut()
            .push_back(Box::new(callback));
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    use super::*;
    use crate::config::DigestConfig;
    use crate::scheduler::Scheduler;

    fn bump(key: &'static str) -> impl Fn(&Value, &Value, &Scope) -> Result<(), EvalError> {
        move |_, _, scope: &Scope| {
            let n = scope.get(key).to_number();
            scope.set(key, n + 1.0);
            Ok(())
        }
    }

    #[test]
    fn first_digest_calls_listener_with_new_value_as_old() {
        let scope = Scope::new();
        scope.set("someValue", 123);
        let seen = Rc::new(RefCell::new(None));
        let s = seen.clone();
        scope
            .watch("someValue", move |new, old, _| {
                *s.borrow_mut() = Some((new.clone(), old.clone()));
                Ok(())
            }, false)
            .unwrap();
        scope.digest().unwrap();
        assert_eq!(*seen.borrow(), Some((Value::from(123), Value::from(123))));
    }

    #[test]
    fn listener_runs_only_when_value_changes() {
        let scope = Scope::new();
        scope.set("someValue", "a");
        scope.set("counter", 0);
        scope.watch("someValue", bump("counter"), false).unwrap();
        scope.digest().unwrap();
        scope.digest().unwrap();
        assert_eq!(scope.get("counter"), Value::from(1));
        scope.set("someValue", "b");
        scope.digest().unwrap();
        assert_eq!(scope.get("counter"), Value::from(2));
    }

    #[test]
    fn undefined_initial_value_still_fires() {
        let scope = Scope::new();
        scope.set("counter", 0);
        scope.watch("someValue", bump("counter"), false).unwrap();
        scope.digest().unwrap();
        assert_eq!(scope.get("counter"), Value::from(1));
    }

    #[test]
    fn chained_watchers_settle_in_one_digest() {
        let scope = Scope::new();
        scope.set("name", "Jane");
        scope
            .watch(
                "initial",
                |new, _, s| {
                    if let Some(initial) = new.as_str() {
                        s.set("greeting", format!("Hello, {initial}"));
                    }
                    Ok(())
                },
                false,
            )
            .unwrap();
        scope
            .watch(
                Expression::from_scope_fn(|s| Ok(s.get("nameUpper"))),
                |new, _, s| {
                    if let Some(upper) = new.as_str() {
                        s.set("initial", format!("{}.", &upper[..1]));
                    }
                    Ok(())
                },
                false,
            )
            .unwrap();
        scope
            .watch(
                "name",
                |new, _, s| {
                    if let Some(name) = new.as_str() {
                        s.set("nameUpper", name.to_uppercase());
                    }
                    Ok(())
                },
                false,
            )
            .unwrap();
        scope.digest().unwrap();
        assert_eq!(scope.get("initial"), Value::from("J."));
        assert_eq!(scope.get("greeting"), Value::from("Hello, J."));
        scope.set("name", "Bob");
        scope.digest().unwrap();
        assert_eq!(scope.get("initial"), Value::from("B."));
        assert_eq!(scope.get("greeting"), Value::from("Hello, B."));
    }

    #[test]
    fn gives_up_after_ttl_passes() {
        let scope = Scope::new();
        scope.set("counterA", 0);
        scope.set("counterB", 0);
        scope.watch("counterA", bump("counterB"), false).unwrap();
        scope.watch("counterB", bump("counterA"), false).unwrap();
        let err = scope.digest().unwrap_err();
        assert_eq!(err, Error::Digest(DigestError::IterationLimit { ttl: 10 }));
        assert_eq!(scope.phase(), None);
    }

    #[test]
    fn ttl_comes_from_config() {
        let config = DigestConfig {
            ttl: 3,
            ..DigestConfig::default()
        };
        let scope = Scope::with_config(config, Scheduler::new());
        let passes = Rc::new(Cell::new(0));
        let p = passes.clone();
        scope
            .watch_expression(
                Expression::from_scope_fn(move |_| {
                    p.set(p.get() + 1);
                    Ok(Value::from(p.get()))
                }),
                false,
            )
            .unwrap();
        assert!(scope.digest().is_err());
        assert_eq!(passes.get(), 4);
    }

    #[test]
    fn ends_digest_at_last_dirty_watch() {
        let scope = Scope::new();
        let array = Value::array((0..100).map(Value::from));
        scope.set("array", array.clone());
        let executions = Rc::new(Cell::new(0));
        for i in 0..100 {
            let ex = executions.clone();
            scope
                .watch_expression(
                    Expression::from_scope_fn(move |s| {
                        ex.set(ex.get() + 1);
                        Ok(s.get("array").get_member(&i.to_string()))
                    }),
                    false,
                )
                .unwrap();
        }
        scope.digest().unwrap();
        assert_eq!(executions.get(), 200);
        array.set_member("0", Value::from(420)).unwrap();
        scope.digest().unwrap();
        assert_eq!(executions.get(), 301);
    }

    #[test]
    fn by_value_compares_contents() {
        let scope = Scope::new();
        let items = Value::array([Value::from(1), Value::from(2), Value::from(3)]);
        scope.set("aValue", items.clone());
        scope.set("counter", 0);
        scope.watch("aValue", bump("counter"), true).unwrap();
        scope.digest().unwrap();
        items.as_array().unwrap().push(4);
        scope.digest().unwrap();
        assert_eq!(scope.get("counter"), Value::from(2));
        scope.digest().unwrap();
        assert_eq!(scope.get("counter"), Value::from(2));
    }

    #[test]
    fn identity_watch_ignores_in_place_mutation() {
        let scope = Scope::new();
        let items = Value::array([Value::from(1)]);
        scope.set("aValue", items.clone());
        scope.set("counter", 0);
        scope.watch("aValue", bump("counter"), false).unwrap();
        scope.digest().unwrap();
        items.as_array().unwrap().push(2);
        scope.digest().unwrap();
        assert_eq!(scope.get("counter"), Value::from(1));
    }

    #[test]
    fn nan_is_stable() {
        let scope = Scope::new();
        scope.set("number", f64::NAN);
        scope.set("counter", 0);
        scope.watch("number", bump("counter"), false).unwrap();
        scope.digest().unwrap();
        scope.digest().unwrap();
        assert_eq!(scope.get("counter"), Value::from(1));
    }

    #[test]
    fn failing_watchers_do_not_stop_the_digest() {
        let scope = Scope::new();
        scope.set("aValue", "abc");
        scope.set("counter", 0);
        scope
            .watch_expression(
                Expression::from_scope_fn(|_| Err(EvalError::raise("error"))),
                false,
            )
            .unwrap();
        scope
            .watch("aValue", |_, _, _| Err(EvalError::raise("error")), false)
            .unwrap();
        scope.watch("aValue", bump("counter"), false).unwrap();
        scope.digest().unwrap();
        assert_eq!(scope.get("counter"), Value::from(1));
    }

    #[test]
    fn apply_runs_a_digest_and_returns_the_value() {
        let scope = Scope::new();
        scope.set("counter", 0);
        scope.watch("aValue", bump("counter"), false).unwrap();
        scope.digest().unwrap();
        let v = scope.apply("aValue = 'someValue'; 42").unwrap();
        assert_eq!(v, Value::from(42));
        assert_eq!(scope.get("counter"), Value::from(2));
    }

    #[test]
    fn apply_digests_even_when_evaluation_fails() {
        let scope = Scope::new();
        scope.set("counter", 0);
        scope.watch("aValue", bump("counter"), false).unwrap();
        let result = scope.apply(Expression::from_scope_fn(|s| {
            s.set("aValue", 1);
            Err(EvalError::raise("boom"))
        }));
        assert!(matches!(result, Err(Error::Eval(EvalError::Raised(_)))));
        assert_eq!(scope.get("counter"), Value::from(1));
    }

    #[test]
    fn phase_is_visible_inside_callbacks() {
        let scope = Scope::new();
        let phases = Rc::new(RefCell::new(Vec::new()));
        let (p1, p2, p3) = (phases.clone(), phases.clone(), phases.clone());
        scope
            .watch(
                Expression::from_scope_fn(move |s| {
                    p1.borrow_mut().push(s.phase());
                    Ok(s.get("aValue"))
                }),
                move |_, _, s| {
                    p2.borrow_mut().push(s.phase());
                    Ok(())
                },
                false,
            )
            .unwrap();
        scope
            .apply(Expression::from_scope_fn(move |s| {
                p3.borrow_mut().push(s.phase());
                Ok(Value::Undefined)
            }))
            .unwrap();
        let phases = phases.borrow();
        assert_eq!(phases[0], Some(Phase::Apply));
        assert!(phases[1..].iter().all(|p| *p == Some(Phase::Digest)));
        assert_eq!(scope.phase(), None);
    }

    #[test]
    fn nested_digest_is_rejected() {
        let scope = Scope::new();
        let inner = Rc::new(RefCell::new(None));
        let i = inner.clone();
        scope
            .watch("a", move |_, _, s| {
                *i.borrow_mut() = Some(s.digest());
                Ok(())
            }, false)
            .unwrap();
        scope.digest().unwrap();
        assert_eq!(
            inner.borrow_mut().take(),
            Some(Err(Error::Digest(DigestError::PhaseInProgress {
                phase: Phase::Digest
            })))
        );
    }

    #[test]
    fn eval_async_runs_later_in_the_same_digest() {
        let scope = Scope::new();
        scope.set("aValue", Value::array([Value::from(1)]));
        scope.set("asyncEvaluated", false);
        scope.set("immediately", false);
        scope
            .watch("aValue", |_, _, s| {
                s.eval_async("asyncEvaluated = true").map_err(|e| EvalError::raise(e.to_string()))?;
                s.set("immediately", s.get("asyncEvaluated"));
                Ok(())
            }, false)
            .unwrap();
        scope.digest().unwrap();
        assert_eq!(scope.get("asyncEvaluated"), Value::from(true));
        assert_eq!(scope.get("immediately"), Value::from(false));
    }

    #[test]
    fn eval_async_from_a_watch_function_is_still_run() {
        let scope = Scope::new();
        scope.set("aValue", Value::array([Value::from(1)]));
        scope.set("asyncEvaluatedTimes", 0);
        scope
            .watch_expression(
                Expression::from_scope_fn(|s| {
                    if s.get("asyncEvaluatedTimes").to_number() < 2.0 {
                        s.eval_async("asyncEvaluatedTimes = asyncEvaluatedTimes + 1")
                            .map_err(|e| EvalError::raise(e.to_string()))?;
                    }
                    Ok(s.get("aValue"))
                }),
                false,
            )
            .unwrap();
        scope.digest().unwrap();
        assert_eq!(scope.get("asyncEvaluatedTimes"), Value::from(2));
    }

    #[test]
    fn endless_eval_async_from_a_watch_fails() {
        let scope = Scope::new();
        scope.set("aValue", 1);
        scope
            .watch_expression(
                Expression::from_scope_fn(|s| {
                    s.eval_async("1").map_err(|e| EvalError::raise(e.to_string()))?;
                    Ok(s.get("aValue"))
                }),
                false,
            )
            .unwrap();
        assert!(scope.digest().is_err());
    }

    #[test]
    fn eval_async_schedules_a_digest() {
        let scope = Scope::new();
        scope.set("aValue", "abc");
        scope.set("counter", 0);
        scope.watch("aValue", bump("counter"), false).unwrap();
        scope.eval_async("1").unwrap();
        assert_eq!(scope.get("counter"), Value::from(0));
        scope.scheduler().run_until_idle();
        assert_eq!(scope.get("counter"), Value::from(1));
    }

    #[test]
    fn apply_async_never_runs_in_the_same_cycle() {
        let scope = Scope::new();
        scope.set("aValue", 1);
        scope.set("asyncApplied", false);
        scope
            .watch("aValue", |_, _, s| {
                s.apply_async("asyncApplied = true").map_err(|e| EvalError::raise(e.to_string()))?;
                Ok(())
            }, false)
            .unwrap();
        scope.digest().unwrap();
        assert_eq!(scope.get("asyncApplied"), Value::from(false));
        scope.scheduler().run_until_idle();
        assert_eq!(scope.get("asyncApplied"), Value::from(true));
    }

    #[test]
    fn apply_async_coalesces() {
        let scope = Scope::new();
        let passes = Rc::new(Cell::new(0));
        let p = passes.clone();
        scope
            .watch_expression(
                Expression::from_scope_fn(move |s| {
                    p.set(p.get() + 1);
                    Ok(s.get("aValue"))
                }),
                false,
            )
            .unwrap();
        scope.apply_async("aValue = 'abc'").unwrap();
        scope.apply_async("aValue = 'def'").unwrap();
        assert_eq!(scope.scheduler().len(), 1);
        scope.scheduler().run_until_idle();
        assert_eq!(passes.get(), 2);
    }

    #[test]
    fn digest_flushes_and_cancels_pending_apply_async() {
        let scope = Scope::new();
        let passes = Rc::new(Cell::new(0));
        let p = passes.clone();
        scope
            .watch_expression(
                Expression::from_scope_fn(move |s| {
                    p.set(p.get() + 1);
                    Ok(s.get("aValue"))
                }),
                false,
            )
            .unwrap();
        scope.apply_async("aValue = 'abc'").unwrap();
        scope.apply_async("aValue = 'def'").unwrap();
        scope.digest().unwrap();
        assert_eq!(passes.get(), 2);
        assert_eq!(scope.get("aValue"), Value::from("def"));
        assert!(scope.scheduler().is_empty());
    }

    #[test]
    fn post_digest_runs_once_after_the_digest() {
        let scope = Scope::new();
        scope.set("aValue", "original value");
        let s = scope.clone();
        scope.post_digest(move || {
            s.set("aValue", "changed value");
            Ok(())
        });
        scope
            .watch("aValue", |new, _, s| {
                s.set("watchedValue", new.clone());
                Ok(())
            }, false)
            .unwrap();
        scope.digest().unwrap();
        assert_eq!(scope.get("watchedValue"), Value::from("original value"));
        scope.digest().unwrap();
        assert_eq!(scope.get("watchedValue"), Value::from("changed value"));
    }

    #[test]
    fn failing_post_digest_does_not_stop_the_rest() {
        let scope = Scope::new();
        let ran = Rc::new(Cell::new(false));
        let r = ran.clone();
        scope.post_digest(|| Err(EvalError::raise("error")));
        scope.post_digest(move || {
            r.set(true);
            Ok(())
        });
        scope.digest().unwrap();
        assert!(ran.get());
    }

    #[test]
    fn sibling_destroyed_mid_pass_is_skipped() {
        let root = Scope::new();
        let a = root.new_child();
        let b = root.new_child();
        let victim = b.clone();
        a.watch("x", move |_, _, _| {
            victim.destroy();
            Ok(())
        }, false)
            .unwrap();
        b.set("counter", 0);
        b.watch("x", bump("counter"), false).unwrap();
        root.digest().unwrap();
        assert!(b.is_destroyed());
        assert_eq!(b.get("counter"), Value::from(0));
        assert_eq!(root.child_count(), 1);
    }

    #[test]
    fn scope_destroyed_by_its_own_listener_stops_watching() {
        let root = Scope::new();
        let child = root.new_child();
        child.set("counter", 0);
        let me = child.clone();
        child
            .watch("x", move |_, _, _| {
                me.destroy();
                Ok(())
            }, false)
            .unwrap();
        child.watch("x", bump("counter"), false).unwrap();
        root.digest().unwrap();
        assert_eq!(child.get("counter"), Value::from(0));
        assert_eq!(child.watcher_count(), 0);
    }

    #[test]
    fn every_scope_stops_early() {
        let root = Scope::new();
        let a = root.new_child();
        a.new_child();
        root.new_child();
        let mut visited = 0;
        let finished = root.every_scope(&mut |_| {
            visited += 1;
            visited < 2
        });
        assert!(!finished);
        assert_eq!(visited, 2);
    }
}
