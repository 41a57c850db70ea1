//! Scope tree.
//!
//! A [`Scope`] is a model object that owns watchers and event listeners and
//! sits in a tree. Reads fall through to the prototype scope when a key is
//! missing locally; writes always land on the scope written to.
//!
//! ```text
//!   root ─┬─ child ──── grandchild        (inherits root and child)
//!         └─ isolated                     (reads only its own keys)
//! ```
//!
//! Every scope attached to the same tree shares one [`Tree`]: the digest
//! phase, the deferred queues, the expression cache and the scheduler.
//!
//! Parents hold their children; children hold weak links back up. A tree
//! lives as long as its root handle does.

mod digest;
mod events;
mod watch;

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::rc::{Rc, Weak};

use indexmap::IndexMap;

use crate::config::DigestConfig;
use crate::error::{Error, EvalError};
use crate::expr::{Expression, ExpressionCache, IntoExpression};
use crate::scheduler::{Scheduler, TaskId};
use crate::value::Value;

pub use events::{Event, EventListener};
pub use watch::{Deregistration, WatchListener};

use events::ListenerSlots;
use watch::Watcher;

// ── Phase ─────────────────────────────────────────────────────────────────────

/// What a tree is busy doing. At most one phase is active at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Digest,
    Apply,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::Digest => "$digest",
            Phase::Apply => "$apply",
        })
    }
}

// ── Tree ──────────────────────────────────────────────────────────────────────

type PostDigestFn = Box<dyn FnOnce() -> Result<(), EvalError>>;

/// A deferred evaluation and the scope it runs against.
type QueuedEval = (Weak<ScopeNode>, Expression);

/// State shared by every scope attached to one root.
struct Tree {
    root: Weak<ScopeNode>,
    next_id: Cell<u32>,
    phase: Cell<Option<Phase>>,
    last_dirty_watch: RefCell<Option<Weak<Watcher>>>,
    async_queue: RefCell<VecDeque<QueuedEval>>,
    apply_async_queue: RefCell<VecDeque<QueuedEval>>,
    apply_async_id: Cell<Option<TaskId>>,
    post_digest_queue: RefCell<VecDeque<PostDigestFn>>,
    expressions: ExpressionCache,
    scheduler: Scheduler,
    config: DigestConfig,
}

impl Tree {
    fn allocate_id(&self) -> u32 {
        let id = self.next_id.get();
        self.next_id.set(id.wrapping_add(1));
        id
    }

    fn is_last_dirty(&self, watcher: &Rc<Watcher>) -> bool {
        self.last_dirty_watch
            .borrow()
            .as_ref()
            .is_some_and(|w| std::ptr::eq(w.as_ptr(), Rc::as_ptr(watcher)))
    }

    fn set_last_dirty(&self, watcher: Option<&Rc<Watcher>>) {
        *self.last_dirty_watch.borrow_mut() = watcher.map(Rc::downgrade);
    }
}

// ── ScopeNode ─────────────────────────────────────────────────────────────────

pub(crate) struct ScopeNode {
    id: u32,
    tree: Rc<Tree>,
    model: RefCell<IndexMap<String, Value>>,
    /// Where reads of missing keys go. `None` for roots and isolated scopes.
    proto: Option<Weak<ScopeNode>>,
    /// Structural parent: digests and broadcasts reach this scope through it.
    parent: Option<Weak<ScopeNode>>,
    children: RefCell<Vec<Scope>>,
    /// Newest first.
    watchers: RefCell<Vec<Rc<Watcher>>>,
    listeners: RefCell<HashMap<String, ListenerSlots>>,
    /// Set on the whole subtree by `destroy`; walks skip flagged scopes.
    destroyed: Cell<bool>,
}

impl ScopeNode {
    fn new(tree: Rc<Tree>, proto: Option<Weak<ScopeNode>>, parent: Option<Weak<ScopeNode>>) -> Self {
        ScopeNode {
            id: tree.allocate_id(),
            tree,
            model: RefCell::new(IndexMap::new()),
            proto,
            parent,
            children: RefCell::new(Vec::new()),
            watchers: RefCell::new(Vec::new()),
            listeners: RefCell::new(HashMap::new()),
            destroyed: Cell::new(false),
        }
    }
}

// ── Scope ─────────────────────────────────────────────────────────────────────

/// Handle to a scope. Clones refer to the same scope.
#[derive(Clone)]
pub struct Scope(Rc<ScopeNode>);

impl Default for Scope {
    fn default() -> Self {
        Scope::new()
    }
}

impl Scope {
    /// A new root with default settings and its own scheduler.
    pub fn new() -> Self {
        Scope::with_config(DigestConfig::default(), Scheduler::new())
    }

    /// A new root. Deferred work is queued on `scheduler`.
    pub fn with_config(config: DigestConfig, scheduler: Scheduler) -> Self {
        let node = Rc::new_cyclic(|root| {
            let tree = Rc::new(Tree {
                root: root.clone(),
                next_id: Cell::new(1),
                phase: Cell::new(None),
                last_dirty_watch: RefCell::new(None),
                async_queue: RefCell::new(VecDeque::new()),
                apply_async_queue: RefCell::new(VecDeque::new()),
                apply_async_id: Cell::new(None),
                post_digest_queue: RefCell::new(VecDeque::new()),
                expressions: ExpressionCache::new(config.cache_expressions),
                scheduler,
                config,
            });
            ScopeNode::new(tree, None, None)
        });
        Scope(node)
    }

    // ── Hierarchy ─────────────────────────────────────────────────────────────

    /// A child that inherits this scope's properties.
    pub fn new_child(&self) -> Scope {
        self.new_scope(false, None)
    }

    /// A child that inherits nothing but still shares this tree's queues.
    pub fn new_isolated(&self) -> Scope {
        self.new_scope(true, None)
    }

    /// Create a child scope.
    ///
    /// Unless `isolated`, the child reads through to `self`. It is attached
    /// under `parent` when given, otherwise under `self`, and belongs to the
    /// tree it is attached to: that tree digests it and reaches it with
    /// events.
    pub fn new_scope(&self, isolated: bool, parent: Option<&Scope>) -> Scope {
        let parent = parent.unwrap_or(self);
        let proto = if isolated {
            None
        } else {
            Some(Rc::downgrade(&self.0))
        };
        let node = ScopeNode::new(parent.0.tree.clone(), proto, Some(Rc::downgrade(&parent.0)));
        let child = Scope(Rc::new(node));
        parent.0.children.borrow_mut().push(child.clone());
        tracing::trace!(scope = child.id(), parent = parent.id(), isolated, "scope created");
        child
    }

    /// Broadcast `$destroy` through this subtree, then detach it so no
    /// ancestor digests it again. Does nothing on a root or on a scope that
    /// is already detached.
    pub fn destroy(&self) {
        let Some(parent) = self.parent() else { return };
        let attached = parent.0.children.borrow().iter().any(|c| c.ptr_eq(self));
        if !attached {
            return;
        }
        self.broadcast("$destroy", &[]);
        parent.0.children.borrow_mut().retain(|c| !c.ptr_eq(self));
        self.every_scope(&mut |scope| {
            scope.0.destroyed.set(true);
            scope.0.watchers.borrow_mut().clear();
            scope.0.listeners.borrow_mut().clear();
            true
        });
        tracing::trace!(scope = self.id(), "scope destroyed");
    }

    /// Whether this scope, or an ancestor it hung from, was destroyed.
    pub fn is_destroyed(&self) -> bool {
        self.0.destroyed.get()
    }

    /// The structural parent, `None` for a root.
    pub fn parent(&self) -> Option<Scope> {
        self.0.parent.as_ref().and_then(Weak::upgrade).map(Scope)
    }

    /// The root of the tree this scope is attached to. A scope whose root
    /// has been dropped acts as its own root.
    pub fn root(&self) -> Scope {
        self.0
            .tree
            .root
            .upgrade()
            .map(Scope)
            .unwrap_or_else(|| self.clone())
    }

    pub fn is_root(&self) -> bool {
        self.0.parent.is_none()
    }

    pub fn children(&self) -> Vec<Scope> {
        self.0.children.borrow().clone()
    }

    pub fn child_count(&self) -> usize {
        self.0.children.borrow().len()
    }

    /// Unique within the tree.
    pub fn id(&self) -> u32 {
        self.0.id
    }

    pub fn ptr_eq(&self, other: &Scope) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    // ── Properties ────────────────────────────────────────────────────────────

    /// Read a property, falling through the prototype chain. `$parent` and
    /// `$root` resolve to the hierarchy when no scope on the chain defines
    /// them.
    pub fn get(&self, key: &str) -> Value {
        let mut node = self.0.clone();
        loop {
            if let Some(v) = node.model.borrow().get(key) {
                return v.clone();
            }
            let next = node.proto.as_ref().and_then(Weak::upgrade);
            match next {
                Some(proto) => node = proto,
                None => break,
            }
        }
        match key {
            "$parent" => self.parent().map(Value::Scope).unwrap_or_default(),
            "$root" => Value::Scope(self.root()),
            _ => Value::Undefined,
        }
    }

    /// Write a property on this scope, shadowing any inherited one.
    pub fn set(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.model.borrow_mut().insert(key.into(), value.into());
    }

    /// Delete an own property. Inherited ones become visible again.
    pub fn remove(&self, key: &str) -> Option<Value> {
        self.0.model.borrow_mut().shift_remove(key)
    }

    pub fn has_own(&self, key: &str) -> bool {
        self.0.model.borrow().contains_key(key)
    }

    /// Own property names in insertion order.
    pub fn keys(&self) -> Vec<String> {
        self.0.model.borrow().keys().cloned().collect()
    }

    // ── Evaluation ────────────────────────────────────────────────────────────

    /// Compile through this tree's expression cache.
    pub fn compile(&self, expr: impl IntoExpression) -> Result<Expression, Error> {
        expr.into_expression(&self.0.tree.expressions)
    }

    /// Evaluate an expression against this scope.
    pub fn eval(&self, expr: impl IntoExpression) -> Result<Value, Error> {
        let expr = self.compile(expr)?;
        Ok(expr.eval_in(self)?)
    }

    /// Evaluate with `locals` consulted before the scope.
    pub fn eval_with(&self, expr: impl IntoExpression, locals: &Value) -> Result<Value, Error> {
        let expr = self.compile(expr)?;
        Ok(expr.call(&Value::Scope(self.clone()), Some(locals))?)
    }

    /// The tree's active phase, if any.
    pub fn phase(&self) -> Option<Phase> {
        self.0.tree.phase.get()
    }

    pub fn scheduler(&self) -> Scheduler {
        self.0.tree.scheduler.clone()
    }

    pub fn config(&self) -> &DigestConfig {
        &self.0.tree.config
    }

    /// Number of watchers registered directly on this scope.
    pub fn watcher_count(&self) -> usize {
        self.0.watchers.borrow().len()
    }

    fn downgrade(&self) -> Weak<ScopeNode> {
        Rc::downgrade(&self.0)
    }

    fn upgrade(node: &Weak<ScopeNode>) -> Option<Scope> {
        node.upgrade().map(Scope)
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope")
            .field("id", &self.id())
            .field("keys", &self.keys())
            .field("watchers", &self.watcher_count())
            .field("children", &self.child_count())
            .finish()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn properties_read_and_write() {
        let scope = Scope::new();
        assert!(scope.get("missing").is_undefined());
        scope.set("a", 1);
        assert_eq!(scope.get("a"), Value::from(1));
        assert!(scope.has_own("a"));
        assert_eq!(scope.remove("a"), Some(Value::from(1)));
        assert!(!scope.has_own("a"));
    }

    #[test]
    fn children_inherit_but_do_not_leak_upward() {
        let parent = Scope::new();
        let child = parent.new_child();
        parent.set("aValue", Value::array([Value::from(1)]));
        assert_eq!(child.get("aValue"), parent.get("aValue"));
        assert!(child.get("aValue").identical(&parent.get("aValue")));

        child.set("mine", true);
        assert!(parent.get("mine").is_undefined());
    }

    #[test]
    fn writes_shadow_and_removal_uncovers() {
        let parent = Scope::new();
        let child = parent.new_child();
        parent.set("name", "Joe");
        child.set("name", "Jill");
        assert_eq!(parent.get("name"), Value::from("Joe"));
        assert_eq!(child.get("name"), Value::from("Jill"));
        child.remove("name");
        assert_eq!(child.get("name"), Value::from("Joe"));
    }

    #[test]
    fn inheritance_reaches_any_depth() {
        let a = Scope::new();
        let b = a.new_child();
        let c = b.new_child();
        a.set("value", 1);
        assert_eq!(c.get("value"), Value::from(1));
        b.set("another", 2);
        assert_eq!(c.get("another"), Value::from(2));
        assert!(a.get("another").is_undefined());
    }

    #[test]
    fn isolated_scopes_do_not_inherit() {
        let parent = Scope::new();
        let child = parent.new_isolated();
        parent.set("aValue", "abc");
        assert!(child.get("aValue").is_undefined());
        assert!(child.parent().unwrap().ptr_eq(&parent));
        assert!(child.root().ptr_eq(&parent));
    }

    #[test]
    fn hierarchy_members() {
        let root = Scope::new();
        let child = root.new_child();
        let grandchild = child.new_child();
        assert!(grandchild.get("$root").as_scope().unwrap().ptr_eq(&root));
        assert!(grandchild.get("$parent").as_scope().unwrap().ptr_eq(&child));
        assert!(root.get("$parent").is_undefined());
        assert!(root.is_root());
        assert!(!child.is_root());
    }

    #[test]
    fn keeps_a_record_of_children() {
        let parent = Scope::new();
        let child1 = parent.new_child();
        let child2 = parent.new_child();
        let child2_1 = child2.new_child();
        assert_eq!(parent.child_count(), 2);
        assert!(parent.children()[0].ptr_eq(&child1));
        assert!(parent.children()[1].ptr_eq(&child2));
        assert_eq!(child1.child_count(), 0);
        assert!(child2.children()[0].ptr_eq(&child2_1));
    }

    #[test]
    fn explicit_parent_attaches_elsewhere() {
        let proto_parent = Scope::new();
        let hierarchy_parent = Scope::new();
        let child = proto_parent.new_scope(false, Some(&hierarchy_parent));
        proto_parent.set("a", 42);
        assert_eq!(child.get("a"), Value::from(42));
        assert_eq!(proto_parent.child_count(), 0);
        assert_eq!(hierarchy_parent.child_count(), 1);
        assert!(child.root().ptr_eq(&hierarchy_parent));
    }

    #[test]
    fn destroy_detaches_once() {
        let parent = Scope::new();
        let child = parent.new_child();
        child.destroy();
        assert_eq!(parent.child_count(), 0);
        child.destroy();
        assert_eq!(parent.child_count(), 0);
        parent.destroy();
        assert!(parent.is_root());
    }

    #[test]
    fn ids_are_unique_within_a_tree() {
        let root = Scope::new();
        let a = root.new_child();
        let b = root.new_isolated();
        assert_ne!(root.id(), a.id());
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn eval_with_locals() {
        let scope = Scope::new();
        scope.set("a", 1);
        let locals = Value::object([("b", Value::from(2))]);
        assert_eq!(scope.eval_with("a + b", &locals).unwrap(), Value::from(3));
        assert!(scope.eval("a + c.d").unwrap() == Value::from(1));
    }

    #[test]
    fn eval_assigns_onto_the_scope() {
        let parent = Scope::new();
        let child = parent.new_child();
        parent.set("user", Value::object([("name", Value::from("Joe"))]));
        child.eval("user.name = 'Jill'").unwrap();
        assert_eq!(parent.eval("user.name").unwrap(), Value::from("Jill"));
        child.eval("local = 1").unwrap();
        assert!(child.has_own("local"));
        assert!(!parent.has_own("local"));
    }

    #[test]
    fn phase_display() {
        assert_eq!(Phase::Digest.to_string(), "$digest");
        assert_eq!(Phase::Apply.to_string(), "$apply");
    }
}
