//! Scope events: `on`, `emit` and `broadcast`.
//!
//! Deregistering a listener leaves an empty slot behind rather than
//! shifting the list, so a listener that removes itself or a neighbour while
//! an event is being fired never makes the loop skip anyone. Empty slots are
//! swept the next time that event fires on the scope.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use crate::error::EvalError;
use crate::value::Value;

use super::{Deregistration, Scope};

/// Listener signature: `(event, extra_args)`.
pub type EventListener = dyn Fn(&Event, &[Value]) -> Result<(), EvalError>;

pub(super) type ListenerSlots = Vec<Option<Rc<EventListener>>>;

// ── Event ─────────────────────────────────────────────────────────────────────

struct EventInner {
    name: String,
    target_scope: Scope,
    current_scope: RefCell<Option<Scope>>,
    stoppable: bool,
    propagation_stopped: Cell<bool>,
    default_prevented: Cell<bool>,
}

/// The object every listener of one `emit` or `broadcast` shares.
#[derive(Clone)]
pub struct Event(Rc<EventInner>);

impl Event {
    fn new(name: &str, target: &Scope, stoppable: bool) -> Self {
        Event(Rc::new(EventInner {
            name: name.to_string(),
            target_scope: target.clone(),
            current_scope: RefCell::new(None),
            stoppable,
            propagation_stopped: Cell::new(false),
            default_prevented: Cell::new(false),
        }))
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    /// The scope the event was fired on.
    pub fn target_scope(&self) -> &Scope {
        &self.0.target_scope
    }

    /// The scope whose listeners are running. `None` once firing is over.
    pub fn current_scope(&self) -> Option<Scope> {
        self.0.current_scope.borrow().clone()
    }

    /// Keep an emitted event from reaching further ancestors. Listeners on
    /// the current scope still run. Broadcasts ignore this.
    pub fn stop_propagation(&self) {
        if self.0.stoppable {
            self.0.propagation_stopped.set(true);
        }
    }

    pub fn is_propagation_stopped(&self) -> bool {
        self.0.propagation_stopped.get()
    }

    pub fn prevent_default(&self) {
        self.0.default_prevented.set(true);
    }

    pub fn default_prevented(&self) -> bool {
        self.0.default_prevented.get()
    }

    /// Same event object.
    pub fn ptr_eq(&self, other: &Event) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    fn set_current(&self, scope: Option<&Scope>) {
        *self.0.current_scope.borrow_mut() = scope.cloned();
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("name", &self.0.name)
            .field("target_scope", &self.0.target_scope.id())
            .field("propagation_stopped", &self.is_propagation_stopped())
            .field("default_prevented", &self.default_prevented())
            .finish()
    }
}

// ── Scope API ─────────────────────────────────────────────────────────────────

impl Scope {
    /// Listen for `name` on this scope.
    pub fn on(
        &self,
        name: &str,
        listener: impl Fn(&Event, &[Value]) -> Result<(), EvalError> + 'static,
    ) -> Deregistration {
        let listener: Rc<EventListener> = Rc::new(listener);
        let registered = Rc::downgrade(&listener);
        self.0
            .listeners
            .borrow_mut()
            .entry(name.to_string())
            .or_default()
            .push(Some(listener));

        let scope = self.downgrade();
        let name = name.to_string();
        Deregistration::new(move || {
            let Some(node) = scope.upgrade() else { return };
            let mut listeners = node.listeners.borrow_mut();
            let Some(slots) = listeners.get_mut(&name) else { return };
            let found = slots
                .iter_mut()
                .find(|slot| {
                    slot.as_ref()
                        .is_some_and(|l| Rc::as_ptr(l).cast::<()>() == registered.as_ptr().cast::<()>())
                });
            if let Some(slot) = found {
                *slot = None;
            }
        })
    }

    /// Fire `name` here, then on each ancestor in turn until a listener
    /// stops propagation or the root is done.
    pub fn emit(&self, name: &str, args: &[Value]) -> Event {
        let event = Event::new(name, self, true);
        let mut scope = Some(self.clone());
        while let Some(current) = scope {
            event.set_current(Some(&current));
            current.fire(&event, args);
            if event.is_propagation_stopped() {
                break;
            }
            scope = current.parent();
        }
        event.set_current(None);
        event
    }

    /// Fire `name` here and on every descendant, depth first.
    pub fn broadcast(&self, name: &str, args: &[Value]) -> Event {
        let event = Event::new(name, self, false);
        self.every_scope(&mut |scope| {
            event.set_current(Some(scope));
            scope.fire(&event, args);
            true
        });
        event.set_current(None);
        event
    }

    /// Number of live listeners for `name` on this scope.
    pub fn listener_count(&self, name: &str) -> usize {
        self.0
            .listeners
            .borrow()
            .get(name)
            .map_or(0, |slots| slots.iter().flatten().count())
    }

    fn fire(&self, event: &Event, args: &[Value]) {
        let mut i = 0;
        loop {
            let slot = {
                let mut listeners = self.0.listeners.borrow_mut();
                let Some(slots) = listeners.get_mut(event.name()) else { return };
                if i >= slots.len() {
                    return;
                }
                if slots[i].is_none() {
                    slots.remove(i);
                }
                slots.get(i).cloned().flatten()
            };
            let Some(listener) = slot else { continue };
            if let Err(e) = listener(event, args) {
                tracing::error!(
                    scope = self.id(),
                    event = event.name(),
                    error = %e,
                    "event listener failed"
                );
            }
            i += 1;
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
