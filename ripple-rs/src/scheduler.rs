//! Timer queue standing in for the host event loop.
//!
//! Scopes never block: `eval_async` and `apply_async` hand zero-delay
//! callbacks to a [`Scheduler`], and whoever owns the loop decides when they
//! run. Tests drain it synchronously with [`Scheduler::run_until_idle`];
//! an async host drives it with [`Scheduler::run`]:
//!
//! ```rust,ignore
//! # use ripple::Scheduler;
//! let scheduler = Scheduler::new();
//! // … register watches, call apply_async …
//! scheduler.run().await;
//! ```

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::time::{Duration, Instant};

/// Handle returned by [`Scheduler::set_timeout`].
pub type TaskId = u32;

// ── Task ──────────────────────────────────────────────────────────────────────

struct Task {
    id: TaskId,
    due: Instant,
    callback: Box<dyn FnOnce()>,
}

#[derive(Default)]
struct TaskQueue {
    tasks: Vec<Task>,
    next_id: TaskId,
}

impl TaskQueue {
    /// Remove and return the earliest task, optionally only if due by `now`.
    /// Ties run in scheduling order.
    fn pop_earliest(&mut self, now: Option<Instant>) -> Option<Task> {
        let (idx, task) = self
            .tasks
            .iter()
            .enumerate()
            .min_by_key(|(_, t)| (t.due, t.id))?;
        if now.is_some_and(|now| task.due > now) {
            return None;
        }
        Some(self.tasks.remove(idx))
    }
}

// ── Scheduler ─────────────────────────────────────────────────────────────────

/// Shared single-threaded timer queue. Clones refer to the same queue.
#[derive(Clone, Default)]
pub struct Scheduler(Rc<RefCell<TaskQueue>>);

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `callback` once `delay` has elapsed.
    pub fn set_timeout(&self, delay: Duration, callback: impl FnOnce() + 'static) -> TaskId {
        let mut queue = self.0.borrow_mut();
        queue.next_id = queue.next_id.wrapping_add(1);
        let id = queue.next_id;
        queue.tasks.push(Task {
            id,
            due: Instant::now() + delay,
            callback: Box::new(callback),
        });
        id
    }

    /// Cancel a pending callback. Returns `true` if it had not run yet.
    pub fn clear_timeout(&self, id: TaskId) -> bool {
        let mut queue = self.0.borrow_mut();
        let before = queue.tasks.len();
        queue.tasks.retain(|t| t.id != id);
        queue.tasks.len() < before
    }

    /// Deadline of the soonest pending callback.
    pub fn next_wakeup(&self) -> Option<Instant> {
        self.0.borrow().tasks.iter().map(|t| t.due).min()
    }

    /// Run every callback due by now, including ones they schedule with no
    /// delay. Returns how many ran.
    pub fn run_ready(&self) -> usize {
        self.drain(Some(Instant::now()))
    }

    /// Run callbacks in deadline order, without waiting, until none remain.
    pub fn run_until_idle(&self) -> usize {
        self.drain(None)
    }

    fn drain(&self, now: Option<Instant>) -> usize {
        let mut ran = 0;
        loop {
            // The borrow must end before the callback runs: callbacks schedule.
            let next = self.0.borrow_mut().pop_earliest(now);
            let Some(task) = next else { break };
            (task.callback)();
            ran += 1;
        }
        ran
    }

    /// Drive the queue on a tokio runtime until it is empty.
    pub async fn run(&self) {
        while let Some(deadline) = self.next_wakeup() {
            tokio::time::sleep_until(deadline.into()).await;
            let ran = self.run_ready();
            tracing::trace!(ran, "scheduler tick");
        }
    }

    /// Number of pending callbacks.
    pub fn len(&self) -> usize {
        self.0.borrow().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.borrow().tasks.is_empty()
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler").field("pending", &self.len()).finish()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
