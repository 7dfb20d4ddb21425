//! The microtask queue and its drain loop.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;

use crate::error::{ZoneError, ZoneResult};
use crate::runtime::RuntimeState;
use crate::zone::Task;

/// FIFO of microtasks waiting for the next drain.
#[derive(Default)]
pub(crate) struct MicrotaskQueue {
    tasks: RefCell<VecDeque<Task>>,
    draining: Cell<bool>,
    drain_requested: Cell<bool>,
}

impl MicrotaskQueue {
    pub(crate) fn len(&self) -> usize {
        self.tasks.borrow().len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.tasks.borrow().is_empty()
    }

    pub(crate) fn drain_requested(&self) -> bool {
        self.drain_requested.get()
    }

    fn push(&self, task: Task) {
        self.tasks.borrow_mut().push_back(task);
    }

    /// Take everything queued so far, leaving the queue empty for tasks
    /// scheduled by the ones about to run.
    fn take_snapshot(&self) -> VecDeque<Task> {
        std::mem::take(&mut *self.tasks.borrow_mut())
    }

    /// Empty the queue and withdraw any pending drain request.
    fn clear(&self) -> VecDeque<Task> {
        self.drain_requested.set(false);
        self.take_snapshot()
    }
}

impl std::fmt::Debug for MicrotaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MicrotaskQueue")
            .field("len", &self.len())
            .field("draining", &self.draining.get())
            .finish()
    }
}

/// Resets the draining flag even if a task panics.
struct DrainingGuard<'a>(&'a Cell<bool>);

impl Drop for DrainingGuard<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

impl RuntimeState {
    /// Append to the microtask queue.
    ///
    /// The first microtask queued outside any task frame asks the host for a
    /// drain: through the native hook when one is installed, otherwise by
    /// raising the `drain_requested` flag for the embedder to poll.
    pub(crate) fn schedule_micro_task(&self, task: Option<Task>) {
        if !self.in_task_frame() && self.microtasks.is_empty() {
            let native = self.hooks.native_microtask.borrow().clone();
            match native {
                Some(hook) => hook(),
                None => self.microtasks.drain_requested.set(true),
            }
        }
        if let Some(task) = task {
            self.microtasks.push(task);
        }
    }

    /// Drop every queued microtask without running it.
    ///
    /// Each dropped task gives back its task counts and returns to
    /// `NotScheduled`. Returns how many tasks were dropped.
    pub(crate) fn discard_micro_tasks(&self) -> usize {
        let dropped = self.microtasks.clear();
        let count = dropped.len();
        for task in dropped {
            let Some(zone) = task.zone() else {
                continue;
            };
            if let Err(err) = zone.discard_task(&task) {
                tracing::warn!(task = %task, error = %err, "could not settle dropped microtask");
            }
        }
        count
    }

    /// Run queued microtasks until the queue stays empty.
    ///
    /// Tasks queued while draining run in the same drain. Task errors are
    /// reported through the unhandled-error hook and do not stop the drain.
    /// A drain started while one is already running returns immediately.
    pub(crate) fn drain_micro_task_queue(&self) -> ZoneResult<()> {
        if self.microtasks.draining.get() {
            return Ok(());
        }
        self.microtasks.draining.set(true);
        self.microtasks.drain_requested.set(false);
        let guard = DrainingGuard(&self.microtasks.draining);

        let limit = self.config.max_drain_passes;
        let mut passes = 0usize;
        let mut ran = 0usize;
        while !self.microtasks.is_empty() {
            if limit > 0 && passes >= limit {
                let dropped = self.discard_micro_tasks();
                tracing::warn!(passes, dropped, "microtask drain limit reached");
                return Err(ZoneError::DrainLimitExceeded { iterations: passes });
            }
            passes += 1;

            for task in self.microtasks.take_snapshot() {
                ran += 1;
                let Some(zone) = task.zone() else {
                    tracing::warn!(task = %task, "dropping microtask with no zone");
                    continue;
                };
                if let Err(err) = zone.run_task(&task, None) {
                    self.report_unhandled(&err);
                }
            }
        }

        drop(guard);
        if ran > 0 {
            tracing::trace!(passes, ran, "drained microtask queue");
        }
        let done = self.hooks.microtask_drain_done.borrow().clone();
        if let Some(done) = done {
            done();
        }
        Ok(())
    }
}
