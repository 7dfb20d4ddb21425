//! Deterministic host loop with a virtual clock.
//!
//! Timers are macro tasks scheduled through the current zone; the loop keeps
//! them ordered by `(deadline, sequence)` and fires them when the clock is
//! advanced. Every fired timer is followed by a microtask checkpoint.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap};
use std::rc::{Rc, Weak};
use std::time::Duration;

use crate::config::EventLoopConfig;
use crate::error::{HostError, ZoneError, ZoneResult};
use crate::runtime::Runtime;
use crate::zone::{HostHooks, Task, TaskData, TaskState, Zone};

/// Periodic timers never fire more often than this.
const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Deadline of a timer whose delay runs past the end of the clock.
const NEVER: Duration = Duration::MAX;

pub const TIMERS_PATCH: &str = "timers";
pub const QUEUE_MICROTASK_PATCH: &str = "queue_microtask";
const EVENT_LOOP_PATCH: &str = "event_loop";

type TimerKey = (Duration, u64);

struct LoopInner {
    runtime: Runtime,
    config: EventLoopConfig,
    now: Cell<Duration>,
    timers: RefCell<BTreeMap<TimerKey, Task>>,
    /// Handle id to the timer's current slot in `timers`.
    handles: RefCell<HashMap<u64, TimerKey>>,
    next_seq: Cell<u64>,
    next_handle: Cell<u64>,
    checkpoint_requested: Cell<bool>,
}

impl LoopInner {
    fn next_seq(&self) -> u64 {
        let seq = self.next_seq.get() + 1;
        self.next_seq.set(seq);
        seq
    }

    fn interval_of(&self, task: &Task) -> Duration {
        let delay = task
            .data()
            .delay
            .unwrap_or_default()
            .max(self.config.min_timer_delay);
        if task.is_periodic() {
            delay.max(MIN_INTERVAL)
        } else {
            delay
        }
    }

    /// Register `task` to fire `interval` from `from`.
    fn arm(&self, task: &Task, from: Duration) {
        let handle = match task.handle_id() {
            Some(handle) => handle,
            None => {
                let handle = self.next_handle.get() + 1;
                self.next_handle.set(handle);
                task.set_handle_id(handle);
                handle
            }
        };
        let key = (from.saturating_add(self.interval_of(task)), self.next_seq());
        self.timers.borrow_mut().insert(key, task.clone());
        self.handles.borrow_mut().insert(handle, key);
        tracing::trace!(handle, deadline_ms = key.0.as_millis() as u64, "armed timer");
    }

    fn disarm(&self, task: &Task) {
        let Some(handle) = task.handle_id() else {
            return;
        };
        if let Some(key) = self.handles.borrow_mut().remove(&handle) {
            self.timers.borrow_mut().remove(&key);
            tracing::trace!(handle, "disarmed timer");
        }
    }

    /// Remove the earliest timer due at or before `limit`, advancing the clock
    /// to its deadline. Periodic timers are re-armed before they are returned.
    fn pop_due(&self, limit: Duration) -> Option<Task> {
        let (key, task) = {
            let mut timers = self.timers.borrow_mut();
            let (&key, _) = timers.first_key_value()?;
            if key.0 > limit || key.0 == NEVER {
                return None;
            }
            timers.pop_first()?
        };
        self.now.set(self.now.get().max(key.0));
        if let Some(handle) = task.handle_id() {
            self.handles.borrow_mut().remove(&handle);
        }
        if task.is_periodic() {
            self.arm(&task, key.0);
        }
        Some(task)
    }

    fn next_deadline(&self) -> Option<Duration> {
        self.timers
            .borrow()
            .first_key_value()
            .map(|(key, _)| key.0)
            .filter(|deadline| *deadline != NEVER)
    }

    fn fire(&self, task: &Task) {
        tracing::trace!(task = %task, "firing timer");
        if let Err(err) = task.invoke(None) {
            self.runtime.state().report_unhandled(&err);
        }
    }
}

/// Host event loop driving timers and microtask checkpoints.
///
/// Cloning yields another handle to the same loop.
#[derive(Clone)]
pub struct EventLoop {
    inner: Rc<LoopInner>,
}

impl EventLoop {
    /// Create a loop for `runtime` and load its patches.
    ///
    /// Installs the loop as the runtime's native microtask hook; a runtime is
    /// meant to be driven by a single loop.
    pub fn new(runtime: &Runtime, config: EventLoopConfig) -> ZoneResult<Self> {
        let inner = Rc::new(LoopInner {
            runtime: runtime.clone(),
            config,
            now: Cell::new(Duration::ZERO),
            timers: RefCell::new(BTreeMap::new()),
            handles: RefCell::new(HashMap::new()),
            next_seq: Cell::new(0),
            next_handle: Cell::new(0),
            checkpoint_requested: Cell::new(false),
        });

        let weak = Rc::downgrade(&inner);
        runtime.load_patch(
            EVENT_LOOP_PATCH,
            move |_, api| {
                api.set_native_microtask(move || {
                    if let Some(inner) = weak.upgrade() {
                        inner.checkpoint_requested.set(true);
                    }
                });
                Ok(())
            },
            false,
        )?;
        runtime.load_patch(TIMERS_PATCH, |_, _| Ok(()), false)?;
        runtime.load_patch(QUEUE_MICROTASK_PATCH, |_, _| Ok(()), false)?;

        Ok(Self { inner })
    }

    pub fn runtime(&self) -> &Runtime {
        &self.inner.runtime
    }

    /// Current virtual time since the loop was created.
    pub fn now(&self) -> Duration {
        self.inner.now.get()
    }

    pub fn pending_timers(&self) -> usize {
        self.inner.timers.borrow().len()
    }

    /// Whether a microtask was queued outside a task frame since the last checkpoint.
    pub fn checkpoint_requested(&self) -> bool {
        self.inner.checkpoint_requested.get()
    }

    /// Zone a patched API schedules into: the current zone, or the root zone
    /// when the patch was not loaded (the API then behaves unpatched).
    fn scheduling_zone(&self, patch: &str) -> Zone {
        let runtime = &self.inner.runtime;
        if runtime.is_patch_loaded(patch) {
            runtime.current()
        } else {
            runtime.root()
        }
    }

    fn timer_hooks(&self) -> HostHooks {
        let on_schedule = Rc::downgrade(&self.inner);
        let on_cancel = Weak::clone(&on_schedule);
        HostHooks::new()
            .on_schedule(move |task| {
                let inner = on_schedule
                    .upgrade()
                    .ok_or_else(|| ZoneError::callback("event loop is gone"))?;
                inner.arm(task, inner.now.get());
                Ok(())
            })
            .on_cancel(move |task| {
                if let Some(inner) = on_cancel.upgrade() {
                    inner.disarm(task);
                }
                Ok(())
            })
    }

    /// Run `callback` once, `delay` from now, in the current zone.
    ///
    /// A deadline past the end of the virtual clock never comes due; the
    /// timer stays pending until cleared.
    pub fn set_timeout(
        &self,
        callback: impl Fn(Option<&dyn Any>) -> ZoneResult<()> + 'static,
        delay: Duration,
    ) -> ZoneResult<Task> {
        self.scheduling_zone(TIMERS_PATCH).schedule_macro_task(
            "setTimeout",
            callback,
            TaskData::delayed(delay),
            self.timer_hooks(),
        )
    }

    /// Run `callback` every `period` until the timer is cleared.
    pub fn set_interval(
        &self,
        callback: impl Fn(Option<&dyn Any>) -> ZoneResult<()> + 'static,
        period: Duration,
    ) -> ZoneResult<Task> {
        self.scheduling_zone(TIMERS_PATCH).schedule_macro_task(
            "setInterval",
            callback,
            TaskData::periodic(period),
            self.timer_hooks(),
        )
    }

    /// Cancel a timer. Clearing a fired one-shot timer, or a one-shot timer
    /// from inside its own callback, does nothing.
    pub fn clear_timer(&self, task: &Task) -> Result<(), HostError> {
        let cancelable = task.state() != TaskState::NotScheduled
            && (task.is_periodic() || task.run_count() == 0);
        if !cancelable {
            return Ok(());
        }
        let zone = task.zone().ok_or(HostError::UnknownTimer {
            handle: task.handle_id().unwrap_or_default(),
        })?;
        zone.cancel_task(task)?;
        Ok(())
    }

    /// Cancel a timer by the handle id the loop assigned to it.
    pub fn clear_timer_by_handle(&self, handle: u64) -> Result<(), HostError> {
        let task = {
            let handles = self.inner.handles.borrow();
            let key = handles.get(&handle).ok_or(HostError::UnknownTimer { handle })?;
            self.inner.timers.borrow().get(key).cloned()
        };
        match task {
            Some(task) => self.clear_timer(&task),
            None => Err(HostError::UnknownTimer { handle }),
        }
    }

    /// Queue `callback` as a microtask in the current zone.
    pub fn queue_microtask(
        &self,
        callback: impl Fn(Option<&dyn Any>) -> ZoneResult<()> + 'static,
    ) -> ZoneResult<Task> {
        self.scheduling_zone(QUEUE_MICROTASK_PATCH).schedule_micro_task(
            "queueMicrotask",
            callback,
            TaskData::default(),
            HostHooks::new(),
        )
    }

    /// Drain pending microtasks.
    pub fn checkpoint(&self) -> Result<(), HostError> {
        self.inner.checkpoint_requested.set(false);
        self.inner.runtime.drain_micro_task_queue()?;
        Ok(())
    }

    /// Move the clock forward by `by`, firing every timer that comes due in
    /// deadline order. Returns how many timers fired.
    pub fn advance(&self, by: Duration) -> Result<usize, HostError> {
        self.checkpoint()?;
        let limit = self.now().saturating_add(by);
        let mut fired = 0;
        while let Some(task) = self.inner.pop_due(limit) {
            self.inner.fire(&task);
            fired += 1;
        }
        self.inner.now.set(limit);
        self.checkpoint()?;
        if fired > 0 {
            tracing::debug!(fired, now_ms = limit.as_millis() as u64, "advanced event loop");
        }
        Ok(fired)
    }

    /// Fire timers until none remain, jumping the clock to each deadline.
    ///
    /// Fails with [`HostError::NotIdle`] after `max_idle_turns` turns, which
    /// is what an uncleared interval leads to.
    pub fn run_until_idle(&self) -> Result<usize, HostError> {
        self.checkpoint()?;
        let mut turns = 0;
        while let Some(deadline) = self.inner.next_deadline() {
            if turns >= self.inner.config.max_idle_turns {
                return Err(HostError::NotIdle { turns });
            }
            let by = deadline.saturating_sub(self.now());
            turns += self.advance(by)?;
        }
        Ok(turns)
    }
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("now", &self.now())
            .field("pending_timers", &self.pending_timers())
            .finish()
    }
}
