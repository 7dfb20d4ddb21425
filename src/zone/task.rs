//! Task types and the task state machine.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ZoneError, ZoneResult};
use crate::zone::delegate::ZoneDelegate;
use crate::zone::zone::Zone;

/// User work carried by a task or produced by [`Zone::wrap`].
///
/// The argument is whatever the host hands over when it fires the task
/// (an event payload, for instance); timers pass `None`.
pub type Callback = Rc<dyn Fn(Option<&dyn Any>) -> ZoneResult<()>>;

/// Host registration hook: performs the real scheduling for a task.
pub type ScheduleFn = Rc<dyn Fn(&Task) -> ZoneResult<()>>;

/// Host cancellation hook: undoes what the matching [`ScheduleFn`] did.
pub type CancelFn = Rc<dyn Fn(&Task) -> ZoneResult<()>>;

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// Kind of task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TaskType {
    /// Runs before control returns to the host loop.
    MicroTask,
    /// Host-scheduled work such as a timer, possibly periodic.
    MacroTask,
    /// A listener that may fire any number of times.
    EventTask,
}

impl TaskType {
    pub const ALL: [TaskType; 3] = [Self::MicroTask, Self::MacroTask, Self::EventTask];

    pub(crate) fn index(self) -> usize {
        match self {
            Self::MicroTask => 0,
            Self::MacroTask => 1,
            Self::EventTask => 2,
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::MicroTask => "microTask",
            Self::MacroTask => "macroTask",
            Self::EventTask => "eventTask",
        };
        write!(f, "{s}")
    }
}

/// State of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TaskState {
    /// Initial state, and the state a finished or canceled task returns to.
    NotScheduled,
    /// Inside `schedule_task`.
    Scheduling,
    /// Waiting for the host to fire it.
    Scheduled,
    /// Callback is executing.
    Running,
    /// Inside `cancel_task`.
    Canceling,
    /// A schedule or cancel hook failed.
    Unknown,
}

impl TaskState {
    /// Whether the task can still fire.
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Scheduled | Self::Running)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NotScheduled => "notScheduled",
            Self::Scheduling => "scheduling",
            Self::Scheduled => "scheduled",
            Self::Running => "running",
            Self::Canceling => "canceling",
            Self::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

/// Host-facing data attached to a task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskData {
    /// The task fires repeatedly until canceled.
    pub is_periodic: bool,
    /// Delay (or period) requested by the scheduling API.
    pub delay: Option<Duration>,
    /// Identifier the host assigned when registering the task.
    pub handle_id: Option<u64>,
}

impl TaskData {
    /// Data for a one-shot delayed task.
    pub fn delayed(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Default::default()
        }
    }

    /// Data for a periodic task.
    pub fn periodic(period: Duration) -> Self {
        Self {
            is_periodic: true,
            delay: Some(period),
            handle_id: None,
        }
    }
}

/// Optional host registration and cancellation for a task.
#[derive(Clone, Default)]
pub struct HostHooks {
    pub schedule: Option<ScheduleFn>,
    pub cancel: Option<CancelFn>,
}

impl HostHooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the function that registers the task with the host.
    pub fn on_schedule(mut self, f: impl Fn(&Task) -> ZoneResult<()> + 'static) -> Self {
        self.schedule = Some(Rc::new(f));
        self
    }

    /// Set the function that removes the task from the host.
    pub fn on_cancel(mut self, f: impl Fn(&Task) -> ZoneResult<()> + 'static) -> Self {
        self.cancel = Some(Rc::new(f));
        self
    }
}

impl fmt::Debug for HostHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostHooks")
            .field("schedule", &self.schedule.is_some())
            .field("cancel", &self.cancel.is_some())
            .finish()
    }
}

/// Unique task identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(u64);

impl TaskId {
    fn next() -> Self {
        Self(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

/// Serializable view of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSnapshot {
    pub id: TaskId,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub state: TaskState,
    pub source: String,
    pub zone: Option<String>,
    pub run_count: u32,
    pub data: TaskData,
}

struct TaskInner {
    id: TaskId,
    task_type: TaskType,
    source: String,
    callback: Callback,
    data: RefCell<TaskData>,
    schedule_fn: Option<ScheduleFn>,
    cancel_fn: Option<CancelFn>,
    state: Cell<TaskState>,
    zone: RefCell<Option<Zone>>,
    /// Delegates that counted this task while it was scheduled.
    delegates: RefCell<Option<Vec<ZoneDelegate>>>,
    /// Token identifying the scheduling pass that produced `delegates`.
    delegates_token: Cell<u64>,
    run_count: Cell<u32>,
    /// Set while `run_task` is executing this task at the outermost level.
    in_progress: Cell<bool>,
}

/// A reified unit of scheduled work.
///
/// Cloning a `Task` clones the handle; equality is identity.
#[derive(Clone)]
pub struct Task {
    inner: Rc<TaskInner>,
}

impl Task {
    /// Create an unscheduled task. Pass it to [`Zone::schedule_task`] to schedule it.
    pub fn new(
        task_type: TaskType,
        source: impl Into<String>,
        callback: Callback,
        data: TaskData,
        hooks: HostHooks,
    ) -> Self {
        Self {
            inner: Rc::new(TaskInner {
                id: TaskId::next(),
                task_type,
                source: source.into(),
                callback,
                data: RefCell::new(data),
                schedule_fn: hooks.schedule,
                cancel_fn: hooks.cancel,
                state: Cell::new(TaskState::NotScheduled),
                zone: RefCell::new(None),
                delegates: RefCell::new(None),
                delegates_token: Cell::new(0),
                run_count: Cell::new(0),
                in_progress: Cell::new(false),
            }),
        }
    }

    pub fn id(&self) -> TaskId {
        self.inner.id
    }

    pub fn task_type(&self) -> TaskType {
        self.inner.task_type
    }

    /// Name of the API that created the task.
    pub fn source(&self) -> &str {
        &self.inner.source
    }

    pub fn state(&self) -> TaskState {
        self.inner.state.get()
    }

    pub fn data(&self) -> TaskData {
        self.inner.data.borrow().clone()
    }

    pub fn is_periodic(&self) -> bool {
        self.inner.data.borrow().is_periodic
    }

    /// Record the host's identifier for this task.
    pub fn set_handle_id(&self, handle_id: u64) {
        self.inner.data.borrow_mut().handle_id = Some(handle_id);
    }

    pub fn handle_id(&self) -> Option<u64> {
        self.inner.data.borrow().handle_id
    }

    /// Zone the task was scheduled into, if it has been scheduled.
    pub fn zone(&self) -> Option<Zone> {
        self.inner.zone.borrow().clone()
    }

    /// Number of times the task has run since it was last reset.
    pub fn run_count(&self) -> u32 {
        self.inner.run_count.get()
    }

    pub fn has_schedule_fn(&self) -> bool {
        self.inner.schedule_fn.is_some()
    }

    pub fn has_cancel_fn(&self) -> bool {
        self.inner.cancel_fn.is_some()
    }

    /// Whether both handles refer to the same task.
    pub fn ptr_eq(&self, other: &Task) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Fire the task the way a host does.
    ///
    /// Runs the task in its zone and, when this is the outermost task frame,
    /// drains the microtask queue before returning.
    pub fn invoke(&self, args: Option<&dyn Any>) -> ZoneResult<()> {
        let zone = self.zone().ok_or_else(|| ZoneError::WrongZone {
            action: "run",
            creation: "NO ZONE".to_string(),
            execution: "NO ZONE".to_string(),
        })?;
        let runtime = zone.runtime_state();
        let frame = runtime.enter_task_frame();
        let result = zone.run_task(self, args);
        let drained = if frame.is_outermost() {
            runtime.drain_micro_task_queue()
        } else {
            Ok(())
        };
        drop(frame);
        result.and(drained)
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            id: self.id(),
            task_type: self.task_type(),
            state: self.state(),
            source: self.source().to_string(),
            zone: self.zone().map(|z| z.name().to_string()),
            run_count: self.run_count(),
            data: self.data(),
        }
    }

    /// Call the user callback directly, outside of any zone bookkeeping.
    pub(crate) fn call_callback(&self, args: Option<&dyn Any>) -> ZoneResult<()> {
        (self.inner.callback)(args)
    }

    pub(crate) fn schedule_fn(&self) -> Option<ScheduleFn> {
        self.inner.schedule_fn.clone()
    }

    pub(crate) fn cancel_fn(&self) -> Option<CancelFn> {
        self.inner.cancel_fn.clone()
    }

    pub(crate) fn set_zone(&self, zone: Zone) {
        *self.inner.zone.borrow_mut() = Some(zone);
    }

    pub(crate) fn increment_run_count(&self) {
        self.inner.run_count.set(self.inner.run_count.get().saturating_add(1));
    }

    pub(crate) fn reset_run_count(&self) {
        self.inner.run_count.set(0);
    }

    pub(crate) fn is_in_progress(&self) -> bool {
        self.inner.in_progress.get()
    }

    pub(crate) fn set_in_progress(&self, in_progress: bool) {
        self.inner.in_progress.set(in_progress);
    }

    /// Start a fresh delegate list for a scheduling pass identified by `token`.
    pub(crate) fn reset_delegates(&self, token: u64) {
        *self.inner.delegates.borrow_mut() = Some(Vec::new());
        self.inner.delegates_token.set(token);
    }

    pub(crate) fn delegates_token(&self) -> Option<u64> {
        self.inner
            .delegates
            .borrow()
            .as_ref()
            .map(|_| self.inner.delegates_token.get())
    }

    pub(crate) fn push_delegate(&self, delegate: ZoneDelegate) {
        if let Some(list) = self.inner.delegates.borrow_mut().as_mut() {
            list.push(delegate);
        }
    }

    pub(crate) fn delegates(&self) -> Vec<ZoneDelegate> {
        self.inner.delegates.borrow().clone().unwrap_or_default()
    }

    pub(crate) fn take_delegates(&self) -> Vec<ZoneDelegate> {
        self.inner.delegates.borrow_mut().take().unwrap_or_default()
    }

    /// Move to `to`, asserting the current state is one of the expected ones.
    pub(crate) fn transition_to(
        &self,
        to: TaskState,
        from: TaskState,
        or_from: Option<TaskState>,
    ) -> ZoneResult<()> {
        let actual = self.state();
        if actual != from && Some(actual) != or_from {
            let expected = match or_from {
                Some(other) => format!("'{from}' or '{other}'"),
                None => format!("'{from}'"),
            };
            return Err(ZoneError::InvalidTransition {
                task_type: self.task_type(),
                task_source: self.source().to_string(),
                to,
                expected,
                actual,
            });
        }

        self.inner.state.set(to);
        if to == TaskState::NotScheduled {
            self.inner.delegates.borrow_mut().take();
        }
        Ok(())
    }
}

impl PartialEq for Task {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for Task {}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.handle_id() {
            Some(handle) => write!(f, "{handle}"),
            None => write!(f, "{} '{}'", self.task_type(), self.source()),
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id())
            .field("type", &self.task_type())
            .field("source", &self.source())
            .field("state", &self.state())
            .field("run_count", &self.run_count())
            .finish()
    }
}
