//! Zones: immutable, tree-structured execution contexts.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::error::{ZoneError, ZoneResult};
use crate::runtime::RuntimeState;
use crate::zone::delegate::ZoneDelegate;
use crate::zone::spec::ZoneSpec;
use crate::zone::task::{Callback, HostHooks, Task, TaskData, TaskState, TaskType};

static NEXT_ZONE_ID: AtomicU64 = AtomicU64::new(1);

/// Unique zone identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ZoneId(u64);

impl ZoneId {
    fn next() -> Self {
        Self(NEXT_ZONE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ZoneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "zone#{}", self.0)
    }
}

pub(crate) struct ZoneInner {
    id: ZoneId,
    name: String,
    parent: Option<Zone>,
    properties: HashMap<String, serde_json::Value>,
    delegate: ZoneDelegate,
    runtime: Rc<RuntimeState>,
}

/// An execution context node.
///
/// Zones never change after construction; [`Zone::fork`] always creates a new
/// child. Cloning a `Zone` clones the handle, and equality is identity.
#[derive(Clone)]
pub struct Zone {
    inner: Rc<ZoneInner>,
}

impl Zone {
    pub(crate) fn new_root(runtime: Rc<RuntimeState>, name: &str) -> Self {
        let inner = Rc::new_cyclic(|weak| ZoneInner {
            id: ZoneId::next(),
            name: name.to_string(),
            parent: None,
            properties: HashMap::new(),
            delegate: ZoneDelegate::new(weak.clone(), name, None, None),
            runtime,
        });
        Self { inner }
    }

    /// Construct a plain child without consulting any `on_fork` hook.
    pub(crate) fn new_child(parent: &Zone, spec: ZoneSpec) -> Self {
        let spec = Rc::new(spec);
        let inner = Rc::new_cyclic(|weak| ZoneInner {
            id: ZoneId::next(),
            name: spec.name.clone(),
            parent: Some(parent.clone()),
            properties: spec.properties.clone(),
            delegate: ZoneDelegate::new(weak.clone(), &spec.name, Some(parent.delegate()), Some(&spec)),
            runtime: parent.inner.runtime.clone(),
        });
        tracing::debug!(zone = %inner.name, parent = %parent.name(), "forked zone");
        Self { inner }
    }

    pub(crate) fn from_inner(inner: Rc<ZoneInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn runtime_state(&self) -> &RuntimeState {
        &self.inner.runtime
    }

    pub fn id(&self) -> ZoneId {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn parent(&self) -> Option<&Zone> {
        self.inner.parent.as_ref()
    }

    pub fn delegate(&self) -> &ZoneDelegate {
        &self.inner.delegate
    }

    /// Top-most ancestor.
    pub fn root(&self) -> Zone {
        let mut zone = self;
        while let Some(parent) = zone.parent() {
            zone = parent;
        }
        zone.clone()
    }

    /// Whether `ancestor` is this zone or one of its parents.
    pub fn is_descendant_of(&self, ancestor: &Zone) -> bool {
        let mut cursor = Some(self);
        while let Some(zone) = cursor {
            if zone == ancestor {
                return true;
            }
            cursor = zone.parent();
        }
        false
    }

    /// Look up a property on this zone or the nearest ancestor that has it.
    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        self.get_zone_with(key)
            .and_then(|zone| zone.inner.properties.get(key).cloned())
    }

    /// Nearest zone (self first) whose properties contain `key`.
    pub fn get_zone_with(&self, key: &str) -> Option<Zone> {
        let mut cursor = Some(self);
        while let Some(zone) = cursor {
            if zone.inner.properties.contains_key(key) {
                return Some(zone.clone());
            }
            cursor = zone.parent();
        }
        None
    }

    /// Create a child zone, through the nearest `on_fork` hook if any.
    pub fn fork(&self, spec: ZoneSpec) -> ZoneResult<Zone> {
        self.inner.delegate.fork(self, spec)
    }

    /// Capture this zone around `callback`. The returned callback runs the
    /// (possibly intercepted) original via `run_guarded` in this zone,
    /// whatever zone is current when it is called.
    pub fn wrap(
        &self,
        callback: impl Fn(Option<&dyn Any>) -> ZoneResult<()> + 'static,
        source: &str,
    ) -> Callback {
        let intercepted = self.inner.delegate.intercept(self, Rc::new(callback), source);
        let zone = self.clone();
        let source = source.to_string();
        Rc::new(move |args: Option<&dyn Any>| {
            zone.run_guarded_with_source(&source, || intercepted(args))
                .map(|_| ())
        })
    }

    /// Run `f` with this zone as the current zone. Errors propagate.
    pub fn run<R>(&self, f: impl FnOnce() -> ZoneResult<R>) -> ZoneResult<R> {
        self.run_with_source("", f)
    }

    pub fn run_with_source<R>(
        &self,
        source: &str,
        f: impl FnOnce() -> ZoneResult<R>,
    ) -> ZoneResult<R> {
        let _frame = self.inner.runtime.enter(self.clone());
        self.invoke(source, f)
    }

    /// Like [`Zone::run`], but errors go through the `handle_error` chain.
    /// Returns `Ok(None)` when a hook reported the error as handled.
    pub fn run_guarded<R>(&self, f: impl FnOnce() -> ZoneResult<R>) -> ZoneResult<Option<R>> {
        self.run_guarded_with_source("", f)
    }

    pub fn run_guarded_with_source<R>(
        &self,
        source: &str,
        f: impl FnOnce() -> ZoneResult<R>,
    ) -> ZoneResult<Option<R>> {
        let _frame = self.inner.runtime.enter(self.clone());
        match self.invoke(source, f) {
            Ok(value) => Ok(Some(value)),
            Err(err) => {
                if self.inner.delegate.handle_error(self, &err) {
                    Err(err)
                } else {
                    tracing::debug!(zone = %self.name(), error = %err, "error handled by zone");
                    Ok(None)
                }
            }
        }
    }

    fn invoke<R>(&self, source: &str, f: impl FnOnce() -> ZoneResult<R>) -> ZoneResult<R> {
        let mut f = Some(f);
        let mut output = None;
        let mut invocation = || -> ZoneResult<()> {
            if let Some(f) = f.take() {
                output = Some(f()?);
            }
            Ok(())
        };
        self.inner.delegate.invoke(self, &mut invocation, source)?;
        output.ok_or_else(|| ZoneError::CallbackNotInvoked {
            zone: self.name().to_string(),
            task_source: source.to_string(),
        })
    }

    /// Execute a task previously scheduled into this zone.
    ///
    /// Event and macro tasks that were canceled before the host fired them
    /// are skipped silently.
    pub fn run_task(&self, task: &Task, args: Option<&dyn Any>) -> ZoneResult<()> {
        self.assert_owns(task, "run")?;

        let task_type = task.task_type();
        if task.state() == TaskState::NotScheduled
            && matches!(task_type, TaskType::EventTask | TaskType::MacroTask)
        {
            tracing::trace!(zone = %self.name(), task = %task, "skipping canceled task");
            return Ok(());
        }

        let reentrant = task.is_in_progress();
        if !reentrant {
            task.transition_to(TaskState::Running, TaskState::Scheduled, None)?;
            task.set_in_progress(true);
        }
        task.increment_run_count();

        let runtime = &self.inner.runtime;
        let _current_task = runtime.enter_task(task.clone());
        let _frame = runtime.enter(self.clone());

        let result = match self.inner.delegate.invoke_task(self, task, args) {
            Ok(()) => Ok(()),
            Err(err) if self.inner.delegate.handle_error(self, &err) => Err(err),
            Err(err) => {
                tracing::debug!(zone = %self.name(), task = %task, error = %err, "task error handled by zone");
                Ok(())
            }
        };

        let settled = self.settle_after_run(task, reentrant);
        match (result, settled) {
            (Err(err), Err(settle_err)) => {
                tracing::warn!(task = %task, error = %settle_err, "failed to settle task after error");
                Err(err)
            }
            (result, settled) => result.and(settled),
        }
    }

    fn settle_after_run(&self, task: &Task, reentrant: bool) -> ZoneResult<()> {
        if !reentrant {
            task.set_in_progress(false);
        }

        let state = task.state();
        if state == TaskState::NotScheduled || state == TaskState::Unknown {
            return Ok(());
        }

        if task.task_type() == TaskType::EventTask || task.is_periodic() {
            if !reentrant {
                task.transition_to(
                    TaskState::Scheduled,
                    TaskState::Running,
                    Some(TaskState::Scheduling),
                )?;
            }
        } else {
            self.update_task_count(task, -1)?;
            if !reentrant {
                task.transition_to(
                    TaskState::NotScheduled,
                    TaskState::Running,
                    Some(TaskState::NotScheduled),
                )?;
                task.reset_run_count();
            }
        }
        Ok(())
    }

    pub fn schedule_micro_task(
        &self,
        source: &str,
        callback: impl Fn(Option<&dyn Any>) -> ZoneResult<()> + 'static,
        data: TaskData,
        hooks: HostHooks,
    ) -> ZoneResult<Task> {
        self.schedule_task(Task::new(TaskType::MicroTask, source, Rc::new(callback), data, hooks))
    }

    pub fn schedule_macro_task(
        &self,
        source: &str,
        callback: impl Fn(Option<&dyn Any>) -> ZoneResult<()> + 'static,
        data: TaskData,
        hooks: HostHooks,
    ) -> ZoneResult<Task> {
        self.schedule_task(Task::new(TaskType::MacroTask, source, Rc::new(callback), data, hooks))
    }

    pub fn schedule_event_task(
        &self,
        source: &str,
        callback: impl Fn(Option<&dyn Any>) -> ZoneResult<()> + 'static,
        data: TaskData,
        hooks: HostHooks,
    ) -> ZoneResult<Task> {
        self.schedule_task(Task::new(TaskType::EventTask, source, Rc::new(callback), data, hooks))
    }

    /// Schedule `task` into this zone through the `schedule_task` chain.
    ///
    /// Returns the task the chain produced, which a hook may have replaced.
    pub fn schedule_task(&self, task: Task) -> ZoneResult<Task> {
        if let Some(original) = task.zone()
            && original != *self
            && self.is_descendant_of(&original)
        {
            return Err(ZoneError::RescheduleIntoDescendant {
                target: self.name().to_string(),
                original: original.name().to_string(),
            });
        }

        task.transition_to(TaskState::Scheduling, TaskState::NotScheduled, None)?;
        let token = self.inner.runtime.next_token();
        task.reset_delegates(token);
        task.set_zone(self.clone());
        tracing::trace!(zone = %self.name(), task = %task, "scheduling task");

        let scheduled = match self.inner.delegate.schedule_task(self, task.clone()) {
            Ok(scheduled) => scheduled,
            Err(err) => {
                if let Err(transition_err) = task.transition_to(
                    TaskState::Unknown,
                    TaskState::Scheduling,
                    Some(TaskState::NotScheduled),
                ) {
                    tracing::warn!(task = %task, error = %transition_err, "could not mark task unknown");
                }
                self.inner.delegate.handle_error(self, &err);
                return Err(err);
            }
        };

        if scheduled.delegates_token() == Some(token) {
            self.update_task_count(&scheduled, 1)?;
        }
        if scheduled.state() == TaskState::Scheduling {
            scheduled.transition_to(TaskState::Scheduled, TaskState::Scheduling, None)?;
        }
        Ok(scheduled)
    }

    /// Cancel a task scheduled into this zone.
    pub fn cancel_task(&self, task: &Task) -> ZoneResult<()> {
        self.assert_owns(task, "cancelled")?;

        task.transition_to(
            TaskState::Canceling,
            TaskState::Scheduled,
            Some(TaskState::Running),
        )?;
        if let Err(err) = self.inner.delegate.cancel_task(self, task) {
            if let Err(transition_err) =
                task.transition_to(TaskState::Unknown, TaskState::Canceling, None)
            {
                tracing::warn!(task = %task, error = %transition_err, "could not mark task unknown");
            }
            self.inner.delegate.handle_error(self, &err);
            return Err(err);
        }

        self.update_task_count(task, -1)?;
        task.transition_to(TaskState::NotScheduled, TaskState::Canceling, None)?;
        task.reset_run_count();
        tracing::trace!(zone = %self.name(), task = %task, "canceled task");
        Ok(())
    }

    /// Settle a scheduled task the host dropped without running it.
    ///
    /// Releases its task counts and returns it to `NotScheduled`, as a cancel
    /// would, but without consulting any `cancel_task` hook.
    pub(crate) fn discard_task(&self, task: &Task) -> ZoneResult<()> {
        self.assert_owns(task, "cancelled")?;
        self.update_task_count(task, -1)?;
        task.transition_to(
            TaskState::NotScheduled,
            TaskState::Scheduled,
            Some(TaskState::Scheduling),
        )?;
        task.reset_run_count();
        tracing::trace!(zone = %self.name(), task = %task, "discarded task");
        Ok(())
    }

    fn assert_owns(&self, task: &Task, action: &'static str) -> ZoneResult<()> {
        match task.zone() {
            Some(zone) if zone == *self => Ok(()),
            other => Err(ZoneError::WrongZone {
                action,
                creation: other
                    .map(|z| z.name().to_string())
                    .unwrap_or_else(|| "NO ZONE".to_string()),
                execution: self.name().to_string(),
            }),
        }
    }

    fn update_task_count(&self, task: &Task, delta: isize) -> ZoneResult<()> {
        let delegates = if delta < 0 {
            task.take_delegates()
        } else {
            task.delegates()
        };
        for delegate in delegates {
            delegate.update_task_count(task.task_type(), delta)?;
        }
        Ok(())
    }
}

impl PartialEq for Zone {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Zone {}

impl fmt::Debug for Zone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Zone")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("parent", &self.parent().map(|p| p.name().to_string()))
            .finish()
    }
}

impl fmt::Display for Zone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner.name)
    }
}
