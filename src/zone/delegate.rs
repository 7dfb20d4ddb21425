//! Per-zone dispatch table.
//!
//! A [`ZoneDelegate`] resolves, once at fork time, which ancestor handles each
//! interception point. Calls then go straight to the bound hook, or to the
//! built-in default when no zone up the chain declared one.

use std::any::Any;
use std::cell::Cell;
use std::rc::{Rc, Weak};

use crate::error::{ZoneError, ZoneResult};
use crate::zone::spec::{HasTaskState, HookKind, ZoneSpec};
use crate::zone::task::{Callback, Task, TaskType};
use crate::zone::zone::{Zone, ZoneInner};

/// Who handles a bound interception point.
#[derive(Clone)]
enum Handler {
    /// A spec that declared the hook.
    Spec(Rc<ZoneSpec>),
    /// Forward to the parent delegate. Used for task hooks in zones that must
    /// count tasks for `on_has_task` without declaring the task hooks themselves.
    PassThrough,
}

#[derive(Clone)]
struct Binding {
    handler: Handler,
    /// Delegate handed to the hook as its `parent_delegate`.
    delegate: ZoneDelegate,
    /// Zone that declared the hook, handed over as `current_zone`.
    zone: Weak<ZoneInner>,
}

impl Binding {
    fn current_zone(&self) -> ZoneResult<Zone> {
        self.zone
            .upgrade()
            .map(Zone::from_inner)
            .ok_or_else(|| ZoneError::ZoneDropped {
                zone: "<declaring zone>".to_string(),
            })
    }

    fn spec(&self) -> Option<&ZoneSpec> {
        match &self.handler {
            Handler::Spec(spec) => Some(spec),
            Handler::PassThrough => None,
        }
    }
}

struct DelegateInner {
    zone: Weak<ZoneInner>,
    zone_name: String,
    bindings: [Option<Binding>; HookKind::COUNT],
    task_counts: [Cell<usize>; 3],
}

/// Cached dispatch chain for one zone.
#[derive(Clone)]
pub struct ZoneDelegate {
    inner: Rc<DelegateInner>,
}

impl ZoneDelegate {
    pub(crate) fn new(
        zone: Weak<ZoneInner>,
        zone_name: &str,
        parent: Option<&ZoneDelegate>,
        spec: Option<&Rc<ZoneSpec>>,
    ) -> Self {
        let mut bindings: [Option<Binding>; HookKind::COUNT] = Default::default();

        if let (Some(parent), Some(spec)) = (parent, spec) {
            let own = |handler: Handler| Binding {
                handler,
                delegate: parent.clone(),
                zone: zone.clone(),
            };

            for kind in HookKind::ALL {
                bindings[kind.index()] = if spec.declares(kind) {
                    Some(own(Handler::Spec(spec.clone())))
                } else if kind == HookKind::HasTask {
                    None
                } else {
                    parent.binding(kind).cloned()
                };
            }

            // Any zone below an `on_has_task` declaration counts its own tasks,
            // so its task hooks must run even when only an ancestor declared them.
            if spec.declares(HookKind::HasTask) || parent.counts_tasks() {
                if !spec.declares(HookKind::HasTask) {
                    bindings[HookKind::HasTask.index()] = Some(own(Handler::PassThrough));
                }
                for kind in [
                    HookKind::ScheduleTask,
                    HookKind::InvokeTask,
                    HookKind::CancelTask,
                ] {
                    if !spec.declares(kind) {
                        bindings[kind.index()] = Some(own(Handler::PassThrough));
                    }
                }
            }
        }

        Self {
            inner: Rc::new(DelegateInner {
                zone,
                zone_name: zone_name.to_string(),
                bindings,
                task_counts: Default::default(),
            }),
        }
    }

    /// Zone this delegate belongs to.
    pub fn zone(&self) -> Option<Zone> {
        self.inner.zone.upgrade().map(Zone::from_inner)
    }

    /// Whether this delegate takes part in task ref-counting.
    pub fn counts_tasks(&self) -> bool {
        self.binding(HookKind::HasTask).is_some()
    }

    /// Whether some zone up the chain customizes the given hook.
    pub fn is_bound(&self, kind: HookKind) -> bool {
        self.binding(kind).is_some()
    }

    /// Outstanding tasks of the given type counted by this delegate.
    pub fn task_count(&self, task_type: TaskType) -> usize {
        self.inner.task_counts[task_type.index()].get()
    }

    fn binding(&self, kind: HookKind) -> Option<&Binding> {
        self.inner.bindings[kind.index()].as_ref()
    }

    pub fn fork(&self, target: &Zone, spec: ZoneSpec) -> ZoneResult<Zone> {
        if let Some(binding) = self.binding(HookKind::Fork)
            && let Some(hook) = binding.spec().and_then(|s| s.on_fork.clone())
        {
            let current = binding.current_zone()?;
            return hook(&binding.delegate, &current, target, spec);
        }
        Ok(Zone::new_child(target, spec))
    }

    pub fn intercept(&self, target: &Zone, callback: Callback, source: &str) -> Callback {
        if let Some(binding) = self.binding(HookKind::Intercept)
            && let Some(hook) = binding.spec().and_then(|s| s.on_intercept.clone())
            && let Ok(current) = binding.current_zone()
        {
            return hook(&binding.delegate, &current, target, callback, source);
        }
        callback
    }

    pub fn invoke(
        &self,
        target: &Zone,
        invocation: &mut dyn FnMut() -> ZoneResult<()>,
        source: &str,
    ) -> ZoneResult<()> {
        if let Some(binding) = self.binding(HookKind::Invoke)
            && let Some(hook) = binding.spec().and_then(|s| s.on_invoke.clone())
        {
            let current = binding.current_zone()?;
            return hook(&binding.delegate, &current, target, invocation, source);
        }
        invocation()
    }

    /// Route an error through the `on_handle_error` chain. `true` means the
    /// caller should rethrow; with no hook declared anywhere, always `true`.
    pub fn handle_error(&self, target: &Zone, error: &ZoneError) -> bool {
        if let Some(binding) = self.binding(HookKind::HandleError)
            && let Some(hook) = binding.spec().and_then(|s| s.on_handle_error.clone())
            && let Ok(current) = binding.current_zone()
        {
            return hook(&binding.delegate, &current, target, error);
        }
        true
    }

    pub fn schedule_task(&self, target: &Zone, task: Task) -> ZoneResult<Task> {
        if let Some(binding) = self.binding(HookKind::ScheduleTask) {
            if self.counts_tasks() {
                task.push_delegate(self.clone());
            }
            if let Some(hook) = binding.spec().and_then(|s| s.on_schedule_task.clone()) {
                let current = binding.current_zone()?;
                return hook(&binding.delegate, &current, target, task);
            }
            return binding.delegate.schedule_task(target, task);
        }

        if let Some(schedule) = task.schedule_fn() {
            schedule(&task)?;
        } else if task.task_type() == TaskType::MicroTask {
            target.runtime_state().schedule_micro_task(Some(task.clone()));
        } else {
            return Err(ZoneError::MissingScheduleFn {
                task_type: task.task_type(),
                task_source: task.source().to_string(),
            });
        }
        Ok(task)
    }

    pub fn invoke_task(
        &self,
        target: &Zone,
        task: &Task,
        args: Option<&dyn Any>,
    ) -> ZoneResult<()> {
        if let Some(binding) = self.binding(HookKind::InvokeTask) {
            if let Some(hook) = binding.spec().and_then(|s| s.on_invoke_task.clone()) {
                let current = binding.current_zone()?;
                return hook(&binding.delegate, &current, target, task, args);
            }
            return binding.delegate.invoke_task(target, task, args);
        }
        task.call_callback(args)
    }

    pub fn cancel_task(&self, target: &Zone, task: &Task) -> ZoneResult<()> {
        if let Some(binding) = self.binding(HookKind::CancelTask) {
            if let Some(hook) = binding.spec().and_then(|s| s.on_cancel_task.clone()) {
                let current = binding.current_zone()?;
                return hook(&binding.delegate, &current, target, task);
            }
            return binding.delegate.cancel_task(target, task);
        }

        match task.cancel_fn() {
            Some(cancel) => cancel(task),
            None => Err(ZoneError::NotCancelable {
                task_type: task.task_type(),
                task_source: task.source().to_string(),
            }),
        }
    }

    /// Notify the `on_has_task` chain. Hook errors go to `handle_error` and
    /// are not propagated.
    pub fn has_task(&self, target: &Zone, state: HasTaskState) {
        let Some(binding) = self.binding(HookKind::HasTask) else {
            return;
        };

        let result = match binding.spec().and_then(|s| s.on_has_task.clone()) {
            Some(hook) => binding
                .current_zone()
                .and_then(|current| hook(&binding.delegate, &current, target, state)),
            None => {
                binding.delegate.has_task(target, state);
                Ok(())
            }
        };

        if let Err(err) = result {
            tracing::warn!(zone = %target.name(), error = %err, "on_has_task hook failed");
            self.handle_error(target, &err);
        }
    }

    /// Adjust the outstanding-task counter for `task_type`, firing `has_task`
    /// when it crosses zero in either direction.
    pub(crate) fn update_task_count(&self, task_type: TaskType, delta: isize) -> ZoneResult<()> {
        let counter = &self.inner.task_counts[task_type.index()];
        let prev = counter.get();
        let next = prev
            .checked_add_signed(delta)
            .ok_or(ZoneError::TaskCountUnderflow)?;
        counter.set(next);

        if prev == 0 || next == 0 {
            let state = HasTaskState {
                micro_task: self.task_count(TaskType::MicroTask) > 0,
                macro_task: self.task_count(TaskType::MacroTask) > 0,
                event_task: self.task_count(TaskType::EventTask) > 0,
                change: task_type,
            };
            tracing::trace!(zone = %self.inner.zone_name, ?state, "task count crossed zero");
            if let Some(zone) = self.zone() {
                self.has_task(&zone, state);
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for ZoneDelegate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let bound: Vec<HookKind> = HookKind::ALL
            .into_iter()
            .filter(|kind| self.is_bound(*kind))
            .collect();
        f.debug_struct("ZoneDelegate")
            .field("zone", &self.inner.zone_name)
            .field("bound", &bound)
            .field("counts_tasks", &self.counts_tasks())
            .finish()
    }
}
