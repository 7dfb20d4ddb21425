//! Event targets whose listeners are zone-aware event tasks.

use std::any::Any;
use std::cell::RefCell;
use std::rc::Rc;

use crate::error::{HostError, ZoneResult};
use crate::runtime::Runtime;
use crate::zone::{HostHooks, Task, TaskData};

pub const EVENT_TARGET_PATCH: &str = "event_target";

struct Listener {
    event: String,
    task: Task,
}

struct TargetInner {
    runtime: Runtime,
    name: String,
    listeners: RefCell<Vec<Listener>>,
}

/// A named source of events.
///
/// `add_event_listener` captures the current zone; `dispatch` runs every
/// listener for the event in the zone it was added from, with a microtask
/// checkpoint after each one.
#[derive(Clone)]
pub struct EventTarget {
    inner: Rc<TargetInner>,
}

impl EventTarget {
    pub fn new(runtime: &Runtime, name: impl Into<String>) -> ZoneResult<Self> {
        runtime.load_patch(EVENT_TARGET_PATCH, |_, _| Ok(()), true)?;
        Ok(Self {
            inner: Rc::new(TargetInner {
                runtime: runtime.clone(),
                name: name.into(),
                listeners: RefCell::new(Vec::new()),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Register `callback` for `event`. The callback receives the dispatched
    /// payload as its argument.
    pub fn add_event_listener(
        &self,
        event: &str,
        callback: impl Fn(Option<&dyn Any>) -> ZoneResult<()> + 'static,
    ) -> ZoneResult<Task> {
        let runtime = &self.inner.runtime;
        let zone = if runtime.is_patch_loaded(EVENT_TARGET_PATCH) {
            runtime.current()
        } else {
            runtime.root()
        };

        let on_schedule = Rc::downgrade(&self.inner);
        let on_cancel = on_schedule.clone();
        let event_name = event.to_string();
        let hooks = HostHooks::new()
            .on_schedule(move |task| {
                if let Some(inner) = on_schedule.upgrade() {
                    inner.listeners.borrow_mut().push(Listener {
                        event: event_name.clone(),
                        task: task.clone(),
                    });
                }
                Ok(())
            })
            .on_cancel(move |task| {
                if let Some(inner) = on_cancel.upgrade() {
                    inner.listeners.borrow_mut().retain(|l| !l.task.ptr_eq(task));
                }
                Ok(())
            });

        let source = format!("{}.addEventListener:{event}", self.inner.name);
        let task = zone.schedule_event_task(&source, callback, TaskData::default(), hooks)?;
        tracing::debug!(target_name = %self.inner.name, event, zone = %zone.name(), "listener added");
        Ok(task)
    }

    /// Remove a listener previously returned by `add_event_listener`.
    pub fn remove_event_listener(&self, task: &Task) -> Result<(), HostError> {
        let registered = self
            .inner
            .listeners
            .borrow()
            .iter()
            .any(|l| l.task.ptr_eq(task));
        let zone = match task.zone() {
            Some(zone) if registered => zone,
            _ => {
                return Err(HostError::UnknownListener {
                    event: task.source().to_string(),
                    target: self.inner.name.clone(),
                });
            }
        };
        zone.cancel_task(task)?;
        Ok(())
    }

    /// Fire `event`, invoking each listener registered for it at dispatch
    /// time. Listener errors are reported as unhandled and do not stop the
    /// remaining listeners. Returns how many listeners ran.
    pub fn dispatch(&self, event: &str, payload: &dyn Any) -> usize {
        let tasks: Vec<Task> = self
            .inner
            .listeners
            .borrow()
            .iter()
            .filter(|l| l.event == event)
            .map(|l| l.task.clone())
            .collect();

        for task in &tasks {
            if let Err(err) = task.invoke(Some(payload)) {
                self.inner.runtime.state().report_unhandled(&err);
            }
        }
        tracing::trace!(target_name = %self.inner.name, event, listeners = tasks.len(), "dispatched event");
        tasks.len()
    }

    pub fn listener_count(&self, event: &str) -> usize {
        self.inner
            .listeners
            .borrow()
            .iter()
            .filter(|l| l.event == event)
            .count()
    }
}

impl std::fmt::Debug for EventTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventTarget")
            .field("name", &self.inner.name)
            .field("listeners", &self.inner.listeners.borrow().len())
            .finish()
    }
}
