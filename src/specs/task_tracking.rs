//! Zone spec that records outstanding tasks.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use crate::error::ZoneResult;
use crate::zone::{Task, TaskType, ZoneSpec};

/// Property set on zones forked with [`TaskTracker::zone_spec`].
pub const TASK_TRACKING_PROPERTY: &str = "TaskTrackingZone";

#[derive(Default)]
struct TrackedTasks {
    by_type: RefCell<[Vec<Task>; 3]>,
}

impl TrackedTasks {
    fn add(&self, task: &Task) {
        self.by_type.borrow_mut()[task.task_type().index()].push(task.clone());
    }

    fn remove(&self, task: &Task) {
        self.by_type.borrow_mut()[task.task_type().index()].retain(|t| !t.ptr_eq(task));
    }
}

/// Tracks every task scheduled in or beneath its zone until the task
/// completes or is canceled. Event tasks and periodic tasks stay tracked
/// until canceled.
#[derive(Clone, Default)]
pub struct TaskTracker {
    tasks: Rc<TrackedTasks>,
}

impl TaskTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spec for a zone reporting to this tracker.
    ///
    /// The hooks hold the tracker weakly; once every `TaskTracker` handle is
    /// dropped they only forward to the parent.
    pub fn zone_spec(&self) -> ZoneSpec {
        let on_schedule = Rc::downgrade(&self.tasks);
        let on_invoke: Weak<TrackedTasks> = on_schedule.clone();
        let on_cancel: Weak<TrackedTasks> = on_schedule.clone();

        ZoneSpec::new("TaskTrackingZone")
            .with_property(TASK_TRACKING_PROPERTY, serde_json::Value::Bool(true))
            .on_schedule_task(move |parent, _, target, task| {
                let tracked = on_schedule.upgrade();
                if let Some(tracked) = &tracked {
                    tracked.add(&task);
                }
                match parent.schedule_task(target, task.clone()) {
                    Ok(scheduled) => {
                        if let Some(tracked) = &tracked
                            && !scheduled.ptr_eq(&task)
                        {
                            tracked.remove(&task);
                            tracked.add(&scheduled);
                        }
                        Ok(scheduled)
                    }
                    Err(err) => {
                        if let Some(tracked) = &tracked {
                            tracked.remove(&task);
                        }
                        Err(err)
                    }
                }
            })
            .on_invoke_task(move |parent, _, target, task, args| {
                if task.task_type() != TaskType::EventTask
                    && !task.is_periodic()
                    && let Some(tracked) = on_invoke.upgrade()
                {
                    tracked.remove(task);
                }
                parent.invoke_task(target, task, args)
            })
            .on_cancel_task(move |parent, _, target, task| {
                if let Some(tracked) = on_cancel.upgrade() {
                    tracked.remove(task);
                }
                parent.cancel_task(target, task)
            })
    }

    /// Outstanding tasks of one type, in scheduling order.
    pub fn tasks_for(&self, task_type: TaskType) -> Vec<Task> {
        self.tasks.by_type.borrow()[task_type.index()].clone()
    }

    /// Total number of tracked tasks.
    pub fn len(&self) -> usize {
        self.tasks.by_type.borrow().iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cancel every tracked event task.
    pub fn clear_events(&self) -> ZoneResult<()> {
        for task in self.tasks_for(TaskType::EventTask) {
            match task.zone() {
                Some(zone) => zone.cancel_task(&task)?,
                None => self.tasks.remove(&task),
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for TaskTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tasks = self.tasks.by_type.borrow();
        f.debug_struct("TaskTracker")
            .field("micro_tasks", &tasks[0].len())
            .field("macro_tasks", &tasks[1].len())
            .field("event_tasks", &tasks[2].len())
            .finish()
    }
}
