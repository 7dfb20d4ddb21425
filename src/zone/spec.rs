//! Zone specifications: the hooks a forked zone declares.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::error::{ZoneError, ZoneResult};
use crate::zone::delegate::ZoneDelegate;
use crate::zone::task::{Callback, Task, TaskType};
use crate::zone::zone::Zone;

/// Interception point resolved by a [`ZoneDelegate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookKind {
    Fork,
    Intercept,
    Invoke,
    HandleError,
    ScheduleTask,
    InvokeTask,
    CancelTask,
    HasTask,
}

impl HookKind {
    pub const COUNT: usize = 8;

    pub const ALL: [HookKind; Self::COUNT] = [
        Self::Fork,
        Self::Intercept,
        Self::Invoke,
        Self::HandleError,
        Self::ScheduleTask,
        Self::InvokeTask,
        Self::CancelTask,
        Self::HasTask,
    ];

    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

/// Snapshot passed to `on_has_task` when a task counter crosses zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HasTaskState {
    pub micro_task: bool,
    pub macro_task: bool,
    pub event_task: bool,
    /// Task type whose counter changed.
    pub change: TaskType,
}

/// `on_fork(parent_delegate, current_zone, target_zone, spec)`
pub type ForkHook = Rc<dyn Fn(&ZoneDelegate, &Zone, &Zone, ZoneSpec) -> ZoneResult<Zone>>;

/// `on_intercept(parent_delegate, current_zone, target_zone, callback, source)`
pub type InterceptHook = Rc<dyn Fn(&ZoneDelegate, &Zone, &Zone, Callback, &str) -> Callback>;

/// `on_invoke(parent_delegate, current_zone, target_zone, invocation, source)`
///
/// The invocation runs the user callback; a hook that wants the default
/// behavior forwards it with `parent_delegate.invoke(target_zone, invocation, source)`.
pub type InvokeHook = Rc<
    dyn Fn(&ZoneDelegate, &Zone, &Zone, &mut dyn FnMut() -> ZoneResult<()>, &str) -> ZoneResult<()>,
>;

/// `on_handle_error(parent_delegate, current_zone, target_zone, error)`.
/// Returning `true` rethrows.
pub type HandleErrorHook = Rc<dyn Fn(&ZoneDelegate, &Zone, &Zone, &ZoneError) -> bool>;

/// `on_schedule_task(parent_delegate, current_zone, target_zone, task)`
pub type ScheduleTaskHook = Rc<dyn Fn(&ZoneDelegate, &Zone, &Zone, Task) -> ZoneResult<Task>>;

/// `on_invoke_task(parent_delegate, current_zone, target_zone, task, args)`
pub type InvokeTaskHook =
    Rc<dyn Fn(&ZoneDelegate, &Zone, &Zone, &Task, Option<&dyn Any>) -> ZoneResult<()>>;

/// `on_cancel_task(parent_delegate, current_zone, target_zone, task)`
pub type CancelTaskHook = Rc<dyn Fn(&ZoneDelegate, &Zone, &Zone, &Task) -> ZoneResult<()>>;

/// `on_has_task(parent_delegate, current_zone, target_zone, state)`
pub type HasTaskHook = Rc<dyn Fn(&ZoneDelegate, &Zone, &Zone, HasTaskState) -> ZoneResult<()>>;

/// Configuration for [`Zone::fork`]: a name, inheritable properties, and
/// optional hooks. Undeclared hooks fall through to the nearest ancestor.
#[derive(Clone, Default)]
pub struct ZoneSpec {
    pub name: String,
    pub properties: HashMap<String, serde_json::Value>,
    pub on_fork: Option<ForkHook>,
    pub on_intercept: Option<InterceptHook>,
    pub on_invoke: Option<InvokeHook>,
    pub on_handle_error: Option<HandleErrorHook>,
    pub on_schedule_task: Option<ScheduleTaskHook>,
    pub on_invoke_task: Option<InvokeTaskHook>,
    pub on_cancel_task: Option<CancelTaskHook>,
    pub on_has_task: Option<HasTaskHook>,
}

impl ZoneSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.properties.insert(key.into(), value);
        self
    }

    pub fn on_fork(
        mut self,
        f: impl Fn(&ZoneDelegate, &Zone, &Zone, ZoneSpec) -> ZoneResult<Zone> + 'static,
    ) -> Self {
        self.on_fork = Some(Rc::new(f));
        self
    }

    pub fn on_intercept(
        mut self,
        f: impl Fn(&ZoneDelegate, &Zone, &Zone, Callback, &str) -> Callback + 'static,
    ) -> Self {
        self.on_intercept = Some(Rc::new(f));
        self
    }

    pub fn on_invoke(
        mut self,
        f: impl Fn(&ZoneDelegate, &Zone, &Zone, &mut dyn FnMut() -> ZoneResult<()>, &str) -> ZoneResult<()>
        + 'static,
    ) -> Self {
        self.on_invoke = Some(Rc::new(f));
        self
    }

    pub fn on_handle_error(
        mut self,
        f: impl Fn(&ZoneDelegate, &Zone, &Zone, &ZoneError) -> bool + 'static,
    ) -> Self {
        self.on_handle_error = Some(Rc::new(f));
        self
    }

    pub fn on_schedule_task(
        mut self,
        f: impl Fn(&ZoneDelegate, &Zone, &Zone, Task) -> ZoneResult<Task> + 'static,
    ) -> Self {
        self.on_schedule_task = Some(Rc::new(f));
        self
    }

    pub fn on_invoke_task(
        mut self,
        f: impl Fn(&ZoneDelegate, &Zone, &Zone, &Task, Option<&dyn Any>) -> ZoneResult<()> + 'static,
    ) -> Self {
        self.on_invoke_task = Some(Rc::new(f));
        self
    }

    pub fn on_cancel_task(
        mut self,
        f: impl Fn(&ZoneDelegate, &Zone, &Zone, &Task) -> ZoneResult<()> + 'static,
    ) -> Self {
        self.on_cancel_task = Some(Rc::new(f));
        self
    }

    pub fn on_has_task(
        mut self,
        f: impl Fn(&ZoneDelegate, &Zone, &Zone, HasTaskState) -> ZoneResult<()> + 'static,
    ) -> Self {
        self.on_has_task = Some(Rc::new(f));
        self
    }

    /// Whether this spec overrides the given hook.
    pub fn declares(&self, kind: HookKind) -> bool {
        match kind {
            HookKind::Fork => self.on_fork.is_some(),
            HookKind::Intercept => self.on_intercept.is_some(),
            HookKind::Invoke => self.on_invoke.is_some(),
            HookKind::HandleError => self.on_handle_error.is_some(),
            HookKind::ScheduleTask => self.on_schedule_task.is_some(),
            HookKind::InvokeTask => self.on_invoke_task.is_some(),
            HookKind::CancelTask => self.on_cancel_task.is_some(),
            HookKind::HasTask => self.on_has_task.is_some(),
        }
    }

    fn declared(&self) -> Vec<HookKind> {
        HookKind::ALL
            .into_iter()
            .filter(|kind| self.declares(*kind))
            .collect()
    }
}

impl fmt::Debug for ZoneSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ZoneSpec")
            .field("name", &self.name)
            .field("properties", &self.properties)
            .field("hooks", &self.declared())
            .finish()
    }
}
