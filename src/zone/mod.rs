//! Zone tree, delegates and tasks.
//!
//! A [`Zone`] is an immutable node in a tree of execution contexts. Hooks
//! declared in a [`ZoneSpec`] are resolved once per zone into a
//! [`ZoneDelegate`], so dispatching a hook never walks the tree.

pub mod delegate;
pub mod spec;
pub mod task;
#[allow(clippy::module_inception)]
pub mod zone;

pub use delegate::ZoneDelegate;
pub use spec::{
    CancelTaskHook, ForkHook, HandleErrorHook, HasTaskHook, HasTaskState, HookKind,
    InterceptHook, InvokeHook, InvokeTaskHook, ScheduleTaskHook, ZoneSpec,
};
pub use task::{
    Callback, CancelFn, HostHooks, ScheduleFn, Task, TaskData, TaskId, TaskSnapshot, TaskState,
    TaskType,
};
pub use zone::{Zone, ZoneId};
