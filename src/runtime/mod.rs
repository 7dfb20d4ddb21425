//! Runtime: the process-wide state behind every zone.
//!
//! One [`Runtime`] owns a root zone and the mutable state zones share:
//! - the current-zone frame stack (pushed and popped around every run)
//! - the current task pointer
//! - the microtask queue (`microtask`)
//! - the patch registry used by host adapters (`patch`)
//!
//! Runtimes are independent of each other, so tests and embedders can keep
//! several isolated ones in one process.

pub mod microtask;
pub mod patch;

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::config::RuntimeConfig;
use crate::error::{ZoneError, ZoneResult};
use crate::zone::{Task, Zone};

use microtask::MicrotaskQueue;
pub use patch::ZonePrivate;

/// Hook receiving errors that escaped a microtask drain or a host dispatch.
pub type UnhandledErrorHook = Rc<dyn Fn(&ZoneError)>;

/// Plain notification hook.
pub type NotifyHook = Rc<dyn Fn()>;

/// One entry of the current-zone stack.
#[derive(Debug)]
pub struct ZoneFrame {
    pub parent: Option<Rc<ZoneFrame>>,
    pub zone: Zone,
}

#[derive(Default)]
pub(crate) struct RuntimeHooks {
    pub(crate) on_unhandled_error: RefCell<Option<UnhandledErrorHook>>,
    pub(crate) microtask_drain_done: RefCell<Option<NotifyHook>>,
    pub(crate) native_microtask: RefCell<Option<NotifyHook>>,
}

pub(crate) struct RuntimeState {
    pub(crate) config: RuntimeConfig,
    frame: RefCell<Option<Rc<ZoneFrame>>>,
    current_task: RefCell<Option<Task>>,
    nested_task_frames: Cell<usize>,
    next_token: Cell<u64>,
    pub(crate) microtasks: MicrotaskQueue,
    pub(crate) hooks: RuntimeHooks,
    pub(crate) patches: RefCell<Vec<String>>,
    pub(crate) natives: RefCell<std::collections::HashMap<String, Rc<dyn std::any::Any>>>,
}

/// Restores the previous zone frame on drop.
pub(crate) struct FrameGuard<'a> {
    state: &'a RuntimeState,
    previous: Option<Rc<ZoneFrame>>,
}

impl Drop for FrameGuard<'_> {
    fn drop(&mut self) {
        *self.state.frame.borrow_mut() = self.previous.take();
    }
}

/// Restores the previous current task on drop.
pub(crate) struct CurrentTaskGuard<'a> {
    state: &'a RuntimeState,
    previous: Option<Task>,
}

impl Drop for CurrentTaskGuard<'_> {
    fn drop(&mut self) {
        *self.state.current_task.borrow_mut() = self.previous.take();
    }
}

/// Tracks nesting of host-level task invocations.
pub(crate) struct TaskFrameGuard<'a> {
    state: &'a RuntimeState,
}

impl TaskFrameGuard<'_> {
    pub(crate) fn is_outermost(&self) -> bool {
        self.state.nested_task_frames.get() == 1
    }
}

impl Drop for TaskFrameGuard<'_> {
    fn drop(&mut self) {
        let depth = self.state.nested_task_frames.get();
        self.state.nested_task_frames.set(depth.saturating_sub(1));
    }
}

impl RuntimeState {
    fn new(config: RuntimeConfig) -> Self {
        Self {
            config,
            frame: RefCell::new(None),
            current_task: RefCell::new(None),
            nested_task_frames: Cell::new(0),
            next_token: Cell::new(0),
            microtasks: MicrotaskQueue::default(),
            hooks: RuntimeHooks::default(),
            patches: RefCell::new(Vec::new()),
            natives: RefCell::new(std::collections::HashMap::new()),
        }
    }

    /// Push `zone` as the current zone until the guard drops.
    pub(crate) fn enter(&self, zone: Zone) -> FrameGuard<'_> {
        let mut slot = self.frame.borrow_mut();
        let previous = slot.clone();
        *slot = Some(Rc::new(ZoneFrame {
            parent: previous.clone(),
            zone,
        }));
        FrameGuard {
            state: self,
            previous,
        }
    }

    pub(crate) fn enter_task(&self, task: Task) -> CurrentTaskGuard<'_> {
        let previous = self.current_task.borrow_mut().replace(task);
        CurrentTaskGuard {
            state: self,
            previous,
        }
    }

    pub(crate) fn enter_task_frame(&self) -> TaskFrameGuard<'_> {
        self.nested_task_frames
            .set(self.nested_task_frames.get() + 1);
        TaskFrameGuard { state: self }
    }

    pub(crate) fn in_task_frame(&self) -> bool {
        self.nested_task_frames.get() > 0
    }

    pub(crate) fn current_frame(&self) -> Option<Rc<ZoneFrame>> {
        self.frame.borrow().clone()
    }

    pub(crate) fn current_zone(&self) -> Option<Zone> {
        self.frame.borrow().as_ref().map(|frame| frame.zone.clone())
    }

    pub(crate) fn current_task(&self) -> Option<Task> {
        self.current_task.borrow().clone()
    }

    /// Fresh token for tagging a scheduling pass.
    pub(crate) fn next_token(&self) -> u64 {
        let token = self.next_token.get() + 1;
        self.next_token.set(token);
        token
    }

    /// Hand an error nobody else will see to the unhandled-error hook.
    pub(crate) fn report_unhandled(&self, error: &ZoneError) {
        let hook = self.hooks.on_unhandled_error.borrow().clone();
        match hook {
            Some(hook) => hook(error),
            None => tracing::warn!(error = %error, "unhandled error in zone runtime"),
        }
    }
}

/// Handle to a zone runtime.
///
/// Cloning is cheap and yields another handle to the same runtime.
#[derive(Clone)]
pub struct Runtime {
    root: Zone,
}

impl Runtime {
    /// Create a runtime with the default configuration.
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::default())
    }

    pub fn with_config(config: RuntimeConfig) -> Self {
        let name = config.root_zone_name.clone();
        let state = Rc::new(RuntimeState::new(config));
        let root = Zone::new_root(state, &name);
        tracing::debug!(root = %root.name(), "zone runtime created");
        Self { root }
    }

    pub(crate) fn state(&self) -> &RuntimeState {
        self.root.runtime_state()
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.state().config
    }

    pub fn root(&self) -> Zone {
        self.root.clone()
    }

    /// Zone at the top of the frame stack, or the root when nothing runs.
    pub fn current(&self) -> Zone {
        self.state()
            .current_zone()
            .unwrap_or_else(|| self.root.clone())
    }

    /// Task whose callback is executing, if any.
    pub fn current_task(&self) -> Option<Task> {
        self.state().current_task()
    }

    pub fn current_frame(&self) -> Option<Rc<ZoneFrame>> {
        self.state().current_frame()
    }

    /// Run the microtask queue to exhaustion.
    pub fn drain_micro_task_queue(&self) -> ZoneResult<()> {
        self.state().drain_micro_task_queue()
    }

    pub fn has_pending_microtasks(&self) -> bool {
        !self.state().microtasks.is_empty()
    }

    pub fn pending_microtasks(&self) -> usize {
        self.state().microtasks.len()
    }

    /// Whether a drain was requested and no native hook was there to take it.
    pub fn drain_requested(&self) -> bool {
        self.state().microtasks.drain_requested()
    }

    /// Install the unhandled-error hook.
    pub fn set_on_unhandled_error(&self, hook: impl Fn(&ZoneError) + 'static) {
        *self.state().hooks.on_unhandled_error.borrow_mut() = Some(Rc::new(hook));
    }

    /// Drop every queued microtask, installed hook and stored native.
    ///
    /// Queued tasks and hooks can hold zones, which hold the runtime; clearing
    /// them releases those references. Dropped microtasks give back their
    /// task counts first.
    pub fn shutdown(&self) {
        let state = self.state();
        let dropped = state.discard_micro_tasks();
        *state.hooks.on_unhandled_error.borrow_mut() = None;
        *state.hooks.microtask_drain_done.borrow_mut() = None;
        *state.hooks.native_microtask.borrow_mut() = None;
        state.natives.borrow_mut().clear();
        tracing::debug!(dropped_microtasks = dropped, "zone runtime shut down");
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("root", &self.root.name())
            .field("current", &self.current().name())
            .field("patches", &self.loaded_patches())
            .finish()
    }
}
