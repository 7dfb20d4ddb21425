//! Patch registry.
//!
//! Host adapters integrate with the runtime by loading a named patch. The
//! patch function receives a [`ZonePrivate`] handle with access to runtime
//! internals a plain [`Runtime`] handle does not expose.

use std::any::Any;
use std::rc::Rc;

use crate::error::{ZoneError, ZoneResult};
use crate::runtime::{Runtime, RuntimeState, ZoneFrame};
use crate::zone::Task;

const SYMBOL_PREFIX: &str = "__zone_symbol__";

/// Namespaced key for natives stored by patches.
pub fn symbol(name: &str) -> String {
    format!("{SYMBOL_PREFIX}{name}")
}

/// Privileged runtime access handed to patch functions.
pub struct ZonePrivate<'a> {
    runtime: &'a Runtime,
}

impl<'a> ZonePrivate<'a> {
    fn new(runtime: &'a Runtime) -> Self {
        Self { runtime }
    }

    fn state(&self) -> &RuntimeState {
        self.runtime.state()
    }

    pub fn symbol(&self, name: &str) -> String {
        symbol(name)
    }

    pub fn current_zone_frame(&self) -> Option<Rc<ZoneFrame>> {
        self.state().current_frame()
    }

    /// Queue an already-scheduled microtask, or just request a drain with `None`.
    pub fn schedule_micro_task(&self, task: Option<Task>) {
        self.state().schedule_micro_task(task)
    }

    pub fn set_on_unhandled_error(&self, hook: impl Fn(&ZoneError) + 'static) {
        self.runtime.set_on_unhandled_error(hook);
    }

    /// Called after every completed microtask drain.
    pub fn set_microtask_drain_done(&self, hook: impl Fn() + 'static) {
        *self.state().hooks.microtask_drain_done.borrow_mut() = Some(Rc::new(hook));
    }

    /// Called when the first microtask is queued outside a task frame, so the
    /// host can arrange a drain.
    pub fn set_native_microtask(&self, hook: impl Fn() + 'static) {
        *self.state().hooks.native_microtask.borrow_mut() = Some(Rc::new(hook));
    }

    /// Keep a host value under `symbol(name)` for later patches.
    pub fn store_native(&self, name: &str, value: Rc<dyn Any>) {
        self.state().natives.borrow_mut().insert(symbol(name), value);
    }

    pub fn native(&self, name: &str) -> Option<Rc<dyn Any>> {
        self.state().natives.borrow().get(&symbol(name)).cloned()
    }
}

impl Runtime {
    /// Load a named patch once.
    ///
    /// A second load of the same name is a no-op unless the runtime was
    /// configured with `force_duplicate_zone_check` and `ignore_duplicate` is
    /// false, in which case it fails with [`ZoneError::DuplicatePatch`].
    /// Patches listed in `disabled_patches` are skipped. Returns whether the
    /// patch function ran.
    pub fn load_patch<F>(&self, name: &str, patch: F, ignore_duplicate: bool) -> ZoneResult<bool>
    where
        F: FnOnce(&Runtime, &ZonePrivate<'_>) -> ZoneResult<()>,
    {
        if self.is_patch_loaded(name) {
            if self.config().force_duplicate_zone_check && !ignore_duplicate {
                return Err(ZoneError::DuplicatePatch(name.to_string()));
            }
            tracing::trace!(patch = %name, "patch already loaded");
            return Ok(false);
        }
        if self.config().is_patch_disabled(name) {
            tracing::debug!(patch = %name, "patch disabled by configuration");
            return Ok(false);
        }

        let api = ZonePrivate::new(self);
        patch(self, &api)?;
        self.state().patches.borrow_mut().push(name.to_string());
        tracing::debug!(patch = %name, "loaded patch");
        Ok(true)
    }

    pub fn is_patch_loaded(&self, name: &str) -> bool {
        self.state().patches.borrow().iter().any(|p| p == name)
    }

    /// Names of loaded patches, in load order.
    pub fn loaded_patches(&self) -> Vec<String> {
        self.state().patches.borrow().clone()
    }

    pub fn symbol(&self, name: &str) -> String {
        symbol(name)
    }
}
