//! Error types for the zone runtime.

use crate::zone::{TaskState, TaskType};

/// Top-level error type for the crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Zone error: {0}")]
    Zone(#[from] ZoneError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Host error: {0}")]
    Host(#[from] HostError),
}

/// Errors raised by zones, delegates and tasks.
///
/// Everything except [`ZoneError::Callback`] is an invariant violation: it is
/// never retried and never swallowed by the runtime itself (a `handle_error`
/// hook may still choose to swallow it inside `run_guarded`).
#[derive(Debug, thiserror::Error)]
pub enum ZoneError {
    #[error("A task can only be {action} in the zone of creation! (Creation: {creation}; Execution: {execution})")]
    WrongZone {
        action: &'static str,
        creation: String,
        execution: String,
    },

    #[error("{task_type} '{task_source}': can not transition to '{to}', expecting state {expected}, was '{actual}'.")]
    InvalidTransition {
        task_type: TaskType,
        task_source: String,
        to: TaskState,
        expected: String,
        actual: TaskState,
    },

    #[error("can not reschedule task to {target} which is descendants of the original zone {original}")]
    RescheduleIntoDescendant { target: String, original: String },

    #[error("Task is missing scheduleFn: {task_type} '{task_source}'")]
    MissingScheduleFn { task_type: TaskType, task_source: String },

    #[error("Task is not cancelable: {task_type} '{task_source}'")]
    NotCancelable { task_type: TaskType, task_source: String },

    #[error("More tasks executed then were scheduled.")]
    TaskCountUnderflow,

    #[error("Already loaded patch: {0}")]
    DuplicatePatch(String),

    #[error("Zone '{zone}' invoke hook did not call the callback (source: {task_source})")]
    CallbackNotInvoked { zone: String, task_source: String },

    #[error("Zone '{zone}' is no longer alive")]
    ZoneDropped { zone: String },

    #[error("Microtask queue did not settle after {iterations} drain passes")]
    DrainLimitExceeded { iterations: usize },

    #[error("Cannot call {task_source} from within a sync test ({zone})")]
    SyncTestViolation { task_source: String, zone: String },

    #[error(transparent)]
    Callback(#[from] anyhow::Error),
}

impl ZoneError {
    /// Build a callback error from a plain message.
    pub fn callback(message: impl std::fmt::Display) -> Self {
        Self::Callback(anyhow::anyhow!("{message}"))
    }

    /// Whether this error came from user code rather than a runtime invariant.
    pub fn is_callback(&self) -> bool {
        matches!(self, Self::Callback(_))
    }
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Errors raised by the host adapters.
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("Timer {handle} is not registered with the event loop")]
    UnknownTimer { handle: u64 },

    #[error("Listener for '{event}' is not registered on target '{target}'")]
    UnknownListener { event: String, target: String },

    #[error("Event loop did not become idle after {turns} turns")]
    NotIdle { turns: usize },

    #[error("Zone error: {0}")]
    Zone(#[from] ZoneError),
}

/// Result alias used throughout the zone core.
pub type ZoneResult<T> = std::result::Result<T, ZoneError>;
