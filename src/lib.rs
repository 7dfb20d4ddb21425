//! zone-rt: zones and tasks for propagating execution context across
//! asynchronous work.

pub mod config;
pub mod error;
pub mod host;
pub mod runtime;
pub mod specs;
pub mod zone;

pub use config::{EventLoopConfig, RuntimeConfig};
pub use error::{Error, ZoneError, ZoneResult};
pub use runtime::{Runtime, ZonePrivate};
pub use zone::{Task, TaskState, TaskType, Zone, ZoneDelegate, ZoneSpec};
