//! Ready-made zone specs.

pub mod task_tracking;

pub use sync_test::sync_test_zone_spec;
pub use task_tracking::{TaskTracker, TASK_TRACKING_PROPERTY};
