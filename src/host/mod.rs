//! Host adapters.
//!
//! Zones only see work that is scheduled through them. These adapters are
//! the host-side APIs that do so: an event loop with timers and
//! `queue_microtask`, event targets, and a future wrapper for async code.
//! Each registers itself with the runtime through `load_patch`.

pub mod event_loop;
pub mod events;
pub mod future;

pub use event_loop::EventLoop;
pub use events::EventTarget;
pub use future::ZonedFuture;
