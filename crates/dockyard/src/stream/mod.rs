//! Caller-facing event streams.
//!
//! Streams are for UX only: they read the record and relay container output
//! but never write state. Dropping a stream leaves the readiness monitor
//! untouched.

mod events;
mod progress;
mod relay;

pub use events::{EventKind, LifecycleEvent, sanitize_log_line};
pub use progress::{StreamSettings, log_events, progress_stream};
pub use relay::spawn_log_relay;
