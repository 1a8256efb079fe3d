//! Job supervision.
//!
//! [`JobSupervisor`] binds one job record to one process run: it marks the
//! job running, feeds every output line into the store and the event bus,
//! and records the terminal status, including on spawn failure,
//! cancellation, timeout, store exhaustion and panics.

pub mod live;
pub mod retry;
pub mod supervisor;

pub use live::LiveSink;
pub use retry::RetryPolicy;
pub use supervisor::{JobSupervisor, SupervisorConfig};
