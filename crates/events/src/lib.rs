//! In-process job event bus.
//!
//! The supervisor publishes a [`JobEvent`] for every lifecycle change and
//! output line; the streaming gateway subscribes to relay them to clients
//! attached to a running job.

pub mod bus;

pub use bus::{JobEvent, JobEventBus};
