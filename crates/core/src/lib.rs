//! Domain logic for the deployment job service.
//!
//! Everything in this crate is free of database and HTTP concerns: the job
//! model and its state machine, the flag schema driven command builder,
//! progress extraction, and the child process runner.

pub mod command;
pub mod error;
pub mod job;
pub mod process;
pub mod progress;
pub mod types;
