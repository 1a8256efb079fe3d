//! deployd HTTP server library.
//!
//! Exposes config, state, error handling, routes and the SSE stream gateway
//! so integration tests and the binary entrypoint can both access them.

pub mod config;
pub mod error;
pub mod handlers;
pub mod response;
pub mod router;
pub mod routes;
pub mod state;
pub mod stream;
