use std::sync::Arc;

use deployd_core::command::FlagSchema;
use deployd_db::{CachedJobStore, JobStore};
use deployd_events::JobEventBus;
use deployd_worker::JobSupervisor;

use crate::config::ServerConfig;

/// Shared application state available to all Axum handlers via `State<AppState>`.
///
/// This is cheaply cloneable (inner data is behind `Arc`).
#[derive(Clone)]
pub struct AppState {
    /// Authoritative job records.
    pub store: Arc<dyn JobStore>,
    /// Runs submitted jobs and tracks their tasks.
    pub supervisor: Arc<JobSupervisor>,
    /// Fan-out of job events to attached stream clients.
    pub bus: Arc<JobEventBus>,
    /// Flags accepted by the deployment command.
    pub schema: Arc<FlagSchema>,
    pub config: Arc<ServerConfig>,
}

impl AppState {
    /// Wire the event bus and supervisor around `store`.
    pub fn new(store: Arc<dyn JobStore>, schema: FlagSchema, config: ServerConfig) -> Self {
        let bus = Arc::new(JobEventBus::default());
        let supervisor = Arc::new(JobSupervisor::new(
            Arc::clone(&store),
            Arc::clone(&bus),
            config.supervisor_config(),
        ));

        Self {
            store,
            supervisor,
            bus,
            schema: Arc::new(schema),
            config: Arc::new(config),
        }
    }
}

/// Put a finished-job cache in front of `store` unless `capacity` is zero.
pub fn with_job_cache<S>(store: S, capacity: usize) -> Arc<dyn JobStore>
where
    S: JobStore + 'static,
{
    if capacity == 0 {
        Arc::new(store)
    } else {
        Arc::new(CachedJobStore::new(store, capacity))
    }
}
