use std::path::PathBuf;
use std::time::Duration;

use deployd_worker::{RetryPolicy, SupervisorConfig};

/// Server configuration loaded from environment variables.
///
/// All fields have defaults suitable for local development. In production,
/// override via environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address (default: `0.0.0.0`).
    pub host: String,
    /// Bind port (default: `3000`).
    pub port: u16,
    /// Allowed CORS origins, parsed from comma-separated `CORS_ORIGINS` env var.
    pub cors_origins: Vec<String>,
    /// HTTP request timeout in seconds (default: `30`). Applies until the
    /// response head is sent, so it does not cut off event streams.
    pub request_timeout_secs: u64,
    /// Time allowed for running jobs to record their final status on
    /// shutdown, in seconds (default: `30`).
    pub shutdown_timeout_secs: u64,
    /// PostgreSQL connection string. Without it jobs live in memory only.
    pub database_url: Option<String>,
    /// JSON flag schema for the deployment command. Defaults to the built-in
    /// management-cluster schema.
    pub flag_schema_path: Option<PathBuf>,
    /// Maximum run time of a job in seconds. Unlimited when unset.
    pub job_timeout_secs: Option<u64>,
    /// Tries per store write while a job runs (default: `3`).
    pub store_retry_attempts: u32,
    /// Delay before the first store write retry in milliseconds (default: `100`).
    pub store_retry_backoff_ms: u64,
    /// How long a slow live client may hold up its job's events before it is
    /// dropped, in seconds (default: `30`).
    pub live_send_timeout_secs: u64,
    /// Finished jobs kept in the read cache (default: `256`, `0` disables).
    pub job_cache_capacity: usize,
}

impl ServerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                  | Default                 |
    /// |--------------------------|-------------------------|
    /// | `HOST`                   | `0.0.0.0`               |
    /// | `PORT`                   | `3000`                  |
    /// | `CORS_ORIGINS`           | `http://localhost:5173` |
    /// | `REQUEST_TIMEOUT_SECS`   | `30`                    |
    /// | `SHUTDOWN_TIMEOUT_SECS`  | `30`                    |
    /// | `DATABASE_URL`           | unset (in-memory)       |
    /// | `FLAG_SCHEMA_PATH`       | unset (built-in)        |
    /// | `JOB_TIMEOUT_SECS`       | unset (no limit)        |
    /// | `STORE_RETRY_ATTEMPTS`   | `3`                     |
    /// | `STORE_RETRY_BACKOFF_MS` | `100`                   |
    /// | `LIVE_SEND_TIMEOUT_SECS` | `30`                    |
    /// | `JOB_CACHE_CAPACITY`     | `256`                   |
    pub fn from_env() -> Self {
        let host = std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".into());

        let port: u16 = std::env::var("PORT")
            .unwrap_or_else(|_| "3000".into())
            .parse()
            .expect("PORT must be a valid u16");

        let cors_origins: Vec<String> = std::env::var("CORS_ORIGINS")
            .unwrap_or_else(|_| "http://localhost:5173".into())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Self {
            host,
            port,
            cors_origins,
            request_timeout_secs: parse_var("REQUEST_TIMEOUT_SECS", 30),
            shutdown_timeout_secs: parse_var("SHUTDOWN_TIMEOUT_SECS", 30),
            database_url: optional_var("DATABASE_URL"),
            flag_schema_path: optional_var("FLAG_SCHEMA_PATH").map(PathBuf::from),
            job_timeout_secs: optional_var("JOB_TIMEOUT_SECS").map(|v| {
                v.parse()
                    .expect("JOB_TIMEOUT_SECS must be a valid u64")
            }),
            store_retry_attempts: parse_var("STORE_RETRY_ATTEMPTS", 3),
            store_retry_backoff_ms: parse_var("STORE_RETRY_BACKOFF_MS", 100),
            live_send_timeout_secs: parse_var("LIVE_SEND_TIMEOUT_SECS", 30),
            job_cache_capacity: parse_var("JOB_CACHE_CAPACITY", 256),
        }
    }

    /// Supervisor settings derived from this configuration.
    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            retry: RetryPolicy::new(
                self.store_retry_attempts,
                Duration::from_millis(self.store_retry_backoff_ms),
            ),
            max_duration: self.job_timeout_secs.map(Duration::from_secs),
            ..Default::default()
        }
    }

    pub fn live_send_timeout(&self) -> Duration {
        Duration::from_secs(self.live_send_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

/// A non-empty environment variable.
fn optional_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// Parse an environment variable, falling back to `default` when unset.
///
/// Panics on an unparsable value so misconfiguration fails at startup.
fn parse_var<T>(name: &str, default: T) -> T
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match optional_var(name) {
        Some(raw) => raw
            .parse()
            .unwrap_or_else(|e| panic!("{name} must be valid ({e}): '{raw}'")),
        None => default,
    }
}
