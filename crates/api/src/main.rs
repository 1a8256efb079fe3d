use std::net::SocketAddr;
use std::sync::Arc;

use deployd_core::command::FlagSchema;
use deployd_db::{JobStore, MemoryJobStore, PgJobStore};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use deployd_api::config::ServerConfig;
use deployd_api::router::build_app_router;
use deployd_api::state::{with_job_cache, AppState};

const INTERRUPTED_REASON: &str = "Job interrupted by service restart";

const DEFAULT_LOG_FILTER: &str = "deployd_api=debug,deployd_worker=debug,tower_http=debug";

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    // --- Tracing ---
    init_tracing();

    // --- Configuration ---
    let config = ServerConfig::from_env();
    tracing::info!(host = %config.host, port = %config.port, "Loaded server configuration");

    // --- Flag schema ---
    let schema = match &config.flag_schema_path {
        Some(path) => {
            let schema = FlagSchema::load(path).expect("Failed to load flag schema");
            tracing::info!(path = %path.display(), program = %schema.program, "Flag schema loaded");
            schema
        }
        None => FlagSchema::default(),
    };

    // --- Job store ---
    let store: Arc<dyn JobStore> = match &config.database_url {
        Some(database_url) => {
            let pool = deployd_db::create_pool(database_url)
                .await
                .expect("Failed to connect to database");
            tracing::info!("Database connection pool created");

            deployd_db::health_check(&pool)
                .await
                .expect("Database health check failed");

            deployd_db::run_migrations(&pool)
                .await
                .expect("Failed to run database migrations");
            tracing::info!("Database migrations applied");

            with_job_cache(PgJobStore::new(pool), config.job_cache_capacity)
        }
        None => {
            tracing::warn!("DATABASE_URL not set, job records are kept in memory only");
            Arc::new(MemoryJobStore::new())
        }
    };

    // Nothing is running yet, so unfinished records belong to a previous run.
    match store.fail_unfinished(INTERRUPTED_REASON).await {
        Ok(0) => {}
        Ok(count) => tracing::warn!(count, "Failed jobs left unfinished by a previous run"),
        Err(e) => tracing::error!(error = %e, "Failed to close out unfinished jobs"),
    }

    // --- App state ---
    let state = AppState::new(store, schema, config.clone());
    let supervisor = Arc::clone(&state.supervisor);
    let app = build_app_router(state, &config);

    // --- Start server ---
    let addr = SocketAddr::new(
        config.host.parse().expect("Invalid HOST address"),
        config.port,
    );
    tracing::info!(%addr, "Starting server");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind to address");

    // On a signal, stop accepting connections and cancel running jobs at the
    // same time: open event streams only end once their jobs do.
    let stop = CancellationToken::new();
    let drain = tokio::spawn({
        let stop = stop.clone();
        let supervisor = Arc::clone(&supervisor);
        let timeout = config.shutdown_timeout();
        async move {
            shutdown_signal().await;
            stop.cancel();
            supervisor.shutdown(timeout).await;
        }
    });

    axum::serve(listener, app)
        .with_graceful_shutdown(stop.cancelled_owned())
        .await
        .expect("Server error");

    // --- Post-shutdown cleanup ---
    tracing::info!("Server stopped accepting connections, cleaning up");
    if let Err(e) = drain.await {
        tracing::error!(error = %e, "Job drain task failed");
    }

    tracing::info!("Graceful shutdown complete");
}

/// Install the global subscriber. `LOG_FORMAT=json` switches to JSON lines.
fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into());
    let json = std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Wait for a termination signal to initiate graceful shutdown.
///
/// Handles both SIGINT (Ctrl-C) and SIGTERM (on Unix) so the server
/// shuts down cleanly whether stopped interactively or by a process
/// manager (e.g. systemd, Docker, Kubernetes).
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl-C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
