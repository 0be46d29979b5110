//! A single queuectl worker running as its own process.
//!
//! Reads the database, configuration and log locations from the environment (see
//! [`queuectl_sqlx::env`]) and processes jobs until its stdin is closed or it receives ctrl-c.
//! This is the program a [`Subprocess`](queuectl::pool::Subprocess) pool launches.
use std::{sync::Arc, time::Duration};

use queuectl::{
    config::JsonFileConfig,
    job_log::FileJobLogger,
    pool::{shutdown_on_stdin_close, POLL_INTERVAL_ENV, WORKER_NAME_ENV},
    store::StoreError,
    worker::{Worker, WorkerSummary, DEFAULT_POLL_INTERVAL},
};
use queuectl_sqlx::{env::Paths, SqliteJobStore};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let code = match run().await {
        Ok(summary) => {
            tracing::info!(?summary, "Worker stopped");
            0
        }
        Err(error) => {
            tracing::error!(?error, "Worker failed: {error}");
            1
        }
    };
    // The stdin watcher blocks a runtime thread, exit without waiting for it.
    std::process::exit(code);
}

async fn run() -> Result<WorkerSummary, StoreError> {
    let paths = Paths::from_env();
    let name = std::env::var(WORKER_NAME_ENV).unwrap_or_else(|_| format!("worker-{}", std::process::id()));
    let poll_interval = std::env::var(POLL_INTERVAL_ENV)
        .ok()
        .and_then(|millis| millis.parse().ok())
        .map_or(DEFAULT_POLL_INTERVAL, Duration::from_millis);

    let store = SqliteJobStore::open(&paths.db).await?;
    let config = JsonFileConfig::new(&paths.config);
    let logger = FileJobLogger::new(&paths.log_dir);
    tracing::info!(worker = %name, db = %paths.db.display(), "Worker starting");

    let shutdown = CancellationToken::new();
    shutdown_on_stdin_close(shutdown.clone());
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Interrupted, finishing current job");
                shutdown.cancel();
            }
        }
    });

    Worker::new(Arc::new(store), Arc::new(config))
        .with_name(name)
        .with_logger(Arc::new(logger))
        .with_poll_interval(poll_interval)
        .run(shutdown)
        .await
}
