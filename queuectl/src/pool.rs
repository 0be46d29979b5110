//! Runs a number of workers and shuts them down together.
//!
//! Workers are launched through an [`Isolation`] which decides where they run:
//!
//! - [`InProcess`] runs each worker as a task in this process.
//! - [`Subprocess`] runs each worker as its own OS process.
//!
//! Either way the pool only sees [`ExecutionContext`]s, which it can stop and join.
use std::{future::Future, time::Duration};

use async_trait::async_trait;
use thiserror::Error;

use crate::store::StoreError;

mod in_process;
mod subprocess;

pub use in_process::InProcess;
pub use subprocess::{shutdown_on_stdin_close, Subprocess, POLL_INTERVAL_ENV, WORKER_NAME_ENV};

/// Errors starting or running a worker.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Failed to start worker: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("Worker stopped after a store failure: {0}")]
    Store(#[from] StoreError),
    #[error("Worker process exited with {0}")]
    ProcessExited(std::process::ExitStatus),
    #[error("Worker panicked: {0}")]
    Panicked(String),
    #[error("Failed to wait for worker: {0}")]
    Wait(#[source] std::io::Error),
}

/// How a worker ended when the pool was shut down.
#[derive(Debug)]
pub enum WorkerExit {
    /// The worker stopped cleanly.
    Stopped,
    /// The worker ended on its own account.
    Failed(PoolError),
    /// The worker was still busy when the grace period ended and was left to finish.
    TimedOut,
    /// The worker was still running when the grace period ended and was killed.
    Killed,
}

impl WorkerExit {
    pub fn is_stopped(&self) -> bool {
        matches!(self, Self::Stopped)
    }
}

/// A running worker, wherever it runs.
#[async_trait]
pub trait ExecutionContext: Send {
    fn name(&self) -> &str;

    /// Asks the worker to stop once it is done with its current job. Does not wait.
    fn stop(&mut self);

    /// Waits up to `grace` for the worker to end.
    async fn join(self: Box<Self>, grace: Duration) -> WorkerExit;
}

/// Launches workers.
pub trait Isolation {
    /// Launches the worker with the given index, polling for work every `poll_interval`.
    fn launch(
        &self,
        index: usize,
        poll_interval: Duration,
    ) -> Result<Box<dyn ExecutionContext>, PoolError>;
}

/// The name given to the worker launched with `index`.
pub fn worker_name(index: usize) -> String {
    format!("worker-{}", index + 1)
}

/// A fixed size group of workers.
///
/// # Example
///
/// ```
/// # use std::{sync::Arc, time::Duration};
/// # use queuectl::prelude::*;
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let store = Arc::new(InMemoryJobStore::new());
/// let worker = Worker::new(store.clone(), Arc::new(InMemoryConfig::default()));
///
/// let pool = WorkerPool::start(&InProcess::new(worker), 3, Duration::from_millis(50)).unwrap();
/// let report = pool.shutdown(Duration::from_secs(5)).await;
///
/// assert!(report.iter().all(|(_, exit)| exit.is_stopped()));
/// # }
/// ```
pub struct WorkerPool {
    contexts: Vec<Box<dyn ExecutionContext>>,
}

impl WorkerPool {
    /// Launches `count` workers.
    ///
    /// If any worker fails to launch, those already launched are stopped.
    pub fn start<I>(isolation: &I, count: usize, poll_interval: Duration) -> Result<Self, PoolError>
    where
        I: Isolation + ?Sized,
    {
        let mut contexts = Vec::with_capacity(count);
        for index in 0..count {
            match isolation.launch(index, poll_interval) {
                Ok(context) => contexts.push(context),
                Err(error) => {
                    tracing::error!(?error, "Failed to launch {}: {error}", worker_name(index));
                    contexts.iter_mut().for_each(|context| context.stop());
                    return Err(error);
                }
            }
        }
        tracing::info!(count, "Started {count} workers");
        Ok(Self { contexts })
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    /// Stops every worker, then waits for all of them concurrently, each for at most `grace`.
    pub async fn shutdown(mut self, grace: Duration) -> Vec<(String, WorkerExit)> {
        tracing::debug!("Shutting down {} workers", self.contexts.len());
        self.contexts.iter_mut().for_each(|context| context.stop());

        let report = futures::future::join_all(
            self.contexts
                .into_iter()
                .map(|context| join_context(context, grace)),
        )
        .await;

        tracing::info!("Worker pool shut down");
        report
    }

    /// Runs until `signal` resolves, then shuts down.
    pub async fn run_until(
        self,
        signal: impl Future<Output = ()>,
        grace: Duration,
    ) -> Vec<(String, WorkerExit)> {
        signal.await;
        self.shutdown(grace).await
    }
}

async fn join_context(context: Box<dyn ExecutionContext>, grace: Duration) -> (String, WorkerExit) {
    let name = context.name().to_owned();
    let exit = context.join(grace).await;
    match &exit {
        WorkerExit::Stopped => tracing::debug!(worker = %name, "{name} stopped"),
        WorkerExit::Failed(error) => tracing::error!(worker = %name, ?error, "{name} failed: {error}"),
        WorkerExit::TimedOut => {
            tracing::warn!(worker = %name, "{name} still busy after {grace:?}, detaching")
        }
        WorkerExit::Killed => {
            tracing::warn!(worker = %name, "{name} still running after {grace:?}, killed")
        }
    }
    (name, exit)
}
