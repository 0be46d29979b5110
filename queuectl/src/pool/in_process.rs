use std::time::Duration;

use async_trait::async_trait;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;

use super::{worker_name, ExecutionContext, Isolation, PoolError, WorkerExit};
use crate::{
    store::StoreError,
    worker::{Worker, WorkerSummary},
};

/// Runs workers as tasks on the current tokio runtime.
///
/// Workers share nothing but the store handle of the template [`Worker`]. Shutdown is
/// cooperative: a running command is never interrupted.
#[derive(Clone)]
pub struct InProcess {
    worker: Worker,
}

impl InProcess {
    /// Launched workers are copies of `worker`, named by their index.
    pub fn new(worker: Worker) -> Self {
        Self { worker }
    }
}

impl Isolation for InProcess {
    fn launch(
        &self,
        index: usize,
        poll_interval: Duration,
    ) -> Result<Box<dyn ExecutionContext>, PoolError> {
        let name = worker_name(index);
        let shutdown = CancellationToken::new();
        let worker = self
            .worker
            .clone()
            .with_name(name.clone())
            .with_poll_interval(poll_interval);
        let handle = tokio::spawn(worker.run(shutdown.clone()));

        Ok(Box::new(TaskContext {
            name,
            shutdown,
            handle,
        }))
    }
}

struct TaskContext {
    name: String,
    shutdown: CancellationToken,
    handle: JoinHandle<Result<WorkerSummary, StoreError>>,
}

#[async_trait]
impl ExecutionContext for TaskContext {
    fn name(&self) -> &str {
        &self.name
    }

    fn stop(&mut self) {
        self.shutdown.cancel();
    }

    async fn join(mut self: Box<Self>, grace: Duration) -> WorkerExit {
        match tokio::time::timeout(grace, &mut self.handle).await {
            Ok(Ok(Ok(summary))) => {
                tracing::debug!(worker = %self.name, ?summary, "{} finished", self.name);
                WorkerExit::Stopped
            }
            Ok(Ok(Err(error))) => WorkerExit::Failed(error.into()),
            Ok(Err(error)) => WorkerExit::Failed(panic_message(error)),
            // Dropping the handle detaches the task, it finishes its current job on its own.
            Err(_elapsed) => WorkerExit::TimedOut,
        }
    }
}

fn panic_message(error: JoinError) -> PoolError {
    let msg = error.to_string();
    let message = match error.try_into_panic() {
        Ok(panic) => panic
            .downcast_ref::<&str>()
            .map(ToString::to_string)
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or(msg),
        Err(_) => msg,
    };
    PoolError::Panicked(message)
}
