use std::{
    ffi::{OsStr, OsString},
    process::Stdio,
    time::Duration,
};

use async_trait::async_trait;
use tokio::{
    io::AsyncReadExt,
    process::{Child, ChildStdin, Command},
};
use tokio_util::sync::CancellationToken;

use super::{worker_name, ExecutionContext, Isolation, PoolError, WorkerExit};

/// Environment variable carrying the poll interval, in milliseconds, to a worker process.
pub const POLL_INTERVAL_ENV: &str = "QUEUECTL_POLL_INTERVAL_MS";
/// Environment variable carrying the worker's name to a worker process.
pub const WORKER_NAME_ENV: &str = "QUEUECTL_WORKER_NAME";

/// Runs each worker as a separate OS process.
///
/// The program is expected to run a worker until its stdin is closed, see
/// [`shutdown_on_stdin_close`]. Its stdout and stderr are inherited.
#[derive(Debug, Clone)]
pub struct Subprocess {
    program: OsString,
    args: Vec<OsString>,
    envs: Vec<(OsString, OsString)>,
}

impl Subprocess {
    pub fn new(program: impl AsRef<OsStr>) -> Self {
        Self {
            program: program.as_ref().to_owned(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_owned());
        self
    }

    pub fn env(mut self, key: impl AsRef<OsStr>, value: impl AsRef<OsStr>) -> Self {
        self.envs
            .push((key.as_ref().to_owned(), value.as_ref().to_owned()));
        self
    }
}

impl Isolation for Subprocess {
    fn launch(
        &self,
        index: usize,
        poll_interval: Duration,
    ) -> Result<Box<dyn ExecutionContext>, PoolError> {
        let name = worker_name(index);
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .envs(self.envs.iter().cloned())
            .env(POLL_INTERVAL_ENV, poll_interval.as_millis().to_string())
            .env(WORKER_NAME_ENV, &name)
            .stdin(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(PoolError::Spawn)?;
        tracing::debug!(worker = %name, pid = child.id(), "Launched {name}");

        let stdin = child.stdin.take();
        Ok(Box::new(ProcessContext { name, child, stdin }))
    }
}

struct ProcessContext {
    name: String,
    child: Child,
    stdin: Option<ChildStdin>,
}

#[async_trait]
impl ExecutionContext for ProcessContext {
    fn name(&self) -> &str {
        &self.name
    }

    fn stop(&mut self) {
        self.stdin.take();
    }

    async fn join(mut self: Box<Self>, grace: Duration) -> WorkerExit {
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) if status.success() => WorkerExit::Stopped,
            Ok(Ok(status)) => WorkerExit::Failed(PoolError::ProcessExited(status)),
            Ok(Err(error)) => WorkerExit::Failed(PoolError::Wait(error)),
            Err(_elapsed) => match self.child.kill().await {
                Ok(()) => WorkerExit::Killed,
                Err(error) => WorkerExit::Failed(PoolError::Wait(error)),
            },
        }
    }
}

/// Cancels `shutdown` once this process's stdin is closed.
///
/// Used by worker processes launched through [`Subprocess`].
pub fn shutdown_on_stdin_close(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut stdin = tokio::io::stdin();
        let mut buf = [0; 64];
        loop {
            match stdin.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) => continue,
            }
        }
        tracing::debug!("Stdin closed, shutting down");
        shutdown.cancel();
    });
}
