//! The claim, execute and report loop run by each worker.
//!
//! A [`Worker`] repeatedly claims the next eligible job from its [`JobStore`], runs the job's
//! command through the [`Shell`] and reports the outcome back to the store. When there is nothing
//! to claim it waits for the poll interval, a wait that is cut short by shutdown. A command that
//! is already running is never interrupted by shutdown.
use std::{sync::Arc, time::Duration};

use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::{
    config::{ConfigError, ConfigProvider, ConfigProviderExt},
    executor::{ExecutionResult, Shell},
    job::{self, Job, JobId},
    job_log::{DiscardLogger, ExecutionRecord, JobLogger},
    retry::{RetryDecision, RetryPolicy},
    store::{JobStore, StoreError},
};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// What happened to a job a worker claimed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed(JobId),
    Failed {
        id: JobId,
        result: ExecutionResult,
        decision: RetryDecision,
    },
}

/// Counts of what a worker did before it stopped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerSummary {
    pub completed: u64,
    pub rescheduled: u64,
    pub dead_lettered: u64,
}

impl WorkerSummary {
    fn record(&mut self, outcome: &JobOutcome) {
        match outcome {
            JobOutcome::Completed(_) => self.completed += 1,
            JobOutcome::Failed {
                decision: RetryDecision::Reschedule { .. },
                ..
            } => self.rescheduled += 1,
            JobOutcome::Failed {
                decision: RetryDecision::DeadLetter { .. },
                ..
            } => self.dead_lettered += 1,
        }
    }

    pub fn processed(&self) -> u64 {
        self.completed + self.rescheduled + self.dead_lettered
    }
}

/// A single worker.
///
/// # Example
///
/// ```
/// # use std::sync::Arc;
/// # use queuectl::prelude::*;
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let store = Arc::new(InMemoryJobStore::new());
/// let config = Arc::new(InMemoryConfig::default());
/// store.enqueue(Job::new("job-1", "exit 0", 3)).await.unwrap();
///
/// let worker = Worker::new(store.clone(), config);
/// let outcome = worker.run_once().await.unwrap();
///
/// assert_eq!(outcome, Some(JobOutcome::Completed("job-1".into())));
/// # }
/// ```
#[derive(Clone)]
pub struct Worker {
    name: String,
    store: Arc<dyn JobStore>,
    config: Arc<dyn ConfigProvider>,
    logger: Arc<dyn JobLogger>,
    shell: Shell,
    poll_interval: Duration,
}

impl Worker {
    pub fn new(store: Arc<dyn JobStore>, config: Arc<dyn ConfigProvider>) -> Self {
        Self {
            name: "worker".to_owned(),
            store,
            config,
            logger: Arc::new(DiscardLogger),
            shell: Shell::default(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_name(self, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..self
        }
    }

    pub fn with_logger(self, logger: Arc<dyn JobLogger>) -> Self {
        Self { logger, ..self }
    }

    pub fn with_shell(self, shell: Shell) -> Self {
        Self { shell, ..self }
    }

    pub fn with_poll_interval(self, poll_interval: Duration) -> Self {
        Self {
            poll_interval,
            ..self
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Runs jobs until `shutdown` is cancelled.
    ///
    /// Store errors affecting a single call are logged and the loop carries on. Errors that
    /// leave the store unusable stop the worker and are returned.
    pub async fn run(self, shutdown: CancellationToken) -> Result<WorkerSummary, StoreError> {
        tracing::info!(worker = %self.name, "Worker {} started", self.name);
        let mut summary = WorkerSummary::default();

        while !shutdown.is_cancelled() {
            match self.run_once().await {
                Ok(Some(outcome)) => {
                    summary.record(&outcome);
                    continue;
                }
                Ok(None) => {}
                Err(error) if error.is_fatal() => {
                    tracing::error!(
                        worker = %self.name,
                        ?error,
                        "Worker {} stopping after store failure: {error}",
                        self.name
                    );
                    return Err(error);
                }
                Err(error) => {
                    tracing::warn!(
                        worker = %self.name,
                        ?error,
                        "Worker {} hit a transient store error: {error}",
                        self.name
                    );
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => {},
                _ = tokio::time::sleep(self.poll_interval) => {},
            }
        }

        tracing::info!(
            worker = %self.name,
            processed = summary.processed(),
            "Worker {} stopped",
            self.name
        );
        Ok(summary)
    }

    /// Claims and processes at most one job.
    pub async fn run_once(&self) -> Result<Option<JobOutcome>, StoreError> {
        let Some(job) = self.store.claim().await? else {
            return Ok(None);
        };
        self.process(job).await.map(Some)
    }

    #[instrument(skip_all, fields(worker = %self.name, job_id = %job.id, attempt = job.attempts + 1))]
    async fn process(&self, job: Job) -> Result<JobOutcome, StoreError> {
        let timeout = self
            .read_config(|config| config.job_timeout())
            .await
            .unwrap_or_else(|error| {
                tracing::warn!(?error, "Failed to read job timeout, running without one: {error}");
                None
            });

        tracing::debug!(command = %job.command, ?timeout, "Executing job {}", job.id);
        let result = self.shell.run(&job.command, timeout).await;

        let record = ExecutionRecord {
            job_id: &job.id,
            attempt: job.attempts.saturating_add(1),
            finished_at: job::now(),
            result: &result,
        };
        let _ = self.logger.record(&record).await.inspect_err(|error| {
            tracing::warn!(?error, "Failed to log output of job {}: {error}", job.id)
        });

        if result.is_success() {
            self.handle_job_complete(job.id).await
        } else {
            self.handle_job_failure(job, result).await
        }
    }

    /// Runs `read` against the configuration on the blocking thread pool.
    async fn read_config<T, F>(&self, read: F) -> Result<T, ConfigError>
    where
        F: FnOnce(&dyn ConfigProvider) -> Result<T, ConfigError> + Send + 'static,
        T: Send + 'static,
    {
        let config = self.config.clone();
        tokio::task::spawn_blocking(move || read(config.as_ref()))
            .await
            .unwrap_or_else(|error| {
                tracing::error!(?error, "Configuration read did not complete: {error}");
                Err(ConfigError::BadState)
            })
    }

    async fn handle_job_complete(&self, job_id: JobId) -> Result<JobOutcome, StoreError> {
        tracing::debug!(%job_id, "Job {job_id} complete");
        self.store
            .complete(&job_id)
            .await
            .inspect_err(|error| {
                tracing::error!(
                    ?error,
                    %job_id,
                    "Failed to mark job {job_id} as complete, error: {error}",
                )
            })?;
        Ok(JobOutcome::Completed(job_id))
    }

    async fn handle_job_failure(
        &self,
        job: Job,
        result: ExecutionResult,
    ) -> Result<JobOutcome, StoreError> {
        let job_id = job.id;
        let policy = self
            .read_config(|config| config.retry_policy())
            .await
            .unwrap_or_else(|error| {
                tracing::warn!(?error, "Failed to read retry policy, using the default: {error}");
                RetryPolicy::default()
            });

        let decision = self
            .store
            .fail(&job_id, job.attempts, job.max_retries, &policy)
            .await
            .inspect_err(|error| {
                tracing::error!(
                    ?error,
                    %job_id,
                    "Failed to record failure of job {job_id}, error: {error}",
                )
            })?;

        match decision {
            RetryDecision::Reschedule {
                attempts,
                next_run_at,
            } => tracing::warn!(
                %job_id,
                error_type = result.kind(),
                attempts,
                %next_run_at,
                "Job {job_id} failed ({result}) and will be retried at {next_run_at}",
            ),
            RetryDecision::DeadLetter { attempts } => tracing::error!(
                %job_id,
                error_type = result.kind(),
                attempts,
                "Job {job_id} failed ({result}) and was moved to the dead letter queue",
            ),
        }

        Ok(JobOutcome::Failed {
            id: job_id,
            result,
            decision,
        })
    }
}

#[cfg(test)]
mod test {
    use std::sync::{
        atomic::{AtomicU32, Ordering},
        Mutex,
    };

    use assert_matches::assert_matches;
    use chrono::Utc;

    use super::*;
    use crate::{
        config::{ConfigKey, InMemoryConfig},
        job::JobState,
        job_log::FileJobLogger,
        store::{memory::InMemoryJobStore, MockJobStore},
    };

    struct FailingLogger;

    #[async_trait::async_trait]
    impl JobLogger for FailingLogger {
        async fn record(&self, _record: &ExecutionRecord<'_>) -> std::io::Result<()> {
            Err(std::io::Error::other("disk full"))
        }
    }

    /// Blocks the calling thread on every read, like a configuration file on a slow disk.
    struct SlowConfig;

    impl ConfigProvider for SlowConfig {
        fn get(&self, key: ConfigKey) -> Result<u64, ConfigError> {
            std::thread::sleep(Duration::from_millis(100));
            Ok(key.default_value())
        }

        fn set(&self, _key: ConfigKey, _value: &str) -> Result<(), ConfigError> {
            Err(ConfigError::BadState)
        }
    }

    fn worker(store: &InMemoryJobStore) -> Worker {
        Worker::new(Arc::new(store.clone()), Arc::new(InMemoryConfig::default()))
            .with_poll_interval(Duration::from_millis(10))
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn slow_config_reads_leave_the_runtime_free() {
        let store = InMemoryJobStore::new();
        store.enqueue(Job::new("job-1", "exit 1", 3)).await.unwrap();
        let worker = Worker::new(Arc::new(store.clone()), Arc::new(SlowConfig));
        let ticks = Arc::new(AtomicU32::new(0));
        let ticker = tokio::spawn({
            let ticks = ticks.clone();
            async move {
                loop {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    ticks.fetch_add(1, Ordering::Relaxed);
                }
            }
        });

        let outcome = worker.run_once().await.unwrap();
        ticker.abort();

        assert_matches!(
            outcome,
            Some(JobOutcome::Failed {
                decision: RetryDecision::Reschedule { attempts: 1, .. },
                ..
            })
        );
        assert!(ticks.load(Ordering::Relaxed) >= 10);
    }

    #[tokio::test]
    async fn run_once_with_nothing_to_do() {
        let store = InMemoryJobStore::new();

        assert_eq!(worker(&store).run_once().await.unwrap(), None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn successful_job_is_completed() {
        let store = InMemoryJobStore::new();
        store
            .enqueue(Job::new("job-1", "echo hello", 3))
            .await
            .unwrap();

        let outcome = worker(&store).run_once().await.unwrap();

        assert_eq!(outcome, Some(JobOutcome::Completed("job-1".into())));
        let job = store.get(&"job-1".into()).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.attempts, 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_job_without_retries_is_dead_lettered() {
        let store = InMemoryJobStore::new();
        store.enqueue(Job::new("job-1", "exit 1", 0)).await.unwrap();

        let outcome = worker(&store).run_once().await.unwrap();

        assert_matches!(
            outcome,
            Some(JobOutcome::Failed {
                decision: RetryDecision::DeadLetter { attempts: 1 },
                result: ExecutionResult::Exited { code: 1, .. },
                ..
            })
        );
        let job = store.get(&"job-1".into()).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Dead);
        assert_eq!(job.attempts, 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_job_is_rescheduled_with_backoff() {
        let store = InMemoryJobStore::new();
        store.enqueue(Job::new("job-1", "exit 7", 2)).await.unwrap();
        let before = Utc::now();

        let outcome = worker(&store).run_once().await.unwrap();

        assert_matches!(
            outcome,
            Some(JobOutcome::Failed {
                decision: RetryDecision::Reschedule { attempts: 1, .. },
                ..
            })
        );
        let job = store.get(&"job-1".into()).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.attempts, 1);
        assert!(job.next_run_at.unwrap() > before + chrono::TimeDelta::seconds(1));
        // Not eligible again until the backoff has elapsed.
        assert_eq!(worker(&store).run_once().await.unwrap(), None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn timed_out_job_fails() {
        let store = InMemoryJobStore::new();
        store.enqueue(Job::new("job-1", "sleep 5", 3)).await.unwrap();
        let config = InMemoryConfig::default()
            .with(ConfigKey::JobTimeout, "1")
            .unwrap();
        let worker = Worker::new(Arc::new(store.clone()), Arc::new(config));
        let started = std::time::Instant::now();

        let outcome = worker.run_once().await.unwrap();

        assert!(started.elapsed() < Duration::from_secs(4));
        assert_matches!(
            outcome,
            Some(JobOutcome::Failed {
                result: ExecutionResult::TimedOut { .. },
                decision: RetryDecision::Reschedule { attempts: 1, .. },
                ..
            })
        );
        let job = store.get(&"job-1".into()).await.unwrap().unwrap();
        assert_eq!(job.attempts, 1);
        assert_eq!(job.state, JobState::Pending);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn logger_failure_does_not_affect_job() {
        let store = InMemoryJobStore::new();
        store.enqueue(Job::new("job-1", "true", 3)).await.unwrap();

        let outcome = worker(&store)
            .with_logger(Arc::new(FailingLogger))
            .run_once()
            .await
            .unwrap();

        assert_eq!(outcome, Some(JobOutcome::Completed("job-1".into())));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn output_is_handed_to_logger() {
        let dir = tempfile::tempdir().unwrap();
        let logger = FileJobLogger::new(dir.path());
        let store = InMemoryJobStore::new();
        store
            .enqueue(Job::new("job-1", "echo hello; echo oops >&2", 3))
            .await
            .unwrap();

        worker(&store)
            .with_logger(Arc::new(logger.clone()))
            .run_once()
            .await
            .unwrap();

        let log = std::fs::read_to_string(logger.path_for(&"job-1".into())).unwrap();
        assert!(log.contains("attempt=1 rc=0"));
        assert!(log.contains("OUT:\nhello\n"));
        assert!(log.contains("ERR:\noops\n"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn run_processes_jobs_until_shutdown() {
        let store = InMemoryJobStore::new();
        for i in 0..3 {
            store
                .enqueue(Job::new(format!("job-{i}"), "true", 0))
                .await
                .unwrap();
        }
        store.enqueue(Job::new("job-3", "false", 0)).await.unwrap();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(worker(&store).run(shutdown.clone()));

        tokio::time::timeout(Duration::from_secs(10), async {
            while store.stats().await.unwrap()[&JobState::Pending] > 0
                || store.stats().await.unwrap()[&JobState::Processing] > 0
            {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        shutdown.cancel();

        let summary = handle.await.unwrap().unwrap();
        assert_eq!(
            summary,
            WorkerSummary {
                completed: 3,
                rescheduled: 0,
                dead_lettered: 1
            }
        );
    }

    #[tokio::test]
    async fn idle_worker_stops_promptly() {
        let store = InMemoryJobStore::new();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(
            worker(&store)
                .with_poll_interval(Duration::from_secs(60))
                .run(shutdown.clone()),
        );

        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.cancel();

        let summary = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(summary.processed(), 0);
    }

    #[tokio::test]
    async fn fatal_store_error_stops_worker() {
        let mut store = MockJobStore::new();
        store
            .expect_claim()
            .times(1)
            .returning(|| Err(StoreError::Storage("disk I/O error".into())));
        let worker = Worker::new(Arc::new(store), Arc::new(InMemoryConfig::default()));

        let result = worker.run(CancellationToken::new()).await;

        assert_matches!(result, Err(StoreError::Storage(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn transient_store_error_is_survived() {
        let pending = Arc::new(Mutex::new(Some(Job::new("job-1", "true", 3))));
        let mut store = MockJobStore::new();
        store
            .expect_claim()
            .returning(move || Ok(pending.lock().unwrap().take()));
        store.expect_complete().times(1).returning(|_| {
            Err(StoreError::Contention {
                attempts: 10,
                source: "database is locked".into(),
            })
        });
        let shutdown = CancellationToken::new();
        let worker = Worker::new(Arc::new(store), Arc::new(InMemoryConfig::default()))
            .with_poll_interval(Duration::from_millis(10));
        let handle = tokio::spawn(worker.run(shutdown.clone()));

        tokio::time::sleep(Duration::from_millis(200)).await;
        shutdown.cancel();

        let summary = handle.await.unwrap().unwrap();
        assert_eq!(summary.processed(), 0);
    }
}
