//! The persistent job store and its atomic claim protocol.
//!
//! A [`JobStore`] is the only coordination point between workers: no job state is shared in
//! memory, every transition goes through the store. Implementations must guarantee that a job
//! instance is handed out by [`JobStore::claim`] to at most one caller.
//!
//! Two implementations exist: [`memory::InMemoryJobStore`] for tests and the SQLite store in the
//! `queuectl-sqlx` crate. Implementors can verify their store with [`crate::test_suite`].
use std::collections::BTreeMap;

use async_trait::async_trait;
use thiserror::Error;

use crate::{
    job::{Job, JobId, JobState},
    retry::{RetryDecision, RetryPolicy},
};

pub mod memory;
#[doc(hidden)]
pub mod testing;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors raised by a [`JobStore`].
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("A job with id {0} already exists")]
    DuplicateId(JobId),
    #[error("Job {id} is invalid: {reason}")]
    InvalidJob { id: JobId, reason: &'static str },
    #[error("Job {0} not found")]
    JobNotFound(JobId),
    #[error("Store remained locked after {attempts} attempts: {source}")]
    Contention { attempts: u32, source: BoxError },
    #[error("Error decoding a stored job: {0}")]
    Decode(BoxError),
    #[error("Storage error: {0}")]
    Storage(BoxError),
    #[error("Store in bad state")]
    BadState,
}

impl StoreError {
    /// Whether the error indicates the store itself is unusable, rather than a single call
    /// failing.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Storage(_) | Self::BadState)
    }
}

/// The number of jobs in each state.
pub type Stats = BTreeMap<JobState, u64>;

/// A [`Stats`] with every state present and zero.
pub fn empty_stats() -> Stats {
    JobState::ALL.into_iter().map(|state| (state, 0)).collect()
}

/// The job table and the transitions workers drive through it.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Inserts a new job.
    ///
    /// Fails with [`StoreError::DuplicateId`] if a job with the same id exists and with
    /// [`StoreError::InvalidJob`] if the job is not a well formed submission.
    async fn enqueue(&self, job: Job) -> Result<(), StoreError>;

    /// Atomically moves the oldest claimable job to [`JobState::Processing`] and returns it.
    ///
    /// Returns [`None`], without side effects, if there is nothing to claim.
    async fn claim(&self) -> Result<Option<Job>, StoreError>;

    /// Marks a job as completed. Completing a job twice is harmless.
    async fn complete(&self, id: &JobId) -> Result<(), StoreError>;

    /// Writes the outcome of a failed execution.
    async fn record_failure(&self, id: &JobId, decision: &RetryDecision)
        -> Result<(), StoreError>;

    /// Records a failed execution of a job that had failed `attempts` times before, rescheduling
    /// or dead lettering it according to `policy`.
    async fn fail(
        &self,
        id: &JobId,
        attempts: u32,
        max_retries: u32,
        policy: &RetryPolicy,
    ) -> Result<RetryDecision, StoreError> {
        let decision = policy.decide(attempts, max_retries, crate::job::now());
        self.record_failure(id, &decision).await?;
        Ok(decision)
    }

    /// All jobs, or those in the given state, oldest first.
    async fn list_by_state(&self, state: Option<JobState>) -> Result<Vec<Job>, StoreError>;

    /// The number of jobs in each state, with every state present.
    async fn stats(&self) -> Result<Stats, StoreError>;

    /// Requeues a dead job with a fresh attempt budget.
    ///
    /// Returns `false` if the job does not exist or is not dead.
    async fn retry_dead(&self, id: &JobId) -> Result<bool, StoreError>;

    async fn get(&self, id: &JobId) -> Result<Option<Job>, StoreError>;
}

/// Validates a submission, mapping a malformed job to [`StoreError::InvalidJob`].
pub fn check_enqueuable(job: &Job) -> Result<(), StoreError> {
    job.validate().map_err(|reason| StoreError::InvalidJob {
        id: job.id.clone(),
        reason,
    })
}
