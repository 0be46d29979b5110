use async_trait::async_trait;
use queuectl::{
    job::{self, Job, JobId, JobState},
    retry::RetryDecision,
    store::{check_enqueuable, empty_stats, JobStore, Stats, StoreError},
};
use tracing::instrument;

use crate::{
    query::ClaimAttempt,
    types::{encode_timestamp, StoredState},
    SqliteJobStore,
};

impl SqliteJobStore {
    fn handle_update(rows: u64, job_id: &JobId) -> Result<(), StoreError> {
        match rows {
            0 => Err(StoreError::JobNotFound(job_id.clone())),
            1 => Ok(()),
            _ => Err(StoreError::BadState),
        }
    }
}

#[async_trait]
impl JobStore for SqliteJobStore {
    #[instrument(skip_all, fields(job_id = %job.id))]
    async fn enqueue(&self, job: Job) -> Result<(), StoreError> {
        check_enqueuable(&job)?;
        let job = &job;
        match self.with_contention_retry(move || self.insert_job(job)).await? {
            0 => Err(StoreError::DuplicateId(job.id.clone())),
            _ => Ok(()),
        }
    }

    async fn claim(&self) -> Result<Option<Job>, StoreError> {
        for _ in 0..self.options.max_attempts.max(1) {
            let now = encode_timestamp(job::now());
            let now = now.as_str();
            match self.with_contention_retry(move || self.try_claim(now)).await? {
                ClaimAttempt::Claimed(job) => {
                    tracing::debug!(job_id = %job.id, attempts = job.attempts, "Claimed job");
                    return Ok(Some(job));
                }
                ClaimAttempt::Empty => return Ok(None),
                ClaimAttempt::Lost => tracing::debug!("Lost the race for a job, selecting again"),
                ClaimAttempt::Undecodable { id, reason } => {
                    tracing::error!(job_id = %id, "Moved unreadable job to dead: {reason}");
                }
            }
        }
        Ok(None)
    }

    #[instrument(skip(self))]
    async fn complete(&self, id: &JobId) -> Result<(), StoreError> {
        let now = encode_timestamp(job::now());
        let (id_str, now) = (id.as_str(), now.as_str());
        let rows = self
            .with_contention_retry(move || self.mark_complete(id_str, now))
            .await?;
        Self::handle_update(rows, id)
    }

    #[instrument(skip(self))]
    async fn record_failure(&self, id: &JobId, decision: &RetryDecision) -> Result<(), StoreError> {
        let now = encode_timestamp(job::now());
        let (id_str, now) = (id.as_str(), now.as_str());
        let rows = self
            .with_contention_retry(move || self.apply_decision(id_str, decision, now))
            .await?;
        Self::handle_update(rows, id)
    }

    async fn list_by_state(&self, state: Option<JobState>) -> Result<Vec<Job>, StoreError> {
        let state = state.map(StoredState::from);
        self.with_contention_retry(move || self.select_jobs(state))
            .await?
            .into_iter()
            .map(Job::try_from)
            .collect()
    }

    async fn stats(&self) -> Result<Stats, StoreError> {
        let counts = self
            .with_contention_retry(move || self.count_by_state())
            .await?;
        let mut stats = empty_stats();
        for (state, count) in counts {
            let count = u64::try_from(count)
                .map_err(|_| StoreError::Decode(format!("negative job count {count}").into()))?;
            *stats.entry(state.into()).or_default() += count;
        }
        Ok(stats)
    }

    #[instrument(skip(self))]
    async fn retry_dead(&self, id: &JobId) -> Result<bool, StoreError> {
        let now = encode_timestamp(job::now());
        let (id_str, now) = (id.as_str(), now.as_str());
        match self
            .with_contention_retry(move || self.requeue_dead(id_str, now))
            .await?
        {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(StoreError::BadState),
        }
    }

    async fn get(&self, id: &JobId) -> Result<Option<Job>, StoreError> {
        let id = id.as_str();
        self.with_contention_retry(move || self.select_job(id))
            .await?
            .map(Job::try_from)
            .transpose()
    }
}
