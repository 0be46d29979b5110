//! Provides an in memory implementation of [`JobStore`].
//!
//! Currently this is provided for testing purposes and not designed for use in a production system.
//!
//! It is not optimized instead is designed to be a correct implementation for use in a test setup.
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::Utc;

use super::{check_enqueuable, empty_stats, JobStore, Stats, StoreError};
use crate::{
    job::{self, Job, JobId, JobState},
    retry::RetryDecision,
};

/// An in memory implementation of [`JobStore`].
///
/// Clones share the same jobs. Every operation holds a single lock for its whole duration, which
/// makes [`JobStore::claim`] trivially atomic.
#[derive(Debug, Clone, Default)]
pub struct InMemoryJobStore {
    jobs: Arc<RwLock<Vec<Job>>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn update<T>(
        &self,
        id: &JobId,
        fun: impl FnOnce(&mut Job) -> T,
    ) -> Result<Option<T>, StoreError> {
        let mut jobs = self.jobs.write().map_err(|_| StoreError::BadState)?;
        Ok(jobs.iter_mut().find(|job| &job.id == id).map(fun))
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn enqueue(&self, job: Job) -> Result<(), StoreError> {
        check_enqueuable(&job)?;
        let mut jobs = self.jobs.write().map_err(|_| StoreError::BadState)?;
        if jobs.iter().any(|existing| existing.id == job.id) {
            return Err(StoreError::DuplicateId(job.id));
        }
        jobs.push(job);
        Ok(())
    }

    async fn claim(&self) -> Result<Option<Job>, StoreError> {
        let now = Utc::now();
        let mut jobs = self.jobs.write().map_err(|_| StoreError::BadState)?;
        let Some(job) = jobs
            .iter_mut()
            .filter(|job| job.is_claimable_at(now))
            .min_by(|a, b| a.created_at.cmp(&b.created_at))
        else {
            return Ok(None);
        };
        job.state = JobState::Processing;
        job.updated_at = job::now().max(job.created_at);
        Ok(Some(job.clone()))
    }

    async fn complete(&self, id: &JobId) -> Result<(), StoreError> {
        self.update(id, |job| {
            job.state = JobState::Completed;
            job.updated_at = job::now().max(job.created_at);
        })?
        .ok_or_else(|| StoreError::JobNotFound(id.clone()))
    }

    async fn record_failure(
        &self,
        id: &JobId,
        decision: &RetryDecision,
    ) -> Result<(), StoreError> {
        self.update(id, |job| {
            job.state = decision.state();
            job.attempts = decision.attempts();
            if let RetryDecision::Reschedule { next_run_at, .. } = decision {
                job.next_run_at = Some(*next_run_at);
            }
            job.updated_at = job::now().max(job.created_at);
        })?
        .ok_or_else(|| StoreError::JobNotFound(id.clone()))
    }

    async fn list_by_state(&self, state: Option<JobState>) -> Result<Vec<Job>, StoreError> {
        let jobs = self.jobs.read().map_err(|_| StoreError::BadState)?;
        let mut jobs: Vec<_> = jobs
            .iter()
            .filter(|job| state.map_or(true, |state| job.state == state))
            .cloned()
            .collect();
        jobs.sort_by_key(|job| job.created_at);
        Ok(jobs)
    }

    async fn stats(&self) -> Result<Stats, StoreError> {
        let jobs = self.jobs.read().map_err(|_| StoreError::BadState)?;
        Ok(jobs.iter().fold(empty_stats(), |mut stats, job| {
            *stats.entry(job.state).or_default() += 1;
            stats
        }))
    }

    async fn retry_dead(&self, id: &JobId) -> Result<bool, StoreError> {
        Ok(self
            .update(id, |job| {
                if job.state != JobState::Dead {
                    return false;
                }
                job.state = JobState::Pending;
                job.attempts = 0;
                job.next_run_at = None;
                job.updated_at = job::now().max(job.created_at);
                true
            })?
            .unwrap_or(false))
    }

    async fn get(&self, id: &JobId) -> Result<Option<Job>, StoreError> {
        let jobs = self.jobs.read().map_err(|_| StoreError::BadState)?;
        Ok(jobs.iter().find(|job| &job.id == id).cloned())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_suite;

    test_suite!(for: InMemoryJobStore::new());

    #[tokio::test]
    async fn clones_share_jobs() {
        let store = InMemoryJobStore::new();
        let clone = store.clone();

        store.enqueue(Job::new("job", "true", 0)).await.unwrap();

        assert!(clone.claim().await.unwrap().is_some());
        assert!(store.claim().await.unwrap().is_none());
    }
}
