//! Operator view over dead lettered jobs.
use crate::{
    job::{Job, JobId, JobState},
    store::{JobStore, StoreError},
};

/// The outcome of requeueing a job from the dead letter queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requeue {
    /// The job is pending again with a fresh attempt budget.
    Requeued,
    /// The job does not exist or is not dead, nothing was changed.
    NotDead,
}

/// Lists and requeues jobs that exhausted their retries.
pub struct DeadLetterQueue<'a, S: ?Sized> {
    store: &'a S,
}

impl<'a, S> DeadLetterQueue<'a, S>
where
    S: JobStore + ?Sized,
{
    pub fn new(store: &'a S) -> Self {
        Self { store }
    }

    /// All dead jobs, oldest first.
    pub async fn list(&self) -> Result<Vec<Job>, StoreError> {
        self.store.list_by_state(Some(JobState::Dead)).await
    }

    /// Requeues a dead job, distinguishing a job that was not dead from a storage failure.
    pub async fn try_retry(&self, id: &JobId) -> Result<Requeue, StoreError> {
        let requeued = self.store.retry_dead(id).await?;
        if requeued {
            tracing::info!(job_id = %id, "Requeued dead job {id}");
            Ok(Requeue::Requeued)
        } else {
            tracing::debug!(job_id = %id, "Job {id} is not in the dead letter queue");
            Ok(Requeue::NotDead)
        }
    }

    /// Requeues a dead job, returning whether it was requeued.
    ///
    /// Storage failures are logged and reported as `false`.
    pub async fn retry(&self, id: &JobId) -> bool {
        match self.try_retry(id).await {
            Ok(requeue) => requeue == Requeue::Requeued,
            Err(error) => {
                tracing::error!(?error, job_id = %id, "Failed to requeue job {id}: {error}");
                false
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{retry::RetryPolicy, store::memory::InMemoryJobStore, store::MockJobStore};

    async fn dead_job(store: &InMemoryJobStore, id: &str) {
        store.enqueue(Job::new(id, "exit 1", 0)).await.unwrap();
        let job = store.claim().await.unwrap().unwrap();
        store
            .fail(&job.id, 0, 0, &RetryPolicy::default())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn list_only_dead_jobs() {
        let store = InMemoryJobStore::new();
        dead_job(&store, "dead").await;
        store.enqueue(Job::new("pending", "true", 3)).await.unwrap();

        let dead = DeadLetterQueue::new(&store).list().await.unwrap();

        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].id.as_str(), "dead");
    }

    #[tokio::test]
    async fn retry_round_trip() {
        let store = InMemoryJobStore::new();
        dead_job(&store, "dead").await;
        let dlq = DeadLetterQueue::new(&store);

        assert!(dlq.retry(&"dead".into()).await);

        assert!(dlq.list().await.unwrap().is_empty());
        let job = store.get(&"dead".into()).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.next_run_at, None);
    }

    #[tokio::test]
    async fn retry_job_that_is_not_dead() {
        let store = InMemoryJobStore::new();
        store.enqueue(Job::new("pending", "true", 3)).await.unwrap();
        let dlq = DeadLetterQueue::new(&store);

        assert_eq!(
            dlq.try_retry(&"pending".into()).await.unwrap(),
            Requeue::NotDead
        );
        assert_eq!(
            dlq.try_retry(&"missing".into()).await.unwrap(),
            Requeue::NotDead
        );
        assert!(!dlq.retry(&"pending".into()).await);
    }

    #[tokio::test]
    async fn storage_failure_is_reported_as_not_requeued() {
        let mut store = MockJobStore::new();
        store
            .expect_retry_dead()
            .returning(|_| Err(StoreError::Storage("disk I/O error".into())));
        let dlq = DeadLetterQueue::new(&store);

        assert!(!dlq.retry(&"dead".into()).await);
        assert!(dlq.try_retry(&"dead".into()).await.is_err());
    }
}
