//! Test suite for ensuring a correct implementation of a [`JobStore`].
use chrono::{DateTime, TimeDelta, Utc};
use futures::future::join_all;

use super::*;
use crate::job;

fn job_created_at(id: &str, created_at: DateTime<Utc>) -> Job {
    Job {
        created_at,
        updated_at: created_at,
        ..Job::new(id, "echo hello", 3)
    }
}

fn job_scheduled_at(id: &str, next_run_at: DateTime<Utc>) -> Job {
    Job {
        next_run_at: Some(next_run_at),
        ..Job::new(id, "echo hello", 3)
    }
}

async fn enqueue_claimed(store: &impl JobStore, id: &str) -> Job {
    store.enqueue(Job::new(id, "exit 1", 3)).await.unwrap();
    let job = store.claim().await.unwrap().unwrap();
    assert_eq!(job.id.as_str(), id);
    job
}

/// Create test suite for a [`JobStore`] implementation.
///
/// For store implementors, it is useful to include this as part of your test suites.
///
/// # Example
///
/// ```
/// # use queuectl::prelude::*;
/// use queuectl::test_suite;
/// use queuectl::store::memory::InMemoryJobStore;
/// test_suite!(for: InMemoryJobStore::new());
/// ```
///
/// If you are using a different async test attribute you can configure the macro to use that
/// instead:
///
/// ```ignore
/// # use queuectl::prelude::*;
/// use queuectl::test_suite;
/// test_suite!(
///     attr: tokio::test(flavor = "multi_thread", worker_threads = 4),
///     args: (),
///     store: StoreImplementation::open(path).await.unwrap()
/// );
/// ```
#[macro_export]
macro_rules! test_suite {
    (for: $store:expr) => {
        $crate::test_suite!(attr: tokio::test, args: (), store: $store);
    };
    (attr: $attr:meta, args: $args:tt, store: $store:expr) => {
        $crate::test_suite!(@tests $attr, $args, $store,
            enqueue,
            enqueue_duplicate_id,
            enqueue_invalid_job,
            claim_empty,
            claim_oldest_first,
            claim_marks_job_processing,
            claim_skips_jobs_scheduled_in_future,
            claim_due_retry,
            claim_skips_jobs_not_pending,
            concurrent_claims_are_exclusive,
            complete,
            complete_twice,
            complete_not_found,
            fail_reschedules,
            fail_dead_letters,
            fail_with_no_retries_dead_letters,
            fail_not_found,
            list_by_state,
            stats,
            retry_dead,
            retry_dead_not_dead,
            retry_dead_not_found,
            get_not_found,
        );
    };
    (@tests $attr:meta, $args:tt, $store:expr, $($test:ident),* $(,)?) => {
        $(
            #[$attr]
            async fn $test $args {
                let store = $store;
                $crate::store::testing::$test(store).await;
            }
        )*
    };
}

#[doc(hidden)]
pub async fn enqueue(store: impl JobStore) {
    let job = Job::new("job-1", "echo hello", 3);
    store.enqueue(job.clone()).await.unwrap();

    assert_eq!(store.get(&job.id).await.unwrap(), Some(job));
}

#[doc(hidden)]
pub async fn enqueue_duplicate_id(store: impl JobStore) {
    store.enqueue(Job::new("job-1", "true", 3)).await.unwrap();

    assert!(matches!(
        store.enqueue(Job::new("job-1", "false", 0)).await,
        Err(StoreError::DuplicateId(id)) if id.as_str() == "job-1"
    ));
    let job = store.get(&"job-1".into()).await.unwrap().unwrap();
    assert_eq!(job.command, "true");
}

#[doc(hidden)]
pub async fn enqueue_invalid_job(store: impl JobStore) {
    assert!(matches!(
        store.enqueue(Job::new("job-1", "", 3)).await,
        Err(StoreError::InvalidJob { .. })
    ));
    assert!(matches!(
        store.enqueue(Job::new("", "true", 3)).await,
        Err(StoreError::InvalidJob { .. })
    ));
    let processing = Job {
        state: JobState::Processing,
        ..Job::new("job-2", "true", 3)
    };
    assert!(matches!(
        store.enqueue(processing).await,
        Err(StoreError::InvalidJob { .. })
    ));
    assert!(store.list_by_state(None).await.unwrap().is_empty());
}

#[doc(hidden)]
pub async fn claim_empty(store: impl JobStore) {
    assert_eq!(store.claim().await.unwrap(), None);
    assert!(store.list_by_state(None).await.unwrap().is_empty());
}

#[doc(hidden)]
pub async fn claim_oldest_first(store: impl JobStore) {
    let now = job::now();
    store
        .enqueue(job_created_at("second", now - TimeDelta::seconds(1)))
        .await
        .unwrap();
    store
        .enqueue(job_created_at("third", now))
        .await
        .unwrap();
    store
        .enqueue(job_created_at("first", now - TimeDelta::seconds(2)))
        .await
        .unwrap();

    for expected in ["first", "second", "third"] {
        let job = store.claim().await.unwrap().unwrap();
        assert_eq!(job.id.as_str(), expected);
    }
    assert_eq!(store.claim().await.unwrap(), None);
}

#[doc(hidden)]
pub async fn claim_marks_job_processing(store: impl JobStore) {
    let enqueued = Job::new("job-1", "true", 3);
    store.enqueue(enqueued.clone()).await.unwrap();

    let claimed = store.claim().await.unwrap().unwrap();

    assert_eq!(claimed.state, JobState::Processing);
    assert_eq!(claimed.attempts, 0);
    assert_eq!(claimed.created_at, enqueued.created_at);
    assert!(claimed.updated_at >= claimed.created_at);
    assert_eq!(store.get(&claimed.id).await.unwrap(), Some(claimed));
}

#[doc(hidden)]
pub async fn claim_skips_jobs_scheduled_in_future(store: impl JobStore) {
    store
        .enqueue(job_scheduled_at("later", Utc::now() + TimeDelta::hours(1)))
        .await
        .unwrap();

    assert_eq!(store.claim().await.unwrap(), None);
    let job = store.get(&"later".into()).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Pending);
}

#[doc(hidden)]
pub async fn claim_due_retry(store: impl JobStore) {
    store
        .enqueue(job_scheduled_at("due", job::now() - TimeDelta::seconds(1)))
        .await
        .unwrap();

    let job = store.claim().await.unwrap().unwrap();
    assert_eq!(job.id.as_str(), "due");
}

#[doc(hidden)]
pub async fn claim_skips_jobs_not_pending(store: impl JobStore) {
    let claimed = enqueue_claimed(&store, "claimed").await;
    let completed = enqueue_claimed(&store, "completed").await;
    store.complete(&completed.id).await.unwrap();
    let dead = enqueue_claimed(&store, "dead").await;
    store
        .fail(&dead.id, 3, 3, &RetryPolicy::default())
        .await
        .unwrap();

    assert_eq!(store.claim().await.unwrap(), None);
    assert_eq!(
        store.get(&claimed.id).await.unwrap().unwrap().state,
        JobState::Processing
    );
}

#[doc(hidden)]
pub async fn concurrent_claims_are_exclusive(store: impl JobStore) {
    let now = job::now();
    for i in 0..5 {
        store
            .enqueue(job_created_at(
                &format!("job-{i}"),
                now + TimeDelta::milliseconds(i),
            ))
            .await
            .unwrap();
    }

    let claims = join_all((0..15).map(|_| store.claim())).await;
    let mut claimed: Vec<_> = claims
        .into_iter()
        .filter_map(|claim| claim.unwrap())
        .map(|job| job.id)
        .collect();
    claimed.sort();
    claimed.dedup();

    assert_eq!(claimed.len(), 5);
    let stats = store.stats().await.unwrap();
    assert_eq!(stats[&JobState::Processing], 5);
    assert_eq!(stats[&JobState::Pending], 0);
}

#[doc(hidden)]
pub async fn complete(store: impl JobStore) {
    let job = enqueue_claimed(&store, "job-1").await;

    store.complete(&job.id).await.unwrap();

    let job = store.get(&job.id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Completed);
    assert!(job.updated_at >= job.created_at);
}

#[doc(hidden)]
pub async fn complete_twice(store: impl JobStore) {
    let job = enqueue_claimed(&store, "job-1").await;

    store.complete(&job.id).await.unwrap();
    store.complete(&job.id).await.unwrap();

    let job = store.get(&job.id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Completed);
}

#[doc(hidden)]
pub async fn complete_not_found(store: impl JobStore) {
    assert!(matches!(
        store.complete(&"missing".into()).await,
        Err(StoreError::JobNotFound(_))
    ));
}

#[doc(hidden)]
pub async fn fail_reschedules(store: impl JobStore) {
    let job = enqueue_claimed(&store, "job-1").await;
    let before = Utc::now();

    let decision = store
        .fail(&job.id, 0, 3, &RetryPolicy::new(2))
        .await
        .unwrap();

    let after = Utc::now();
    let job = store.get(&job.id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Pending);
    assert_eq!(job.attempts, 1);
    assert_eq!(job.next_run_at, decision.next_run_at());
    let next_run_at = job.next_run_at.unwrap();
    assert!(next_run_at >= before + TimeDelta::seconds(2) - TimeDelta::milliseconds(1));
    assert!(next_run_at <= after + TimeDelta::seconds(2));
    assert_eq!(store.claim().await.unwrap(), None);
}

#[doc(hidden)]
pub async fn fail_dead_letters(store: impl JobStore) {
    let job = enqueue_claimed(&store, "job-1").await;

    let decision = store
        .fail(&job.id, 3, 3, &RetryPolicy::new(2))
        .await
        .unwrap();

    assert_eq!(decision, RetryDecision::DeadLetter { attempts: 4 });
    let job = store.get(&job.id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Dead);
    assert_eq!(job.attempts, 4);
}

#[doc(hidden)]
pub async fn fail_with_no_retries_dead_letters(store: impl JobStore) {
    store.enqueue(Job::new("job-1", "exit 1", 0)).await.unwrap();
    let job = store.claim().await.unwrap().unwrap();

    store
        .fail(&job.id, job.attempts, job.max_retries, &RetryPolicy::default())
        .await
        .unwrap();

    let job = store.get(&job.id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Dead);
    assert_eq!(job.attempts, 1);
}

#[doc(hidden)]
pub async fn fail_not_found(store: impl JobStore) {
    assert!(matches!(
        store
            .fail(&"missing".into(), 0, 3, &RetryPolicy::default())
            .await,
        Err(StoreError::JobNotFound(_))
    ));
}

#[doc(hidden)]
pub async fn list_by_state(store: impl JobStore) {
    let now = job::now();
    store
        .enqueue(job_created_at("b", now - TimeDelta::seconds(1)))
        .await
        .unwrap();
    store
        .enqueue(job_created_at("a", now - TimeDelta::seconds(2)))
        .await
        .unwrap();
    store.enqueue(job_created_at("c", now)).await.unwrap();
    let claimed = store.claim().await.unwrap().unwrap();

    let all: Vec<_> = store
        .list_by_state(None)
        .await
        .unwrap()
        .into_iter()
        .map(|job| job.id)
        .collect();
    assert_eq!(all, ["a", "b", "c"].map(JobId::from));

    let pending: Vec<_> = store
        .list_by_state(Some(JobState::Pending))
        .await
        .unwrap()
        .into_iter()
        .map(|job| job.id)
        .collect();
    assert_eq!(pending, ["b", "c"].map(JobId::from));

    let processing = store
        .list_by_state(Some(JobState::Processing))
        .await
        .unwrap();
    assert_eq!(processing, vec![claimed]);

    assert!(store
        .list_by_state(Some(JobState::Failed))
        .await
        .unwrap()
        .is_empty());
}

#[doc(hidden)]
pub async fn stats(store: impl JobStore) {
    assert_eq!(store.stats().await.unwrap(), empty_stats());

    let completed = enqueue_claimed(&store, "completed").await;
    store.complete(&completed.id).await.unwrap();
    let dead = enqueue_claimed(&store, "dead").await;
    store
        .fail(&dead.id, 0, 0, &RetryPolicy::default())
        .await
        .unwrap();
    enqueue_claimed(&store, "processing").await;
    store.enqueue(Job::new("pending", "true", 3)).await.unwrap();

    let stats = store.stats().await.unwrap();
    assert_eq!(stats[&JobState::Pending], 1);
    assert_eq!(stats[&JobState::Processing], 1);
    assert_eq!(stats[&JobState::Completed], 1);
    assert_eq!(stats[&JobState::Failed], 0);
    assert_eq!(stats[&JobState::Dead], 1);
}

#[doc(hidden)]
pub async fn retry_dead(store: impl JobStore) {
    let job = enqueue_claimed(&store, "job-1").await;
    store
        .fail(&job.id, 3, 3, &RetryPolicy::default())
        .await
        .unwrap();

    assert!(store.retry_dead(&job.id).await.unwrap());

    let job = store.get(&job.id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Pending);
    assert_eq!(job.attempts, 0);
    assert_eq!(job.next_run_at, None);
    assert_eq!(store.claim().await.unwrap().map(|job| job.id), Some(job.id));
}

#[doc(hidden)]
pub async fn retry_dead_not_dead(store: impl JobStore) {
    let job = enqueue_claimed(&store, "job-1").await;
    store
        .fail(&job.id, 0, 3, &RetryPolicy::default())
        .await
        .unwrap();
    let before = store.get(&job.id).await.unwrap().unwrap();

    assert!(!store.retry_dead(&job.id).await.unwrap());
    assert_eq!(store.get(&job.id).await.unwrap(), Some(before));
}

#[doc(hidden)]
pub async fn retry_dead_not_found(store: impl JobStore) {
    assert!(!store.retry_dead(&"missing".into()).await.unwrap());
}

#[doc(hidden)]
pub async fn get_not_found(store: impl JobStore) {
    assert_eq!(store.get(&"missing".into()).await.unwrap(), None);
}
