#![cfg(unix)]
use std::time::Duration;

use queuectl::prelude::*;
use queuectl_sqlx::{env::Paths, SqliteJobStore};

async fn wait_for_state(store: &SqliteJobStore, state: JobState, count: u64) {
    tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            if store.stats().await.unwrap()[&state] == count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {count} {state} jobs"));
}

fn worker_processes(paths: &Paths) -> Subprocess {
    paths.apply(Subprocess::new(env!("CARGO_BIN_EXE_queuectl-worker")))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn worker_processes_drain_the_queue() {
    let dir = tempfile::tempdir().unwrap();
    let paths = Paths::in_dir(dir.path());
    let store = SqliteJobStore::open(&paths.db).await.unwrap();
    let config = JsonFileConfig::new(&paths.config);
    for i in 0..4 {
        JobBuilder::new(format!("echo job {i}"))
            .with_id(format!("job-{i}"))
            .enqueue_to(&store, &config)
            .await
            .unwrap();
    }

    let pool = WorkerPool::start(&worker_processes(&paths), 2, Duration::from_millis(50)).unwrap();
    wait_for_state(&store, JobState::Completed, 4).await;
    let report = pool.shutdown(Duration::from_secs(10)).await;

    assert_eq!(report.len(), 2);
    assert!(report.iter().all(|(_, exit)| exit.is_stopped()));
    for i in 0..4 {
        let log = std::fs::read_to_string(paths.log_dir.join(format!("job-{i}.log"))).unwrap();
        assert_eq!(log.matches("attempt=1 ").count(), 1, "{log}");
        assert!(log.contains(&format!("job {i}")));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn worker_processes_dead_letter_failing_jobs() {
    let dir = tempfile::tempdir().unwrap();
    let paths = Paths::in_dir(dir.path());
    let store = SqliteJobStore::open(&paths.db).await.unwrap();
    let config = JsonFileConfig::new(&paths.config);
    config.set(ConfigKey::BackoffBase, "1").unwrap();
    JobBuilder::new("exit 7")
        .with_id("broken")
        .with_max_retries(1)
        .enqueue_to(&store, &config)
        .await
        .unwrap();

    let pool = WorkerPool::start(&worker_processes(&paths), 1, Duration::from_millis(50)).unwrap();
    wait_for_state(&store, JobState::Dead, 1).await;
    pool.shutdown(Duration::from_secs(10)).await;

    let job = store.get(&"broken".into()).await.unwrap().unwrap();
    assert_eq!(job.attempts, 2);
    assert_eq!(DeadLetterQueue::new(&store).list().await.unwrap(), vec![job]);
}
