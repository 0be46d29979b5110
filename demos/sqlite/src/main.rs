use std::{sync::Arc, time::Duration};

use chrono::TimeDelta;
use queuectl::prelude::*;
use queuectl_sqlx::{env::Paths, SqliteJobStore};

#[tokio::main]
pub async fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let paths = Paths::from_env();
    let store = Arc::new(SqliteJobStore::open(&paths.db).await.unwrap());
    let config = Arc::new(
        InMemoryConfig::default()
            .with(ConfigKey::MaxRetries, "1")
            .unwrap()
            .with(ConfigKey::BackoffBase, "1")
            .unwrap(),
    );

    let job_id = JobBuilder::new("echo first job")
        .schedule_in(TimeDelta::seconds(2))
        .enqueue_to(store.as_ref(), config.as_ref())
        .await
        .unwrap();
    println!("Inserted job {job_id}");

    let job_id = JobBuilder::new("echo second job")
        .enqueue_to(store.as_ref(), config.as_ref())
        .await
        .unwrap();
    println!("Inserted job {job_id}");

    let job_id = JobBuilder::new("echo doomed >&2; exit 1")
        .enqueue_to(store.as_ref(), config.as_ref())
        .await
        .unwrap();
    println!("Inserted job {job_id}");

    let worker = Worker::new(store.clone(), config)
        .with_logger(Arc::new(FileJobLogger::new(&paths.log_dir)));
    let pool = WorkerPool::start(&InProcess::new(worker), 2, Duration::from_millis(200)).unwrap();

    tokio::time::sleep(Duration::from_secs(5)).await;
    for (name, exit) in pool.shutdown(Duration::from_secs(10)).await {
        println!("{name}: {exit:?}");
    }

    for (state, count) in store.stats().await.unwrap() {
        println!("{state}: {count}");
    }
    let dlq = DeadLetterQueue::new(store.as_ref());
    for job in dlq.list().await.unwrap() {
        println!("Dead job {} after {} attempts, requeueing", job.id, job.attempts);
        dlq.retry(&job.id).await;
    }
}
