//! A durable, at-least-once job queue for shell commands.
//!
//! Jobs are submitted to a [`store::JobStore`] in the `pending` state. Workers claim them one at a
//! time, run their command through the platform shell and report the outcome back. Failed jobs
//! are retried with exponential backoff until their retry allowance runs out, at which point they
//! are moved to the dead letter queue where an operator can inspect and requeue them.
//!
//! The store is the only coordination point between workers: a job instance is never handed to
//! two workers at once, whether the workers run as tasks in one process or in separate processes.
//!
//! # Example
//!
//! ```
//! # use std::{sync::Arc, time::Duration};
//! use queuectl::prelude::*;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let store = Arc::new(InMemoryJobStore::new());
//! let config = Arc::new(InMemoryConfig::default());
//!
//! JobBuilder::new("echo hello")
//!     .with_id("greeting")
//!     .enqueue_to(store.as_ref(), config.as_ref())
//!     .await
//!     .unwrap();
//!
//! let worker = Worker::new(store.clone(), config);
//! let pool = WorkerPool::start(&InProcess::new(worker), 2, Duration::from_millis(50)).unwrap();
//! // ...
//! pool.shutdown(Duration::from_secs(10)).await;
//! # }
//! ```
pub mod backoff;
pub mod config;
pub mod dlq;
pub mod executor;
pub mod job;
pub mod job_log;
pub mod pool;
pub mod prelude;
pub mod retry;
pub mod store;
pub mod worker;
