//! The purpose of this module is to alleviate the need to import many of the `[queuectl]` types.
//!
//! ```
//! # #![allow(unused_imports)]
//! use queuectl::prelude::*;
//! ```
pub use crate::backoff::BackoffStrategy;
pub use crate::backoff::Jitter;
pub use crate::backoff::Strategy;
pub use crate::config::{
    ConfigError, ConfigKey, ConfigProvider, ConfigProviderExt, InMemoryConfig, JsonFileConfig,
};
pub use crate::dlq::{DeadLetterQueue, Requeue};
pub use crate::executor::{ExecutionResult, Shell};
pub use crate::job::builder::{JobBuilder, SubmitError};
pub use crate::job::{Job, JobId, JobState};
pub use crate::job_log::{DiscardLogger, FileJobLogger, JobLogger};
pub use crate::pool::{InProcess, Subprocess, WorkerExit, WorkerPool};
pub use crate::retry::{RetryDecision, RetryPolicy};
pub use crate::store::memory::InMemoryJobStore;
pub use crate::store::{JobStore, StoreError};
pub use crate::worker::{JobOutcome, Worker};
