use std::path::Path;

use chrono::{DateTime, SubsecRound, TimeDelta, Utc};
use serde::Deserialize;
use thiserror::Error;

use crate::{
    config::{ConfigError, ConfigProvider, ConfigProviderExt},
    store::{JobStore, StoreError},
};

use super::{Job, JobId};

/// Errors reading a job submission from a file.
#[derive(Debug, Error)]
pub enum JobFileError {
    #[error("Failed to read job file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse job file: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Job command is empty")]
    EmptyCommand,
}

/// Errors submitting a job.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error(transparent)]
    JobFile(#[from] JobFileError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A job submission as written in a JSON job file.
#[derive(Debug, Deserialize)]
struct JobFile {
    id: Option<String>,
    command: String,
    max_retries: Option<u32>,
}

/// Builds and enqueues a new pending job.
///
/// # Example
///
/// ```
/// # use queuectl::prelude::*;
/// # use chrono::TimeDelta;
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let store = InMemoryJobStore::new();
/// let config = InMemoryConfig::default();
///
/// let id = JobBuilder::new("echo hello")
///     .with_id("greeting")
///     .with_max_retries(5)
///     .schedule_in(TimeDelta::minutes(10))
///     .enqueue_to(&store, &config)
///     .await
///     .unwrap();
///
/// assert_eq!(id.as_str(), "greeting");
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct JobBuilder {
    id: Option<JobId>,
    command: String,
    max_retries: Option<u32>,
    next_run_at: Option<DateTime<Utc>>,
}

impl JobBuilder {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            id: None,
            command: command.into(),
            max_retries: None,
            next_run_at: None,
        }
    }

    /// A job running the trimmed contents of a file as its command.
    pub async fn from_command_file(path: impl AsRef<Path>) -> Result<Self, JobFileError> {
        let command = tokio::fs::read_to_string(path).await?;
        let command = command.trim();
        if command.is_empty() {
            return Err(JobFileError::EmptyCommand);
        }
        Ok(Self::new(command))
    }

    /// A job described by a JSON file of the form `{"id"?, "command", "max_retries"?}`.
    pub async fn from_job_file(path: impl AsRef<Path>) -> Result<Self, JobFileError> {
        Self::from_json(&tokio::fs::read_to_string(path).await?)
    }

    /// A job described by a JSON document of the form `{"id"?, "command", "max_retries"?}`.
    pub fn from_json(json: &str) -> Result<Self, JobFileError> {
        let file: JobFile = serde_json::from_str(json)?;
        if file.command.trim().is_empty() {
            return Err(JobFileError::EmptyCommand);
        }
        Ok(Self {
            id: file.id.map(Into::into),
            max_retries: file.max_retries,
            ..Self::new(file.command)
        })
    }

    pub fn with_id(self, id: impl Into<JobId>) -> Self {
        Self {
            id: Some(id.into()),
            ..self
        }
    }

    pub fn with_max_retries(self, max_retries: u32) -> Self {
        Self {
            max_retries: Some(max_retries),
            ..self
        }
    }

    pub fn schedule_at(self, schedule_at: DateTime<Utc>) -> Self {
        Self {
            next_run_at: Some(schedule_at.trunc_subsecs(6)),
            ..self
        }
    }

    pub fn schedule_in(self, schedule_in: TimeDelta) -> Self {
        self.schedule_at(Utc::now() + schedule_in)
    }

    /// Builds the job, generating an id and taking the retry allowance from `config` where none
    /// was given.
    pub fn build<C: ConfigProvider + ?Sized>(self, config: &C) -> Result<Job, ConfigError> {
        let max_retries = match self.max_retries {
            Some(max_retries) => max_retries,
            None => config.max_retries()?,
        };
        Ok(Job {
            next_run_at: self.next_run_at,
            ..Job::new(
                self.id.unwrap_or_else(JobId::generate),
                self.command,
                max_retries,
            )
        })
    }

    pub async fn enqueue_to<S, C>(self, store: &S, config: &C) -> Result<JobId, SubmitError>
    where
        S: JobStore + ?Sized,
        C: ConfigProvider + ?Sized,
    {
        let job = self.build(config)?;
        let id = job.id.clone();
        store.enqueue(job).await?;
        tracing::debug!(job_id = %id, "Enqueued job");
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::{
        config::{ConfigKey, InMemoryConfig},
        job::JobState,
        store::memory::InMemoryJobStore,
    };

    #[tokio::test]
    async fn enqueue() {
        let store = InMemoryJobStore::new();
        let config = InMemoryConfig::default();

        let id = JobBuilder::new("echo hello")
            .with_id("job-1")
            .with_max_retries(5)
            .enqueue_to(&store, &config)
            .await
            .unwrap();

        let job = store.get(&id).await.unwrap().unwrap();
        assert_eq!(job.id.as_str(), "job-1");
        assert_eq!(job.command, "echo hello");
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.max_retries, 5);
        assert_eq!(job.next_run_at, None);
    }

    #[tokio::test]
    async fn enqueue_duplicate() {
        let store = InMemoryJobStore::new();
        let config = InMemoryConfig::default();
        let builder = JobBuilder::new("true").with_id("job-1");

        builder.clone().enqueue_to(&store, &config).await.unwrap();

        assert_matches!(
            builder.enqueue_to(&store, &config).await,
            Err(SubmitError::Store(StoreError::DuplicateId(_)))
        );
    }

    #[test]
    fn defaults_come_from_config() {
        let config = InMemoryConfig::default()
            .with(ConfigKey::MaxRetries, "7")
            .unwrap();

        let job = JobBuilder::new("true").build(&config).unwrap();

        assert_eq!(job.max_retries, 7);
        assert!(uuid::Uuid::parse_str(job.id.as_str()).is_ok());
    }

    #[tokio::test]
    async fn delayed_job_is_not_claimable_before_its_time() {
        let store = InMemoryJobStore::new();
        let config = InMemoryConfig::default();

        let id = JobBuilder::new("true")
            .schedule_in(TimeDelta::minutes(5))
            .enqueue_to(&store, &config)
            .await
            .unwrap();

        assert_eq!(store.claim().await.unwrap(), None);
        let job = store.get(&id).await.unwrap().unwrap();
        assert!(job.next_run_at.unwrap() > Utc::now() + TimeDelta::minutes(4));
    }

    #[tokio::test]
    async fn command_file_is_trimmed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cmd.txt");
        std::fs::write(&path, "  echo from file\n\n").unwrap();

        let job = JobBuilder::from_command_file(&path)
            .await
            .unwrap()
            .build(&InMemoryConfig::default())
            .unwrap();

        assert_eq!(job.command, "echo from file");
    }

    #[tokio::test]
    async fn empty_command_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cmd.txt");
        std::fs::write(&path, "\n  \n").unwrap();

        assert_matches!(
            JobBuilder::from_command_file(&path).await,
            Err(JobFileError::EmptyCommand)
        );
        assert_matches!(
            JobBuilder::from_command_file(dir.path().join("missing.txt")).await,
            Err(JobFileError::Io(_))
        );
    }

    #[tokio::test]
    async fn job_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("job.json");
        std::fs::write(
            &path,
            r#"{"id": "from-file", "command": "echo hi", "max_retries": 1}"#,
        )
        .unwrap();

        let job = JobBuilder::from_job_file(&path)
            .await
            .unwrap()
            .build(&InMemoryConfig::default())
            .unwrap();

        assert_eq!(job.id.as_str(), "from-file");
        assert_eq!(job.command, "echo hi");
        assert_eq!(job.max_retries, 1);
    }

    #[test]
    fn job_file_optional_fields() {
        let job = JobBuilder::from_json(r#"{"command": "echo hi"}"#)
            .unwrap()
            .build(&InMemoryConfig::default())
            .unwrap();

        assert_eq!(job.max_retries, 3);
        assert!(!job.id.as_str().is_empty());
    }

    #[test]
    fn malformed_job_file_is_rejected() {
        assert_matches!(
            JobBuilder::from_json(r#"{"id": "no-command"}"#),
            Err(JobFileError::Json(_))
        );
        assert_matches!(
            JobBuilder::from_json(r#"{"command": " "}"#),
            Err(JobFileError::EmptyCommand)
        );
    }
}
