use std::{fmt::Display, str::FromStr};

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod builder;

/// The caller supplied identifier of a job.
///
/// Job ids are unique within a store and never change once the job has been enqueued.
#[derive(Debug, Eq, PartialEq, Clone, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Generates a new random (v4 UUID) job id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for JobId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<JobId> for String {
    fn from(value: JobId) -> Self {
        value.0
    }
}

impl AsRef<str> for JobId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// The lifecycle state of a job.
///
/// Jobs move `Pending -> Processing -> {Completed | Pending | Dead}`. The only way back out of
/// `Dead` is an explicit requeue through the dead letter queue.
///
/// `Failed` is never written by the engine, it is kept so that stores which predate dead
/// lettering can still be read and counted.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Processing,
    Completed,
    Failed,
    Dead,
}

impl JobState {
    pub const ALL: [JobState; 5] = [
        Self::Pending,
        Self::Processing,
        Self::Completed,
        Self::Failed,
        Self::Dead,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Dead => "dead",
        }
    }
}

impl Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("Unknown job state: {0}")]
pub struct UnknownJobState(pub String);

impl FromStr for JobState {
    type Err = UnknownJobState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| UnknownJobState(s.to_owned()))
    }
}

/// A unit of work: a shell command plus its retry bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub command: String,
    pub state: JobState,
    /// The number of execution attempts that have failed so far.
    pub attempts: u32,
    /// How many attempts beyond the first are allowed before the job is dead lettered.
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// The earliest time the job may be claimed. [`None`] means immediately.
    pub next_run_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Creates a new pending job that is immediately eligible to run.
    pub fn new(id: impl Into<JobId>, command: impl Into<String>, max_retries: u32) -> Self {
        let now = now();
        Self {
            id: id.into(),
            command: command.into(),
            state: JobState::Pending,
            attempts: 0,
            max_retries,
            created_at: now,
            updated_at: now,
            next_run_at: None,
        }
    }

    /// Whether a worker may claim this job at `now`.
    pub fn is_claimable_at(&self, now: DateTime<Utc>) -> bool {
        self.state == JobState::Pending && self.next_run_at.map_or(true, |at| at <= now)
    }

    /// Checks the job is a well formed submission, returning the reason it is not.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.id.as_str().trim().is_empty() {
            return Err("id must not be empty");
        }
        if self.command.trim().is_empty() {
            return Err("command must not be empty");
        }
        if self.state != JobState::Pending {
            return Err("new jobs must be pending");
        }
        if self.attempts != 0 {
            return Err("new jobs must not have any attempts");
        }
        if self.updated_at < self.created_at {
            return Err("updated_at must not precede created_at");
        }
        Ok(())
    }
}

/// The current time truncated to the microsecond precision jobs are persisted with.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}
