use chrono::{DateTime, NaiveDateTime, Utc};
use queuectl::{
    job::{JobId, JobState},
    store::StoreError,
};
use sqlx::prelude::FromRow;

/// Timestamps are stored as fixed width text so that lexical and chronological order agree.
const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6fZ";

pub(crate) fn encode_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp.format(TIMESTAMP_FORMAT).to_string()
}

/// Decodes a stored timestamp, accepting RFC 3339 as well as naive timestamps with an optional
/// `Z` suffix as written by older stores.
pub(crate) fn decode_timestamp(value: &str) -> Result<DateTime<Utc>, StoreError> {
    if let Ok(timestamp) = DateTime::parse_from_rfc3339(value) {
        return Ok(timestamp.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(value.trim_end_matches('Z'), "%Y-%m-%dT%H:%M:%S%.f")
        .map(|timestamp| timestamp.and_utc())
        .map_err(|error| StoreError::Decode(format!("invalid timestamp {value:?}: {error}").into()))
}

#[derive(sqlx::Type, Debug, Clone, Copy, PartialEq, Eq)]
#[sqlx(rename_all = "lowercase")]
pub(crate) enum StoredState {
    Pending,
    Processing,
    Completed,
    Failed,
    Dead,
}

impl From<StoredState> for JobState {
    fn from(value: StoredState) -> Self {
        match value {
            StoredState::Pending => Self::Pending,
            StoredState::Processing => Self::Processing,
            StoredState::Completed => Self::Completed,
            StoredState::Failed => Self::Failed,
            StoredState::Dead => Self::Dead,
        }
    }
}

impl From<JobState> for StoredState {
    fn from(value: JobState) -> Self {
        match value {
            JobState::Pending => Self::Pending,
            JobState::Processing => Self::Processing,
            JobState::Completed => Self::Completed,
            JobState::Failed => Self::Failed,
            JobState::Dead => Self::Dead,
        }
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct JobRow {
    pub id: String,
    pub command: String,
    pub state: StoredState,
    pub attempts: i64,
    pub max_retries: i64,
    pub created_at: String,
    pub updated_at: String,
    pub next_run_at: Option<String>,
}

fn decode_count(id: &str, field: &str, value: i64) -> Result<u32, StoreError> {
    u32::try_from(value)
        .map_err(|_| StoreError::Decode(format!("job {id} has invalid {field}: {value}").into()))
}

impl TryFrom<JobRow> for queuectl::job::Job {
    type Error = StoreError;

    fn try_from(value: JobRow) -> Result<Self, Self::Error> {
        Ok(Self {
            attempts: decode_count(&value.id, "attempts", value.attempts)?,
            max_retries: decode_count(&value.id, "max_retries", value.max_retries)?,
            created_at: decode_timestamp(&value.created_at)?,
            updated_at: decode_timestamp(&value.updated_at)?,
            next_run_at: value
                .next_run_at
                .as_deref()
                .map(decode_timestamp)
                .transpose()?,
            state: value.state.into(),
            command: value.command,
            id: JobId::from(value.id),
        })
    }
}
