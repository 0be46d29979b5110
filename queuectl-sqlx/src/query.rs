use queuectl::{job::Job, retry::RetryDecision};
use sqlx::{FromRow, SqliteConnection};

use crate::{
    map_err,
    types::{encode_timestamp, JobRow, StoredState},
    SqliteJobStore,
};

const JOB_COLUMNS: &str =
    "id, command, state, attempts, max_retries, created_at, updated_at, next_run_at";

/// Result of a single claim transaction.
pub(crate) enum ClaimAttempt {
    Claimed(Job),
    /// The selected job could not be read back and was moved to dead.
    Undecodable { id: String, reason: String },
    /// No pending job is due.
    Empty,
    /// The selected job was taken by someone else before it could be marked.
    Lost,
}

impl SqliteJobStore {
    /// Inserts `job`, returning the number of rows written: zero when the id is taken.
    pub(crate) async fn insert_job(&self, job: &Job) -> sqlx::Result<u64> {
        Ok(sqlx::query(
            "INSERT INTO jobs (id, command, state, attempts, max_retries, created_at, updated_at, next_run_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(id) DO NOTHING",
        )
        .bind(job.id.as_str())
        .bind(job.command.as_str())
        .bind(StoredState::from(job.state))
        .bind(i64::from(job.attempts))
        .bind(i64::from(job.max_retries))
        .bind(encode_timestamp(job.created_at))
        .bind(encode_timestamp(job.updated_at))
        .bind(job.next_run_at.map(encode_timestamp))
        .execute(&self.pool)
        .await?
        .rows_affected())
    }

    /// Selects the oldest due pending job and marks it processing, in one write transaction.
    pub(crate) async fn try_claim(&self, now: &str) -> sqlx::Result<ClaimAttempt> {
        let mut tx = self.begin_immediate().await?;
        let attempt = claim_oldest_due(&mut tx, now).await?;
        tx.commit().await?;
        Ok(attempt)
    }

    pub(crate) async fn mark_complete(&self, id: &str, now: &str) -> sqlx::Result<u64> {
        Ok(sqlx::query(
            "UPDATE jobs SET state = 'completed', updated_at = MAX(?1, created_at) WHERE id = ?2",
        )
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?
        .rows_affected())
    }

    /// Applies a retry decision. Dead lettering keeps the previous `next_run_at`.
    pub(crate) async fn apply_decision(
        &self,
        id: &str,
        decision: &RetryDecision,
        now: &str,
    ) -> sqlx::Result<u64> {
        Ok(sqlx::query(
            "UPDATE jobs
            SET state = ?1, attempts = ?2, next_run_at = COALESCE(?3, next_run_at),
                updated_at = MAX(?4, created_at)
            WHERE id = ?5",
        )
        .bind(StoredState::from(decision.state()))
        .bind(i64::from(decision.attempts()))
        .bind(decision.next_run_at().map(encode_timestamp))
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?
        .rows_affected())
    }

    /// Moves a dead job back to pending with a fresh retry allowance.
    pub(crate) async fn requeue_dead(&self, id: &str, now: &str) -> sqlx::Result<u64> {
        Ok(sqlx::query(
            "UPDATE jobs
            SET state = 'pending', attempts = 0, next_run_at = NULL, updated_at = MAX(?1, created_at)
            WHERE id = ?2 AND state = 'dead'",
        )
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?
        .rows_affected())
    }

    pub(crate) async fn select_job(&self, id: &str) -> sqlx::Result<Option<JobRow>> {
        sqlx::query_as(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
    }

    pub(crate) async fn select_jobs(&self, state: Option<StoredState>) -> sqlx::Result<Vec<JobRow>> {
        sqlx::query_as(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs
            WHERE ?1 IS NULL OR state = ?1
            ORDER BY created_at, rowid"
        ))
        .bind(state)
        .fetch_all(&self.pool)
        .await
    }

    pub(crate) async fn count_by_state(&self) -> sqlx::Result<Vec<(StoredState, i64)>> {
        sqlx::query_as("SELECT state, COUNT(*) FROM jobs GROUP BY state")
            .fetch_all(&self.pool)
            .await
    }
}

async fn claim_oldest_due(conn: &mut SqliteConnection, now: &str) -> sqlx::Result<ClaimAttempt> {
    let candidate: Option<(String,)> = sqlx::query_as(
        "SELECT id FROM jobs
        WHERE state = 'pending' AND (next_run_at IS NULL OR next_run_at <= ?1)
        ORDER BY created_at, rowid
        LIMIT 1",
    )
    .bind(now)
    .fetch_optional(&mut *conn)
    .await?;
    let Some((id,)) = candidate else {
        return Ok(ClaimAttempt::Empty);
    };

    let claimed = sqlx::query(&format!(
        "UPDATE jobs SET state = 'processing', updated_at = MAX(?1, created_at)
        WHERE id = ?2 AND state = 'pending'
        RETURNING {JOB_COLUMNS}"
    ))
    .bind(now)
    .bind(id.as_str())
    .fetch_optional(&mut *conn)
    .await?;
    let Some(row) = claimed else {
        return Ok(ClaimAttempt::Lost);
    };

    match JobRow::from_row(&row).map_err(map_err).and_then(Job::try_from) {
        Ok(job) => Ok(ClaimAttempt::Claimed(job)),
        Err(error) => {
            sqlx::query("UPDATE jobs SET state = 'dead', updated_at = MAX(?1, created_at) WHERE id = ?2")
                .bind(now)
                .bind(id.as_str())
                .execute(&mut *conn)
                .await?;
            Ok(ClaimAttempt::Undecodable {
                id,
                reason: error.to_string(),
            })
        }
    }
}
