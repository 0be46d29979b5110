//! Per job logging of command output.
//!
//! The engine never persists command output itself, it hands every execution to a [`JobLogger`].
//! Failures to log are reported to the caller, the worker only warns about them.
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::io::AsyncWriteExt;

use crate::{executor::ExecutionResult, job::JobId};

/// A single execution of a job, as handed to a [`JobLogger`].
#[derive(Debug, Clone)]
pub struct ExecutionRecord<'a> {
    pub job_id: &'a JobId,
    /// The 1-based number of this attempt.
    pub attempt: u32,
    pub finished_at: DateTime<Utc>,
    pub result: &'a ExecutionResult,
}

impl ExecutionRecord<'_> {
    /// Renders the record as appended to a job's log file.
    pub fn render(&self) -> String {
        let mut entry = format!(
            "--- {} attempt={} {}\n",
            self.finished_at.format("%Y-%m-%dT%H:%M:%SZ"),
            self.attempt,
            self.result
        );
        match self.result {
            ExecutionResult::Error { message } => {
                entry.push_str("ERR:\n");
                entry.push_str(message);
                entry.push('\n');
            }
            result => {
                if let Some(output) = result.output() {
                    if !output.stdout.is_empty() {
                        entry.push_str("OUT:\n");
                        entry.push_str(&output.stdout);
                        entry.push('\n');
                    }
                    if !output.stderr.is_empty() {
                        entry.push_str("ERR:\n");
                        entry.push_str(&output.stderr);
                        entry.push('\n');
                    }
                }
            }
        }
        entry
    }
}

/// Receives the output of every job execution.
#[async_trait]
pub trait JobLogger: Send + Sync {
    async fn record(&self, record: &ExecutionRecord<'_>) -> std::io::Result<()>;
}

/// Appends executions to `<dir>/<job id>.log`.
#[derive(Debug, Clone)]
pub struct FileJobLogger {
    dir: PathBuf,
}

impl FileJobLogger {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, id: &JobId) -> PathBuf {
        self.dir.join(format!("{id}.log"))
    }
}

#[async_trait]
impl JobLogger for FileJobLogger {
    async fn record(&self, record: &ExecutionRecord<'_>) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path_for(record.job_id))
            .await?;
        file.write_all(record.render().as_bytes()).await?;
        file.flush().await
    }
}

/// Drops all output.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiscardLogger;

#[async_trait]
impl JobLogger for DiscardLogger {
    async fn record(&self, _record: &ExecutionRecord<'_>) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;
    use crate::executor::Output;
    use chrono::TimeZone;

    fn finished_at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap()
    }

    #[test]
    fn render_exited() {
        let id = JobId::from("job-1");
        let result = ExecutionResult::Exited {
            code: 2,
            output: Output {
                stdout: "hello".to_owned(),
                stderr: String::new(),
            },
        };
        let record = ExecutionRecord {
            job_id: &id,
            attempt: 1,
            finished_at: finished_at(),
            result: &result,
        };

        assert_eq!(
            record.render(),
            "--- 2024-05-01T12:30:00Z attempt=1 rc=2\nOUT:\nhello\n"
        );
    }

    #[test]
    fn render_timeout() {
        let id = JobId::from("job-1");
        let result = ExecutionResult::TimedOut {
            timeout: Duration::from_secs(3),
            output: Output {
                stdout: "partial".to_owned(),
                stderr: String::new(),
            },
        };
        let record = ExecutionRecord {
            job_id: &id,
            attempt: 2,
            finished_at: finished_at(),
            result: &result,
        };

        assert_eq!(
            record.render(),
            "--- 2024-05-01T12:30:00Z attempt=2 timed out after 3s\nOUT:\npartial\n"
        );
    }

    #[tokio::test]
    async fn file_logger_appends_per_job() {
        let dir = tempfile::tempdir().unwrap();
        let logger = FileJobLogger::new(dir.path().join("job_logs"));
        let id = JobId::from("job-1");
        let result = ExecutionResult::Error {
            message: "no such shell".to_owned(),
        };

        for attempt in 1..=2 {
            logger
                .record(&ExecutionRecord {
                    job_id: &id,
                    attempt,
                    finished_at: finished_at(),
                    result: &result,
                })
                .await
                .unwrap();
        }

        let contents = std::fs::read_to_string(logger.path_for(&id)).unwrap();
        assert_eq!(contents.matches("ERR:\nno such shell\n").count(), 2);
        assert!(contents.contains("attempt=1"));
        assert!(contents.contains("attempt=2"));
    }
}
