//! Runs job commands through the platform shell.
use std::{fmt::Display, process::Stdio, time::Duration};

use tokio::{
    io::{AsyncRead, AsyncReadExt},
    process::Command,
};

/// How long output still buffered in the pipes of a killed command is collected for.
const KILLED_OUTPUT_GRACE: Duration = Duration::from_millis(250);

/// The captured output of a command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Output {
    pub stdout: String,
    pub stderr: String,
}

impl Output {
    fn from_bytes(stdout: &[u8], stderr: &[u8]) -> Self {
        Self {
            stdout: String::from_utf8_lossy(stdout).into_owned(),
            stderr: String::from_utf8_lossy(stderr).into_owned(),
        }
    }
}

/// The outcome of running a command once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionResult {
    /// The command ran to completion with the given exit code.
    Exited { code: i32, output: Output },
    /// The command was terminated by a signal.
    Terminated { output: Output },
    /// The command did not finish within the timeout and was killed.
    ///
    /// `output` holds what the command wrote before it was killed.
    TimedOut { timeout: Duration, output: Output },
    /// The command could not be run at all.
    Error { message: String },
}

impl ExecutionResult {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Exited { code: 0, .. })
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::Exited { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub fn output(&self) -> Option<&Output> {
        match self {
            Self::Exited { output, .. }
            | Self::Terminated { output }
            | Self::TimedOut { output, .. } => Some(output),
            Self::Error { .. } => None,
        }
    }

    /// A short machine friendly tag for the outcome, used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Exited { code: 0, .. } => "success",
            Self::Exited { .. } => "exit_code",
            Self::Terminated { .. } => "terminated",
            Self::TimedOut { .. } => "timeout",
            Self::Error { .. } => "spawn_error",
        }
    }
}

impl Display for ExecutionResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exited { code, .. } => write!(f, "rc={code}"),
            Self::Terminated { .. } => f.write_str("terminated by signal"),
            Self::TimedOut { timeout, .. } => write!(f, "timed out after {}s", timeout.as_secs()),
            Self::Error { message } => write!(f, "failed to run: {message}"),
        }
    }
}

/// The shell job commands are handed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shell {
    program: String,
    flag: String,
}

impl Default for Shell {
    #[cfg(windows)]
    fn default() -> Self {
        Self::new("cmd", "/C")
    }

    #[cfg(not(windows))]
    fn default() -> Self {
        Self::new("sh", "-c")
    }
}

impl Shell {
    /// A shell run as `<program> <flag> <command>`.
    pub fn new(program: impl Into<String>, flag: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            flag: flag.into(),
        }
    }

    /// Runs `command` to completion, killing it if it outlives `timeout`.
    pub async fn run(&self, command: &str, timeout: Option<Duration>) -> ExecutionResult {
        let child = Command::new(&self.program)
            .arg(&self.flag)
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();
        let mut child = match child {
            Ok(child) => child,
            Err(error) => {
                return ExecutionResult::Error {
                    message: error.to_string(),
                }
            }
        };
        let mut stdout_pipe = child.stdout.take();
        let mut stderr_pipe = child.stderr.take();
        let (mut stdout, mut stderr) = (Vec::new(), Vec::new());

        let status = {
            let run = async {
                let (status, _, _) = tokio::join!(
                    child.wait(),
                    drain(stdout_pipe.as_mut(), &mut stdout),
                    drain(stderr_pipe.as_mut(), &mut stderr),
                );
                status
            };
            match timeout {
                Some(timeout) => tokio::time::timeout(timeout, run).await.ok(),
                None => Some(run.await),
            }
        };

        let Some(status) = status else {
            if let Err(error) = child.kill().await {
                tracing::warn!(?error, "Failed to kill timed out command: {error}");
            }
            let _ = tokio::time::timeout(KILLED_OUTPUT_GRACE, async {
                tokio::join!(
                    drain(stdout_pipe.as_mut(), &mut stdout),
                    drain(stderr_pipe.as_mut(), &mut stderr),
                )
            })
            .await;
            return ExecutionResult::TimedOut {
                // The timeout branch is only reachable with a timeout set.
                timeout: timeout.unwrap_or_default(),
                output: Output::from_bytes(&stdout, &stderr),
            };
        };

        let output = Output::from_bytes(&stdout, &stderr);
        match status {
            Ok(status) => match status.code() {
                Some(code) => ExecutionResult::Exited { code, output },
                None => ExecutionResult::Terminated { output },
            },
            Err(error) => ExecutionResult::Error {
                message: error.to_string(),
            },
        }
    }
}

/// Appends everything read from `pipe` to `buf` until end of file.
///
/// Bytes already appended are kept if the future is dropped part way.
async fn drain<R>(pipe: Option<&mut R>, buf: &mut Vec<u8>) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let Some(pipe) = pipe else {
        return Ok(());
    };
    while pipe.read_buf(buf).await? != 0 {}
    Ok(())
}

#[cfg(all(test, unix))]
mod test {
    use super::*;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn captures_output_and_exit_code() {
        let result = Shell::default()
            .run("echo out; echo err >&2; exit 3", None)
            .await;

        assert_eq!(
            result,
            ExecutionResult::Exited {
                code: 3,
                output: Output {
                    stdout: "out\n".to_owned(),
                    stderr: "err\n".to_owned(),
                },
            }
        );
        assert!(!result.is_success());
        assert_eq!(result.to_string(), "rc=3");
    }

    #[tokio::test]
    async fn success() {
        let result = Shell::default().run("true", None).await;

        assert!(result.is_success());
        assert_eq!(result.exit_code(), Some(0));
    }

    #[tokio::test]
    async fn timeout_kills_command() {
        let started = std::time::Instant::now();
        let result = Shell::default()
            .run("sleep 5", Some(Duration::from_millis(200)))
            .await;

        assert_matches!(result, ExecutionResult::TimedOut { .. });
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn timeout_keeps_output_written_before_kill() {
        let result = Shell::default()
            .run(
                "echo started; echo warming up >&2; exec sleep 5",
                Some(Duration::from_millis(300)),
            )
            .await;

        assert_matches!(
            &result,
            ExecutionResult::TimedOut { output, .. }
                if output.stdout == "started\n" && output.stderr == "warming up\n"
        );
        assert_eq!(result.to_string(), "timed out after 0s");
    }

    #[tokio::test]
    async fn killed_by_signal() {
        let result = Shell::default().run("kill -9 $$", None).await;

        assert_matches!(result, ExecutionResult::Terminated { .. });
        assert!(!result.is_success());
    }

    #[tokio::test]
    async fn missing_shell_is_an_error() {
        let result = Shell::new("/nonexistent/shell", "-c").run("true", None).await;

        assert_matches!(result, ExecutionResult::Error { .. });
        assert_eq!(result.kind(), "spawn_error");
    }
}
