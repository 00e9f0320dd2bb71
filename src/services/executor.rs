use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;

/// Output of a command that exited with status 0.
#[derive(Debug, Clone)]
pub struct ExecutionOutput {
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

/// Runs one external process per job with a bounded wall-clock timeout.
///
/// The command string is split with POSIX shell-word rules and executed
/// directly, without a shell. Jobs that need pipes, redirects or builtins
/// submit an explicit `sh -c '...'` invocation.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    timeout: Duration,
}

impl CommandExecutor {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub async fn run(&self, command: &str) -> Result<ExecutionOutput, ExecutionError> {
        let argv = shlex::split(command).ok_or(ExecutionError::InvalidCommand)?;
        let (program, args) = argv.split_first().ok_or(ExecutionError::EmptyCommand)?;

        let start = Instant::now();
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ExecutionError::Spawn {
                program: program.clone(),
                source,
            })?;

        // On timeout the future is dropped, which drops the child and kills it.
        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(ExecutionError::Wait)?,
            Err(_) => return Err(ExecutionError::Timeout(self.timeout)),
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        if output.status.success() {
            Ok(ExecutionOutput {
                stdout,
                stderr,
                duration: start.elapsed(),
            })
        } else {
            Err(ExecutionError::NonZeroExit {
                code: output.status.code(),
                stdout,
                stderr,
            })
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("Command is empty")]
    EmptyCommand,

    #[error("Command has unbalanced quotes or escapes")]
    InvalidCommand,

    #[error("Failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to wait for command: {0}")]
    Wait(std::io::Error),

    #[error("Command timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("Command exited with status {}", .code.map_or_else(|| "signal".to_string(), |c| c.to_string()))]
    NonZeroExit {
        code: Option<i32>,
        stdout: String,
        stderr: String,
    },
}

impl ExecutionError {
    /// Text recorded in the job's `error` field for this failed attempt.
    pub fn job_error(&self) -> String {
        match self {
            ExecutionError::NonZeroExit { stdout, stderr, .. } => {
                if !stderr.trim().is_empty() {
                    stderr.clone()
                } else if !stdout.trim().is_empty() {
                    stdout.clone()
                } else {
                    self.to_string()
                }
            }
            other => other.to_string(),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ExecutionError::Timeout(_))
    }
}
