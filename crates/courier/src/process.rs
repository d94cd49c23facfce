//! External command execution.
//!
//! Every external tool the pipeline drives goes through [`run_command`]: the
//! child is bound to the run's cancellation token, optionally boxed by a
//! deadline, and its output captured for classification by the caller. A
//! timed-out command is killed and reported with `timed_out` set rather than
//! as a spawn error, so callers can log the distinction.

use std::process::Stdio;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::environment::CommandEnvironment;

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to wait for {program}: {source}")]
    Wait {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The run context was cancelled while the command was in flight. The
    /// child has been killed.
    #[error("cancelled while running {program}")]
    Cancelled { program: String },
}

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub duration: Duration,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }

    /// Stdout and stderr concatenated, for marker scanning.
    pub fn combined(&self) -> String {
        let mut combined = String::with_capacity(self.stdout.len() + self.stderr.len() + 1);
        combined.push_str(&self.stdout);
        if !self.stdout.is_empty() && !self.stderr.is_empty() {
            combined.push('\n');
        }
        combined.push_str(&self.stderr);
        combined
    }

    /// A short diagnostic line: exit code plus the tail of stderr.
    pub fn describe(&self) -> String {
        let stderr_tail: String = self
            .stderr
            .lines()
            .rev()
            .take(3)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect::<Vec<_>>()
            .join(" | ");
        if self.timed_out {
            format!("timed out; partial stderr: {stderr_tail}")
        } else {
            format!("exit {}; stderr: {stderr_tail}", self.exit_code)
        }
    }
}

/// Run `program` with `args` under `env`, killing it on timeout or
/// cancellation. Stdin is closed; stdout/stderr are captured lossily.
pub async fn run_command(
    cancel: &CancellationToken,
    program: &str,
    args: &[String],
    env: &CommandEnvironment,
    timeout: Option<Duration>,
) -> Result<CommandOutput, CommandError> {
    let start = Instant::now();

    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    for (key, value) in env.iter() {
        command.env(key, value);
    }

    let mut child = command.spawn().map_err(|source| CommandError::Spawn {
        program: program.to_string(),
        source,
    })?;

    let mut stdout_pipe = child.stdout.take();
    let mut stderr_pipe = child.stderr.take();
    let stdout_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(pipe) = stdout_pipe.as_mut() {
            let _ = pipe.read_to_end(&mut buf).await;
        }
        buf
    });
    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(pipe) = stderr_pipe.as_mut() {
            let _ = pipe.read_to_end(&mut buf).await;
        }
        buf
    });

    let deadline = async {
        match timeout {
            Some(t) => tokio::time::sleep(t).await,
            None => std::future::pending().await,
        }
    };

    let wait_err = |source| CommandError::Wait {
        program: program.to_string(),
        source,
    };

    let (exit_code, timed_out) = tokio::select! {
        status = child.wait() => {
            let status = status.map_err(wait_err)?;
            (status.code().unwrap_or(-1), false)
        }
        _ = deadline => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            (-1, true)
        }
        _ = cancel.cancelled() => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            return Err(CommandError::Cancelled {
                program: program.to_string(),
            });
        }
    };

    let stdout_bytes = stdout_task.await.unwrap_or_default();
    let stderr_bytes = stderr_task.await.unwrap_or_default();

    let mut stderr = String::from_utf8_lossy(&stderr_bytes).to_string();
    if timed_out {
        if let Some(t) = timeout {
            if !stderr.is_empty() {
                stderr.push('\n');
            }
            stderr.push_str(&format!(
                "command timed out after {}",
                humantime::format_duration(t)
            ));
        }
    }

    Ok(CommandOutput {
        exit_code,
        stdout: String::from_utf8_lossy(&stdout_bytes).to_string(),
        stderr,
        timed_out,
        duration: start.elapsed(),
    })
}

/// Run `program` attached to the parent's stdio, for commands that may
/// prompt the operator. Output is not captured; only the exit status is
/// reported.
pub async fn run_command_interactive(
    cancel: &CancellationToken,
    program: &str,
    args: &[String],
    env: &CommandEnvironment,
    timeout: Option<Duration>,
) -> Result<CommandOutput, CommandError> {
    let start = Instant::now();

    let mut command = Command::new(program);
    command.args(args).kill_on_drop(true);
    for (key, value) in env.iter() {
        command.env(key, value);
    }

    let mut child = command.spawn().map_err(|source| CommandError::Spawn {
        program: program.to_string(),
        source,
    })?;

    let deadline = async {
        match timeout {
            Some(t) => tokio::time::sleep(t).await,
            None => std::future::pending().await,
        }
    };

    let (exit_code, timed_out) = tokio::select! {
        status = child.wait() => {
            let status = status.map_err(|source| CommandError::Wait {
                program: program.to_string(),
                source,
            })?;
            (status.code().unwrap_or(-1), false)
        }
        _ = deadline => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            (-1, true)
        }
        _ = cancel.cancelled() => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            return Err(CommandError::Cancelled {
                program: program.to_string(),
            });
        }
    };

    Ok(CommandOutput {
        exit_code,
        stdout: String::new(),
        stderr: String::new(),
        timed_out,
        duration: start.elapsed(),
    })
}
