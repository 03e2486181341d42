//! Subprocess invocation for command-driven backends.
//!
//! Backends describe the process they want as a [`CommandSpec`] and hand it
//! to a [`CommandRunner`]. The real runner spawns it with exactly the given
//! environment list, streams its output, and kills it on cancellation.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::env::split_entry;

/// A process to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
  pub program: String,
  pub args: Vec<String>,

  /// Working directory.
  pub dir: PathBuf,

  /// Complete environment as ordered `KEY=VALUE` entries. The process gets
  /// nothing else; for repeated keys the last entry wins.
  pub env: Vec<String>,
}

impl CommandSpec {
  /// The command line, for logs and error messages.
  pub fn display(&self) -> String {
    std::iter::once(self.program.as_str())
      .chain(self.args.iter().map(String::as_str))
      .collect::<Vec<_>>()
      .join(" ")
  }
}

#[derive(Debug, Error)]
pub enum CommandError {
  #[error("failed to start {program}: {source}")]
  Spawn {
    program: String,
    #[source]
    source: std::io::Error,
  },

  #[error("command exited with code {code:?}")]
  Failed { code: Option<i32> },

  #[error("command cancelled")]
  Cancelled,

  #[error("io error: {0}")]
  Io(#[from] std::io::Error),
}

/// Runs processes on behalf of a backend.
#[async_trait]
pub trait CommandRunner: Send + Sync {
  /// Run `spec` to completion, writing its stdout and stderr to `out`.
  ///
  /// Returns [`CommandError::Cancelled`] once `cancel` fires; the process is
  /// killed first.
  async fn run(
    &self,
    spec: &CommandSpec,
    out: &mut (dyn AsyncWrite + Send + Unpin),
    cancel: &CancellationToken,
  ) -> Result<(), CommandError>;
}

/// Spawns real processes with `tokio::process`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

#[async_trait]
impl CommandRunner for ProcessRunner {
  async fn run(
    &self,
    spec: &CommandSpec,
    out: &mut (dyn AsyncWrite + Send + Unpin),
    cancel: &CancellationToken,
  ) -> Result<(), CommandError> {
    info!(cmd = %spec.display(), "executing command");

    let mut command = Command::new(&spec.program);
    command
      .args(&spec.args)
      .current_dir(&spec.dir)
      .env_clear()
      .stdin(Stdio::null())
      .stdout(Stdio::piped())
      .stderr(Stdio::piped())
      .kill_on_drop(true);

    for entry in &spec.env {
      let (key, value) = split_entry(entry);
      command.env(key, value);
    }

    debug!(working_dir = ?spec.dir, env_entries = spec.env.len(), "spawning process");

    let mut child = command.spawn().map_err(|source| CommandError::Spawn {
      program: spec.program.clone(),
      source,
    })?;

    let mut stdout = child.stdout.take().map(BufReader::new);
    let mut stderr = child.stderr.take().map(BufReader::new);

    loop {
      tokio::select! {
        _ = cancel.cancelled() => {
          debug!(cmd = %spec.program, "killing cancelled process");
          child.kill().await?;
          return Err(CommandError::Cancelled);
        }
        chunk = next_chunk(&mut stdout), if stdout.is_some() => match chunk? {
          Some(bytes) => out.write_all(&bytes).await?,
          None => stdout = None,
        },
        chunk = next_chunk(&mut stderr), if stderr.is_some() => match chunk? {
          Some(bytes) => out.write_all(&bytes).await?,
          None => stderr = None,
        },
        status = child.wait(), if stdout.is_none() && stderr.is_none() => {
          let status = status?;
          out.flush().await?;
          if !status.success() {
            debug!(code = ?status.code(), "command failed");
            return Err(CommandError::Failed { code: status.code() });
          }
          return Ok(());
        }
      }
    }
  }
}

/// Next piece of output: up to and including a newline, or whatever the
/// reader has buffered. Bytes are passed through undecoded and a chunk never
/// exceeds the reader's buffer.
async fn next_chunk<R>(reader: &mut Option<R>) -> std::io::Result<Option<Vec<u8>>>
where
  R: AsyncBufRead + Unpin,
{
  let Some(reader) = reader else {
    return Ok(None);
  };

  let available = reader.fill_buf().await?;
  if available.is_empty() {
    return Ok(None);
  }

  let end = available
    .iter()
    .position(|b| *b == b'\n')
    .map_or(available.len(), |i| i + 1);
  let chunk = available[..end].to_vec();
  reader.consume(end);
  Ok(Some(chunk))
}

/// Get the shell command and arguments for the current platform.
///
/// `override_shell` selects a specific shell; the argument style is derived
/// from its name.
pub fn get_shell(override_shell: Option<&str>) -> (String, Vec<String>) {
  if let Some(shell) = override_shell {
    let args = if shell.contains("powershell") || shell.contains("pwsh") {
      vec!["-NoProfile".to_string(), "-Command".to_string()]
    } else if shell.contains("cmd") {
      vec!["/C".to_string()]
    } else {
      vec!["-c".to_string()]
    };
    return (shell.to_string(), args);
  }

  #[cfg(unix)]
  {
    ("/bin/sh".to_string(), vec!["-c".to_string()])
  }

  #[cfg(windows)]
  {
    (
      "powershell.exe".to_string(),
      vec![
        "-NoProfile".to_string(),
        "-ExecutionPolicy".to_string(),
        "Bypass".to_string(),
        "-Command".to_string(),
      ],
    )
  }
}
