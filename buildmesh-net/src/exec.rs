//! Process execution for dispatched tasks.

use std::io;
use std::process::Stdio;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;

use crate::protocol::{AccessMode, TaskDispatch};

/// Size of each read from the child's output pipes.
const OUTPUT_CHUNK: usize = 8 * 1024;

/// Failure of a dispatched process.
#[derive(Debug, Error)]
pub enum ExecError {
    /// The process could not be started.
    #[error("failed to start {executable}: {source}")]
    Spawn {
        executable: String,
        #[source]
        source: io::Error,
    },

    /// Reading output or waiting for the process failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The process exited with a non-zero status.
    #[error("exit status: {0}")]
    ExitStatus(i32),

    /// The process was killed by a signal.
    #[error("terminated by signal")]
    Signaled,

    /// The executor refused the task.
    #[error("{0}")]
    Rejected(String),
}

/// Receives events from a running task.
///
/// Both methods may wait while earlier events are still being sent, which
/// throttles a task that produces output faster than the tunnel drains it.
#[async_trait]
pub trait TaskEvents: Send + Sync {
    /// A chunk of console output.
    async fn output(&self, chunk: String);

    /// The process accessed `path`.
    async fn file_access(&self, path: String, mode: AccessMode);
}

/// Runs dispatched tasks on the executing side of a tunnel.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Run `task` to completion, reporting progress through `events`.
    ///
    /// Dropping the returned future must stop the task.
    async fn execute(&self, task: &TaskDispatch, events: &dyn TaskEvents) -> Result<(), ExecError>;
}

/// Runs tasks as local child processes.
///
/// Standard output and standard error are forwarded as output chunks in
/// arrival order. File access is not traced.
#[derive(Debug, Clone, Default)]
pub struct LocalProcess;

impl LocalProcess {
    /// Create a local process executor.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TaskExecutor for LocalProcess {
    async fn execute(&self, task: &TaskDispatch, events: &dyn TaskEvents) -> Result<(), ExecError> {
        let mut command = Command::new(&task.executable);
        command
            .args(&task.arguments)
            .envs(task.environment.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if !task.working_dir.is_empty() {
            command.current_dir(&task.working_dir);
        }

        let mut child = command.spawn().map_err(|source| ExecError::Spawn {
            executable: task.executable.clone(),
            source,
        })?;
        tracing::debug!(executable = %task.executable, pid = ?child.id(), "Process started");

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (out, err) = tokio::join!(forward(stdout, events), forward(stderr, events));
        out?;
        err?;

        let status = child.wait().await?;
        match status.code() {
            Some(0) => Ok(()),
            Some(code) => Err(ExecError::ExitStatus(code)),
            None => Err(ExecError::Signaled),
        }
    }
}

async fn forward<R>(pipe: Option<R>, events: &dyn TaskEvents) -> io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let Some(mut pipe) = pipe else {
        return Ok(());
    };
    let mut buf = vec![0u8; OUTPUT_CHUNK];
    let mut pending = Vec::new();
    loop {
        let n = pipe.read(&mut buf).await?;
        if n == 0 {
            if !pending.is_empty() {
                events.output(String::from_utf8_lossy(&pending).into_owned()).await;
            }
            return Ok(());
        }
        pending.extend_from_slice(&buf[..n]);
        let text = take_text(&mut pending);
        if !text.is_empty() {
            events.output(text).await;
        }
    }
}

/// Drain `pending` up to any incomplete UTF-8 sequence at its end, which is
/// left in place for the next read. Invalid bytes become U+FFFD.
fn take_text(pending: &mut Vec<u8>) -> String {
    let complete = match std::str::from_utf8(pending) {
        Ok(_) => pending.len(),
        Err(e) if e.error_len().is_none() => e.valid_up_to(),
        Err(_) => pending.len(),
    };
    let rest = pending.split_off(complete);
    let text = std::mem::replace(pending, rest);
    match String::from_utf8(text) {
        Ok(text) => text,
        Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
    }
}
