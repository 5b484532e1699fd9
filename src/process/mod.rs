//! Process output module
//!
//! Wraps a running command's stdout so that end-of-stream is only reported
//! once the command has exited successfully.
//!
//! A pipe closes when the producer exits, whether or not it succeeded. A
//! consumer that copies bytes until EOF would happily upload the truncated
//! output of a crashed command. [`ProcessOutputStream`] waits on the process
//! when the pipe reaches EOF and turns a failed exit into a read error.
//!
//! # Example
//!
//! ```no_run
//! use cmd2s3::process::ShellCommand;
//! use tokio::io::AsyncReadExt;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut output = ShellCommand::new("tar -c /var/log").spawn(CancellationToken::new())?;
//! let mut sink = Vec::new();
//! // Fails with a ProcessError if tar exits non-zero
//! output.read_to_end(&mut sink).await?;
//! # Ok(())
//! # }
//! ```

use futures::future::BoxFuture;
use futures::FutureExt;
use pin_project_lite::pin_project;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::process::{ExitStatus, Stdio};
use std::task::{ready, Context, Poll};
use thiserror::Error;
use tokio::io::{AsyncRead, ReadBuf};
use tokio::process::{ChildStdout, Command};
use tokio_util::sync::CancellationToken;

/// Process errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProcessError {
    #[error("failed to spawn `{command}`: {message}")]
    Spawn { command: String, message: String },

    #[error("process exited with status {0}")]
    Exited(i32),

    #[error("process terminated by signal {0}")]
    Signaled(i32),

    #[error("failed to wait for process: {0}")]
    Wait(String),

    #[error("process killed after cancellation")]
    Cancelled,
}

impl ProcessError {
    /// Extract a process failure carried inside an I/O error, if any
    pub fn from_io(err: &io::Error) -> Option<&ProcessError> {
        err.get_ref()
            .and_then(|inner| inner.downcast_ref::<ProcessError>())
    }
}

/// How a process terminated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitOutcome {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitOutcome {
    /// Exited with the given code
    pub fn code(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    /// Killed by the given signal
    pub fn signal(signal: i32) -> Self {
        Self {
            code: None,
            signal: Some(signal),
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Convert a non-successful outcome into an error
    pub fn check(&self) -> Result<(), ProcessError> {
        if self.success() {
            return Ok(());
        }
        match (self.code, self.signal) {
            (Some(code), _) => Err(ProcessError::Exited(code)),
            (None, Some(signal)) => Err(ProcessError::Signaled(signal)),
            (None, None) => Err(ProcessError::Wait("unknown exit status".into())),
        }
    }
}

impl From<ExitStatus> for ExitOutcome {
    fn from(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = std::os::unix::process::ExitStatusExt::signal(&status);
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }
}

/// Result of waiting on a process
pub type ProcessResult = Result<ExitOutcome, ProcessError>;

enum Exit {
    /// Not waited on yet. The future is only polled after EOF.
    Pending(BoxFuture<'static, ProcessResult>),
    Known(ProcessResult),
}

pin_project! {
    /// Readable stream over a process's output that only reports EOF after a
    /// successful exit.
    ///
    /// Reads are delegated to the inner stream. When it reaches EOF the wait
    /// future is driven to completion exactly once and its result is cached.
    /// A failed exit surfaces as an `io::Error` wrapping [`ProcessError`];
    /// every later read returns the same cached outcome.
    pub struct ProcessOutputStream<R> {
        #[pin]
        inner: R,
        eof: bool,
        exit: Exit,
    }
}

impl<R> ProcessOutputStream<R>
where
    R: AsyncRead,
{
    /// Wrap `inner` with the process's `wait` operation.
    ///
    /// `wait` must not be awaited elsewhere; this stream owns reaping the
    /// process.
    pub fn new<W>(inner: R, wait: W) -> Self
    where
        W: Future<Output = ProcessResult> + Send + 'static,
    {
        Self {
            inner,
            eof: false,
            exit: Exit::Pending(wait.boxed()),
        }
    }

    /// Exit result, once the stream has reached EOF and the process was reaped
    pub fn exit_result(&self) -> Option<&ProcessResult> {
        match &self.exit {
            Exit::Pending(_) => None,
            Exit::Known(result) => Some(result),
        }
    }
}

impl<R> AsyncRead for ProcessOutputStream<R>
where
    R: AsyncRead,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.project();

        if !*this.eof {
            let before = buf.filled().len();
            ready!(this.inner.poll_read(cx, buf))?;
            if buf.filled().len() > before || buf.remaining() == 0 {
                return Poll::Ready(Ok(()));
            }
            *this.eof = true;
            tracing::debug!("process output reached EOF, waiting for exit");
        }

        let result = match this.exit {
            Exit::Known(result) => result.clone(),
            Exit::Pending(wait) => {
                let result = ready!(wait.as_mut().poll(cx));
                match &result {
                    Ok(outcome) => tracing::debug!(
                        code = ?outcome.code,
                        signal = ?outcome.signal,
                        "Process exited"
                    ),
                    Err(e) => tracing::debug!(error = %e, "Process wait failed"),
                }
                *this.exit = Exit::Known(result.clone());
                result
            }
        };

        let status = result.and_then(|outcome| outcome.check());
        Poll::Ready(status.map_err(io::Error::other))
    }
}

/// Shell command whose stdout is streamed
#[derive(Debug, Clone)]
pub struct ShellCommand {
    command: String,
    shell: String,
}

impl ShellCommand {
    /// Run `command` with `sh -c`
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            shell: "sh".into(),
        }
    }

    /// Use a different shell binary
    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    /// Start the command.
    ///
    /// Stdout is piped into the returned stream, stderr goes to ours. The
    /// child is killed if the stream is dropped before the process is reaped,
    /// or when `cancel` fires while waiting for it.
    #[tracing::instrument(name = "process.spawn", skip(self, cancel), fields(command = %self.command), err)]
    pub fn spawn(
        &self,
        cancel: CancellationToken,
    ) -> Result<ProcessOutputStream<ChildStdout>, ProcessError> {
        let spawn_error = |message: String| ProcessError::Spawn {
            command: self.command.clone(),
            message,
        };

        let mut child = Command::new(&self.shell)
            .arg("-c")
            .arg(&self.command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| spawn_error(e.to_string()))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| spawn_error("stdout was not captured".into()))?;

        tracing::info!(pid = ?child.id(), "Started command");

        let wait = async move {
            tokio::select! {
                status = child.wait() => status
                    .map(ExitOutcome::from)
                    .map_err(|e| ProcessError::Wait(e.to_string())),
                _ = cancel.cancelled() => {
                    if let Err(e) = child.kill().await {
                        tracing::warn!(error = %e, "Failed to kill cancelled command");
                    }
                    Err(ProcessError::Cancelled)
                }
            }
        };

        Ok(ProcessOutputStream::new(stdout, wait))
    }
}
