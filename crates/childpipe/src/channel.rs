//! The child channel: spawn a child process wired to a duplex pipe pair,
//! submit non-blocking reads and writes against it, and shut it down.
//!
//! Submission calls never block; they only claim the direction's in-flight
//! slot and spawn a completion task onto the runtime. At most one read and
//! one write are in flight at a time - refusing further submissions instead
//! of queuing pushes flow control to the caller.

use std::io;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use tokio::net::unix::pipe;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::context::OperationContext;
use crate::error::ChannelError;
use crate::pipe::DuplexPipePair;

/// Size of the receive buffer handed to the read callback.
pub const READ_BUFFER_SIZE: usize = 1024;

/// Longest accepted spawn command line, in bytes.
pub const MAX_COMMAND_LINE: usize = 2048;

/// How long a child gets to exit voluntarily before being killed.
const EXIT_GRACE: Duration = Duration::from_secs(1);

/// Sleep between checks while draining in-flight operations.
const DRAIN_POLL: Duration = Duration::from_millis(50);

/// How [`ChildProcess::shutdown`] disposed of the child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// The child exited on its own within the grace period.
    Exited(ExitStatus),
    /// The child outlived the grace period and was forcibly terminated.
    Killed,
}

/// State shared between the channel and its spawned completion tasks.
///
/// Each completion task owns an `Arc` of this state, so a task finishing
/// after the channel is dropped is harmless.
struct Shared {
    reader: pipe::Receiver,
    /// `None` once shutdown has closed the parent write end.
    writer: Mutex<Option<pipe::Sender>>,
    read_buf: Mutex<Box<[u8; READ_BUFFER_SIZE]>>,
    read_ctx: OperationContext,
    write_ctx: OperationContext,
    on_read: Box<dyn Fn(&[u8]) + Send + Sync>,
    cancel: CancellationToken,
    /// First I/O failure observed by a completion task. Submissions against
    /// a faulted channel fail; there is no automatic retry.
    fault: StdMutex<Option<String>>,
}

impl Shared {
    fn fault_message(&self) -> Option<String> {
        self.fault.lock().ok().and_then(|guard| guard.clone())
    }

    fn record_fault(&self, direction: &str, error: &io::Error) {
        tracing::error!(direction, error = %error, "channel I/O failed");
        if let Ok(mut guard) = self.fault.lock() {
            guard.get_or_insert_with(|| format!("{direction} failed: {error}"));
        }
    }

    /// Complete one read: await readiness, pull at most one buffer's worth,
    /// hand it to the callback.
    ///
    /// The callback borrows the receive buffer for the duration of the call
    /// only; the channel does not re-arm the read afterwards.
    async fn run_read(self: Arc<Self>) {
        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                tracing::trace!("read canceled");
                Ok(())
            }
            res = self.read_once() => res,
        };
        if let Err(e) = result {
            self.record_fault("read", &e);
        }
        self.read_ctx.complete();
    }

    async fn read_once(&self) -> io::Result<()> {
        let mut buf = self.read_buf.lock().await;
        loop {
            self.reader.readable().await?;
            match self.reader.try_read(&mut buf[..]) {
                Ok(n) => {
                    tracing::trace!(bytes = n, "read completed");
                    (self.on_read)(&buf[..n]);
                    return Ok(());
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Complete one write: push the whole owned buffer, looping short
    /// writes. Fire-and-forget; nothing is reported back on success.
    async fn run_write(self: Arc<Self>, data: Vec<u8>) {
        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                tracing::trace!("write canceled");
                Ok(())
            }
            res = self.write_all(&data) => res,
        };
        if let Err(e) = result {
            self.record_fault("write", &e);
        }
        self.write_ctx.complete();
    }

    async fn write_all(&self, data: &[u8]) -> io::Result<()> {
        let writer = self.writer.lock().await;
        let Some(writer) = writer.as_ref() else {
            // Shutdown already closed the write end.
            return Ok(());
        };
        let mut written = 0;
        while written < data.len() {
            writer.writable().await?;
            match writer.try_write(&data[written..]) {
                Ok(n) => written += n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e),
            }
        }
        tracing::trace!(bytes = data.len(), "write completed");
        Ok(())
    }
}

/// One child process plus the duplex byte channel to it.
///
/// Standard input of the child is wired to the parent-to-child pipe; its
/// standard output and standard error both feed the child-to-parent pipe.
/// The channel carries raw, unframed bytes - delimiting messages is the
/// caller's business.
///
/// Call [`shutdown`](Self::shutdown) when done: it cancels in-flight I/O,
/// gives the child a grace period to exit, and kills it otherwise. Dropping
/// the channel without shutting it down escalates straight to a kill.
pub struct ChildProcess {
    shared: Arc<Shared>,
    child: Option<Child>,
    // Retained so the FIFO nodes outlive the channel and are removed with it.
    _pipes: DuplexPipePair,
}

impl ChildProcess {
    /// Create the pipe pair, spawn `command_line` wired to it, and register
    /// the parent endpoints with the runtime.
    ///
    /// `command_line` is a single whitespace-separated string, executable
    /// first. `on_read` runs on the runtime whenever an issued read
    /// completes, with exclusive access to the received bytes for the
    /// duration of the call.
    ///
    /// Must be called from within a tokio runtime. On any failure every
    /// handle and FIFO created so far is released before returning.
    pub fn spawn(
        command_line: &str,
        on_read: impl Fn(&[u8]) + Send + Sync + 'static,
    ) -> Result<Self, ChannelError> {
        if command_line.len() > MAX_COMMAND_LINE {
            return Err(ChannelError::CommandLineTooLong {
                length: command_line.len(),
            });
        }
        let spawn_failed = |source: io::Error| ChannelError::ProcessSpawnFailed {
            command: command_line.to_string(),
            source,
        };

        let mut parts = command_line.split_whitespace();
        let program = parts.next().ok_or_else(|| {
            spawn_failed(io::Error::new(
                io::ErrorKind::InvalidInput,
                "empty command line",
            ))
        })?;

        let mut pipes = DuplexPipePair::create()?;

        let stdin_fd = pipes.take_child_read().into_owned_fd()?;
        let stdout_fd = pipes.take_child_write().into_owned_fd()?;
        let stderr_fd = stdout_fd.try_clone().map_err(spawn_failed)?;

        tracing::debug!(command = command_line, "spawning child process");
        let child = Command::new(program)
            .args(parts)
            .stdin(Stdio::from(stdin_fd))
            .stdout(Stdio::from(stdout_fd))
            .stderr(Stdio::from(stderr_fd))
            .spawn()
            .map_err(spawn_failed)?;
        tracing::debug!(pid = child.id(), "child process running");

        let reader = pipe::Receiver::from_owned_fd(pipes.take_parent_read().into_owned_fd()?)
            .map_err(|source| ChannelError::PipeConnectFailed {
                path: pipes.inbound_path().to_path_buf(),
                source,
            })?;
        let writer = pipe::Sender::from_owned_fd(pipes.take_parent_write().into_owned_fd()?)
            .map_err(|source| ChannelError::PipeConnectFailed {
                path: pipes.outbound_path().to_path_buf(),
                source,
            })?;

        Ok(Self {
            shared: Arc::new(Shared {
                reader,
                writer: Mutex::new(Some(writer)),
                read_buf: Mutex::new(Box::new([0u8; READ_BUFFER_SIZE])),
                read_ctx: OperationContext::new(),
                write_ctx: OperationContext::new(),
                on_read: Box::new(on_read),
                cancel: CancellationToken::new(),
                fault: StdMutex::new(None),
            }),
            child: Some(child),
            _pipes: pipes,
        })
    }

    /// OS pid of the child, while it is still attached.
    pub fn id(&self) -> Option<u32> {
        self.child.as_ref().and_then(|c| c.id())
    }

    /// Submit one asynchronous read.
    ///
    /// Idempotent: while a read is in flight further calls are no-ops. The
    /// callback passed to [`spawn`](Self::spawn) receives the bytes when the
    /// read completes; the channel never re-arms itself, so call this again
    /// to receive more data.
    pub fn issue_read(&self) -> Result<(), ChannelError> {
        if let Some(fault) = self.shared.fault_message() {
            return Err(ChannelError::ReadSubmissionFailed(fault));
        }
        if self.shared.cancel.is_cancelled() {
            return Err(ChannelError::ReadSubmissionFailed(
                "channel is shutting down".to_string(),
            ));
        }
        if !self.shared.read_ctx.try_begin() {
            tracing::trace!("read already in flight");
            return Ok(());
        }
        tokio::spawn(Arc::clone(&self.shared).run_read());
        Ok(())
    }

    /// Submit one asynchronous write of `bytes`.
    ///
    /// Returns `Ok(false)` while a write is in flight - backpressure, not an
    /// error; the caller serializes further writes. The bytes are copied
    /// into an owned buffer, so the caller's storage is free to reuse
    /// immediately. Completion is not reported (fire-and-forget).
    pub fn try_issue_write(&self, bytes: &[u8]) -> Result<bool, ChannelError> {
        if let Some(fault) = self.shared.fault_message() {
            return Err(ChannelError::WriteSubmissionFailed(fault));
        }
        if self.shared.cancel.is_cancelled() {
            return Err(ChannelError::WriteSubmissionFailed(
                "channel is shutting down".to_string(),
            ));
        }
        if !self.shared.write_ctx.try_begin() {
            tracing::trace!("write already in flight");
            return Ok(false);
        }
        tokio::spawn(Arc::clone(&self.shared).run_write(bytes.to_vec()));
        Ok(true)
    }

    /// Cancel outstanding I/O, give the child a one-second grace period to
    /// exit, then kill it.
    ///
    /// Two phases: cancel-and-drain (in-flight operations settle under a
    /// bounded poll; a cancel racing a just-completed operation resolves
    /// within one poll interval), then a timed wait on the child. Closing
    /// the parent write end first gives a well-behaved child EOF on stdin.
    /// Failures here are logged, never propagated.
    pub async fn shutdown(mut self) -> ShutdownOutcome {
        tracing::debug!("shutting down child channel");
        self.shared.cancel.cancel();

        let drain_deadline = tokio::time::Instant::now() + EXIT_GRACE;
        while self.shared.read_ctx.is_in_flight() || self.shared.write_ctx.is_in_flight() {
            if tokio::time::Instant::now() >= drain_deadline {
                tracing::warn!("in-flight operation did not settle; abandoning drain");
                break;
            }
            // Wake on the next completion, or re-check after one poll
            // interval in case a completion raced the cancel.
            let _ = tokio::time::timeout(DRAIN_POLL, async {
                tokio::select! {
                    _ = self.shared.read_ctx.settled() => {}
                    _ = self.shared.write_ctx.settled() => {}
                }
            })
            .await;
        }

        self.shared.writer.lock().await.take();

        // The child is only ever taken here; Drop sees None afterwards.
        let Some(mut child) = self.child.take() else {
            return ShutdownOutcome::Killed;
        };

        tracing::debug!("waiting for child process to exit");
        match tokio::time::timeout(EXIT_GRACE, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!(%status, "child process exited");
                ShutdownOutcome::Exited(status)
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "failed waiting for child process");
                kill_and_reap(&mut child).await;
                ShutdownOutcome::Killed
            }
            Err(_) => {
                tracing::warn!("child process outlived grace period; killing");
                kill_and_reap(&mut child).await;
                ShutdownOutcome::Killed
            }
        }
    }
}

async fn kill_and_reap(child: &mut Child) {
    if let Err(e) = child.start_kill() {
        tracing::warn!(error = %e, "failed to kill child process");
    }
    let _ = child.wait().await;
}

impl Drop for ChildProcess {
    fn drop(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        // Dropped without shutdown(). Drop cannot block on the grace
        // period, so escalate straight to a kill.
        self.shared.cancel.cancel();
        tracing::warn!("child channel dropped without shutdown; killing child process");
        if let Err(e) = child.start_kill() {
            tracing::warn!(error = %e, "failed to kill child process");
        }
    }
}
