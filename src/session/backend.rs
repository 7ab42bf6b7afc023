use crate::config::BackendPolicy;
use crate::error::AppError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{self, Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::pipe::PipeBackend;
use super::pty::PtyBackend;

/// How long a write may keep retrying on a full non-blocking descriptor.
const WRITE_DEADLINE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Pty,
    Pipe,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Pty => f.write_str("pty"),
            BackendKind::Pipe => f.write_str("pipe"),
        }
    }
}

/// The byte stream a session's output reader drains.
pub struct BackendOutput {
    pub reader: Box<dyn Read + Send>,
    /// When false every read may block and must run off the async workers.
    pub nonblocking: bool,
}

/// A running shell process plus the handles to talk to it.
///
/// Methods may block briefly on OS calls; async callers go through
/// `spawn_blocking`.
pub trait Backend: Send + Sync {
    fn kind(&self) -> BackendKind;

    fn pid(&self) -> Option<u32>;

    /// Hands out the output stream. Only the first call returns it.
    fn take_output(&self) -> Option<BackendOutput>;

    fn write(&self, data: &[u8]) -> Result<(), AppError>;

    /// Ctrl-C semantics for the foreground job.
    fn interrupt(&self) -> Result<(), AppError>;

    /// Closes the input side (pty master or stdin). Idempotent.
    fn close_input(&self);

    /// Asks the process to exit. Pending and later writes give up instead of
    /// waiting for the shell to drain its input, so this never waits on a writer.
    fn terminate(&self) -> Result<(), AppError>;

    /// Kills the process outright, for shells that outlive `terminate`.
    fn force_kill(&self) -> Result<(), AppError>;

    /// Exit code if the process has exited, without waiting.
    fn try_wait(&self) -> Result<Option<i32>, AppError>;
}

/// Starts `shell` in `cwd` on the backend `policy` selects.
pub fn spawn_backend(
    policy: BackendPolicy,
    shell: &str,
    cwd: &Path,
) -> Result<Box<dyn Backend>, AppError> {
    match policy {
        BackendPolicy::Pty => Ok(Box::new(PtyBackend::spawn(shell, cwd)?)),
        BackendPolicy::Pipe => Ok(Box::new(PipeBackend::spawn(shell, cwd)?)),
        BackendPolicy::Auto => match PtyBackend::spawn(shell, cwd) {
            Ok(pty) => Ok(Box::new(pty)),
            Err(e) => {
                warn!(error = %e, shell = %shell, "Pseudo-terminal unavailable, falling back to pipe subprocess");
                Ok(Box::new(PipeBackend::spawn(shell, cwd)?))
            }
        },
    }
}

#[cfg(unix)]
pub(crate) fn set_nonblocking(fd: std::os::unix::io::RawFd) -> io::Result<()> {
    // SAFETY: fcntl on a descriptor we own; no memory is passed.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// `write_all` that tolerates a non-blocking descriptor being momentarily full.
///
/// Gives up as soon as `closing` is set, so a shell that stopped reading
/// cannot pin the caller (or the input lock it holds).
pub(crate) fn write_all_retrying<W: Write + ?Sized>(
    writer: &mut W,
    mut data: &[u8],
    closing: &AtomicBool,
) -> io::Result<()> {
    let deadline = Instant::now() + WRITE_DEADLINE;
    while !data.is_empty() {
        if closing.load(Ordering::Acquire) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "terminal is closing"));
        }
        match writer.write(data) {
            Ok(0) => return Err(io::Error::new(io::ErrorKind::WriteZero, "terminal input closed")),
            Ok(n) => data = &data[n..],
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                if Instant::now() >= deadline {
                    return Err(io::Error::new(io::ErrorKind::TimedOut, "terminal input is not draining"));
                }
                std::thread::sleep(Duration::from_millis(5));
            }
            Err(e) => return Err(e),
        }
    }
    loop {
        match writer.flush() {
            Ok(()) => return Ok(()),
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    && Instant::now() < deadline
                    && !closing.load(Ordering::Acquire) =>
            {
                debug!("Flush would block, retrying");
                std::thread::sleep(Duration::from_millis(5));
            }
            Err(e) => return Err(e),
        }
    }
}
