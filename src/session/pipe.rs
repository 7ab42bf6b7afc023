use super::backend::{write_all_retrying, Backend, BackendKind, BackendOutput};
use crate::error::AppError;
use std::io::{self, Read};
use std::path::Path;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tracing::debug;

/// A shell subprocess with piped stdio, used where no pty is available.
///
/// Stdout and stderr are merged into one output stream.
pub struct PipeBackend {
    pid: u32,
    stdin: Mutex<Option<ChildStdin>>,
    output: Mutex<Option<BackendOutput>>,
    child: Mutex<Child>,
    closing: AtomicBool,
}

impl PipeBackend {
    pub fn spawn(shell: &str, cwd: &Path) -> Result<Self, AppError> {
        let mut command = Command::new(shell);
        command
            .current_dir(cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            // Own process group, so an interrupt reaches the shell's children too.
            command.process_group(0);
        }

        let mut child = command
            .spawn()
            .map_err(|e| AppError::SpawnFailed(format!("failed to spawn {shell}: {e}")))?;
        let pid = child.id();

        let stdin = child.stdin.take();
        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            // A shell that stops reading must not block writers forever.
            if let Some(stdin) = &stdin {
                super::backend::set_nonblocking(stdin.as_raw_fd()).map_err(|e| {
                    AppError::SpawnFailed(format!("failed to configure subprocess stdin: {e}"))
                })?;
            }
        }
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AppError::SpawnFailed("child stdout was not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| AppError::SpawnFailed("child stderr was not captured".to_string()))?;

        let output = merged_output(stdout, stderr)?;
        debug!(pid, shell = %shell, nonblocking = output.nonblocking, "Spawned shell subprocess");

        Ok(Self {
            pid,
            stdin: Mutex::new(stdin),
            output: Mutex::new(Some(output)),
            child: Mutex::new(child),
            closing: AtomicBool::new(false),
        })
    }

    #[cfg(unix)]
    fn signal_group(&self, signal: libc::c_int) -> io::Result<()> {
        // SAFETY: plain syscall; a negative pid addresses the process group.
        let rc = unsafe { libc::kill(-(self.pid as libc::pid_t), signal) };
        if rc == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }
}

#[cfg(unix)]
fn merged_output(
    stdout: std::process::ChildStdout,
    stderr: std::process::ChildStderr,
) -> Result<BackendOutput, AppError> {
    use std::os::unix::io::AsRawFd;
    super::backend::set_nonblocking(stdout.as_raw_fd())
        .and_then(|_| super::backend::set_nonblocking(stderr.as_raw_fd()))
        .map_err(|e| AppError::SpawnFailed(format!("failed to configure subprocess pipes: {e}")))?;
    Ok(BackendOutput {
        reader: Box::new(MergedReader::new(vec![Box::new(stdout), Box::new(stderr)])),
        nonblocking: true,
    })
}

#[cfg(not(unix))]
fn merged_output(
    stdout: std::process::ChildStdout,
    stderr: std::process::ChildStderr,
) -> Result<BackendOutput, AppError> {
    Ok(BackendOutput {
        reader: Box::new(ChannelReader::new(vec![Box::new(stdout), Box::new(stderr)])),
        nonblocking: false,
    })
}

/// Interleaves several non-blocking streams.
///
/// Reports `WouldBlock` only when every open stream would block, and end of
/// stream only once all of them have ended.
pub(crate) struct MergedReader {
    streams: Vec<Option<Box<dyn Read + Send>>>,
    next: usize,
}

impl MergedReader {
    pub(crate) fn new(streams: Vec<Box<dyn Read + Send>>) -> Self {
        Self {
            streams: streams.into_iter().map(Some).collect(),
            next: 0,
        }
    }
}

impl Read for MergedReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let count = self.streams.len();
        for offset in 0..count {
            let index = (self.next + offset) % count;
            let Some(stream) = self.streams[index].as_mut() else {
                continue;
            };
            match stream.read(buf) {
                Ok(0) => self.streams[index] = None,
                Ok(n) => {
                    // Start with the other stream next time so neither starves.
                    self.next = (index + 1) % count;
                    return Ok(n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        if self.streams.iter().all(Option::is_none) {
            Ok(0)
        } else {
            Err(io::ErrorKind::WouldBlock.into())
        }
    }
}

/// Blocking merge: one thread per stream feeding a channel.
#[cfg(not(unix))]
struct ChannelReader {
    rx: std::sync::mpsc::Receiver<Vec<u8>>,
    pending: Vec<u8>,
}

#[cfg(not(unix))]
impl ChannelReader {
    fn new(streams: Vec<Box<dyn Read + Send>>) -> Self {
        let (tx, rx) = std::sync::mpsc::channel();
        for mut stream in streams {
            let tx = tx.clone();
            std::thread::spawn(move || {
                let mut buf = [0u8; 4096];
                loop {
                    match stream.read(&mut buf) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if tx.send(buf[..n].to_vec()).is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
        Self {
            rx,
            pending: Vec::new(),
        }
    }
}

#[cfg(not(unix))]
impl Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pending.is_empty() {
            match self.rx.recv() {
                Ok(chunk) => self.pending = chunk,
                Err(_) => return Ok(0),
            }
        }
        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        Ok(n)
    }
}

impl Backend for PipeBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Pipe
    }

    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn take_output(&self) -> Option<BackendOutput> {
        self.output.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    fn write(&self, data: &[u8]) -> Result<(), AppError> {
        let mut guard = self.stdin.lock().unwrap_or_else(|e| e.into_inner());
        let stdin = guard
            .as_mut()
            .ok_or_else(|| AppError::BackendError("terminal input is closed".to_string()))?;
        write_all_retrying(stdin, data, &self.closing).map_err(|e| AppError::backend("write to terminal", e))
    }

    #[cfg(unix)]
    fn interrupt(&self) -> Result<(), AppError> {
        self.signal_group(libc::SIGINT)
            .map_err(|e| AppError::backend("interrupt terminal", e))
    }

    #[cfg(not(unix))]
    fn interrupt(&self) -> Result<(), AppError> {
        self.write(&[0x03])
    }

    fn close_input(&self) {
        self.closing.store(true, Ordering::Release);
        // Dropping stdin delivers EOF to the shell.
        self.stdin.lock().unwrap_or_else(|e| e.into_inner()).take();
    }

    fn terminate(&self) -> Result<(), AppError> {
        self.closing.store(true, Ordering::Release);
        if self.try_wait()?.is_some() {
            return Ok(());
        }
        #[cfg(unix)]
        {
            match self.signal_group(libc::SIGTERM) {
                Ok(()) => return Ok(()),
                // The group may already be gone while the leader is still unreaped.
                Err(e) => debug!(pid = self.pid, error = %e, "SIGTERM to process group failed, killing shell"),
            }
        }
        self.child
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .kill()
            .map_err(|e| AppError::backend("terminate shell", e))
    }

    fn force_kill(&self) -> Result<(), AppError> {
        self.closing.store(true, Ordering::Release);
        #[cfg(unix)]
        {
            if self.signal_group(libc::SIGKILL).is_ok() {
                return Ok(());
            }
        }
        self.child
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .kill()
            .map_err(|e| AppError::backend("kill shell", e))
    }

    fn try_wait(&self) -> Result<Option<i32>, AppError> {
        let mut child = self.child.lock().unwrap_or_else(|e| e.into_inner());
        match child.try_wait() {
            Ok(Some(status)) => Ok(Some(exit_code(status))),
            Ok(None) => Ok(None),
            Err(e) => Err(AppError::backend("wait for shell", e)),
        }
    }
}

/// Exit code, or 128 + signal number for a signalled process as shells report it.
fn exit_code(status: std::process::ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}
