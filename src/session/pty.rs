use super::backend::{write_all_retrying, Backend, BackendKind, BackendOutput};
use crate::error::AppError;
use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use std::io::{Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tracing::{debug, warn};

const ETX: u8 = 0x03;

/// A shell attached to a pseudo-terminal.
pub struct PtyBackend {
    pid: Option<u32>,
    master: Mutex<Option<Box<dyn MasterPty + Send>>>,
    writer: Mutex<Option<Box<dyn Write + Send>>>,
    output: Mutex<Option<BackendOutput>>,
    child: Mutex<Box<dyn Child + Send + Sync>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    closing: AtomicBool,
}

impl PtyBackend {
    pub fn spawn(shell: &str, cwd: &Path) -> Result<Self, AppError> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: 24,
                cols: 120,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| AppError::SpawnFailed(format!("failed to open pty: {e}")))?;

        let mut cmd = CommandBuilder::new(shell);
        cmd.cwd(cwd);

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| AppError::SpawnFailed(format!("failed to spawn {shell} on pty: {e}")))?;
        // The child holds its own copy of the slave side.
        drop(pair.slave);

        let reader: Box<dyn Read + Send> = pair
            .master
            .try_clone_reader()
            .map_err(|e| AppError::SpawnFailed(format!("failed to clone pty reader: {e}")))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| AppError::SpawnFailed(format!("failed to take pty writer: {e}")))?;

        let nonblocking = make_nonblocking(pair.master.as_ref());
        let pid = child.process_id();
        let killer = child.clone_killer();
        debug!(pid = ?pid, shell = %shell, nonblocking, "Spawned shell on pty");

        Ok(Self {
            pid,
            master: Mutex::new(Some(pair.master)),
            writer: Mutex::new(Some(writer)),
            output: Mutex::new(Some(BackendOutput { reader, nonblocking })),
            child: Mutex::new(child),
            killer: Mutex::new(killer),
            closing: AtomicBool::new(false),
        })
    }
}

impl PtyBackend {
    fn kill_with(&self, action: &str) -> Result<(), AppError> {
        self.killer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .kill()
            .map_err(|e| AppError::backend(action, e))
    }
}

#[cfg(unix)]
fn make_nonblocking(master: &(dyn MasterPty + Send)) -> bool {
    // The reader and writer are dups of the master, so they share its file status flags.
    match master.as_raw_fd() {
        Some(fd) => match super::backend::set_nonblocking(fd) {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Could not make pty master non-blocking");
                false
            }
        },
        None => false,
    }
}

#[cfg(not(unix))]
fn make_nonblocking(_master: &(dyn MasterPty + Send)) -> bool {
    false
}

impl Backend for PtyBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Pty
    }

    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn take_output(&self) -> Option<BackendOutput> {
        self.output.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    fn write(&self, data: &[u8]) -> Result<(), AppError> {
        let mut guard = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        let writer = guard
            .as_mut()
            .ok_or_else(|| AppError::BackendError("terminal input is closed".to_string()))?;
        write_all_retrying(writer.as_mut(), data, &self.closing).map_err(|e| AppError::backend("write to terminal", e))
    }

    fn interrupt(&self) -> Result<(), AppError> {
        // The line discipline turns ETX into SIGINT for the foreground process group.
        self.write(&[ETX])
    }

    fn close_input(&self) {
        self.closing.store(true, Ordering::Release);
        self.writer.lock().unwrap_or_else(|e| e.into_inner()).take();
        self.master.lock().unwrap_or_else(|e| e.into_inner()).take();
    }

    fn terminate(&self) -> Result<(), AppError> {
        self.closing.store(true, Ordering::Release);
        if self.try_wait()?.is_some() {
            return Ok(());
        }
        self.kill_with("terminate shell")
    }

    fn force_kill(&self) -> Result<(), AppError> {
        self.closing.store(true, Ordering::Release);
        self.kill_with("kill shell")
    }

    fn try_wait(&self) -> Result<Option<i32>, AppError> {
        let mut child = self.child.lock().unwrap_or_else(|e| e.into_inner());
        match child.try_wait() {
            Ok(Some(status)) => Ok(Some(status.exit_code() as i32)),
            Ok(None) => Ok(None),
            Err(e) => Err(AppError::backend("wait for shell", e)),
        }
    }
}
