use crate::events::Event;
use anyhow::Result;
use chrono::Utc;
use std::path::PathBuf;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

enum LogCommand {
    Append(String),
    Flush(oneshot::Sender<()>),
}

impl std::fmt::Debug for LogCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogCommand::Append(line) => f.debug_tuple("Append").field(&line.len()).finish(),
            LogCommand::Flush(_) => f.write_str("Flush"),
        }
    }
}

/// Append-only JSON-lines sink for published events.
///
/// `append` only queues the line; a single writer task owns the file, so
/// publishers never wait on the disk. Failures are logged and swallowed.
#[derive(Debug, Clone)]
pub struct EventLog {
    tx: mpsc::UnboundedSender<LogCommand>,
}

impl EventLog {
    /// Starts the writer task. Must be called from within a tokio runtime.
    pub fn spawn(log_file_path: impl Into<PathBuf>, max_size_bytes: u64) -> Self {
        let log_file_path = log_file_path.into();
        // Ensure log directory exists
        if let Some(parent_dir) = log_file_path.parent() {
            if !parent_dir.as_os_str().is_empty() && !parent_dir.exists() {
                if let Err(e) = std::fs::create_dir_all(parent_dir) {
                    error!(path = %parent_dir.display(), error = %e, "Failed to create event log directory");
                }
            }
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let writer = LogWriter {
            log_file_path,
            max_size_bytes,
            file: None,
            warned: false,
        };
        tokio::spawn(writer.run(rx));
        Self { tx }
    }

    /// Queues one event for writing.
    pub fn append(&self, event: &Event) {
        let line = match serde_json::to_string(event) {
            Ok(mut line) => {
                line.push('\n');
                line
            }
            Err(e) => {
                warn!(seq = event.seq, error = %e, "Failed to serialize event for the event log");
                return;
            }
        };
        if self.tx.send(LogCommand::Append(line)).is_err() {
            debug!(seq = event.seq, "Event log writer is gone, dropping event");
        }
    }

    /// Waits until every event queued so far has been written.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(LogCommand::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }
}

struct LogWriter {
    log_file_path: PathBuf,
    max_size_bytes: u64,
    file: Option<File>,
    warned: bool,
}

impl LogWriter {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<LogCommand>) {
        while let Some(command) = rx.recv().await {
            match command {
                LogCommand::Append(line) => {
                    if let Err(e) = self.try_append(&line).await {
                        // One warning is enough to point at the problem; the rest would flood stderr.
                        if !self.warned {
                            self.warned = true;
                            warn!(path = %self.log_file_path.display(), error = %e, "Failed to write event log");
                        } else {
                            debug!(error = %e, "Failed to write event log");
                        }
                    }
                }
                LogCommand::Flush(done) => {
                    let _ = done.send(());
                }
            }
        }
        debug!("Event log writer stopped");
    }

    async fn try_append(&mut self, line: &str) -> Result<()> {
        if self.rotate_log_if_needed().await? {
            self.file = None;
        }
        let mut file = match self.file.take() {
            Some(file) => file,
            None => {
                if let Some(parent_dir) = self.log_file_path.parent() {
                    if !parent_dir.as_os_str().is_empty() {
                        fs::create_dir_all(parent_dir).await?;
                    }
                }
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&self.log_file_path)
                    .await?
            }
        };
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        // Kept only after a successful write; a failed handle is dropped and reopened next time.
        self.file = Some(file);
        Ok(())
    }

    /// Renames a full log out of the way. Returns true when a rotation happened.
    async fn rotate_log_if_needed(&self) -> Result<bool> {
        if self.max_size_bytes == 0 || !fs::try_exists(&self.log_file_path).await.unwrap_or(false) {
            return Ok(false);
        }

        let metadata = fs::metadata(&self.log_file_path).await?;
        if metadata.len() < self.max_size_bytes {
            return Ok(false);
        }

        let timestamp = Utc::now().format("%Y-%m-%d_%H-%M-%S%.3f").to_string();
        let file_stem = self
            .log_file_path
            .file_stem()
            .unwrap_or_default()
            .to_string_lossy();
        let extension = self
            .log_file_path
            .extension()
            .unwrap_or_default()
            .to_string_lossy();

        let backup_file_name = format!("{}_{}.{}", file_stem, timestamp, extension);
        let backup_path = self.log_file_path.with_file_name(backup_file_name);

        fs::rename(&self.log_file_path, &backup_path).await?;
        debug!(backup = %backup_path.display(), "Rotated event log");
        Ok(true)
    }
}
