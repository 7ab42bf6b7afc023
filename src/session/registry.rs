use super::backend::{spawn_backend, Backend, BackendKind};
use super::buffer::BoundedBuffer;
use super::reader::OutputReader;
use crate::config::Config;
use crate::error::{AppError, CreateError};
use crate::events::{Event, EventBus, EventType};
use crate::utils::naming::{generate_name, with_random_suffix};
use crate::utils::path_utils::resolve_working_dir;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex as TokioMutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn, Instrument};

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// One live shell and the state attached to it.
pub struct Session {
    id: String,
    cwd: String,
    backend: Arc<dyn Backend>,
    buffer: Arc<TokioMutex<BoundedBuffer>>,
    stop_tx: watch::Sender<bool>,
    reader: StdMutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("cwd", &self.cwd)
            .field("kind", &self.backend.kind())
            .field("pid", &self.backend.pid())
            .finish()
    }
}

impl Session {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn cwd(&self) -> &str {
        &self.cwd
    }

    pub fn kind(&self) -> BackendKind {
        self.backend.kind()
    }

    pub fn pid(&self) -> Option<u32> {
        self.backend.pid()
    }

    /// Writes raw bytes to the shell's input.
    pub async fn write(&self, data: Vec<u8>) -> Result<(), AppError> {
        let backend = Arc::clone(&self.backend);
        tokio::task::spawn_blocking(move || backend.write(&data))
            .await
            .map_err(|e| AppError::backend("write to terminal", e))?
    }

    pub async fn interrupt(&self) -> Result<(), AppError> {
        let backend = Arc::clone(&self.backend);
        tokio::task::spawn_blocking(move || backend.interrupt())
            .await
            .map_err(|e| AppError::backend("interrupt terminal", e))?
    }

    pub async fn snapshot(&self, tail: Option<i64>) -> String {
        self.buffer.lock().await.snapshot(tail)
    }

    pub async fn clear(&self) {
        self.buffer.lock().await.clear();
    }

    pub async fn buffer_chars(&self) -> usize {
        self.buffer.lock().await.len()
    }
}

/// Result of a successful [`SessionRegistry::create`].
#[derive(Debug, Clone)]
pub struct Created {
    pub terminal_id: String,
    pub cwd: String,
    pub pid: Option<u32>,
    pub kind: BackendKind,
}

/// Point-in-time view of one session for `list`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionInfo {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: BackendKind,
    pub pid: Option<u32>,
    pub buffer_chars: usize,
    pub cwd: String,
}

/// Result of a successful [`SessionRegistry::dispose`].
#[derive(Debug, Clone, PartialEq)]
pub struct Disposed {
    pub terminal_id: String,
    /// `None` when the process did not exit within the grace period.
    pub exit_code: Option<i32>,
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<String, Arc<Session>>,
    /// Ids handed out to creations that have not inserted their session yet.
    reserved: HashSet<String>,
}

/// All live sessions, keyed by terminal id.
pub struct SessionRegistry {
    config: Arc<Config>,
    bus: Arc<EventBus>,
    inner: TokioMutex<Inner>,
}

impl SessionRegistry {
    pub fn new(config: Arc<Config>, bus: Arc<EventBus>) -> Self {
        Self {
            config,
            bus,
            inner: TokioMutex::new(Inner::default()),
        }
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    #[instrument(skip(self), fields(terminal_id = tracing::field::Empty))]
    pub async fn create(&self, name: Option<&str>, cwd: Option<&str>) -> Result<Created, CreateError> {
        let base = name
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(str::to_string)
            .unwrap_or_else(generate_name);
        let terminal_id = self.reserve_id(base).await;
        tracing::Span::current().record("terminal_id", terminal_id.as_str());

        match self.spawn_session(&terminal_id, cwd).await {
            Ok(created) => Ok(created),
            Err(source) => {
                self.inner.lock().await.reserved.remove(&terminal_id);
                warn!(terminal_id = %terminal_id, error = %source, "Failed to create terminal");
                Err(CreateError { terminal_id, source })
            }
        }
    }

    async fn reserve_id(&self, base: String) -> String {
        let mut inner = self.inner.lock().await;
        let taken = |inner: &Inner, id: &str| inner.sessions.contains_key(id) || inner.reserved.contains(id);
        let mut id = base;
        if taken(&*inner, &id) {
            let base = id;
            loop {
                id = with_random_suffix(&base);
                if !taken(&*inner, &id) {
                    break;
                }
            }
            debug!(terminal_id = %id, "Requested id is in use, picked a suffixed one");
        }
        inner.reserved.insert(id.clone());
        id
    }

    async fn spawn_session(&self, terminal_id: &str, cwd: Option<&str>) -> Result<Created, AppError> {
        let cwd_path = resolve_working_dir(cwd);
        let cwd = cwd_path.to_string_lossy().into_owned();
        let shell = self.config.shell_program();
        let policy = self.config.backend_policy;

        let backend: Arc<dyn Backend> =
            tokio::task::spawn_blocking(move || spawn_backend(policy, &shell, &cwd_path))
                .await
                .map_err(|e| AppError::SpawnFailed(e.to_string()))??
                .into();
        let output = backend
            .take_output()
            .ok_or_else(|| AppError::SpawnFailed("backend output already taken".to_string()))?;

        let pid = backend.pid();
        let kind = backend.kind();
        let buffer = Arc::new(TokioMutex::new(BoundedBuffer::new(self.config.max_buffer_chars)));
        let (stop_tx, stop_rx) = watch::channel(false);

        // Published before the reader starts so it precedes every stdout event.
        self.bus.publish(
            Event::new(terminal_id, EventType::Create)
                .with_cwd(cwd.clone())
                .with_pid(pid),
        );

        let reader = OutputReader {
            terminal_id: terminal_id.to_string(),
            cwd: cwd.clone(),
            buffer: Arc::clone(&buffer),
            bus: Arc::clone(&self.bus),
            chunk_size: self.config.read_chunk_size,
            poll_interval: self.config.read_poll_interval,
        }
        .spawn(output, stop_rx);

        // The reader handle is in place before the session becomes visible, so
        // any dispose that finds the session can also join its reader.
        let session = Arc::new(Session {
            id: terminal_id.to_string(),
            cwd: cwd.clone(),
            backend,
            buffer,
            stop_tx,
            reader: StdMutex::new(Some(reader)),
        });
        {
            let mut inner = self.inner.lock().await;
            inner.reserved.remove(terminal_id);
            inner.sessions.insert(terminal_id.to_string(), session);
        }

        info!(terminal_id = %terminal_id, pid = ?pid, kind = %kind, cwd = %cwd, "Terminal created");
        Ok(Created {
            terminal_id: terminal_id.to_string(),
            cwd,
            pid,
            kind,
        })
    }

    pub async fn get(&self, id: &str) -> Result<Arc<Session>, AppError> {
        self.inner
            .lock()
            .await
            .sessions
            .get(id)
            .cloned()
            .ok_or_else(|| AppError::SessionNotFound(id.to_string()))
    }

    pub async fn list(&self) -> Vec<SessionInfo> {
        let sessions: Vec<Arc<Session>> = {
            let inner = self.inner.lock().await;
            inner.sessions.values().cloned().collect()
        };

        let mut infos = Vec::with_capacity(sessions.len());
        for session in sessions {
            infos.push(SessionInfo {
                id: session.id.clone(),
                kind: session.kind(),
                pid: session.pid(),
                buffer_chars: session.buffer_chars().await,
                cwd: session.cwd.clone(),
            });
        }
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    #[instrument(skip(self))]
    pub async fn dispose(&self, terminal_id: &str) -> Result<Disposed, AppError> {
        // Removing first makes a concurrent dispose of the same id see NotFound.
        let session = self
            .inner
            .lock()
            .await
            .sessions
            .remove(terminal_id)
            .ok_or_else(|| AppError::SessionNotFound(terminal_id.to_string()))?;

        // Teardown runs on its own task: a caller that stops waiting cannot
        // leave a removed session with its shell still running.
        let task = tokio::spawn(
            teardown(session, Arc::clone(&self.bus), self.config.dispose_grace)
                .instrument(tracing::Span::current()),
        );
        task.await
            .map_err(|e| AppError::backend("dispose terminal", e))
    }

    /// Disposes every live session. Used at shutdown.
    pub async fn dispose_all(&self) {
        let ids: Vec<String> = self.inner.lock().await.sessions.keys().cloned().collect();
        for id in ids {
            match self.dispose(&id).await {
                Ok(_) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => warn!(terminal_id = %id, error = %e, "Failed to dispose terminal during shutdown"),
            }
        }
    }
}

/// Stops the reader and the shell, each step bounded by `grace`.
async fn teardown(session: Arc<Session>, bus: Arc<EventBus>, grace: Duration) -> Disposed {
    let terminal_id = session.id.clone();
    let _ = session.stop_tx.send(true);

    // Signal before closing input: closing needs the input lock, which an
    // in-flight write may hold until it sees the process going away.
    let backend = Arc::clone(&session.backend);
    let stopping = tokio::task::spawn_blocking(move || {
        let terminated = backend.terminate();
        backend.close_input();
        terminated
    });
    match timeout(grace, stopping).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => warn!(terminal_id = %terminal_id, error = %e, "Failed to terminate shell"),
        Ok(Err(e)) => warn!(terminal_id = %terminal_id, error = %e, "Terminate task failed"),
        Err(_) => warn!(terminal_id = %terminal_id, "Terminating the shell timed out, continuing teardown"),
    }

    let exit_code = wait_for_exit(session.backend.as_ref(), grace).await;
    if exit_code.is_none() {
        warn!(terminal_id = %terminal_id, "Shell did not exit within the grace period, killing it");
        let backend = Arc::clone(&session.backend);
        match timeout(grace, tokio::task::spawn_blocking(move || backend.force_kill())).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => warn!(terminal_id = %terminal_id, error = %e, "Failed to kill shell"),
            Ok(Err(e)) => warn!(terminal_id = %terminal_id, error = %e, "Kill task failed"),
            Err(_) => warn!(terminal_id = %terminal_id, "Killing the shell timed out"),
        }
    }

    let reader = session.reader.lock().unwrap_or_else(|e| e.into_inner()).take();
    if let Some(mut handle) = reader {
        match timeout(grace, &mut handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(terminal_id = %terminal_id, error = %e, "Output reader ended abnormally"),
            Err(_) => {
                warn!(terminal_id = %terminal_id, "Output reader did not stop in time, aborting it");
                handle.abort();
            }
        }
    }

    bus.publish(
        Event::new(terminal_id.clone(), EventType::Dispose)
            .with_cwd(session.cwd.clone())
            .with_exit_code(exit_code),
    );
    info!(terminal_id = %terminal_id, exit_code = ?exit_code, "Terminal disposed");

    Disposed {
        terminal_id,
        exit_code,
    }
}

async fn wait_for_exit(backend: &dyn Backend, grace: Duration) -> Option<i32> {
    let deadline = Instant::now() + grace;
    loop {
        match backend.try_wait() {
            Ok(Some(code)) => return Some(code),
            Ok(None) => {}
            Err(e) => {
                warn!(error = %e, "Could not query shell exit status");
                return None;
            }
        }
        if Instant::now() >= deadline {
            return None;
        }
        tokio::time::sleep(EXIT_POLL_INTERVAL).await;
    }
}
