use anyhow::{Context, Result};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

pub const DEFAULT_MAX_BUFFER_CHARS: usize = 200_000;
pub const DEFAULT_EVENT_WINDOW: usize = 2000;

#[derive(Debug, Clone)]
pub struct Config {
    pub default_shell: Option<String>,
    pub backend_policy: BackendPolicy,
    pub log_level: String,
    pub event_log_enabled: bool,
    pub event_log_file: PathBuf,
    pub event_log_max_size_bytes: u64,
    pub max_buffer_chars: usize,
    pub event_window_capacity: usize,
    pub read_chunk_size: usize,
    pub read_poll_interval: Duration,
    /// Bound for both the exit wait and the reader join during dispose.
    pub dispose_grace: Duration,
}

/// How a new session picks its backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendPolicy {
    /// Try a pty first, fall back to a pipe subprocess if that fails.
    Auto,
    Pty,
    Pipe,
}

impl FromStr for BackendPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(BackendPolicy::Auto),
            "pty" => Ok(BackendPolicy::Pty),
            "pipe" => Ok(BackendPolicy::Pipe),
            _ => Err(anyhow::anyhow!("Invalid backend policy: {}", s)),
        }
    }
}

fn expand_tilde(path_str: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path_str).as_ref())
}

impl Default for Config {
    fn default() -> Self {
        let event_log_dir = PathBuf::from(".terminal-mcp");
        Config {
            default_shell: None,
            backend_policy: BackendPolicy::Auto,
            log_level: "info".to_string(),
            event_log_enabled: true,
            event_log_file: event_log_dir.join("events.log"),
            event_log_max_size_bytes: 10 * 1024 * 1024,
            max_buffer_chars: DEFAULT_MAX_BUFFER_CHARS,
            event_window_capacity: DEFAULT_EVENT_WINDOW,
            read_chunk_size: 4096,
            read_poll_interval: Duration::from_millis(50),
            dispose_grace: Duration::from_millis(1000),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok(); // Load .env file if present
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from an arbitrary key lookup; `load` passes the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Config::default();
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let default_shell = var("DEFAULT_SHELL");

        let log_level = var("LOG_LEVEL").unwrap_or(defaults.log_level);

        let backend_policy = match var("TERMINAL_MCP_BACKEND") {
            Some(s) => BackendPolicy::from_str(&s)?,
            None => defaults.backend_policy,
        };

        let event_log_dir = match var("TERMINAL_MCP_EVENT_DIR") {
            Some(dir) => expand_tilde(&dir),
            None => std::env::current_dir()
                .map(|cwd| cwd.join(".terminal-mcp"))
                .unwrap_or_else(|_| PathBuf::from(".terminal-mcp")),
        };
        let event_log_file = match var("TERMINAL_MCP_EVENT_LOG") {
            Some(file) => expand_tilde(&file),
            None => event_log_dir.join("events.log"),
        };
        let event_log_enabled = var("TERMINAL_MCP_EVENT_LOG_ENABLED")
            .map(|v| v.trim() == "1" || v.trim().eq_ignore_ascii_case("true"))
            .unwrap_or(defaults.event_log_enabled);

        let event_log_max_size_bytes = var("TERMINAL_MCP_EVENT_LOG_MAX_SIZE_MB")
            .unwrap_or_else(|| "10".to_string())
            .trim()
            .parse::<u64>()
            .map(|mb| mb * 1024 * 1024) // Convert MB to Bytes
            .context("Invalid TERMINAL_MCP_EVENT_LOG_MAX_SIZE_MB")?;

        let max_buffer_chars = var("TERMINAL_MCP_MAX_BUFFER_CHARS")
            .unwrap_or_else(|| DEFAULT_MAX_BUFFER_CHARS.to_string())
            .trim()
            .parse::<usize>()
            .context("Invalid TERMINAL_MCP_MAX_BUFFER_CHARS")?;

        let mut event_window_capacity = var("TERMINAL_MCP_EVENT_WINDOW")
            .unwrap_or_else(|| DEFAULT_EVENT_WINDOW.to_string())
            .trim()
            .parse::<usize>()
            .context("Invalid TERMINAL_MCP_EVENT_WINDOW")?;
        if event_window_capacity == 0 {
            warn!("TERMINAL_MCP_EVENT_WINDOW=0 would make events unqueryable, using 1");
            event_window_capacity = 1;
        }

        let read_poll_interval = var("TERMINAL_MCP_READ_POLL_MS")
            .map(|v| v.trim().parse::<u64>().context("Invalid TERMINAL_MCP_READ_POLL_MS"))
            .transpose()?
            .map(Duration::from_millis)
            .unwrap_or(defaults.read_poll_interval);

        let dispose_grace = var("TERMINAL_MCP_DISPOSE_GRACE_MS")
            .map(|v| v.trim().parse::<u64>().context("Invalid TERMINAL_MCP_DISPOSE_GRACE_MS"))
            .transpose()?
            .map(Duration::from_millis)
            .unwrap_or(defaults.dispose_grace);

        Ok(Config {
            default_shell,
            backend_policy,
            log_level,
            event_log_enabled,
            event_log_file,
            event_log_max_size_bytes,
            max_buffer_chars,
            event_window_capacity,
            read_chunk_size: defaults.read_chunk_size,
            read_poll_interval,
            dispose_grace,
        })
    }

    /// The shell program new sessions run.
    ///
    /// `DEFAULT_SHELL` wins; bare program names are resolved through `PATH`.
    pub fn shell_program(&self) -> String {
        if let Some(shell) = &self.default_shell {
            if shell.contains(std::path::MAIN_SEPARATOR) {
                return shell.clone();
            }
            return match which::which(shell) {
                Ok(path) => path.to_string_lossy().into_owned(),
                Err(e) => {
                    warn!(shell = %shell, error = %e, "DEFAULT_SHELL not found in PATH, using it verbatim");
                    shell.clone()
                }
            };
        }
        if cfg!(windows) {
            std::env::var("ComSpec").unwrap_or_else(|_| "cmd.exe".to_string())
        } else {
            std::env::var("SHELL")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "/bin/sh".to_string())
        }
    }
}
