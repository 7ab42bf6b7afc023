use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("I/O error: {0}")]
    StdIoError(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    ConfigError(#[from] anyhow::Error),

    #[error("Serde JSON error: {0}")]
    SerdeJsonError(#[from] serde_json::Error),

    // Display strings below are part of the tool contract, see `mcp::handler::render_error`.
    #[error("terminal not found")]
    SessionNotFound(String),

    #[error("{0} required")]
    InvalidInputArgument(&'static str),

    #[error("failed to spawn shell: {0}")]
    SpawnFailed(String),

    #[error("{0}")]
    BackendError(String),
}

impl AppError {
    /// Wraps an OS-boundary failure with a short description of the attempted action.
    pub fn backend(action: &str, err: impl std::fmt::Display) -> Self {
        AppError::BackendError(format!("{}: {}", action, err))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, AppError::SessionNotFound(_))
    }
}

/// Failure of `SessionRegistry::create`.
///
/// Creation never fails without an identifier: callers that can only report a
/// string still get the id that was resolved for the attempt.
#[derive(Error, Debug)]
#[error("could not create terminal {terminal_id}: {source}")]
pub struct CreateError {
    pub terminal_id: String,
    #[source]
    pub source: AppError,
}
