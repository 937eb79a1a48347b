//! Error types for the Ding core library.

use thiserror::Error;

/// Core error type for Ding's build-execution subsystem.
#[derive(Error, Debug)]
pub enum DingError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("repository not found: {0}")]
    RepositoryNotFound(String),

    #[error("build not found: {0}")]
    BuildNotFound(String),

    #[error("webhook verification failed")]
    WebhookVerificationFailed,

    #[error("invalid webhook payload: {0}")]
    InvalidWebhookPayload(String),

    #[error("invalid repository configuration: {0}")]
    InvalidRepository(String),

    #[error("{0}")]
    UserError(String),

    #[error("build has been released, cannot be removed")]
    BuildReleased,

    #[error("build not finished successfully")]
    BuildNotSuccessful,

    #[error("invalid result line: {0}")]
    InvalidResultLine(String),

    #[error("git clone error: {0}")]
    GitClone(String),

    #[error("mercurial clone error: {0}")]
    HgClone(String),

    #[error("command clone error: {0}")]
    CommandClone(String),

    #[error("child process error: {0}")]
    ChildProcess(String),

    #[error("root process error: {0}")]
    RootProcess(String),

    #[error("ipc framing error: {0}")]
    IpcFraming(String),

    #[error("path escapes configured root: {0}")]
    PathEscape(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("mail submission error: {0}")]
    Mail(String),
}

/// Result type alias for Ding operations.
pub type Result<T> = std::result::Result<T, DingError>;

/// The three-way error taxonomy exposed by the external RPC surface.
///
/// Only the outermost dispatcher converts a [`DingError`] into one of these;
/// internal code always works with `Result<T, DingError>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    UserError,
    ServerError,
    NotFound,
}

impl DingError {
    /// Classifies this error into the user/server/not-found taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            DingError::RepositoryNotFound(_) | DingError::BuildNotFound(_) => ErrorKind::NotFound,
            DingError::InvalidRepository(_)
            | DingError::UserError(_)
            | DingError::BuildReleased
            | DingError::BuildNotSuccessful
            | DingError::InvalidResultLine(_)
            | DingError::InvalidWebhookPayload(_)
            | DingError::WebhookVerificationFailed
            | DingError::GitClone(_)
            | DingError::HgClone(_)
            | DingError::CommandClone(_)
            | DingError::ChildProcess(_) => ErrorKind::UserError,
            _ => ErrorKind::ServerError,
        }
    }

    pub fn user_error(message: impl Into<String>) -> Self {
        DingError::UserError(message.into())
    }
}
