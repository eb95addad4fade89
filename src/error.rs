use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Write conflict: {0}")]
    Conflict(String),
    #[error("Unique constraint violated: {0}")]
    UniqueViolation(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Transaction already closed")]
    Closed,
    #[error("Database error: {0}")]
    Database(String),
    #[error("Blocking task failed: {0}")]
    Join(String),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }
}

impl From<sea_orm::DbErr> for StoreError {
    fn from(err: sea_orm::DbErr) -> Self {
        let message = err.to_string();
        let lowered = message.to_lowercase();
        if lowered.contains("unique constraint failed") {
            StoreError::UniqueViolation(message)
        } else if lowered.contains("database is locked")
            || lowered.contains("database table is locked")
            || lowered.contains("sqlite_busy")
        {
            StoreError::Conflict(message)
        } else {
            StoreError::Database(message)
        }
    }
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(err: tokio::task::JoinError) -> Self {
        StoreError::Join(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("Request failed: {0}")]
    Transport(String),
    #[error("Malformed response: {0}")]
    Malformed(String),
    #[error("Timed out after {0}s")]
    Timeout(u64),
    #[error("Run finished with status {0}")]
    RunFailed(String),
    #[error("Option not supported by runner: {0}")]
    UnsupportedOption(&'static str),
    #[error("Agent run failed: {0}")]
    Agent(String),
    #[error("Session error: {0}")]
    Session(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<reqwest::Error> for BackendError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            BackendError::Malformed(err.to_string())
        } else {
            BackendError::Transport(err.to_string())
        }
    }
}
