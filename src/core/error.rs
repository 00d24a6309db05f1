use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    /// Unique key or CHECK violation. A data bug, never retried.
    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Database error: {0}")]
    Sqlite(rusqlite::Error),

    /// A stored value that does not map onto the model.
    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Serialisation error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cache schema version {found} is newer than supported version {supported}")]
    SchemaTooNew { found: u32, supported: u32 },

    #[error("Cache unavailable")]
    Unavailable,
}

impl From<rusqlite::Error> for CacheError {
    fn from(e: rusqlite::Error) -> Self {
        match e {
            rusqlite::Error::SqliteFailure(ref err, ref msg)
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                CacheError::Constraint(msg.clone().unwrap_or_else(|| err.to_string()))
            }
            other => CacheError::Sqlite(other),
        }
    }
}

impl CacheError {
    pub fn is_constraint(&self) -> bool {
        matches!(self, CacheError::Constraint(_))
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    /// Network or backend unavailable. Retried through the outbox.
    #[error("Remote unavailable: {0}")]
    Unavailable(String),

    /// Authentication or authorization failure. Terminal for the operation.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Remote document not found: {0}")]
    NotFound(String),

    #[error("Remote rejected the request: {0}")]
    Rejected(String),
}

impl RemoteError {
    pub fn is_transient(&self) -> bool {
        matches!(self, RemoteError::Unavailable(_))
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("Offline")]
    Offline,

    #[error("No cached message with local id {0}")]
    UnknownMessage(String),
}
