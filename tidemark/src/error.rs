use std::path::PathBuf;

/// Error type for the tidemark crate.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Settings or script layout are unusable. Raised before any mutation.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The script directory does not exist or is not a directory.
    #[error("migration directory not found: {}", .0.display())]
    NotFound(PathBuf),

    /// Another invocation holds the migration lock.
    #[error("migration lock is held elsewhere: {0}")]
    LockContention(String),

    /// Waiting for the migration lock was interrupted.
    #[error("interrupted while waiting for the migration lock")]
    LockInterrupted,

    #[error("failed to read migration script {}: {source}", path.display())]
    ScriptRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A script's statements failed. Nothing was recorded for it.
    #[error("migration {version} ({script_name}) failed: {source}")]
    ScriptExecution {
        version: String,
        script_name: String,
        #[source]
        source: Box<Error>,
    },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[cfg(feature = "sqlite")]
    #[error("{0}")]
    Sqlite(#[from] rusqlite::Error),

    #[cfg(feature = "postgres")]
    #[error("{0}")]
    Postgres(#[from] postgres::Error),
}

impl Error {
    /// True for failures that left the database untouched and may succeed on a later attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::LockContention(_) | Self::LockInterrupted)
    }

    /// True for failures raised before any database work started.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration(_) | Self::NotFound(_))
    }
}
