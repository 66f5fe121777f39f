use thiserror::Error;

/// Errors produced by the store layer.
#[derive(Error, Debug)]
pub enum StoreError {
    /// SQLite failure, including rows that could not be mapped back
    /// (unknown status strings, out-of-range timestamps, malformed JSON).
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Could not determine application data directory")]
    NoDataDir,

    /// Creating the data directory failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The requested message or participant does not exist.
    #[error("Record not found")]
    NotFound,

    #[error("Migration error: {0}")]
    Migration(String),

    /// An opaque JSON column could not be encoded.
    #[error("Blob encoding error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;
