//! Storage-specific error types for SQLite operations.
//!
//! Diesel, r2d2 and migration failures are wrapped in [`StorageError`] and
//! converted to the database-agnostic [`StoreError`] at the `PriceStore`
//! boundary.

use cardprice_ingest::StoreError;
use diesel::result::Error as DieselError;
use thiserror::Error;

/// Result type alias for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Storage-specific errors that wrap Diesel and r2d2 types.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database connection failed: {0}")]
    ConnectionFailed(#[from] diesel::ConnectionError),

    #[error("Connection pool error: {0}")]
    PoolError(#[from] r2d2::Error),

    #[error("Query execution failed: {0}")]
    QueryFailed(#[from] DieselError),

    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A stored row could not be turned back into a domain value.
    #[error("Corrupt row: {0}")]
    Corrupt(String),

    /// The writer actor is gone; no further writes can be made.
    #[error("Writer stopped: {0}")]
    WriterStopped(String),
}

impl From<StorageError> for StoreError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::ConnectionFailed(_)
            | StorageError::PoolError(_)
            | StorageError::WriterStopped(_)
            | StorageError::Io(_) => StoreError::Unavailable(err.to_string()),
            StorageError::QueryFailed(DieselError::DatabaseError(kind, info)) => {
                StoreError::WriteFailed(format!("{:?}: {}", kind, info.message()))
            }
            other => StoreError::WriteFailed(other.to_string()),
        }
    }
}
