// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

use thiserror::Error;

/// Error types for staging store operations
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum StoreError {
    /// SQLite-level failure
    #[error("SQLite error: {0}")]
    Sqlite(String),

    /// The database is locked/busy; retriable via the transaction wrapper
    #[error("Store busy: {0}")]
    Busy(String),

    /// A constraint rejected the write
    #[error("Constraint violation: {0}")]
    Constraint(String),

    /// Row or record not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Stored JSON could not be (de)serialized
    #[error("Store serialization error: {0}")]
    Serialization(String),

    /// The store worker thread has shut down
    #[error("Store closed")]
    Closed,
}

/// Result type for staging store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        match &e {
            rusqlite::Error::SqliteFailure(inner, _) => match inner.code {
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked => {
                    Self::Busy(e.to_string())
                }
                rusqlite::ErrorCode::ConstraintViolation => Self::Constraint(e.to_string()),
                _ => Self::Sqlite(e.to_string()),
            },
            rusqlite::Error::QueryReturnedNoRows => Self::NotFound(e.to_string()),
            _ => Self::Sqlite(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_rows_maps_to_not_found() {
        let e: StoreError = rusqlite::Error::QueryReturnedNoRows.into();
        assert!(matches!(e, StoreError::NotFound(_)));
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}
        assert_send::<StoreError>();
        assert_sync::<StoreError>();
    }
}
