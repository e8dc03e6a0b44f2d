//! Error types for logaudit.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("log not found: {0}")]
    NotFound(String),

    /// Malformed batch input, rejected before any transaction begins.
    #[error("invalid input: {0}")]
    Validation(String),

    #[error("unknown task status: {0}")]
    InvalidStatus(String),

    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    #[error("{operation} failed: {source}")]
    Database {
        operation: &'static str,
        #[source]
        source: sqlx::Error,
    },

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether the whole batch may be retried by the caller as-is.
    ///
    /// Every batch operation is idempotent under retry: re-claiming rows that
    /// are already `PROCESSING` yields nothing, re-inserting is a no-op, and
    /// the transition updates are gated on the prior status.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Timeout { .. } | Error::Database { .. } | Error::Storage(_)
        )
    }
}

/// Wrap a sqlx error with the batch operation and stage it occurred in.
pub(crate) fn db_err(operation: &'static str) -> impl FnOnce(sqlx::Error) -> Error {
    move |source| Error::Database { operation, source }
}

pub type Result<T> = std::result::Result<T, Error>;
