//! Store error type

use thiserror::Error;

/// Errors returned by the result and coordination stores
///
/// Any of these during a pipeline write is a persistence failure and aborts
/// the build.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No record exists for the build
    #[error("no record found for build {0}")]
    NotFound(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("coordination request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// Store answered with an unexpected status
    #[error("coordination store error (status {status}): {message}")]
    Coordination { status: u16, message: String },
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}
