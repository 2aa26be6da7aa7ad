//! Error types for fan-out operations

use mongodb::error::{ErrorKind, WriteFailure};

/// Mongo server code for a unique index violation
const DUPLICATE_KEY_CODE: i32 = 11000;

/// Main error type for fan-out operations
#[derive(Debug, thiserror::Error)]
pub enum FanoutError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Unrecognized audience: {0}")]
    UnrecognizedAudience(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl FanoutError {
    /// Whether the publish pipeline may re-invoke the failed operation.
    ///
    /// Only store failures qualify: the write path is idempotent, so a
    /// retry completes whatever records are missing.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Database(_))
    }
}

impl From<mongodb::error::Error> for FanoutError {
    fn from(err: mongodb::error::Error) -> Self {
        Self::Database(err.to_string())
    }
}

impl From<bson::ser::Error> for FanoutError {
    fn from(err: bson::ser::Error) -> Self {
        Self::Internal(format!("BSON serialization failed: {}", err))
    }
}

impl From<bson::de::Error> for FanoutError {
    fn from(err: bson::de::Error) -> Self {
        Self::Internal(format!("BSON deserialization failed: {}", err))
    }
}

/// Check whether a Mongo error is a unique-key collision.
///
/// Two upserts racing on the same `dedupe_key` can both miss the filter;
/// the loser fails with E11000 and the record it wanted already exists.
pub(crate) fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    match err.kind.as_ref() {
        ErrorKind::Write(WriteFailure::WriteError(write_error)) => {
            write_error.code == DUPLICATE_KEY_CODE
        }
        ErrorKind::Command(command_error) => command_error.code == DUPLICATE_KEY_CODE,
        _ => false,
    }
}

/// Result type alias for fan-out operations
pub type Result<T> = std::result::Result<T, FanoutError>;
