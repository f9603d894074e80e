//! Error types for Strata

use thiserror::Error;

/// Result type alias for Strata operations
pub type Result<T> = std::result::Result<T, StrataError>;

/// Main error type for Strata
#[derive(Error, Debug)]
pub enum StrataError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("No authenticated identity")]
    Unauthenticated,

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Unknown role: {0}")]
    UnknownRole(String),

    #[error("Item not found: {0}")]
    UnknownItem(i64),

    #[error("Device not found: {0}")]
    UnknownDevice(String),

    #[error("User not found: {0}")]
    UnknownUser(String),

    #[error("Queue entry not found: {0}")]
    UnknownEntry(i64),

    #[error("Conflict detected on item {item_id}: {message}")]
    Conflict { item_id: i64, message: String },

    #[error("Resolution pending on item {0}: awaiting manual decision")]
    ResolutionPending(i64),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Sync error: {0}")]
    Sync(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl StrataError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, StrataError::Sync(_) | StrataError::Io(_))
    }

    /// HTTP status hint for the external request layer
    pub fn http_status(&self) -> u16 {
        match self {
            StrataError::Unauthenticated => 401,
            StrataError::PermissionDenied(_) => 403,
            StrataError::UnknownRole(_) => 400,
            StrataError::UnknownItem(_)
            | StrataError::UnknownDevice(_)
            | StrataError::UnknownUser(_)
            | StrataError::UnknownEntry(_) => 404,
            StrataError::Conflict { .. } | StrataError::ResolutionPending(_) => 409,
            StrataError::InvalidInput(_) => 400,
            _ => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_status_mapping() {
        assert_eq!(StrataError::Unauthenticated.http_status(), 401);
        assert_eq!(
            StrataError::PermissionDenied("sync".to_string()).http_status(),
            403
        );
        assert_eq!(StrataError::UnknownItem(7).http_status(), 404);
        assert_eq!(StrataError::ResolutionPending(7).http_status(), 409);
        assert_eq!(StrataError::Internal("boom".to_string()).http_status(), 500);
    }

    #[test]
    fn test_retryable() {
        assert!(StrataError::Sync("transport".to_string()).is_retryable());
        assert!(!StrataError::Unauthenticated.is_retryable());
    }
}
