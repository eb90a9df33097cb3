//! Error types for lifeline.
//!
//! This module defines all error types used throughout the lifeline crate.
//! Most of them never reach a user: the emergency paths log them and fall
//! back to a safe value instead.

use std::path::PathBuf;
use thiserror::Error;

/// Errors reported by a position source.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionError {
    /// The user (or the OS) refused location access.
    #[error("location permission denied")]
    PermissionDenied,

    /// No fix could be obtained (hardware off, no signal).
    #[error("position unavailable")]
    PositionUnavailable,

    /// No fix arrived within the configured timeout.
    #[error("position request timed out")]
    Timeout,
}

/// The main error type for lifeline operations.
#[derive(Error, Debug)]
pub enum Error {
    // === Storage Errors ===
    /// Failed to open or create the database.
    #[error("failed to open database at {path}: {source}")]
    DatabaseOpen {
        /// Path to the database file.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: rusqlite::Error,
    },

    /// A database query failed.
    #[error("database query failed: {0}")]
    DatabaseQuery(#[from] rusqlite::Error),

    /// Failed to run database migrations.
    #[error("database migration failed: {message}")]
    DatabaseMigration {
        /// Description of what went wrong.
        message: String,
    },

    // === Configuration Errors ===
    /// Failed to load configuration.
    #[error("failed to load configuration: {0}")]
    ConfigLoad(Box<figment::Error>),

    /// Configuration validation failed.
    #[error("invalid configuration: {message}")]
    ConfigValidation {
        /// Description of the validation failure.
        message: String,
    },

    // === Collaborator Errors ===
    /// The remote store rejected or failed an operation.
    #[error("remote store error: {0}")]
    Remote(String),

    /// The notification gateway failed to send.
    #[error("notification gateway error: {0}")]
    Gateway(String),

    /// A position source reported an error.
    #[error("position error: {0}")]
    Position(#[from] PositionError),

    /// A record failed validation at the process boundary.
    #[error("invalid {entity} record: {reason}")]
    InvalidRecord {
        /// Kind of record (e.g. "contact").
        entity: &'static str,
        /// Why the record was rejected.
        reason: String,
    },

    /// The user has no usable emergency contacts.
    #[error("no emergency contacts available for user {user_id}")]
    NoContacts {
        /// The user who triggered the alert.
        user_id: String,
    },

    // === I/O Errors ===
    /// File system operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to create a required directory.
    #[error("failed to create directory {path}: {source}")]
    DirectoryCreate {
        /// Path that couldn't be created.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    // === Serialization Errors ===
    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // === Generic Errors ===
    /// An operation timed out.
    #[error("operation timed out: {operation}")]
    Timeout {
        /// Description of the operation that timed out.
        operation: String,
    },

    /// An internal error occurred (bug).
    #[error("internal error: {0}")]
    Internal(String),
}

/// A specialized Result type for lifeline operations.
pub type Result<T> = std::result::Result<T, Error>;

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Self::ConfigLoad(Box::new(err))
    }
}

impl Error {
    /// Create a new remote store error.
    #[must_use]
    pub fn remote(message: impl Into<String>) -> Self {
        Self::Remote(message.into())
    }

    /// Create a new gateway error.
    #[must_use]
    pub fn gateway(message: impl Into<String>) -> Self {
        Self::Gateway(message.into())
    }

    /// Create a new internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Create a timeout error for the named operation.
    #[must_use]
    pub fn timeout(operation: impl Into<String>) -> Self {
        Self::Timeout {
            operation: operation.into(),
        }
    }

    /// Create an invalid record error.
    #[must_use]
    pub fn invalid_record(entity: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidRecord {
            entity,
            reason: reason.into(),
        }
    }

    /// Check if this error is a location permission refusal.
    #[must_use]
    pub fn is_permission_error(&self) -> bool {
        matches!(self, Self::Position(PositionError::PermissionDenied))
    }

    /// Check if this error is the kind a later retry could fix.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Remote(_) | Self::Gateway(_) | Self::Timeout { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::remote("connection reset");
        assert_eq!(err.to_string(), "remote store error: connection reset");

        let err = Error::gateway("503");
        assert_eq!(err.to_string(), "notification gateway error: 503");
    }

    #[test]
    fn test_position_error_conversion() {
        let err: Error = PositionError::PermissionDenied.into();
        assert!(err.is_permission_error());
        assert_eq!(
            err.to_string(),
            "position error: location permission denied"
        );

        let err: Error = PositionError::PositionUnavailable.into();
        assert!(!err.is_permission_error());
    }

    #[test]
    fn test_is_transient() {
        assert!(Error::remote("x").is_transient());
        assert!(Error::gateway("x").is_transient());
        assert!(Error::timeout("contact fetch").is_transient());
        assert!(!Error::internal("x").is_transient());
        assert!(!Error::from(PositionError::Timeout).is_transient());
    }

    #[test]
    fn test_invalid_record_display() {
        let err = Error::invalid_record("contact", "empty phone number");
        assert_eq!(
            err.to_string(),
            "invalid contact record: empty phone number"
        );
    }

    #[test]
    fn test_no_contacts_display() {
        let err = Error::NoContacts {
            user_id: "u1".to_string(),
        };
        assert_eq!(err.to_string(), "no emergency contacts available for user u1");
    }

    #[test]
    fn test_timeout_error_display() {
        let err = Error::timeout("profile write");
        assert!(err.to_string().contains("profile write"));
    }

    #[test]
    fn test_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        assert!(err.to_string().contains("file not found"));
    }

    #[test]
    fn test_from_json_error() {
        let json_result: std::result::Result<i32, serde_json::Error> =
            serde_json::from_str("not valid json");
        if let Err(json_err) = json_result {
            let err: Error = json_err.into();
            assert!(matches!(err, Error::Json(_)));
        }
    }

    #[test]
    fn test_from_rusqlite_error() {
        let result = rusqlite::Connection::open_with_flags(
            "/nonexistent/path/db.sqlite",
            rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY,
        );
        if let Err(sqlite_err) = result {
            let err: Error = sqlite_err.into();
            assert!(matches!(err, Error::DatabaseQuery(_)));
        }
    }

    #[test]
    fn test_database_migration_error_display() {
        let err = Error::DatabaseMigration {
            message: "version mismatch".to_string(),
        };
        assert!(err.to_string().contains("version mismatch"));
    }

    #[test]
    fn test_directory_create_error_display() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "access denied");
        let err = Error::DirectoryCreate {
            path: PathBuf::from("/root/forbidden"),
            source: io_err,
        };
        assert!(err.to_string().contains("/root/forbidden"));
    }
}
