//! Error types for role resolution and impersonation.

use std::time::Duration;
use thiserror::Error;

/// The main error type for role resolution and impersonation operations.
///
/// Most public flows never surface these: switch and reset report their
/// degraded paths through [`ImpersonationOutcome`](crate::impersonation::ImpersonationOutcome)
/// and resolution always falls back to a lower-privilege role. Errors are
/// reserved for faults in the layers underneath (store, config, identity).
#[derive(Error, Debug)]
pub enum Error {
    /// A read or write against the user record store failed.
    #[error("Storage operation failed: {0}")]
    Storage(String),

    /// A write for a specific principal failed.
    #[error("Write for '{uid}' failed: {reason}")]
    WriteFailed { uid: String, reason: String },

    /// No user record exists for the given uid.
    #[error("User record '{0}' not found")]
    RecordNotFound(String),

    /// The string does not name a known role.
    #[error("Invalid role: '{0}'")]
    InvalidRole(String),

    /// The principal is not allowed to perform the operation.
    #[error("Permission denied: '{uid}' may not {operation}")]
    PermissionDenied { uid: String, operation: String },

    /// Session resolution did not settle within the configured window.
    #[error("Authentication did not resolve within {0:?}")]
    AuthTimeout(Duration),

    /// The identity provider could not refresh the session token.
    #[error("Token refresh failed: {0}")]
    TokenRefresh(String),

    /// The session task has stopped and no longer accepts identity events.
    #[error("Role session is closed")]
    SessionClosed,

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Serialization error.
    #[cfg(feature = "persistence")]
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Filesystem error from the file-backed store.
    #[cfg(feature = "persistence")]
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Short, stable label used as a metrics key.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Storage(_) => "storage",
            Error::WriteFailed { .. } => "write_failed",
            Error::RecordNotFound(_) => "record_not_found",
            Error::InvalidRole(_) => "invalid_role",
            Error::PermissionDenied { .. } => "permission_denied",
            Error::AuthTimeout(_) => "auth_timeout",
            Error::TokenRefresh(_) => "token_refresh",
            Error::SessionClosed => "session_closed",
            Error::InvalidConfiguration(_) => "invalid_configuration",
            #[cfg(feature = "persistence")]
            Error::Serialization(_) => "serialization",
            #[cfg(feature = "persistence")]
            Error::Io(_) => "io",
        }
    }
}

/// Result type alias for role resolution and impersonation operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::WriteFailed {
            uid: "u1".to_string(),
            reason: "offline".to_string(),
        };
        assert_eq!(err.to_string(), "Write for 'u1' failed: offline");
        assert_eq!(err.kind(), "write_failed");

        let err = Error::PermissionDenied {
            uid: "u2".to_string(),
            operation: "switch roles".to_string(),
        };
        assert_eq!(err.to_string(), "Permission denied: 'u2' may not switch roles");
    }
}
