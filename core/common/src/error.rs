//! Common error types for recsync.

use thiserror::Error;

/// Top-level error type for recsync operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The remote API could not be reached (no response received).
    #[error("Network error: {0}")]
    Network(String),

    /// A remote call exceeded its time budget.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// The remote API received the request and refused it.
    #[error("Rejected by server{}: {message}", status_suffix(.status))]
    Rejected {
        /// HTTP status, when the transport has one.
        status: Option<u16>,
        /// Server-provided reason.
        message: String,
    },

    /// Local storage operation failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Resource already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Configuration is missing or malformed.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Whether the error means the request never got an answer.
    ///
    /// Network failures and timeouts are transient: the mutation stays
    /// queued and is retried on the next drain pass.
    pub fn is_network(&self) -> bool {
        matches!(self, Error::Network(_) | Error::Timeout(_))
    }

    /// Whether the server answered and refused the request.
    pub fn is_rejection(&self) -> bool {
        matches!(self, Error::Rejected { .. })
    }

    /// Whether the error is a local persistence failure.
    pub fn is_persistence(&self) -> bool {
        matches!(self, Error::Storage(_) | Error::Io(_) | Error::Serialization(_))
    }

    /// Shorthand for a rejection without a transport status.
    pub fn rejected(message: impl Into<String>) -> Self {
        Error::Rejected {
            status: None,
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" ({})", s)).unwrap_or_default()
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(Error::Network("refused".to_string()).is_network());
        assert!(Error::Timeout("10s".to_string()).is_network());
        assert!(!Error::rejected("bad field").is_network());
        assert!(Error::rejected("bad field").is_rejection());
        assert!(Error::Storage("disk full".to_string()).is_persistence());
        assert!(!Error::NotFound("x".to_string()).is_persistence());
    }

    #[test]
    fn test_rejection_display() {
        let err = Error::Rejected {
            status: Some(422),
            message: "email is required".to_string(),
        };
        assert_eq!(err.to_string(), "Rejected by server (422): email is required");
        assert_eq!(
            Error::rejected("nope").to_string(),
            "Rejected by server: nope"
        );
    }
}
