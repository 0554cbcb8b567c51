//! Error types for the trust-aware authorization core

use thiserror::Error;

use crate::invariants::Severity;

/// Authorization core errors
///
/// Only [`AuthzError::SecurityInvariantViolation`] with critical severity and
/// [`AuthzError::AuditFailure`] abort an otherwise successful decision. Every
/// other failure degrades to a deny decision plus an observability signal.
#[derive(Debug, Error)]
pub enum AuthzError {
    /// Authoritative backend timed out or is temporarily unreachable.
    /// Callers retry with backoff.
    #[error("Transient backend error: {0}")]
    TransientBackend(String),

    /// Terminal denial, carries the decision reason
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Token presented on a retry failed validation; the retry chain must
    /// restart at attempt 0
    #[error("Invalid or expired token: {0}")]
    InvalidOrExpiredToken(String),

    /// One or more security invariants failed
    #[error("Security invariant violated ({severity}): {}", .violations.join("; "))]
    SecurityInvariantViolation {
        severity: Severity,
        violations: Vec<String>,
    },

    /// Both audit sinks failed for an operation that requires an audit trail
    #[error("Audit failure: {0}")]
    AuditFailure(String),

    /// A single audit sink rejected a record
    #[error("Audit sink error: {0}")]
    AuditSink(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Prometheus registration error
    #[error("Metrics error: {0}")]
    Metrics(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl AuthzError {
    /// Whether a caller may retry the failed call with backoff
    pub fn is_transient(&self) -> bool {
        matches!(self, AuthzError::TransientBackend(_))
    }
}

impl From<serde_json::Error> for AuthzError {
    fn from(e: serde_json::Error) -> Self {
        AuthzError::Serialization(e.to_string())
    }
}

impl From<prometheus::Error> for AuthzError {
    fn from(e: prometheus::Error) -> Self {
        AuthzError::Metrics(e.to_string())
    }
}

impl From<toml::de::Error> for AuthzError {
    fn from(e: toml::de::Error) -> Self {
        AuthzError::Config(e.to_string())
    }
}

/// Result type for authorization operations
pub type Result<T> = std::result::Result<T, AuthzError>;
