//! Error types for the AGM interop core.
//!
//! Configuration problems are fatal and surface synchronously from the
//! facade constructor. Lookup misses, remote failures and stream-state
//! violations are ordinary recoverable values returned to the caller.

use std::time::Duration;
use thiserror::Error;

/// Main error type for AGM operations.
#[derive(Debug, Error)]
pub enum AgmError {
    // Configuration errors (fatal, thrown at construction)
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Protocol version {version} not supported")]
    UnsupportedProtocolVersion { version: u8 },

    // Readiness gating
    #[error("Interop is not ready yet; await ready() before issuing operations")]
    NotReady,

    // Discovery/lookup errors
    #[error("No server found for method: {method}")]
    NoServerFound { method: String },

    #[error("Subscribe to {method} failed: {message}")]
    SubscribeFailed { method: String, message: String },

    // Remote execution errors
    #[error("Invocation of {method} failed: {message}")]
    InvocationFailed { method: String, message: String },

    #[error("Method {method} timed out after {timeout:?}")]
    Timeout { method: String, timeout: Duration },

    // Stream-state errors
    #[error("Stream {name} is closed")]
    StreamClosed { name: String },

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // Generic errors
    #[error("{0}")]
    Other(String),
}

/// Result type alias for AGM operations.
pub type Result<T> = std::result::Result<T, AgmError>;

impl From<serde_json::Error> for AgmError {
    fn from(err: serde_json::Error) -> Self {
        AgmError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl AgmError {
    /// True for errors raised by the remote side of an invocation,
    /// including protocol-level timeouts. The telemetry pipeline treats
    /// both identically.
    pub fn is_remote(&self) -> bool {
        matches!(
            self,
            AgmError::InvocationFailed { .. } | AgmError::Timeout { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = AgmError::NoServerFound {
            method: "missing".into(),
        };
        assert_eq!(err.to_string(), "No server found for method: missing");
    }

    #[test]
    fn test_unsupported_version_display() {
        let err = AgmError::UnsupportedProtocolVersion { version: 7 };
        assert_eq!(err.to_string(), "Protocol version 7 not supported");
    }

    #[test]
    fn test_remote_classification() {
        assert!(AgmError::Timeout {
            method: "m".into(),
            timeout: Duration::from_secs(30)
        }
        .is_remote());
        assert!(!AgmError::NotReady.is_remote());
    }
}
