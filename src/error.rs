//! Error types for the MPC node
//!
//! One crate-wide error carries the protocol taxonomy. Module level errors
//! (config, keystore, logging) convert into it.

use crate::types::PartnerId;
use serde::Serialize;
use std::collections::BTreeMap;
use thiserror::Error;

/// Partner graph attached to `InsufficientPartners` for operators
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RejectionGraph {
    /// Mutual "heard from" edges that survived the symmetry filter
    pub edges: BTreeMap<PartnerId, Vec<PartnerId>>,
    /// Partners removed while pruning to a complete graph, in removal order
    pub removed: Vec<PartnerId>,
    /// Partners that never answered the round data request
    pub unreachable: Vec<PartnerId>,
}

/// Root error type for the node
#[derive(Debug, Error)]
pub enum NodeError {
    /// Share, partial signature or public key check failed
    #[error("verification failed: {0}")]
    Verification(String),

    /// Qualified partner count dropped below the threshold
    #[error("insufficient partners: {qualified} qualified, threshold {threshold}")]
    InsufficientPartners {
        threshold: usize,
        qualified: usize,
        graph: RejectionGraph,
    },

    /// Round-level, run-level or request-level deadline expired
    #[error("timeout: {0}")]
    Timeout(String),

    /// Nonce or key reused for a different purpose or message
    #[error("replay or misuse: {0}")]
    ReplayOrMisuse(String),

    /// Malformed inbound payload or point not on the curve
    #[error("schema validation failed: {0}")]
    SchemaValidation(String),

    /// This node was dropped from the qualified set of a run
    #[error("not qualified: {0}")]
    NotQualified(String),

    /// A run was rejected before the requested round resolved
    #[error("mpc aborted: {0}")]
    Aborted(String),

    /// Unknown MPC instance, key or batch
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// Transport level failure talking to a partner
    #[error("network error: {0}")]
    Network(String),

    /// Arithmetic precondition violated (duplicate index, zero inverse)
    #[error("crypto error: {0}")]
    Crypto(String),

    /// Invalid caller input
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("keystore error: {0}")]
    Keystore(#[from] crate::keystore::KeystoreError),

    #[error("logging error: {0}")]
    Logging(#[from] crate::logging::LoggingError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl NodeError {
    pub fn verification(msg: impl Into<String>) -> Self {
        Self::Verification(msg.into())
    }

    pub fn schema(msg: impl Into<String>) -> Self {
        Self::SchemaValidation(msg.into())
    }

    pub fn network(msg: impl Into<String>) -> Self {
        Self::Network(msg.into())
    }

    pub fn crypto(msg: impl Into<String>) -> Self {
        Self::Crypto(msg.into())
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Check if retrying the same call may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            NodeError::Network(_) | NodeError::Timeout(_) | NodeError::SessionNotFound(_)
        )
    }

    /// Get error code for API responses
    pub fn error_code(&self) -> &'static str {
        match self {
            NodeError::Verification(_) => "VERIFICATION_FAILURE",
            NodeError::InsufficientPartners { .. } => "INSUFFICIENT_PARTNERS",
            NodeError::Timeout(_) => "TIMEOUT",
            NodeError::ReplayOrMisuse(_) => "REPLAY_OR_MISUSE",
            NodeError::SchemaValidation(_) => "SCHEMA_VALIDATION",
            NodeError::NotQualified(_) => "NOT_QUALIFIED",
            NodeError::Aborted(_) => "ABORTED",
            NodeError::SessionNotFound(_) => "SESSION_NOT_FOUND",
            NodeError::Network(_) => "NETWORK_ERROR",
            NodeError::Crypto(_) => "CRYPTO_ERROR",
            NodeError::InvalidInput(_) => "INVALID_INPUT",
            NodeError::Config(_) => "CONFIG_ERROR",
            NodeError::Keystore(_) => "KEYSTORE_ERROR",
            NodeError::Logging(_) => "LOGGING_ERROR",
            NodeError::Io(_) => "IO_ERROR",
        }
    }
}

impl From<serde_json::Error> for NodeError {
    fn from(err: serde_json::Error) -> Self {
        NodeError::SchemaValidation(err.to_string())
    }
}

/// Result type alias using NodeError
pub type Result<T> = std::result::Result<T, NodeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(
            NodeError::verification("bad share").error_code(),
            "VERIFICATION_FAILURE"
        );
        assert_eq!(
            NodeError::ReplayOrMisuse("nonce".into()).error_code(),
            "REPLAY_OR_MISUSE"
        );
        let err = NodeError::InsufficientPartners {
            threshold: 3,
            qualified: 2,
            graph: RejectionGraph::default(),
        };
        assert_eq!(err.error_code(), "INSUFFICIENT_PARTNERS");
        assert!(err.to_string().contains("2 qualified"));
    }

    #[test]
    fn test_retryable() {
        assert!(NodeError::network("connection refused").is_retryable());
        assert!(!NodeError::schema("missing field").is_retryable());
    }

    #[test]
    fn test_json_error_is_schema_error() {
        let err: NodeError = serde_json::from_str::<u8>("\"x\"").unwrap_err().into();
        assert!(matches!(err, NodeError::SchemaValidation(_)));
    }
}
