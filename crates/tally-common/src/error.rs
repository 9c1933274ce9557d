//! Error types for Tally
//!
//! Provides a unified error type and domain-specific error variants

use thiserror::Error;

use crate::types::AggregationKind;

/// Result type alias using TallyError
pub type Result<T> = std::result::Result<T, TallyError>;

/// Unified error type for Tally operations
#[derive(Debug, Error)]
pub enum TallyError {
    // Malformed meter or event, rejected at ingress
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Not found: {0}")]
    NotFound(String),

    // Value extraction errors
    #[error("Extraction error: {0}")]
    Extraction(#[from] ExtractionError),

    #[error("Unknown aggregation kind: {0}")]
    UnknownAggregationKind(String),

    #[error("Aggregation kind '{0}' is not implemented")]
    UnsupportedAggregation(AggregationKind),

    #[error("Reading type mismatch: stored {stored}, meter expects {expected}")]
    KindMismatch {
        stored: AggregationKind,
        expected: AggregationKind,
    },

    // Storage errors
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    // Dead-letter or ingress publish failed
    #[error("Publish error: {0}")]
    Publish(String),

    // Subscription / broker errors
    #[error("Messaging error: {0}")]
    Messaging(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TallyError {
    /// True for every flavour of "nothing stored under this key"
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            TallyError::NotFound(_)
                | TallyError::Store(StoreError::KeyNotFound(_))
                | TallyError::Store(StoreError::Expired(_))
        )
    }

    /// True when a pattern query matched no keys
    pub fn is_no_keys(&self) -> bool {
        matches!(self, TallyError::Store(StoreError::NoKeysFound(_)))
    }
}

/// Key-value persistence errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("key not found: {0}")]
    KeyNotFound(String),

    #[error("key is expired: {0}")]
    Expired(String),

    #[error("no keys found matching {0}")]
    NoKeysFound(String),

    #[error("revision conflict on {key}: expected {expected}")]
    Conflict { key: String, expected: u64 },

    #[error("key already exists: {0}")]
    AlreadyExists(String),

    #[error("backend failure: {0}")]
    Backend(String),

    #[error("envelope serialization failed: {0}")]
    Serialization(String),
}

/// Errors raised while resolving a value path against event data
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExtractionError {
    #[error("invalid path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("path '{0}' not found in event data")]
    PathNotFound(String),

    #[error("type mismatch at '{path}': expected {expected}, got {found}")]
    TypeMismatch {
        path: String,
        expected: &'static str,
        found: String,
    },
}

impl From<serde_json::Error> for TallyError {
    fn from(err: serde_json::Error) -> Self {
        TallyError::Serialization(err.to_string())
    }
}

impl From<anyhow::Error> for TallyError {
    fn from(err: anyhow::Error) -> Self {
        TallyError::Internal(err.to_string())
    }
}
