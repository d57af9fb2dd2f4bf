//! Top-level error type for value construction and decoding.

use thiserror::Error;

/// Errors raised while constructing or parsing saga types.
#[derive(Debug, Error)]
pub enum TypesError {
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    #[error("invalid transaction hash: {0}")]
    InvalidTxHash(String),

    #[error("unknown envelope status: {0}")]
    UnknownStatus(String),

    #[error("unknown event type: {0}")]
    UnknownEventType(String),

    #[error("unknown event status: {0}")]
    UnknownEventStatus(String),

    #[error("unknown transaction status: {0}")]
    UnknownTxStatus(String),

    #[error("unknown scope event kind: {0}")]
    UnknownScopeEvent(String),

    #[error("record group {group} not found in scope {scope}")]
    RecordGroupMissing { scope: String, group: String },

    #[error("scope {0} has no record groups")]
    ScopeEmpty(String),

    #[error("invalid snapshot key length: {0}")]
    InvalidSnapshotKey(usize),
}
