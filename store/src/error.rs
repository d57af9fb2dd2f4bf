use saga_types::{EnvelopeId, MirrorMismatch};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("key not found: {0}")]
    NotFound(String),

    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("database is corrupted: {0}")]
    Corruption(String),

    /// A row whose columns disagree with its document was refused.
    #[error(transparent)]
    Divergent(#[from] MirrorMismatch),

    #[error("envelope {0} changed identity fields")]
    Immutable(EnvelopeId),
}
