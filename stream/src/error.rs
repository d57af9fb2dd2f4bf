use saga_collab::CollabError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("chain node error: {0}")]
    Chain(#[from] CollabError),

    #[error("no new block for {idle_ms}ms (highest observed height {height})")]
    Stale { height: u64, idle_ms: u64 },

    #[error("block subscription closed")]
    SubscriptionClosed,

    #[error("batch sink failed: {0}")]
    Sink(String),

    #[error("fetch task failed: {0}")]
    Task(String),

    #[error("node returned {got} blocks for range {min}..={max}")]
    IncompleteRange { min: u64, max: u64, got: usize },
}
