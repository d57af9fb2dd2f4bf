//! Chain submission and the block model the stream consumer reads.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use saga_types::{SubEnvelope, Timestamp, TxHash};

use crate::CollabError;

/// Acknowledgement of a broadcast transaction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxReceipt {
    pub tx_hash: TxHash,
    /// Non-zero when the node refused the transaction at check time.
    pub code: u32,
    pub raw_log: String,
}

impl TxReceipt {
    pub fn is_accepted(&self) -> bool {
        self.code == 0
    }
}

#[async_trait]
pub trait TransactionSubmitter: Send + Sync {
    /// Build, sign and broadcast the contract invocation for `result`.
    async fn submit(&self, result: &SubEnvelope) -> Result<TxReceipt, CollabError>;
}

/// An event emitted by a transaction, as a type plus key/value attributes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainEvent {
    pub event_type: String,
    pub attributes: Vec<(String, String)>,
}

impl ChainEvent {
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            attributes: Vec::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.push((key.into(), value.into()));
        self
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Outcome of one transaction in a block.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxResult {
    pub hash: TxHash,
    /// Zero on success.
    pub code: u32,
    pub raw_log: String,
    pub events: Vec<ChainEvent>,
}

impl TxResult {
    pub fn succeeded(&self) -> bool {
        self.code == 0
    }
}

/// A block with its transaction results.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamBlock {
    pub height: u64,
    pub time: Timestamp,
    pub txs: Vec<TxResult>,
}

/// Announcement of a newly committed block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NewBlock {
    pub height: u64,
}

/// Inclusive height range.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockRange {
    pub min: u64,
    pub max: u64,
}

impl BlockRange {
    pub fn new(min: u64, max: u64) -> Self {
        Self { min, max }
    }

    pub fn len(&self) -> u64 {
        if self.is_empty() {
            0
        } else {
            self.max - self.min + 1
        }
    }

    pub fn is_empty(&self) -> bool {
        self.max < self.min
    }

    /// Split into consecutive ranges of at most `size` heights.
    pub fn chunks(&self, size: u64) -> Vec<BlockRange> {
        let size = size.max(1);
        let mut out = Vec::new();
        let mut start = self.min;
        while start <= self.max {
            let end = start.saturating_add(size - 1).min(self.max);
            out.push(BlockRange::new(start, end));
            if end == u64::MAX {
                break;
            }
            start = end + 1;
        }
        out
    }
}

/// Query and subscription interface of a chain node.
#[async_trait]
pub trait ChainNode: Send + Sync {
    async fn latest_height(&self) -> Result<u64, CollabError>;

    /// Blocks in `range`, ascending. The range must not exceed the node's
    /// per-call query limit.
    async fn block_results(&self, range: BlockRange) -> Result<Vec<StreamBlock>, CollabError>;

    /// Subscribe to new-block announcements. The channel closes when the
    /// subscription drops.
    async fn subscribe_new_blocks(&self) -> Result<mpsc::Receiver<NewBlock>, CollabError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunks_cover_range_without_overlap() {
        let chunks = BlockRange::new(101, 140).chunks(20);
        assert_eq!(chunks, vec![BlockRange::new(101, 120), BlockRange::new(121, 140)]);

        let chunks = BlockRange::new(1, 45).chunks(20);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[2], BlockRange::new(41, 45));
        assert_eq!(chunks.iter().map(|c| c.len()).sum::<u64>(), 45);
    }

    #[test]
    fn empty_range_has_no_chunks() {
        let range = BlockRange::new(10, 9);
        assert!(range.is_empty());
        assert!(range.chunks(5).is_empty());
    }

    #[test]
    fn attribute_lookup() {
        let ev = ChainEvent::new("scope_created").with_attribute("scope_id", "abc");
        assert_eq!(ev.attribute("scope_id"), Some("abc"));
        assert_eq!(ev.attribute("group_id"), None);
    }
}
