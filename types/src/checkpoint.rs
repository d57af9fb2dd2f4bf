//! Persisted block-height checkpoint of a stream consumer.

use serde::{Deserialize, Serialize};

use crate::Timestamp;

/// Last block height a consumer has fully processed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamCheckpoint {
    /// Consumer identity.
    pub id: String,
    pub last_block_height: u64,
    pub updated_at: Timestamp,
}

impl StreamCheckpoint {
    pub fn new(id: impl Into<String>, last_block_height: u64, now: Timestamp) -> Self {
        Self {
            id: id.into(),
            last_block_height,
            updated_at: now,
        }
    }

    /// Move the checkpoint to `height` if that is further along.
    /// Returns whether the height changed.
    pub fn advance(&mut self, height: u64, now: Timestamp) -> bool {
        if height > self.last_block_height {
            self.last_block_height = height;
            self.updated_at = now;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkpoint_never_moves_backwards() {
        let mut cp = StreamCheckpoint::new("scope", 100, Timestamp::EPOCH);
        assert!(cp.advance(120, Timestamp::from_secs(1)));
        assert!(!cp.advance(110, Timestamp::from_secs(2)));
        assert!(!cp.advance(120, Timestamp::from_secs(3)));
        assert_eq!(cp.last_block_height, 120);
        assert_eq!(cp.updated_at, Timestamp::from_secs(1));
    }
}
