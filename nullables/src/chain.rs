//! Nullable chain node and transaction submitter.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use saga_collab::{
    BlockRange, ChainNode, CollabError, NewBlock, StreamBlock, TransactionSubmitter, TxReceipt,
};
use saga_types::{ExecutionId, SubEnvelope, Timestamp, TxHash};

/// A submitter that records every submission. Scripted outcomes are consumed
/// one per call; without a script every submission is accepted under a fresh
/// hash.
#[derive(Default)]
pub struct NullSubmitter {
    submitted: Mutex<Vec<ExecutionId>>,
    script: Mutex<VecDeque<Result<TxReceipt, CollabError>>>,
    delay: Mutex<Option<Duration>>,
    counter: AtomicU64,
}

impl NullSubmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_outcome(&self, outcome: Result<TxReceipt, CollabError>) {
        self.script.lock().unwrap().push_back(outcome);
    }

    /// Sleep this long inside every submission.
    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock().unwrap() = delay;
    }

    /// Execution ids of every submitted result, in call order.
    pub fn submissions(&self) -> Vec<ExecutionId> {
        self.submitted.lock().unwrap().clone()
    }

    /// The hash the n-th unscripted submission (1-based) is assigned.
    pub fn hash_for(n: u64) -> TxHash {
        let mut bytes = [0u8; 32];
        bytes[24..].copy_from_slice(&n.to_be_bytes());
        TxHash::new(bytes)
    }
}

#[async_trait]
impl TransactionSubmitter for NullSubmitter {
    async fn submit(&self, result: &SubEnvelope) -> Result<TxReceipt, CollabError> {
        self.submitted.lock().unwrap().push(result.execution_id);
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let scripted = self.script.lock().unwrap().pop_front();
        match scripted {
            Some(outcome) => outcome,
            None => {
                let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
                Ok(TxReceipt {
                    tx_hash: Self::hash_for(n),
                    code: 0,
                    raw_log: String::new(),
                })
            }
        }
    }
}

#[derive(Default)]
struct ChainState {
    blocks: BTreeMap<u64, StreamBlock>,
    latest: u64,
    subscribers: Vec<mpsc::Sender<NewBlock>>,
    fetches: Vec<BlockRange>,
    delays: HashMap<u64, Duration>,
    subscribe_failures: VecDeque<CollabError>,
}

/// An in-memory chain. Blocks missing from the map read as empty blocks.
pub struct NullChainNode {
    state: Mutex<ChainState>,
    query_limit: u64,
}

impl NullChainNode {
    pub fn new(query_limit: u64) -> Self {
        Self {
            state: Mutex::new(ChainState::default()),
            query_limit,
        }
    }

    /// Store `block` and raise the latest height to it if higher.
    pub fn put_block(&self, block: StreamBlock) {
        let mut state = self.state.lock().unwrap();
        state.latest = state.latest.max(block.height);
        state.blocks.insert(block.height, block);
    }

    pub fn set_latest_height(&self, height: u64) {
        self.state.lock().unwrap().latest = height;
    }

    /// Announce `height` to every live subscriber.
    pub fn announce(&self, height: u64) {
        let subscribers = {
            let mut state = self.state.lock().unwrap();
            state.latest = state.latest.max(height);
            state.subscribers.retain(|tx| !tx.is_closed());
            state.subscribers.clone()
        };
        for tx in subscribers {
            let _ = tx.try_send(NewBlock { height });
        }
    }

    /// Drop every subscription, closing their channels.
    pub fn disconnect(&self) {
        self.state.lock().unwrap().subscribers.clear();
    }

    pub fn subscriber_count(&self) -> usize {
        let mut state = self.state.lock().unwrap();
        state.subscribers.retain(|tx| !tx.is_closed());
        state.subscribers.len()
    }

    /// Delay the fetch whose range starts at `min`.
    pub fn set_fetch_delay(&self, min: u64, delay: Duration) {
        self.state.lock().unwrap().delays.insert(min, delay);
    }

    pub fn fail_next_subscribe(&self, error: CollabError) {
        self.state
            .lock()
            .unwrap()
            .subscribe_failures
            .push_back(error);
    }

    /// Every range requested through `block_results`, in call order.
    pub fn fetches(&self) -> Vec<BlockRange> {
        self.state.lock().unwrap().fetches.clone()
    }
}

#[async_trait]
impl ChainNode for NullChainNode {
    async fn latest_height(&self) -> Result<u64, CollabError> {
        Ok(self.state.lock().unwrap().latest)
    }

    async fn block_results(&self, range: BlockRange) -> Result<Vec<StreamBlock>, CollabError> {
        if range.len() > self.query_limit {
            return Err(CollabError::Rejected(format!(
                "range {}..={} exceeds query limit {}",
                range.min, range.max, self.query_limit
            )));
        }
        let delay = {
            let mut state = self.state.lock().unwrap();
            state.fetches.push(range);
            state.delays.get(&range.min).copied()
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let state = self.state.lock().unwrap();
        Ok((range.min..=range.max)
            .map(|height| {
                state.blocks.get(&height).cloned().unwrap_or(StreamBlock {
                    height,
                    time: Timestamp::from_secs(height),
                    txs: Vec::new(),
                })
            })
            .collect())
    }

    async fn subscribe_new_blocks(&self) -> Result<mpsc::Receiver<NewBlock>, CollabError> {
        let mut state = self.state.lock().unwrap();
        if let Some(error) = state.subscribe_failures.pop_front() {
            return Err(error);
        }
        let (tx, rx) = mpsc::channel(64);
        state.subscribers.push(tx);
        Ok(rx)
    }
}
