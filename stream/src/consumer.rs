//! The event stream consumer state machine.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use saga_collab::{BlockRange, ChainNode, StreamBlock};
use tokio::sync::{broadcast, oneshot, watch};

use crate::backfill::fetch_and_deliver;
use crate::watchdog::{self, HeightMarker, Stale};
use crate::StreamError;

/// Error a sink reports for a batch it could not accept.
pub type SinkError = Box<dyn std::error::Error + Send + Sync>;

/// Receiver of ordered block batches.
///
/// A batch is accepted only when `deliver` returns `Ok`. A batch may repeat
/// heights the sink already accepted after a restart from an older checkpoint.
#[async_trait]
pub trait BatchSink: Send + Sync {
    async fn deliver(&self, batch: Vec<StreamBlock>) -> Result<(), SinkError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamState {
    Disconnected,
    Connecting,
    Backfilling,
    Live,
    Error,
}

#[derive(Clone, Debug)]
pub struct ConsumerConfig {
    pub watch_list: Vec<String>,
    /// Heights per fetch call.
    pub chunk_size: u64,
    /// Chunks fetched in parallel per window.
    pub fetch_concurrency: usize,
    /// Node's maximum heights per call; caps `chunk_size`.
    pub query_limit: u64,
    pub liveness_interval: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            watch_list: Vec::new(),
            chunk_size: 20,
            fetch_concurrency: 2,
            query_limit: 20,
            liveness_interval: Duration::from_secs(60),
        }
    }
}

pub struct EventStreamConsumer {
    chain: Arc<dyn ChainNode>,
    config: ConsumerConfig,
    state: watch::Sender<StreamState>,
}

impl EventStreamConsumer {
    pub fn new(chain: Arc<dyn ChainNode>, config: ConsumerConfig) -> Self {
        let (state, _) = watch::channel(StreamState::Disconnected);
        Self {
            chain,
            config,
            state,
        }
    }

    pub fn state(&self) -> watch::Receiver<StreamState> {
        self.state.subscribe()
    }

    fn set_state(&self, next: StreamState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            tracing::debug!(from = ?prev, to = ?next, "stream state");
        }
    }

    /// Consume until shutdown (returns `Ok`) or failure (returns the error).
    ///
    /// `checkpoint` is the last height the sink has durably accepted. With a
    /// checkpoint below the chain head the gap is backfilled first; without
    /// one, consumption starts at the current head.
    pub async fn run(
        &self,
        checkpoint: Option<u64>,
        sink: &dyn BatchSink,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<(), StreamError> {
        let result = self.consume(checkpoint, sink, shutdown).await;
        match &result {
            Ok(()) => self.set_state(StreamState::Disconnected),
            Err(e) => {
                tracing::warn!(error = %e, "block stream failed");
                self.set_state(StreamState::Error);
                self.set_state(StreamState::Disconnected);
            }
        }
        result
    }

    async fn consume(
        &self,
        checkpoint: Option<u64>,
        sink: &dyn BatchSink,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<(), StreamError> {
        self.set_state(StreamState::Connecting);
        let mut blocks = self.chain.subscribe_new_blocks().await?;
        let head = self.chain.latest_height().await?;

        let mut last = match checkpoint {
            Some(cp) if cp < head => {
                self.set_state(StreamState::Backfilling);
                tracing::info!(from = cp + 1, to = head, "backfilling blocks");
                fetch_and_deliver(&self.chain, &self.config, BlockRange::new(cp + 1, head), sink)
                    .await?
                    .unwrap_or(cp)
            }
            Some(cp) => cp,
            None => head,
        };

        self.set_state(StreamState::Live);
        tracing::info!(height = last, "block stream live");

        // Started after backfill so a long catch-up does not read as a stall.
        let marker = HeightMarker::default();
        marker.observe(head.max(last));
        let (liveness, mut stale) = watchdog::spawn(marker.clone(), self.config.liveness_interval);
        let _liveness = AbortOnDrop(liveness);

        // Highest announced height not yet delivered.
        let mut target = last;
        loop {
            if target > last {
                let range = BlockRange::new(last + 1, target);
                if range.min < range.max {
                    tracing::debug!(from = range.min, to = range.max, "filling block gap");
                }
                // Announcements keep feeding the marker while the range is fetched.
                let fill = fetch_and_deliver(&self.chain, &self.config, range, sink);
                tokio::pin!(fill);
                loop {
                    tokio::select! {
                        biased;
                        _ = shutdown.recv() => {
                            tracing::info!("block stream shutting down");
                            return Ok(());
                        }
                        report = &mut stale => return Err(self.stale_error(report, &marker)),
                        delivered = &mut fill => {
                            last = delivered?.unwrap_or(range.max);
                            break;
                        }
                        announced = blocks.recv() => {
                            let Some(block) = announced else {
                                return Err(StreamError::SubscriptionClosed);
                            };
                            marker.observe(block.height);
                            target = target.max(block.height);
                        }
                    }
                }
                continue;
            }

            tokio::select! {
                biased;
                _ = shutdown.recv() => {
                    tracing::info!("block stream shutting down");
                    return Ok(());
                }
                report = &mut stale => return Err(self.stale_error(report, &marker)),
                announced = blocks.recv() => {
                    let Some(block) = announced else {
                        return Err(StreamError::SubscriptionClosed);
                    };
                    marker.observe(block.height);
                    if block.height <= last {
                        tracing::trace!(height = block.height, last, "dropping already delivered block");
                        continue;
                    }
                    target = block.height;
                }
            }
        }
    }

    fn stale_error(
        &self,
        report: Result<Stale, oneshot::error::RecvError>,
        marker: &HeightMarker,
    ) -> StreamError {
        let height = report.map(|s| s.height).unwrap_or_else(|_| marker.get());
        StreamError::Stale {
            height,
            idle_ms: u64::try_from(self.config.liveness_interval.as_millis()).unwrap_or(u64::MAX),
        }
    }
}

/// Tears the watchdog down with the subscription on every exit path.
struct AbortOnDrop(tokio::task::JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}
