//! Liveness watchdog for the block subscription.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Highest block height the consumer has seen announced.
#[derive(Clone, Default)]
pub(crate) struct HeightMarker(Arc<AtomicU64>);

impl HeightMarker {
    pub fn observe(&self, height: u64) {
        self.0.fetch_max(height, Ordering::SeqCst);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

/// Staleness report: the height that stopped advancing.
#[derive(Debug)]
pub(crate) struct Stale {
    pub height: u64,
}

/// Wake every `interval`; if the marker has not moved since the previous wake,
/// report staleness once and exit. Dropping or aborting the handle stops it.
pub(crate) fn spawn(
    marker: HeightMarker,
    interval: Duration,
) -> (JoinHandle<()>, oneshot::Receiver<Stale>) {
    let (tx, rx) = oneshot::channel();
    let handle = tokio::spawn(async move {
        let mut previous = marker.get();
        loop {
            tokio::time::sleep(interval).await;
            let current = marker.get();
            if current == previous {
                tracing::warn!(height = current, ?interval, "block stream stalled");
                let _ = tx.send(Stale { height: current });
                return;
            }
            previous = current;
        }
    });
    (handle, rx)
}
