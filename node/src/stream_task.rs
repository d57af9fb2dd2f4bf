//! Keeps the block stream running from the persisted checkpoint.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use saga_stream::{EventStreamConsumer, StreamState};

use crate::checkpointer::Checkpointer;
use crate::metrics::SagaMetrics;

pub struct StreamScheduler {
    consumer: EventStreamConsumer,
    checkpointer: Arc<Checkpointer>,
    metrics: Arc<SagaMetrics>,
    reconnect_delay: Duration,
}

impl StreamScheduler {
    pub fn new(
        consumer: EventStreamConsumer,
        checkpointer: Arc<Checkpointer>,
        metrics: Arc<SagaMetrics>,
        reconnect_delay: Duration,
    ) -> Self {
        Self {
            consumer,
            checkpointer,
            metrics,
            reconnect_delay,
        }
    }

    pub fn state(&self) -> watch::Receiver<StreamState> {
        self.consumer.state()
    }

    /// Consume until shutdown, restarting from the checkpoint after every
    /// failure once the reconnect delay has passed.
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) {
        loop {
            let outcome = match self.checkpointer.checkpoint() {
                Ok(checkpoint) => self
                    .consumer
                    .run(checkpoint, self.checkpointer.as_ref(), &mut shutdown_rx)
                    .await
                    .map_err(|e| e.to_string()),
                Err(e) => Err(format!("checkpoint unreadable: {e}")),
            };

            match outcome {
                Ok(()) => {
                    tracing::info!("block stream shutting down");
                    break;
                }
                Err(e) => {
                    self.metrics.stream_reconnects.inc();
                    tracing::warn!(error = %e, delay = ?self.reconnect_delay, "block stream stopped; reconnecting");
                }
            }

            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => {
                    tracing::info!("block stream shutting down");
                    break;
                }
                _ = tokio::time::sleep(self.reconnect_delay) => {}
            }
        }
    }

    pub fn spawn(self: Arc<Self>, shutdown_rx: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(shutdown_rx).await })
    }
}
