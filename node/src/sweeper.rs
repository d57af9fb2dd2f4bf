//! Background recovery for triggers and submissions that stalled.
//!
//! Handlers never retry in place. A trigger whose handler crashed before
//! recording an outcome stays CREATED; one that hit a transient failure is
//! recorded ERROR with a retryable failure. The dispatch sweeper re-fires
//! both. The pending-transaction sweeper gives up on chain submissions that
//! were never confirmed.

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::Instrument;

use saga_store::{SagaStore, StoreError};
use saga_types::{
    Clock, DispatchEvent, EnvelopeStatus, EventPayload, EventType, ScopeId, TxStatus,
};

use crate::config::SweeperConfig;
use crate::dispatcher::{stage_event, EventDispatcher};
use crate::metrics::SagaMetrics;
use crate::scope_gate::ScopeGate;
use crate::tracing_spans::sweep_span;

pub struct DispatchSweeper {
    store: Arc<dyn SagaStore>,
    dispatcher: Arc<EventDispatcher>,
    clock: Arc<dyn Clock>,
    metrics: Arc<SagaMetrics>,
    config: SweeperConfig,
}

impl DispatchSweeper {
    pub fn new(
        store: Arc<dyn SagaStore>,
        dispatcher: Arc<EventDispatcher>,
        clock: Arc<dyn Clock>,
        metrics: Arc<SagaMetrics>,
        config: SweeperConfig,
    ) -> Self {
        Self {
            store,
            dispatcher,
            clock,
            metrics,
            config,
        }
    }

    /// Triggers worth firing again.
    pub fn due(&self) -> Result<Vec<DispatchEvent>, StoreError> {
        let now = self.clock.now();
        let txn = self.store.read()?;
        let mut due = Vec::new();
        for event in txn.iter_events()? {
            let stalled =
                event.is_stuck(now, self.config.stale_after()) || event.is_retryable();
            if !stalled || event.attempts >= self.config.max_attempts {
                continue;
            }
            let Some(record) = txn.get_envelope(&event.envelope_id)? else {
                continue;
            };
            let notifying_error = event.event_type == EventType::EnvelopeError
                && record.status == EnvelopeStatus::Error;
            if record.status.is_terminal() && !notifying_error {
                continue;
            }
            due.push(event);
        }
        Ok(due)
    }

    /// Re-fire every due trigger. Returns how many were fired.
    pub async fn sweep(&self) -> Result<usize, StoreError> {
        let due = self.due()?;
        let count = due.len();
        for event in due {
            tracing::info!(
                kind = %event.event_type,
                envelope = %event.envelope_id,
                attempts = event.attempts,
                "re-firing stalled trigger"
            );
            self.metrics.events_refired.inc();
            if let Err(e) = self.dispatcher.fire(event).await {
                tracing::warn!(error = %e, "re-fire failed");
            }
        }
        Ok(count)
    }
}

pub struct PendingTxSweeper {
    store: Arc<dyn SagaStore>,
    dispatcher: Arc<EventDispatcher>,
    gate: Arc<ScopeGate>,
    clock: Arc<dyn Clock>,
    config: SweeperConfig,
}

impl PendingTxSweeper {
    pub fn new(
        store: Arc<dyn SagaStore>,
        dispatcher: Arc<EventDispatcher>,
        gate: Arc<ScopeGate>,
        clock: Arc<dyn Clock>,
        config: SweeperConfig,
    ) -> Self {
        Self {
            store,
            dispatcher,
            gate,
            clock,
            config,
        }
    }

    /// Fail timed-out submissions and stage a new submission for invoker
    /// copies still waiting at SIGNED.
    fn expire(&self) -> Result<(usize, Vec<DispatchEvent>), StoreError> {
        let now = self.clock.now();
        let timeout = self.config.pending_tx_timeout();
        let mut txn = self.store.write()?;
        let mut expired = 0;
        let mut staged = Vec::new();
        let mut released: BTreeSet<ScopeId> = BTreeSet::new();

        for mut pending in txn.iter_transactions()? {
            if pending.status != TxStatus::Pending || !pending.is_timed_out(now, timeout) {
                continue;
            }
            let reason = format!("no chain confirmation within {}s", timeout.as_secs());
            if !pending.settle(TxStatus::Error, Some(reason), now) {
                continue;
            }
            txn.put_transaction(&pending)?;
            expired += 1;
            tracing::warn!(tx = %pending.tx_hash, "pending transaction timed out");

            for execution in &pending.execution_ids {
                for record in txn.envelopes_by_execution(execution)? {
                    released.insert(record.scope_id);
                    if record.is_invoker && record.status == EnvelopeStatus::Signed {
                        staged.push(stage_event(
                            txn.as_mut(),
                            record.id,
                            EventType::EnvelopeChaincode,
                            EventPayload::Envelope,
                            now,
                        )?);
                    }
                }
            }
        }
        txn.commit()?;

        for scope in &released {
            self.gate.release(scope);
        }
        Ok((expired, staged))
    }

    /// Returns how many submissions were given up on.
    pub async fn sweep(&self) -> Result<usize, StoreError> {
        let (expired, staged) = self.expire()?;
        for event in staged {
            if let Err(e) = self.dispatcher.fire(event).await {
                tracing::warn!(error = %e, "re-submission failed");
            }
        }
        Ok(expired)
    }
}

/// Run both sweepers every `config.interval()` until shutdown.
pub fn spawn_sweepers(
    dispatch: Arc<DispatchSweeper>,
    pending: Arc<PendingTxSweeper>,
    config: &SweeperConfig,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    let period = config.interval();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.tick().await;
        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => {
                    tracing::info!("sweepers shutting down");
                    break;
                }
                _ = interval.tick() => {
                    match pending.sweep().instrument(sweep_span("pending_tx")).await {
                        Ok(0) => {}
                        Ok(n) => tracing::info!(count = n, "pending transactions expired"),
                        Err(e) => tracing::error!(error = %e, "pending transaction sweep failed"),
                    }
                    match dispatch.sweep().instrument(sweep_span("dispatch")).await {
                        Ok(0) => {}
                        Ok(n) => tracing::info!(count = n, "stalled triggers re-fired"),
                        Err(e) => tracing::error!(error = %e, "dispatch sweep failed"),
                    }
                }
            }
        }
    })
}
