//! Turns delivered block batches into scope snapshots and index triggers.
//!
//! Everything a batch changes (snapshots, staged SCOPE_INDEX triggers,
//! settled pending transactions, the checkpoint) commits in one write
//! transaction. A batch that was already checkpointed can be delivered
//! again without effect: snapshots are keyed by (scope, tx hash, kind) and
//! only new ones stage triggers, settled transactions stay settled, and the
//! checkpoint never moves backwards.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::Instrument;

use saga_collab::{CollabError, ScopeLookup, StreamBlock};
use saga_store::{SagaStore, StoreError, WriteTxn};
use saga_stream::{BatchSink, SinkError};
use saga_types::{
    Clock, DispatchEvent, EnvelopeError, EnvelopeErrorKind, EnvelopeStatus, EventPayload,
    EventType, GroupId, Scope, ScopeEventKind, ScopeId, ScopeSnapshot, SnapshotKey,
    StreamCheckpoint, Timestamp, TxHash, TxStatus,
};

use crate::dispatcher::{stage_event, EventDispatcher};
use crate::metrics::SagaMetrics;
use crate::reaper::{fail_envelope, with_timeout, ReaperError};
use crate::scope_gate::ScopeGate;
use crate::state_machine::Step;
use crate::tracing_spans::batch_span;

/// One scope mutation observed in a block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScopeMutation {
    pub scope_id: ScopeId,
    pub group_id: Option<GroupId>,
    pub kind: ScopeEventKind,
    pub tx_hash: TxHash,
    pub height: u64,
}

/// Scope mutations of successful transactions in `batch`, in block order.
pub fn extract_mutations(batch: &[StreamBlock]) -> Vec<ScopeMutation> {
    let mut out = Vec::new();
    for block in batch {
        for tx in block.txs.iter().filter(|tx| tx.succeeded()) {
            for event in &tx.events {
                let Some(kind) = ScopeEventKind::from_chain_event(&event.event_type) else {
                    continue;
                };
                let Some(scope_id) = event.attribute("scope_id").and_then(|s| s.parse().ok())
                else {
                    tracing::warn!(height = block.height, kind = %kind, "scope event without a valid scope_id");
                    continue;
                };
                let group_id = event.attribute("group_id").and_then(|s| s.parse().ok());
                out.push(ScopeMutation {
                    scope_id,
                    group_id,
                    kind,
                    tx_hash: tx.hash,
                    height: block.height,
                });
            }
        }
    }
    out
}

pub struct Checkpointer {
    consumer_id: String,
    store: Arc<dyn SagaStore>,
    dispatcher: Arc<EventDispatcher>,
    lookup: Arc<dyn ScopeLookup>,
    gate: Arc<ScopeGate>,
    clock: Arc<dyn Clock>,
    metrics: Arc<SagaMetrics>,
    lookup_timeout: Duration,
}

/// What one batch committed.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub snapshots: usize,
    pub settled: usize,
    pub checkpoint: Option<u64>,
    pub staged: Vec<DispatchEvent>,
    released: BTreeSet<ScopeId>,
    steps: Vec<Step>,
}

impl Checkpointer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        consumer_id: impl Into<String>,
        store: Arc<dyn SagaStore>,
        dispatcher: Arc<EventDispatcher>,
        lookup: Arc<dyn ScopeLookup>,
        gate: Arc<ScopeGate>,
        clock: Arc<dyn Clock>,
        metrics: Arc<SagaMetrics>,
        lookup_timeout: Duration,
    ) -> Self {
        Self {
            consumer_id: consumer_id.into(),
            store,
            dispatcher,
            lookup,
            gate,
            clock,
            metrics,
            lookup_timeout,
        }
    }

    pub fn consumer_id(&self) -> &str {
        &self.consumer_id
    }

    /// The persisted checkpoint height, if any.
    pub fn checkpoint(&self) -> Result<Option<u64>, StoreError> {
        Ok(self
            .store
            .read()?
            .get_checkpoint(&self.consumer_id)?
            .map(|cp| cp.last_block_height))
    }

    /// Apply `batch` and fire the triggers it staged.
    pub async fn process(&self, batch: Vec<StreamBlock>) -> Result<BatchReport, ReaperError> {
        let Some(last) = batch.last().map(|b| b.height) else {
            return Ok(BatchReport::default());
        };
        let first = batch.first().map_or(last, |b| b.height);
        let span = batch_span(first, last, batch.len());

        async move {
            let mutations = extract_mutations(&batch);
            let scopes = self.fetch_scopes(&mutations).await?;
            let report = self.commit(&batch, &mutations, &scopes)?;

            for scope in &report.released {
                self.gate.release(scope);
            }
            for step in &report.steps {
                if let Step::Advanced(status) = step {
                    self.metrics.record_transition(*status);
                }
            }
            self.metrics.blocks_delivered.inc_by(batch.len() as u64);
            if let Some(height) = report.checkpoint {
                self.metrics
                    .checkpoint_height
                    .set(i64::try_from(height).unwrap_or(i64::MAX));
            }
            tracing::info!(
                snapshots = report.snapshots,
                settled = report.settled,
                triggers = report.staged.len(),
                "batch checkpointed"
            );
            if !report.staged.is_empty() {
                self.dispatcher.spawn_fire(report.staged.clone());
            }
            Ok(report)
        }
        .instrument(span)
        .await
    }

    async fn fetch_scopes(
        &self,
        mutations: &[ScopeMutation],
    ) -> Result<BTreeMap<ScopeId, Scope>, ReaperError> {
        let wanted: BTreeSet<ScopeId> = mutations.iter().map(|m| m.scope_id).collect();
        let mut scopes = BTreeMap::new();
        for scope_id in wanted {
            let found = with_timeout(
                self.lookup_timeout,
                "scope fetch",
                self.lookup.fetch_scope(&scope_id),
            )
            .await?;
            // Refused batches are re-delivered from the checkpoint.
            let Some(scope) = found else {
                tracing::warn!(scope = %scope_id, "mutated scope not yet visible on chain");
                return Err(CollabError::Transient(format!("scope {scope_id} not yet visible")).into());
            };
            scopes.insert(scope_id, scope);
        }
        Ok(scopes)
    }

    fn commit(
        &self,
        batch: &[StreamBlock],
        mutations: &[ScopeMutation],
        scopes: &BTreeMap<ScopeId, Scope>,
    ) -> Result<BatchReport, ReaperError> {
        let now = self.clock.now();
        let mut report = BatchReport::default();
        let mut txn = self.store.write()?;

        for mutation in mutations {
            let Some(scope) = scopes.get(&mutation.scope_id) else {
                continue;
            };
            report.released.insert(mutation.scope_id);
            self.record_snapshot(txn.as_mut(), mutation, scope, now, &mut report)?;
        }

        for tx in batch.iter().flat_map(|b| b.txs.iter()) {
            self.settle(txn.as_mut(), tx.hash, tx.code, &tx.raw_log, now, &mut report)?;
        }

        let height = batch.iter().map(|b| b.height).max().unwrap_or(0);
        let checkpoint = match txn.get_checkpoint(&self.consumer_id)? {
            Some(mut cp) => {
                cp.advance(height, now);
                cp
            }
            None => StreamCheckpoint::new(self.consumer_id.clone(), height, now),
        };
        txn.put_checkpoint(&checkpoint)?;
        txn.commit()?;

        report.checkpoint = Some(checkpoint.last_block_height);
        Ok(report)
    }

    fn record_snapshot<T: WriteTxn + ?Sized>(
        &self,
        txn: &mut T,
        mutation: &ScopeMutation,
        scope: &Scope,
        now: Timestamp,
        report: &mut BatchReport,
    ) -> Result<(), ReaperError> {
        let key = SnapshotKey::new(mutation.scope_id, mutation.tx_hash, mutation.kind);
        if txn.get_snapshot(&key)?.is_some() {
            tracing::debug!(snapshot = %key, "snapshot already recorded");
            return Ok(());
        }
        let snapshot = ScopeSnapshot {
            key,
            block_height: mutation.height,
            group_id: mutation.group_id,
            scope: scope.clone(),
            indexed: false,
            created_at: now,
        };
        txn.put_snapshot(&snapshot)?;
        report.snapshots += 1;

        let group = match (mutation.kind, mutation.group_id) {
            (ScopeEventKind::Ownership, _) | (_, None) => {
                snapshot.relevant_group().ok().map(|g| g.group_id)
            }
            (_, Some(group_id)) => Some(group_id),
        };
        let Some(group) = group else {
            tracing::debug!(snapshot = %key, "no record group to index");
            return Ok(());
        };

        let mut copies = txn.envelopes_by_group(&group)?;
        copies.sort_by_key(|e| e.id);
        for (n, copy) in copies.iter().enumerate() {
            let kind = if n == 0 {
                EventType::ScopeIndex
            } else {
                EventType::ScopeIndexFragment
            };
            report
                .staged
                .push(stage_event(txn, copy.id, kind, EventPayload::Snapshot(key), now)?);
        }
        Ok(())
    }

    /// Settle a pending submission the batch confirms or fails.
    fn settle<T: WriteTxn + ?Sized>(
        &self,
        txn: &mut T,
        hash: TxHash,
        code: u32,
        raw_log: &str,
        now: Timestamp,
        report: &mut BatchReport,
    ) -> Result<(), ReaperError> {
        let Some(mut pending) = txn.get_transaction(&hash)? else {
            return Ok(());
        };
        let status = if code == 0 {
            TxStatus::Success
        } else {
            TxStatus::Error
        };
        let raw_log = (code != 0).then(|| raw_log.to_string());
        if !pending.settle(status, raw_log.clone(), now) {
            return Ok(());
        }
        txn.put_transaction(&pending)?;
        report.settled += 1;

        if status == TxStatus::Error {
            let reason = raw_log.unwrap_or_default();
            tracing::info!(tx = %hash, code, log = %reason, "submitted transaction failed on chain");
            for execution in &pending.execution_ids {
                for mut record in txn.envelopes_by_execution(execution)? {
                    report.released.insert(record.scope_id);
                    if record.status != EnvelopeStatus::Chaincode {
                        continue;
                    }
                    let error = EnvelopeError::new(
                        EnvelopeErrorKind::ContractInvocation,
                        reason.clone(),
                        record.owner_key.clone(),
                        now,
                    );
                    let (step, staged) = fail_envelope(txn, &mut record, error, now)?;
                    report.steps.push(step);
                    report.staged.extend(staged);
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl BatchSink for Checkpointer {
    async fn deliver(&self, batch: Vec<StreamBlock>) -> Result<(), SinkError> {
        self.process(batch).await.map(|_| ()).map_err(|e| Box::new(e) as SinkError)
    }
}
