use std::sync::Arc;

use async_trait::async_trait;
use tracing::Instrument;

use saga_collab::{CollabError, PeerDelivery, ScopeLookup, TransactionSubmitter, TxReceipt};
use saga_types::{
    DispatchEvent, Envelope, EnvelopeError, EnvelopeErrorKind, EnvelopeStatus, EventPayload,
    EventType, PendingTransaction, Scope, ScopeEventKind, ScopeSnapshot, SnapshotKey, TxHash,
};

use super::{fail_envelope, notify_owner, persist_step, with_timeout, ReaperContext, ReaperError};
use crate::config::TimeoutConfig;
use crate::dispatcher::{stage_event, EventHandler, HandlerOutcome};
use crate::scope_gate::ScopeGate;
use crate::state_machine::{on_handle_chaincode, StateMachineError};
use crate::tracing_spans::reaper_span;
use crate::worker_pool::WorkerPool;

/// Submits a fully signed result to the chain.
pub struct ChaincodeReaper {
    work: Arc<ChaincodeWork>,
    pool: WorkerPool,
}

struct ChaincodeWork {
    ctx: ReaperContext,
    lookup: Arc<dyn ScopeLookup>,
    submitter: Arc<dyn TransactionSubmitter>,
    peer: Arc<dyn PeerDelivery>,
    gate: Arc<ScopeGate>,
    timeouts: TimeoutConfig,
}

enum Plan {
    Done(HandlerOutcome),
    Expired {
        record: Envelope,
        error: EnvelopeError,
        outcome: HandlerOutcome,
    },
    Submit(Envelope),
}

impl ChaincodeReaper {
    pub fn new(
        ctx: ReaperContext,
        lookup: Arc<dyn ScopeLookup>,
        submitter: Arc<dyn TransactionSubmitter>,
        peer: Arc<dyn PeerDelivery>,
        gate: Arc<ScopeGate>,
        timeouts: TimeoutConfig,
        workers: usize,
    ) -> Self {
        Self {
            work: Arc::new(ChaincodeWork {
                ctx,
                lookup,
                submitter,
                peer,
                gate,
                timeouts,
            }),
            pool: WorkerPool::new("chaincode", workers),
        }
    }
}

#[async_trait]
impl EventHandler for ChaincodeReaper {
    async fn handle(&self, event: &DispatchEvent) -> Result<HandlerOutcome, ReaperError> {
        let work = Arc::clone(&self.work);
        let event = event.clone();
        let span = reaper_span("chaincode", &event.envelope_id);
        self.pool
            .run(event.envelope_id, async move { work.process(event).await }.instrument(span))
            .await?
    }
}

/// Snapshot key for a group found on chain by lookup rather than by the
/// block stream; the group id stands in for the unknown transaction hash.
fn lookup_snapshot_key(record: &Envelope) -> SnapshotKey {
    let mut bytes = [0u8; 32];
    bytes[..16].copy_from_slice(record.group_id.as_bytes());
    SnapshotKey::new(record.scope_id, TxHash::new(bytes), ScopeEventKind::Updated)
}

impl ChaincodeWork {
    async fn process(&self, event: DispatchEvent) -> Result<HandlerOutcome, ReaperError> {
        let record = match self.prepare(&event)? {
            Plan::Done(outcome) => return Ok(outcome),
            Plan::Expired {
                record,
                error,
                outcome,
            } => {
                notify_owner(&self.peer, self.timeouts.delivery(), &record, &error).await;
                return Ok(outcome);
            }
            Plan::Submit(record) => record,
        };

        let found = with_timeout(
            self.timeouts.lookup(),
            "scope lookup",
            self.lookup
                .find_scope_by_owner_and_id(&record.owner_key, &record.scope_id),
        )
        .await;
        match found {
            Ok(Some(scope)) if scope.record_group(&record.group_id).is_some() => {
                tracing::info!(scope = %record.scope_id, "group already on chain; indexing directly");
                return self.index_directly(&record, scope);
            }
            Ok(_) => {}
            Err(e) if e.is_transient() => {
                tracing::warn!(error = %e, "scope lookup failed; awaiting re-trigger");
                return Ok(HandlerOutcome::retry(e.to_string()));
            }
            Err(e) => return Err(e.into()),
        }

        if !self.gate.try_acquire(record.scope_id, record.execution_id) {
            tracing::info!(scope = %record.scope_id, "scope has a submission in flight");
            return Ok(HandlerOutcome::retry(format!(
                "scope {} has a submission in flight",
                record.scope_id
            )));
        }

        let Some(result) = record.result().cloned() else {
            self.release(&record);
            return Err(StateMachineError::MissingResult(record.id).into());
        };

        let submitted = with_timeout(
            self.timeouts.submission(),
            "transaction submission",
            self.submitter.submit(&result),
        )
        .await;
        match submitted {
            Ok(receipt) if receipt.is_accepted() => self.record_submission(&record, receipt),
            Ok(receipt) => {
                self.release(&record);
                tracing::info!(code = receipt.code, log = %receipt.raw_log, "chain refused submission");
                self.reject(&event, receipt.raw_log)
            }
            Err(CollabError::Rejected(reason)) => {
                self.release(&record);
                tracing::info!(reason = %reason, "chain refused submission");
                self.reject(&event, reason)
            }
            Err(e) if e.is_transient() => {
                self.release(&record);
                tracing::warn!(error = %e, "submission failed; awaiting re-trigger");
                Ok(HandlerOutcome::retry(e.to_string()))
            }
            Err(e) => {
                self.release(&record);
                Err(e.into())
            }
        }
    }

    fn release(&self, record: &Envelope) {
        self.gate.release_held(&record.scope_id, &record.execution_id);
    }

    fn prepare(&self, event: &DispatchEvent) -> Result<Plan, ReaperError> {
        let now = self.ctx.now();
        let mut txn = self.ctx.store.write()?;
        let mut record = txn.require_envelope(&event.envelope_id)?;

        if record.status != EnvelopeStatus::Signed {
            tracing::info!(status = %record.status, "not signed; skipping submission");
            return Ok(Plan::Done(HandlerOutcome::complete()));
        }

        if record.is_expired(now) {
            let deadline = record.input().expiration.unwrap_or(now);
            let error = EnvelopeError::ttl_expired(deadline, record.owner_key.clone(), now);
            let (step, staged) = fail_envelope(txn.as_mut(), &mut record, error.clone(), now)?;
            txn.commit()?;
            self.ctx.note(&[step]);
            tracing::info!(deadline = %deadline, "envelope expired before submission");
            return Ok(Plan::Expired {
                record,
                error,
                outcome: HandlerOutcome::complete_with(staged.into_iter().collect()),
            });
        }

        Ok(Plan::Submit(record))
    }

    fn index_directly(&self, record: &Envelope, scope: Scope) -> Result<HandlerOutcome, ReaperError> {
        let now = self.ctx.now();
        let key = lookup_snapshot_key(record);
        let mut txn = self.ctx.store.write()?;

        let kind = match txn.get_snapshot(&key)? {
            Some(existing) if existing.indexed => EventType::ScopeIndexFragment,
            Some(_) => EventType::ScopeIndex,
            None => {
                txn.put_snapshot(&ScopeSnapshot {
                    key,
                    block_height: 0,
                    group_id: Some(record.group_id),
                    scope,
                    indexed: false,
                    created_at: now,
                })?;
                EventType::ScopeIndex
            }
        };
        let staged = stage_event(txn.as_mut(), record.id, kind, EventPayload::Snapshot(key), now)?;
        txn.commit()?;
        Ok(HandlerOutcome::complete_with(vec![staged]))
    }

    /// Advance every copy of the group still waiting for submission.
    fn record_submission(
        &self,
        record: &Envelope,
        receipt: TxReceipt,
    ) -> Result<HandlerOutcome, ReaperError> {
        let now = self.ctx.now();
        let mut txn = self.ctx.store.write()?;
        let mut steps = Vec::new();
        let mut staged = Vec::new();

        for mut copy in txn.envelopes_by_execution(&record.execution_id)? {
            if copy.group_id != record.group_id
                || !matches!(copy.status, EnvelopeStatus::Signed | EnvelopeStatus::Outbox)
            {
                continue;
            }
            let step = on_handle_chaincode(&mut copy, receipt.tx_hash, now)?;
            staged.extend(persist_step(txn.as_mut(), &copy, step, now)?);
            steps.push(step);
        }

        let pending = match txn.get_transaction(&receipt.tx_hash)? {
            Some(mut pending) => {
                if !pending.execution_ids.contains(&record.execution_id) {
                    pending.execution_ids.push(record.execution_id);
                }
                pending
            }
            None => PendingTransaction::new(receipt.tx_hash, vec![record.execution_id], now),
        };
        txn.put_transaction(&pending)?;
        txn.commit()?;

        self.ctx.note(&steps);
        tracing::info!(tx = %receipt.tx_hash, copies = steps.len(), "result submitted");
        Ok(HandlerOutcome::complete_with(staged))
    }

    fn reject(&self, event: &DispatchEvent, reason: String) -> Result<HandlerOutcome, ReaperError> {
        let now = self.ctx.now();
        let mut txn = self.ctx.store.write()?;
        let mut record = txn.require_envelope(&event.envelope_id)?;
        if record.status != EnvelopeStatus::Signed {
            return Ok(HandlerOutcome::complete());
        }
        let error = EnvelopeError::new(
            EnvelopeErrorKind::ContractInvocation,
            reason,
            record.owner_key.clone(),
            now,
        );
        let (step, staged) = fail_envelope(txn.as_mut(), &mut record, error, now)?;
        txn.commit()?;
        self.ctx.note(&[step]);
        Ok(HandlerOutcome::complete_with(staged.into_iter().collect()))
    }
}
