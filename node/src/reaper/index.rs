use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::Instrument;

use saga_collab::{FieldExtractor, SearchIndex};
use saga_store::WriteTxn;
use saga_types::{
    DispatchEvent, Envelope, EnvelopeError, EnvelopeErrorKind, EnvelopeId, EnvelopeStatus,
    EventType, PartyKey, ScopeSnapshot, SnapshotKey, Timestamp,
};

use super::{fail_envelope, persist_step, with_timeout, ReaperContext, ReaperError};
use crate::config::SearchConfig;
use crate::dispatcher::{EventHandler, HandlerOutcome};
use crate::state_machine::on_handle_index;
use crate::tracing_spans::reaper_span;
use crate::worker_pool::WorkerPool;

/// Indexes chain-confirmed scopes and advances the envelopes behind them.
pub struct IndexReaper {
    work: Arc<IndexWork>,
    pool: WorkerPool,
}

struct IndexWork {
    ctx: ReaperContext,
    extractor: Arc<dyn FieldExtractor>,
    search: Arc<dyn SearchIndex>,
    routing: SearchConfig,
    search_timeout: Duration,
}

enum Plan {
    Done(HandlerOutcome),
    Index {
        snapshot: ScopeSnapshot,
        /// Copies of the group's execution to advance.
        envelopes: Vec<EnvelopeId>,
        /// Owners whose search document is written.
        owners: Vec<PartyKey>,
    },
}

/// Statuses a chain confirmation may move to INDEX.
fn indexable(status: EnvelopeStatus) -> bool {
    matches!(
        status,
        EnvelopeStatus::Executed
            | EnvelopeStatus::Outbox
            | EnvelopeStatus::Signed
            | EnvelopeStatus::Chaincode
    )
}

/// Statuses whose owner still gets a search document. A copy another
/// trigger already moved to INDEX keeps its owner's document.
fn has_document(status: EnvelopeStatus) -> bool {
    indexable(status) || matches!(status, EnvelopeStatus::Index | EnvelopeStatus::Complete)
}

/// Whether another copy for the same owner and scope confirmed later than
/// `envelope` would.
fn is_stale(envelope: &Envelope, same_scope: &[Envelope], now: Timestamp) -> bool {
    let confirmed = envelope.chain_confirmed_at().unwrap_or(now);
    same_scope.iter().any(|other| {
        other.id != envelope.id
            && other.owner_key == envelope.owner_key
            && other.chain_confirmed_at().is_some_and(|at| at > confirmed)
    })
}

impl IndexReaper {
    pub fn new(
        ctx: ReaperContext,
        extractor: Arc<dyn FieldExtractor>,
        search: Arc<dyn SearchIndex>,
        routing: SearchConfig,
        search_timeout: Duration,
        workers: usize,
    ) -> Self {
        Self {
            work: Arc::new(IndexWork {
                ctx,
                extractor,
                search,
                routing,
                search_timeout,
            }),
            pool: WorkerPool::new("index", workers),
        }
    }
}

#[async_trait]
impl EventHandler for IndexReaper {
    async fn handle(&self, event: &DispatchEvent) -> Result<HandlerOutcome, ReaperError> {
        let work = Arc::clone(&self.work);
        let event = event.clone();
        let span = reaper_span("index", &event.envelope_id);
        self.pool
            .run(event.envelope_id, async move { work.process(event).await }.instrument(span))
            .await?
    }
}

impl IndexWork {
    async fn process(&self, event: DispatchEvent) -> Result<HandlerOutcome, ReaperError> {
        let key = *event
            .snapshot_key()
            .ok_or(ReaperError::MissingSnapshotKey {
                kind: event.event_type,
            })?;
        if event.event_type == EventType::ScopeIndexFragment {
            return self.advance_own(&event, &key);
        }

        let (snapshot, envelopes, owners) = match self.plan(&event, &key)? {
            Plan::Done(outcome) => return Ok(outcome),
            Plan::Index {
                snapshot,
                envelopes,
                owners,
            } => (snapshot, envelopes, owners),
        };

        for owner in &owners {
            let written = self.write_document(&snapshot, owner).await;
            match written {
                Ok(()) => {}
                Err(e) if e.is_transient() => {
                    tracing::warn!(owner = %owner, error = %e, "search write failed; awaiting re-trigger");
                    return Ok(HandlerOutcome::retry(e.to_string()));
                }
                Err(e) => return Err(e.into()),
            }
        }

        self.commit(&key, &envelopes)
    }

    async fn write_document(
        &self,
        snapshot: &ScopeSnapshot,
        owner: &PartyKey,
    ) -> Result<(), saga_collab::CollabError> {
        let fields = with_timeout(
            self.search_timeout,
            "field extraction",
            self.extractor.extract_fields(&snapshot.scope, owner),
        )
        .await?;
        let index = self.routing.index_for(owner);
        let document_id = format!("{}:{}", snapshot.scope.scope_id, owner);
        with_timeout(
            self.search_timeout,
            "search write",
            self.search.index_document(index, &document_id, fields),
        )
        .await?;
        tracing::debug!(index, document = %document_id, "search document written");
        Ok(())
    }

    fn plan(&self, event: &DispatchEvent, key: &SnapshotKey) -> Result<Plan, ReaperError> {
        let now = self.ctx.now();
        let mut txn = self.ctx.store.write()?;
        let snapshot = txn
            .get_snapshot(key)?
            .ok_or_else(|| ReaperError::NotFound(format!("snapshot {key}")))?;
        if snapshot.indexed {
            tracing::debug!(snapshot = %key, "already indexed");
            return Ok(Plan::Done(HandlerOutcome::complete()));
        }

        let group = match snapshot.relevant_group() {
            Ok(group) => group,
            Err(e) => {
                let outcome = self.group_missing(txn.as_mut(), event, e.to_string(), now)?;
                txn.commit()?;
                return Ok(Plan::Done(outcome));
            }
        };

        let copies: Vec<Envelope> = txn
            .envelopes_by_execution(&group.execution_id)?
            .into_iter()
            .filter(|e| e.group_id == group.group_id && has_document(e.status))
            .collect();
        let same_scope = txn.envelopes_by_scope(&snapshot.scope.scope_id)?;

        let mut owners: Vec<PartyKey> = Vec::new();
        for copy in &copies {
            if is_stale(copy, &same_scope, now) {
                tracing::debug!(envelope = %copy.id, "newer copy exists; search write skipped");
                continue;
            }
            if !owners.contains(&copy.owner_key) {
                owners.push(copy.owner_key.clone());
            }
        }

        Ok(Plan::Index {
            envelopes: copies
                .iter()
                .filter(|e| indexable(e.status))
                .map(|e| e.id)
                .collect(),
            snapshot,
            owners,
        })
    }

    /// Advance the planned copies and flag the snapshot, atomically.
    fn commit(&self, key: &SnapshotKey, envelopes: &[EnvelopeId]) -> Result<HandlerOutcome, ReaperError> {
        let now = self.ctx.now();
        let mut txn = self.ctx.store.write()?;
        let Some(mut snapshot) = txn.get_snapshot(key)? else {
            return Err(ReaperError::NotFound(format!("snapshot {key}")));
        };
        if snapshot.indexed {
            return Ok(HandlerOutcome::complete());
        }

        let mut steps = Vec::new();
        let mut staged = Vec::new();
        for id in envelopes {
            let Some(mut record) = txn.get_envelope(id)? else {
                continue;
            };
            if !indexable(record.status) {
                continue;
            }
            let step = on_handle_index(&mut record, &snapshot.scope, now)?;
            staged.extend(persist_step(txn.as_mut(), &record, step, now)?);
            steps.push(step);
        }

        snapshot.indexed = true;
        txn.put_snapshot(&snapshot)?;
        txn.commit()?;
        self.ctx.note(&steps);
        tracing::info!(snapshot = %key, copies = steps.len(), "scope indexed");
        Ok(HandlerOutcome::complete_with(staged))
    }

    /// Move only the trigger's own envelope; no search writes.
    fn advance_own(&self, event: &DispatchEvent, key: &SnapshotKey) -> Result<HandlerOutcome, ReaperError> {
        let now = self.ctx.now();
        let mut txn = self.ctx.store.write()?;
        let snapshot = txn
            .get_snapshot(key)?
            .ok_or_else(|| ReaperError::NotFound(format!("snapshot {key}")))?;
        if let Err(e) = snapshot.relevant_group() {
            let outcome = self.group_missing(txn.as_mut(), event, e.to_string(), now)?;
            txn.commit()?;
            return Ok(outcome);
        }

        let mut record = txn.require_envelope(&event.envelope_id)?;
        if !indexable(record.status) {
            tracing::debug!(status = %record.status, "not awaiting confirmation");
            return Ok(HandlerOutcome::complete());
        }
        let step = on_handle_index(&mut record, &snapshot.scope, now)?;
        let staged = persist_step(txn.as_mut(), &record, step, now)?;
        txn.commit()?;
        self.ctx.note(&[step]);
        Ok(HandlerOutcome::complete_with(staged.into_iter().collect()))
    }

    /// The chain scope lacks the group this execution wrote: fail the
    /// trigger's envelope and the trigger itself.
    fn group_missing<T: WriteTxn + ?Sized>(
        &self,
        txn: &mut T,
        event: &DispatchEvent,
        reason: String,
        now: Timestamp,
    ) -> Result<HandlerOutcome, ReaperError> {
        tracing::warn!(reason = %reason, "record group missing from chain scope");
        let mut staged = Vec::new();
        if let Some(mut record) = txn.get_envelope(&event.envelope_id)? {
            let error = EnvelopeError::new(
                EnvelopeErrorKind::RecordGroupMissing,
                reason.clone(),
                record.owner_key.clone(),
                now,
            );
            let (step, error_event) = fail_envelope(txn, &mut record, error, now)?;
            self.ctx.note(&[step]);
            staged.extend(error_event);
        }
        Ok(HandlerOutcome::failed(reason).with_triggered(staged))
    }
}
