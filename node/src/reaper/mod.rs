//! Reaper handlers: one per dispatch kind, each on its own worker pool.
//!
//! A reaper never holds a write transaction across collaborator I/O. It
//! reads what it needs, releases the transaction, talks to the outside
//! world, then re-validates under a fresh write transaction before
//! committing the advance.

mod chaincode;
mod error;
mod fragment;
mod index;

pub use chaincode::ChaincodeReaper;
pub use error::ErrorReaper;
pub use fragment::FragmentReaper;
pub use index::IndexReaper;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use saga_collab::{CollabError, PeerDelivery};
use saga_store::{SagaStore, StoreError, WriteTxn};
use saga_types::{
    Clock, DispatchEvent, Envelope, EnvelopeError, EnvelopeStatus, EventPayload, EventType,
    Timestamp, TypesError,
};

use crate::dispatcher::{stage_event, DispatchTable};
use crate::metrics::SagaMetrics;
use crate::state_machine::{on_handle_error, StateMachineError, Step};
use crate::worker_pool::PoolError;

#[derive(Debug, Error)]
pub enum ReaperError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    StateMachine(#[from] StateMachineError),

    #[error(transparent)]
    Collaborator(#[from] CollabError),

    #[error(transparent)]
    Types(#[from] TypesError),

    #[error("{0} not found")]
    NotFound(String),

    #[error("{kind} trigger carries no snapshot key")]
    MissingSnapshotKey { kind: EventType },

    #[error(transparent)]
    Pool(#[from] PoolError),
}

impl ReaperError {
    /// Whether re-firing the trigger later can succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Store(StoreError::Backend(_)) => true,
            Self::Collaborator(e) => e.is_transient(),
            Self::Pool(PoolError::Closed(_)) => true,
            _ => false,
        }
    }
}

/// What every reaper shares.
#[derive(Clone)]
pub struct ReaperContext {
    pub store: Arc<dyn SagaStore>,
    pub clock: Arc<dyn Clock>,
    pub metrics: Arc<SagaMetrics>,
}

impl ReaperContext {
    pub fn new(store: Arc<dyn SagaStore>, clock: Arc<dyn Clock>, metrics: Arc<SagaMetrics>) -> Self {
        Self {
            store,
            clock,
            metrics,
        }
    }

    pub(crate) fn now(&self) -> Timestamp {
        self.clock.now()
    }

    /// Count committed transitions.
    pub(crate) fn note(&self, steps: &[Step]) {
        for step in steps {
            if let Step::Advanced(status) = step {
                self.metrics.record_transition(*status);
            }
        }
    }
}

/// Write back a transitioned record and stage ENVELOPE_ERROR if the
/// transition landed in ERROR.
pub(crate) fn persist_step<T: WriteTxn + ?Sized>(
    txn: &mut T,
    record: &Envelope,
    step: Step,
    now: Timestamp,
) -> Result<Option<DispatchEvent>, ReaperError> {
    if !step.changed() {
        return Ok(None);
    }
    txn.put_envelope(record)?;
    if step == Step::Advanced(EnvelopeStatus::Error) {
        let staged = stage_event(
            txn,
            record.id,
            EventType::EnvelopeError,
            EventPayload::Envelope,
            now,
        )?;
        return Ok(Some(staged));
    }
    Ok(None)
}

/// Attach a business error and move the record to ERROR.
///
/// Terminal records are left alone.
pub(crate) fn fail_envelope<T: WriteTxn + ?Sized>(
    txn: &mut T,
    record: &mut Envelope,
    error: EnvelopeError,
    now: Timestamp,
) -> Result<(Step, Option<DispatchEvent>), ReaperError> {
    if record.status.is_terminal() {
        return Ok((Step::Unchanged, None));
    }
    record.attach_error(error);
    let step = on_handle_error(record, now)?;
    let staged = persist_step(txn, record, step, now)?;
    Ok((step, staged))
}

/// Bound a collaborator call; running out of time is transient.
pub(crate) async fn with_timeout<T, F>(
    limit: Duration,
    what: &str,
    call: F,
) -> Result<T, CollabError>
where
    F: Future<Output = Result<T, CollabError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(CollabError::Transient(format!(
            "{what} timed out after {}ms",
            limit.as_millis()
        ))),
    }
}

/// Build the dispatch table every node runs with.
pub fn dispatch_table(
    fragment: Arc<FragmentReaper>,
    chaincode: Arc<ChaincodeReaper>,
    index: Arc<IndexReaper>,
    error: Arc<ErrorReaper>,
) -> DispatchTable {
    DispatchTable::builder()
        .register(EventType::EnvelopeFragment, fragment)
        .register(EventType::EnvelopeChaincode, chaincode)
        .register(EventType::ScopeIndex, index.clone())
        .register(EventType::ScopeIndexFragment, index)
        .register(EventType::EnvelopeError, error)
        .build()
}

/// Tell the owner's mailbox that `envelope` failed. Failures are logged.
pub(crate) async fn notify_owner(
    peer: &Arc<dyn PeerDelivery>,
    limit: Duration,
    envelope: &Envelope,
    error: &EnvelopeError,
) {
    let sent = with_timeout(
        limit,
        "error notification",
        peer.notify_error(&envelope.owner_key, envelope, error),
    )
    .await;
    if let Err(e) = sent {
        tracing::warn!(envelope = %envelope.id, error = %e, "owner notification failed");
    }
}
