//! Transitions driven from outside the saga: a local proposal, an inbound
//! peer delivery, local execution and signing, reading, acknowledgement.

use std::sync::Arc;

use thiserror::Error;

use saga_store::{SagaStore, StoreError};
use saga_types::{
    Clock, DispatchEvent, Envelope, EnvelopeId, EnvelopeStatus, EventPayload, EventType, PartyKey,
    SubEnvelope, Timestamp,
};

use crate::dispatcher::{stage_event, DispatchError, EventDispatcher};
use crate::metrics::SagaMetrics;
use crate::state_machine::{
    on_handle_complete, on_handle_create, on_handle_execute, on_handle_outbox, on_handle_read,
    on_handle_receive, on_handle_sign, StateMachineError, Step,
};

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    StateMachine(#[from] StateMachineError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error("envelope {0} not found")]
    NotFound(EnvelopeId),

    #[error("envelope {id} is {status}, expected {expected}")]
    WrongStatus {
        id: EnvelopeId,
        status: EnvelopeStatus,
        expected: EnvelopeStatus,
    },
}

pub struct EnvelopeLifecycle {
    store: Arc<dyn SagaStore>,
    dispatcher: Arc<EventDispatcher>,
    clock: Arc<dyn Clock>,
    metrics: Arc<SagaMetrics>,
}

impl EnvelopeLifecycle {
    pub fn new(
        store: Arc<dyn SagaStore>,
        dispatcher: Arc<EventDispatcher>,
        clock: Arc<dyn Clock>,
        metrics: Arc<SagaMetrics>,
    ) -> Self {
        Self {
            store,
            dispatcher,
            clock,
            metrics,
        }
    }

    pub fn envelope(&self, id: &EnvelopeId) -> Result<Envelope, LifecycleError> {
        self.store
            .read()?
            .get_envelope(id)?
            .ok_or(LifecycleError::NotFound(*id))
    }

    /// Store a locally proposed envelope and fragment it to its counter-parties.
    pub async fn create(
        &self,
        owner: PartyKey,
        input: SubEnvelope,
    ) -> Result<EnvelopeId, LifecycleError> {
        let (id, staged) = self.insert_created(owner, input)?;
        tracing::info!(envelope = %id, "envelope created");
        self.dispatcher.fire(staged).await?;
        Ok(id)
    }

    fn insert_created(
        &self,
        owner: PartyKey,
        input: SubEnvelope,
    ) -> Result<(EnvelopeId, DispatchEvent), LifecycleError> {
        let now = self.clock.now();
        let record = on_handle_create(EnvelopeId::random(), owner, input, now);
        let mut txn = self.store.write()?;
        txn.put_envelope(&record)?;
        let staged = stage_event(
            txn.as_mut(),
            record.id,
            EventType::EnvelopeFragment,
            EventPayload::Envelope,
            now,
        )?;
        txn.commit()?;
        self.metrics.record_transition(EnvelopeStatus::Created);
        Ok((record.id, staged))
    }

    /// Store a counter-party copy delivered by a peer.
    pub fn receive(&self, owner: PartyKey, input: SubEnvelope) -> Result<EnvelopeId, LifecycleError> {
        let record = on_handle_receive(EnvelopeId::random(), owner, input, self.clock.now());
        let mut txn = self.store.write()?;
        txn.put_envelope(&record)?;
        txn.commit()?;
        self.metrics.record_transition(EnvelopeStatus::Inbox);
        tracing::info!(envelope = %record.id, execution = %record.execution_id, "envelope received");
        Ok(record.id)
    }

    /// The contract ran locally and produced `result`.
    pub async fn record_execution(
        &self,
        id: EnvelopeId,
        result: SubEnvelope,
    ) -> Result<Step, LifecycleError> {
        self.transition(id, |record, now| Ok(on_handle_execute(record, result, now)?))
            .await
    }

    /// The signed result went back to the invoker.
    pub async fn record_outbox(&self, id: EnvelopeId) -> Result<Step, LifecycleError> {
        self.transition(id, |record, now| Ok(on_handle_outbox(record, now)?))
            .await
    }

    /// Merge a peer's counter-signatures. An invoker copy that becomes fully
    /// signed is submitted to the chain.
    pub async fn record_signature(
        &self,
        id: EnvelopeId,
        peer: &SubEnvelope,
    ) -> Result<Step, LifecycleError> {
        self.transition(id, |record, now| Ok(on_handle_sign(record, peer, now)?))
            .await
    }

    pub fn mark_read(&self, id: EnvelopeId) -> Result<Step, LifecycleError> {
        let now = self.clock.now();
        let mut txn = self.store.write()?;
        let mut record = txn
            .get_envelope(&id)?
            .ok_or(LifecycleError::NotFound(id))?;
        let step = on_handle_read(&mut record, now);
        if step.changed() {
            txn.put_envelope(&record)?;
            txn.commit()?;
        }
        Ok(step)
    }

    /// The owner acknowledged an indexed envelope.
    pub async fn acknowledge(&self, id: EnvelopeId) -> Result<Step, LifecycleError> {
        self.transition(id, |record, now| {
            if !matches!(record.status, EnvelopeStatus::Index | EnvelopeStatus::Complete) {
                return Err(LifecycleError::WrongStatus {
                    id: record.id,
                    status: record.status,
                    expected: EnvelopeStatus::Index,
                });
            }
            Ok(on_handle_complete(record, now)?)
        })
        .await
    }

    async fn transition<F>(&self, id: EnvelopeId, apply: F) -> Result<Step, LifecycleError>
    where
        F: FnOnce(&mut Envelope, Timestamp) -> Result<Step, LifecycleError>,
    {
        let (step, staged) = self.apply(id, apply)?;
        if let Step::Advanced(status) = step {
            self.metrics.record_transition(status);
            tracing::info!(envelope = %id, status = %status, "envelope advanced");
        }
        if let Some(event) = staged {
            self.dispatcher.fire(event).await?;
        }
        Ok(step)
    }

    fn apply<F>(&self, id: EnvelopeId, apply: F) -> Result<(Step, Option<DispatchEvent>), LifecycleError>
    where
        F: FnOnce(&mut Envelope, Timestamp) -> Result<Step, LifecycleError>,
    {
        let now = self.clock.now();
        let mut txn = self.store.write()?;
        let mut record = txn
            .get_envelope(&id)?
            .ok_or(LifecycleError::NotFound(id))?;
        let step = apply(&mut record, now)?;
        if !step.changed() {
            return Ok((step, None));
        }
        txn.put_envelope(&record)?;

        let follow_up = match step {
            Step::Advanced(EnvelopeStatus::Error) => Some(EventType::EnvelopeError),
            Step::Advanced(EnvelopeStatus::Signed) if record.is_invoker => {
                Some(EventType::EnvelopeChaincode)
            }
            _ => None,
        };
        let staged = match follow_up {
            Some(kind) => Some(stage_event(txn.as_mut(), id, kind, EventPayload::Envelope, now)?),
            None => None,
        };
        txn.commit()?;
        Ok((step, staged))
    }
}
