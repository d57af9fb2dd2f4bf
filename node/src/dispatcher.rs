//! Durable event dispatch.
//!
//! Each `(envelope, event type)` pair owns one slot in the `event` table.
//! [`EventDispatcher::submit`] upserts the slot and runs the registered
//! handler, then records the handler's status in the slot. A handler that
//! stages follow-up events writes them in its own transaction and returns
//! them; they are fired only after the triggering outcome is recorded.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures_util::future::{BoxFuture, FutureExt};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::Instrument;

use saga_store::{SagaStore, StoreError, WriteTxn};
use saga_types::{
    Clock, DispatchEvent, DispatchFailure, EnvelopeId, EventPayload, EventStatus, EventType,
    Timestamp,
};

use crate::metrics::SagaMetrics;
use crate::reaper::ReaperError;
use crate::tracing_spans::dispatch_span;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("no handler registered for {0}")]
    NoHandler(EventType),
}

/// Result of handling one trigger, independent of the envelope's own state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerOutcome {
    pub status: EventStatus,
    pub failure: Option<DispatchFailure>,
    /// Follow-ups already persisted by the handler, fired after this outcome.
    pub triggered: Vec<DispatchEvent>,
}

impl HandlerOutcome {
    pub fn complete() -> Self {
        Self::complete_with(Vec::new())
    }

    pub fn complete_with(triggered: Vec<DispatchEvent>) -> Self {
        Self {
            status: EventStatus::Complete,
            failure: None,
            triggered,
        }
    }

    /// Failed for a reason a later re-trigger may not hit.
    pub fn retry(message: impl Into<String>) -> Self {
        Self::error(message, true)
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::error(message, false)
    }

    fn error(message: impl Into<String>, retryable: bool) -> Self {
        Self {
            status: EventStatus::Error,
            failure: Some(DispatchFailure {
                message: message.into(),
                retryable,
            }),
            triggered: Vec::new(),
        }
    }

    pub fn with_triggered(mut self, triggered: Vec<DispatchEvent>) -> Self {
        self.triggered.extend(triggered);
        self
    }
}

#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &DispatchEvent) -> Result<HandlerOutcome, ReaperError>;
}

/// Event type to handler, fixed at startup.
pub struct DispatchTable {
    handlers: BTreeMap<EventType, Arc<dyn EventHandler>>,
}

impl DispatchTable {
    pub fn builder() -> DispatchTableBuilder {
        DispatchTableBuilder {
            handlers: BTreeMap::new(),
        }
    }

    pub fn handler(&self, event_type: EventType) -> Option<&Arc<dyn EventHandler>> {
        self.handlers.get(&event_type)
    }

    pub fn event_types(&self) -> impl Iterator<Item = EventType> + '_ {
        self.handlers.keys().copied()
    }
}

pub struct DispatchTableBuilder {
    handlers: BTreeMap<EventType, Arc<dyn EventHandler>>,
}

impl DispatchTableBuilder {
    /// Register `handler` for `event_type`, replacing any earlier one.
    pub fn register(mut self, event_type: EventType, handler: Arc<dyn EventHandler>) -> Self {
        self.handlers.insert(event_type, handler);
        self
    }

    pub fn build(self) -> DispatchTable {
        DispatchTable {
            handlers: self.handlers,
        }
    }
}

/// Upsert a CREATED trigger inside `txn`. The caller fires it after commit.
pub fn stage_event<T: WriteTxn + ?Sized>(
    txn: &mut T,
    envelope: EnvelopeId,
    event_type: EventType,
    payload: EventPayload,
    now: Timestamp,
) -> Result<DispatchEvent, StoreError> {
    let event = DispatchEvent::new(envelope, event_type, payload, now);
    txn.put_event(&event)?;
    Ok(event)
}

pub struct EventDispatcher {
    store: Arc<dyn SagaStore>,
    table: DispatchTable,
    clock: Arc<dyn Clock>,
    metrics: Arc<SagaMetrics>,
}

impl EventDispatcher {
    pub fn new(
        store: Arc<dyn SagaStore>,
        table: DispatchTable,
        clock: Arc<dyn Clock>,
        metrics: Arc<SagaMetrics>,
    ) -> Self {
        Self {
            store,
            table,
            clock,
            metrics,
        }
    }

    /// Upsert the slot and run its handler to completion.
    pub async fn submit(
        &self,
        envelope: EnvelopeId,
        event_type: EventType,
        payload: EventPayload,
    ) -> Result<EventStatus, DispatchError> {
        let event = self.upsert(envelope, event_type, payload)?;
        self.fire(event).await
    }

    fn upsert(
        &self,
        envelope: EnvelopeId,
        event_type: EventType,
        payload: EventPayload,
    ) -> Result<DispatchEvent, StoreError> {
        let mut txn = self.store.write()?;
        let event = stage_event(txn.as_mut(), envelope, event_type, payload, self.clock.now())?;
        txn.commit()?;
        Ok(event)
    }

    /// Run the handler for an already persisted trigger, record its outcome,
    /// then fire the follow-ups it staged.
    pub fn fire(&self, event: DispatchEvent) -> BoxFuture<'_, Result<EventStatus, DispatchError>> {
        async move {
            let span = dispatch_span(event.event_type, &event.envelope_id, &event.id);
            let Some(handler) = self.table.handler(event.event_type).cloned() else {
                let outcome = HandlerOutcome::failed(format!("no handler for {}", event.event_type));
                self.record(&event, &outcome)?;
                return Err(DispatchError::NoHandler(event.event_type));
            };

            let started = Instant::now();
            let outcome = match handler.handle(&event).instrument(span.clone()).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    span.in_scope(|| tracing::error!(error = %e, "handler failed"));
                    if e.is_retryable() {
                        HandlerOutcome::retry(e.to_string())
                    } else {
                        HandlerOutcome::failed(e.to_string())
                    }
                }
            };
            self.metrics.record_outcome(
                event.event_type,
                outcome.status,
                started.elapsed().as_secs_f64() * 1000.0,
            );
            self.record(&event, &outcome)?;

            for follow_up in outcome.triggered {
                let kind = follow_up.event_type;
                if let Err(e) = self.fire(follow_up).await {
                    tracing::warn!(error = %e, kind = %kind, "follow-up dispatch failed");
                }
            }
            Ok(outcome.status)
        }
        .boxed()
    }

    /// Fire `events` on a background task.
    pub fn spawn_fire(self: &Arc<Self>, events: Vec<DispatchEvent>) -> JoinHandle<()> {
        let dispatcher = Arc::clone(self);
        tokio::spawn(async move {
            for event in events {
                let kind = event.event_type;
                if let Err(e) = dispatcher.fire(event).await {
                    tracing::warn!(error = %e, kind = %kind, "dispatch failed");
                }
            }
        })
    }

    /// Write the outcome into the slot unless a newer trigger replaced it.
    fn record(&self, event: &DispatchEvent, outcome: &HandlerOutcome) -> Result<bool, StoreError> {
        let mut txn = self.store.write()?;
        let Some(mut slot) = txn.get_event(&event.envelope_id, event.event_type)? else {
            return Ok(false);
        };
        if slot.id != event.id {
            tracing::debug!(
                kind = %event.event_type,
                envelope = %event.envelope_id,
                "trigger superseded; outcome dropped"
            );
            return Ok(false);
        }
        slot.status = outcome.status;
        slot.failure = outcome.failure.clone();
        slot.attempts = slot.attempts.saturating_add(1);
        slot.updated_at = self.clock.now();
        txn.put_event(&slot)?;
        txn.commit()?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use saga_nullables::{NullClock, NullStore};

    type Seen = Arc<Mutex<Vec<(EventType, Option<EventStatus>)>>>;

    /// Records what it saw of its own and the parent slot, then answers.
    struct Scripted {
        store: Arc<NullStore>,
        clock: Arc<NullClock>,
        seen: Seen,
        outcome: Result<HandlerOutcome, fn() -> ReaperError>,
        stage: Option<EventType>,
        parent: Option<EventType>,
    }

    #[async_trait]
    impl EventHandler for Scripted {
        async fn handle(&self, event: &DispatchEvent) -> Result<HandlerOutcome, ReaperError> {
            let parent_status = match self.parent {
                Some(parent) => self
                    .store
                    .read()?
                    .get_event(&event.envelope_id, parent)?
                    .map(|e| e.status),
                None => None,
            };
            self.seen.lock().unwrap().push((event.event_type, parent_status));

            let mut staged = Vec::new();
            if let Some(kind) = self.stage {
                let mut txn = self.store.write()?;
                staged.push(stage_event(
                    txn.as_mut(),
                    event.envelope_id,
                    kind,
                    EventPayload::Envelope,
                    self.clock.now(),
                )?);
                txn.commit()?;
            }
            match &self.outcome {
                Ok(outcome) => Ok(outcome.clone().with_triggered(staged)),
                Err(make) => Err(make()),
            }
        }
    }

    struct Harness {
        store: Arc<NullStore>,
        clock: Arc<NullClock>,
        seen: Seen,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                store: Arc::new(NullStore::new()),
                clock: Arc::new(NullClock::default()),
                seen: Arc::new(Mutex::new(Vec::new())),
            }
        }

        fn handler(
            &self,
            outcome: Result<HandlerOutcome, fn() -> ReaperError>,
            stage: Option<EventType>,
            parent: Option<EventType>,
        ) -> Arc<dyn EventHandler> {
            Arc::new(Scripted {
                store: Arc::clone(&self.store),
                clock: Arc::clone(&self.clock),
                seen: Arc::clone(&self.seen),
                outcome,
                stage,
                parent,
            })
        }

        fn dispatcher(&self, table: DispatchTable) -> Arc<EventDispatcher> {
            Arc::new(EventDispatcher::new(
                self.store.clone(),
                table,
                self.clock.clone(),
                Arc::new(SagaMetrics::new().unwrap()),
            ))
        }

        fn slot(&self, envelope: &EnvelopeId, kind: EventType) -> DispatchEvent {
            self.store.read().unwrap().get_event(envelope, kind).unwrap().unwrap()
        }
    }

    #[tokio::test]
    async fn submit_records_handler_status() {
        let h = Harness::new();
        let table = DispatchTable::builder()
            .register(EventType::EnvelopeFragment, h.handler(Ok(HandlerOutcome::complete()), None, None))
            .build();
        let dispatcher = h.dispatcher(table);
        let envelope = EnvelopeId::random();

        let status = dispatcher
            .submit(envelope, EventType::EnvelopeFragment, EventPayload::Envelope)
            .await
            .unwrap();
        assert_eq!(status, EventStatus::Complete);
        let slot = h.slot(&envelope, EventType::EnvelopeFragment);
        assert_eq!(slot.status, EventStatus::Complete);
        assert_eq!(slot.attempts, 1);
        assert!(slot.failure.is_none());
    }

    #[tokio::test]
    async fn resubmission_replaces_the_slot() {
        let h = Harness::new();
        let table = DispatchTable::builder()
            .register(EventType::EnvelopeError, h.handler(Ok(HandlerOutcome::retry("later")), None, None))
            .build();
        let dispatcher = h.dispatcher(table);
        let envelope = EnvelopeId::random();

        dispatcher.submit(envelope, EventType::EnvelopeError, EventPayload::Envelope).await.unwrap();
        let first = h.slot(&envelope, EventType::EnvelopeError);
        dispatcher.submit(envelope, EventType::EnvelopeError, EventPayload::Envelope).await.unwrap();
        let second = h.slot(&envelope, EventType::EnvelopeError);

        assert_ne!(first.id, second.id);
        assert_eq!(second.attempts, 1);
        assert!(second.is_retryable());
        assert_eq!(h.store.read().unwrap().events_for_envelope(&envelope).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn superseded_outcome_is_dropped() {
        let h = Harness::new();
        let table = DispatchTable::builder()
            .register(EventType::EnvelopeFragment, h.handler(Ok(HandlerOutcome::complete()), None, None))
            .build();
        let dispatcher = h.dispatcher(table);
        let envelope = EnvelopeId::random();

        let stale = DispatchEvent::envelope(envelope, EventType::EnvelopeFragment, h.clock.now());
        let newer = {
            let mut txn = h.store.write().unwrap();
            txn.put_event(&stale).unwrap();
            let newer = stage_event(
                txn.as_mut(),
                envelope,
                EventType::EnvelopeFragment,
                EventPayload::Envelope,
                h.clock.now(),
            )
            .unwrap();
            txn.commit().unwrap();
            newer
        };

        dispatcher.fire(stale).await.unwrap();
        let slot = h.slot(&envelope, EventType::EnvelopeFragment);
        assert_eq!(slot.id, newer.id);
        assert_eq!(slot.status, EventStatus::Created);
    }

    #[tokio::test]
    async fn missing_handler_marks_slot_failed() {
        let h = Harness::new();
        let dispatcher = h.dispatcher(DispatchTable::builder().build());
        let envelope = EnvelopeId::random();

        let err = dispatcher
            .submit(envelope, EventType::ScopeIndex, EventPayload::Envelope)
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::NoHandler(EventType::ScopeIndex)));
        let slot = h.slot(&envelope, EventType::ScopeIndex);
        assert_eq!(slot.status, EventStatus::Error);
        assert!(!slot.is_retryable());
    }

    #[tokio::test]
    async fn handler_error_is_recorded_not_returned() {
        let h = Harness::new();
        let table = DispatchTable::builder()
            .register(
                EventType::EnvelopeChaincode,
                h.handler(Err(|| ReaperError::NotFound("envelope".into())), None, None),
            )
            .build();
        let dispatcher = h.dispatcher(table);
        let envelope = EnvelopeId::random();

        let status = dispatcher
            .submit(envelope, EventType::EnvelopeChaincode, EventPayload::Envelope)
            .await
            .unwrap();
        assert_eq!(status, EventStatus::Error);
        let slot = h.slot(&envelope, EventType::EnvelopeChaincode);
        assert!(slot.failure.unwrap().message.contains("envelope"));
    }

    #[tokio::test]
    async fn follow_ups_fire_after_the_outcome_is_recorded() {
        let h = Harness::new();
        let table = DispatchTable::builder()
            .register(
                EventType::EnvelopeFragment,
                h.handler(Ok(HandlerOutcome::complete()), Some(EventType::EnvelopeError), None),
            )
            .register(
                EventType::EnvelopeError,
                h.handler(Ok(HandlerOutcome::complete()), None, Some(EventType::EnvelopeFragment)),
            )
            .build();
        let dispatcher = h.dispatcher(table);
        let envelope = EnvelopeId::random();

        dispatcher
            .submit(envelope, EventType::EnvelopeFragment, EventPayload::Envelope)
            .await
            .unwrap();

        let seen = h.seen.lock().unwrap().clone();
        assert_eq!(
            seen,
            vec![
                (EventType::EnvelopeFragment, None),
                (EventType::EnvelopeError, Some(EventStatus::Complete)),
            ]
        );
        assert_eq!(h.slot(&envelope, EventType::EnvelopeError).status, EventStatus::Complete);
    }

    #[tokio::test]
    async fn spawn_fire_runs_in_background() {
        let h = Harness::new();
        let table = DispatchTable::builder()
            .register(EventType::EnvelopeError, h.handler(Ok(HandlerOutcome::complete()), None, None))
            .build();
        let dispatcher = h.dispatcher(table);
        let envelope = EnvelopeId::random();
        let event = {
            let mut txn = h.store.write().unwrap();
            let event = stage_event(
                txn.as_mut(),
                envelope,
                EventType::EnvelopeError,
                EventPayload::Envelope,
                h.clock.now(),
            )
            .unwrap();
            txn.commit().unwrap();
            event
        };

        dispatcher.spawn_fire(vec![event]).await.unwrap();
        assert_eq!(h.slot(&envelope, EventType::EnvelopeError).status, EventStatus::Complete);
    }
}
