use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::Instrument;

use saga_collab::{CollabError, PeerDelivery};
use saga_types::{DispatchEvent, Envelope, EnvelopeError, EnvelopeErrorKind, EnvelopeStatus};

use super::{fail_envelope, persist_step, with_timeout, ReaperContext, ReaperError};
use crate::dispatcher::{EventHandler, HandlerOutcome};
use crate::state_machine::on_handle_fragment;
use crate::tracing_spans::reaper_span;
use crate::worker_pool::WorkerPool;

/// Delivers a freshly created envelope's input to its counter-parties.
pub struct FragmentReaper {
    work: Arc<FragmentWork>,
    pool: WorkerPool,
}

struct FragmentWork {
    ctx: ReaperContext,
    peer: Arc<dyn PeerDelivery>,
    delivery_timeout: Duration,
}

enum Plan {
    Done(HandlerOutcome),
    Deliver(Envelope),
}

impl FragmentReaper {
    pub fn new(
        ctx: ReaperContext,
        peer: Arc<dyn PeerDelivery>,
        delivery_timeout: Duration,
        workers: usize,
    ) -> Self {
        Self {
            work: Arc::new(FragmentWork {
                ctx,
                peer,
                delivery_timeout,
            }),
            pool: WorkerPool::new("fragment", workers),
        }
    }
}

#[async_trait]
impl EventHandler for FragmentReaper {
    async fn handle(&self, event: &DispatchEvent) -> Result<HandlerOutcome, ReaperError> {
        let work = Arc::clone(&self.work);
        let event = event.clone();
        let span = reaper_span("fragment", &event.envelope_id);
        self.pool
            .run(event.envelope_id, async move { work.process(event).await }.instrument(span))
            .await?
    }
}

impl FragmentWork {
    async fn process(&self, event: DispatchEvent) -> Result<HandlerOutcome, ReaperError> {
        let envelope = match self.prepare(&event)? {
            Plan::Done(outcome) => return Ok(outcome),
            Plan::Deliver(envelope) => envelope,
        };

        for target in envelope.counter_parties() {
            let delivered = with_timeout(
                self.delivery_timeout,
                "peer delivery",
                self.peer.deliver(&envelope, envelope.input(), &target),
            )
            .await;
            match delivered {
                Ok(()) => tracing::debug!(target = %target, "input delivered"),
                Err(CollabError::Rejected(reason)) => {
                    tracing::info!(target = %target, reason = %reason, "counter-party refused envelope");
                    return self.reject(&event, reason);
                }
                Err(e) if e.is_transient() => {
                    tracing::warn!(target = %target, error = %e, "delivery failed; awaiting re-trigger");
                    return Ok(HandlerOutcome::retry(e.to_string()));
                }
                Err(e) => return Err(e.into()),
            }
        }

        self.finish(&event)
    }

    fn prepare(&self, event: &DispatchEvent) -> Result<Plan, ReaperError> {
        let now = self.ctx.now();
        let mut txn = self.ctx.store.write()?;
        let mut record = txn.require_envelope(&event.envelope_id)?;

        if record.status != EnvelopeStatus::Created || record.stamps.has(EnvelopeStatus::Fragment) {
            tracing::debug!(status = %record.status, "already fragmented");
            return Ok(Plan::Done(HandlerOutcome::complete()));
        }

        if record.is_expired(now) {
            let deadline = record.input().expiration.unwrap_or(now);
            let error = EnvelopeError::ttl_expired(deadline, record.owner_key.clone(), now);
            let (step, staged) = fail_envelope(txn.as_mut(), &mut record, error, now)?;
            txn.commit()?;
            self.ctx.note(&[step]);
            tracing::info!(deadline = %deadline, "envelope expired before fragmenting");
            return Ok(Plan::Done(HandlerOutcome::complete_with(
                staged.into_iter().collect(),
            )));
        }

        Ok(Plan::Deliver(record))
    }

    fn finish(&self, event: &DispatchEvent) -> Result<HandlerOutcome, ReaperError> {
        let now = self.ctx.now();
        let mut txn = self.ctx.store.write()?;
        let mut record = txn.require_envelope(&event.envelope_id)?;
        let step = on_handle_fragment(&mut record, now)?;
        let staged = persist_step(txn.as_mut(), &record, step, now)?;
        txn.commit()?;
        self.ctx.note(&[step]);
        Ok(HandlerOutcome::complete_with(staged.into_iter().collect()))
    }

    fn reject(&self, event: &DispatchEvent, reason: String) -> Result<HandlerOutcome, ReaperError> {
        let now = self.ctx.now();
        let mut txn = self.ctx.store.write()?;
        let mut record = txn.require_envelope(&event.envelope_id)?;
        let error = EnvelopeError::new(
            EnvelopeErrorKind::PeerRejected,
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
