use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::Instrument;

use saga_collab::{CollabErrorKind, PeerDelivery};
use saga_types::{DispatchEvent, Envelope, EnvelopeError, EnvelopeStatus};

use super::{with_timeout, ReaperContext, ReaperError};
use crate::dispatcher::{EventHandler, HandlerOutcome};
use crate::tracing_spans::reaper_span;
use crate::worker_pool::WorkerPool;

/// Tells counter-parties that a fragmented envelope failed.
pub struct ErrorReaper {
    work: Arc<ErrorWork>,
    pool: WorkerPool,
}

struct ErrorWork {
    ctx: ReaperContext,
    peer: Arc<dyn PeerDelivery>,
    delivery_timeout: Duration,
}

impl ErrorReaper {
    pub fn new(
        ctx: ReaperContext,
        peer: Arc<dyn PeerDelivery>,
        delivery_timeout: Duration,
        workers: usize,
    ) -> Self {
        Self {
            work: Arc::new(ErrorWork {
                ctx,
                peer,
                delivery_timeout,
            }),
            pool: WorkerPool::new("error", workers),
        }
    }
}

#[async_trait]
impl EventHandler for ErrorReaper {
    async fn handle(&self, event: &DispatchEvent) -> Result<HandlerOutcome, ReaperError> {
        let work = Arc::clone(&self.work);
        let event = event.clone();
        let span = reaper_span("error", &event.envelope_id);
        self.pool
            .run(event.envelope_id, async move { work.process(event).await }.instrument(span))
            .await?
    }
}

impl ErrorWork {
    async fn process(&self, event: DispatchEvent) -> Result<HandlerOutcome, ReaperError> {
        let Some((record, error)) = self.load(&event)? else {
            return Ok(HandlerOutcome::complete());
        };

        for target in record.counter_parties() {
            let sent = with_timeout(
                self.delivery_timeout,
                "error notification",
                self.peer.notify_error(&target, &record, &error),
            )
            .await;
            match sent {
                Ok(()) => tracing::debug!(target = %target, "counter-party notified"),
                Err(e) => match e.kind() {
                    CollabErrorKind::Transient => {
                        tracing::warn!(target = %target, error = %e, "notification failed; awaiting re-trigger");
                        return Ok(HandlerOutcome::retry(e.to_string()));
                    }
                    CollabErrorKind::Rejected => {
                        tracing::info!(target = %target, error = %e, "counter-party refused notification");
                    }
                    CollabErrorKind::Fatal => return Err(e.into()),
                },
            }
        }
        Ok(HandlerOutcome::complete())
    }

    fn load(&self, event: &DispatchEvent) -> Result<Option<(Envelope, EnvelopeError)>, ReaperError> {
        let txn = self.ctx.store.read()?;
        let record = txn.require_envelope(&event.envelope_id)?;
        if record.status != EnvelopeStatus::Error || !record.stamps.has(EnvelopeStatus::Fragment) {
            tracing::debug!(status = %record.status, "nothing to notify");
            return Ok(None);
        }
        let Some(error) = record.document.last_error().cloned() else {
            return Ok(None);
        };
        Ok(Some((record, error)))
    }
}
