//! Nullable peer transport: record deliveries instead of sending them.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use saga_collab::{CollabError, PeerDelivery};
use saga_types::{
    Envelope, EnvelopeError, EnvelopeErrorKind, EnvelopeId, EnvelopeStatus, PartyKey, SubEnvelope,
};

/// One recorded transport call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PeerCall {
    Deliver {
        envelope: EnvelopeId,
        target: PartyKey,
        /// Phase of the delivered side at send time.
        status: EnvelopeStatus,
    },
    NotifyError {
        envelope: EnvelopeId,
        target: PartyKey,
        kind: EnvelopeErrorKind,
    },
}

/// A peer transport that records every call. Failures can be scripted and
/// are consumed one per call.
#[derive(Default)]
pub struct NullPeer {
    calls: Mutex<Vec<PeerCall>>,
    failures: Mutex<VecDeque<CollabError>>,
}

impl NullPeer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next call fail with `error`.
    pub fn fail_next(&self, error: CollabError) {
        self.failures.lock().unwrap().push_back(error);
    }

    pub fn calls(&self) -> Vec<PeerCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn deliveries(&self) -> Vec<PeerCall> {
        self.calls()
            .into_iter()
            .filter(|c| matches!(c, PeerCall::Deliver { .. }))
            .collect()
    }

    pub fn notifications(&self) -> Vec<PeerCall> {
        self.calls()
            .into_iter()
            .filter(|c| matches!(c, PeerCall::NotifyError { .. }))
            .collect()
    }

    fn record(&self, call: PeerCall) -> Result<(), CollabError> {
        if let Some(error) = self.failures.lock().unwrap().pop_front() {
            return Err(error);
        }
        self.calls.lock().unwrap().push(call);
        Ok(())
    }
}

#[async_trait]
impl PeerDelivery for NullPeer {
    async fn deliver(
        &self,
        envelope: &Envelope,
        payload: &SubEnvelope,
        target: &PartyKey,
    ) -> Result<(), CollabError> {
        self.record(PeerCall::Deliver {
            envelope: envelope.id,
            target: target.clone(),
            status: payload.status,
        })
    }

    async fn notify_error(
        &self,
        target: &PartyKey,
        envelope: &Envelope,
        error: &EnvelopeError,
    ) -> Result<(), CollabError> {
        self.record(PeerCall::NotifyError {
            envelope: envelope.id,
            target: target.clone(),
            kind: error.kind,
        })
    }
}
