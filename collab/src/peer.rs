use async_trait::async_trait;
use saga_types::{Envelope, EnvelopeError, PartyKey, SubEnvelope};

use crate::CollabError;

/// Encrypted peer-to-peer mailbox transport.
#[async_trait]
pub trait PeerDelivery: Send + Sync {
    /// Deliver one side of an envelope to `target`'s mailbox.
    async fn deliver(
        &self,
        envelope: &Envelope,
        payload: &SubEnvelope,
        target: &PartyKey,
    ) -> Result<(), CollabError>;

    /// Tell `target` that `envelope` failed with `error`.
    async fn notify_error(
        &self,
        target: &PartyKey,
        envelope: &Envelope,
        error: &EnvelopeError,
    ) -> Result<(), CollabError>;
}
