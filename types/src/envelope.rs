//! The envelope row.
//!
//! Row columns are a queryable write-through cache over fields that also live
//! in the durable [`EnvelopeDocument`]. Both are written together; a row whose
//! columns disagree with its document is never persisted (see
//! [`Envelope::verify_mirror`]).

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{
    EnvelopeDocument, EnvelopeError, EnvelopeId, EnvelopeStatus, ExecutionId, GroupId, PartyKey,
    PhaseStamps, ScopeId, SubEnvelope, Timestamp, TxHash,
};

/// One party's copy of a logical execution.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: EnvelopeId,
    pub execution_id: ExecutionId,
    pub group_id: GroupId,
    pub scope_id: ScopeId,
    /// Identity of the locally-hosted party this copy belongs to.
    pub owner_key: PartyKey,
    pub status: EnvelopeStatus,
    pub is_invoker: bool,
    pub error_at: Option<Timestamp>,
    pub stamps: PhaseStamps,
    pub read_at: Option<Timestamp>,
    pub chain_tx: Option<TxHash>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    pub document: EnvelopeDocument,
}

/// A row column that disagrees with the document it mirrors.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MirrorMismatch {
    pub envelope: EnvelopeId,
    pub field: &'static str,
}

impl fmt::Display for MirrorMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "envelope {} column `{}` diverges from its document",
            self.envelope, self.field
        )
    }
}

impl std::error::Error for MirrorMismatch {}

impl Envelope {
    /// Build a row whose columns are derived from `document`.
    pub fn from_document(
        id: EnvelopeId,
        owner_key: PartyKey,
        document: EnvelopeDocument,
        now: Timestamp,
    ) -> Self {
        Self {
            id,
            execution_id: document.input.execution_id,
            group_id: document.input.group_id,
            scope_id: document.input.scope_id,
            owner_key,
            status: document.status(),
            is_invoker: document.is_invoker,
            error_at: document.error_at,
            stamps: document.stamps.clone(),
            read_at: document.read_at,
            chain_tx: document.chain_tx,
            created_at: now,
            updated_at: now,
            document,
        }
    }

    /// Check every mirrored column against the document.
    pub fn verify_mirror(&self) -> Result<(), MirrorMismatch> {
        let doc = &self.document;
        let field = if self.status != doc.status() {
            Some("status")
        } else if self.stamps != doc.stamps {
            Some("stamps")
        } else if self.error_at != doc.error_at {
            Some("error_at")
        } else if self.read_at != doc.read_at {
            Some("read_at")
        } else if self.chain_tx != doc.chain_tx {
            Some("chain_tx")
        } else if self.is_invoker != doc.is_invoker {
            Some("is_invoker")
        } else if self.execution_id != doc.input.execution_id {
            Some("execution_id")
        } else if self.group_id != doc.input.group_id {
            Some("group_id")
        } else if self.scope_id != doc.input.scope_id {
            Some("scope_id")
        } else {
            None
        };
        match field {
            Some(field) => Err(MirrorMismatch {
                envelope: self.id,
                field,
            }),
            None => Ok(()),
        }
    }

    /// Whether the document records `phase` and the row sits exactly at it.
    pub fn is_at(&self, phase: EnvelopeStatus) -> bool {
        self.status == phase && self.document.stamps.has(phase)
    }

    pub fn input(&self) -> &SubEnvelope {
        &self.document.input
    }

    pub fn result(&self) -> Option<&SubEnvelope> {
        self.document.result.as_ref()
    }

    /// Whether the input's expiration deadline has passed.
    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.document.input.is_expired(now)
    }

    /// Counter-parties named by the input's recitals.
    pub fn counter_parties(&self) -> Vec<PartyKey> {
        self.document.input.counter_parties(&self.owner_key)
    }

    /// Attach a business error to the document and stamp `error_at` on both
    /// row and document. The status is left for the error transition.
    pub fn attach_error(&mut self, error: EnvelopeError) {
        let at = error.at;
        self.document.current_mut().errors.push(error);
        self.document.error_at = Some(at);
        self.error_at = Some(at);
    }

    /// The time this copy observed chain confirmation, if it has.
    pub fn chain_confirmed_at(&self) -> Option<Timestamp> {
        self.stamps.chaincoded_at.or(self.stamps.indexed_at)
    }
}
