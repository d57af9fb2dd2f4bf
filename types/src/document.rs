//! The serialized state document carried by every envelope row.
//!
//! The document is the durable source of truth that travels between parties:
//! an `input` sub-envelope signed by the proposer and, once executed, a
//! `result` sub-envelope accumulating counter-signatures and chain outputs.
//! Phase timestamps live here and are mirrored onto the row.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{EnvelopeStatus, ExecutionId, GroupId, PartyKey, ScopeId, Timestamp, TxHash};

/// A named party role in the contract.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recital {
    pub role: String,
    pub party: PartyKey,
}

/// A signature over a sub-envelope by one party.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartySignature {
    pub signer: PartyKey,
    pub signature: Vec<u8>,
}

/// A named output record: the fact name and the hash of its content.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fact {
    pub name: String,
    pub hash: String,
}

/// Business error categories attached to a document.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EnvelopeErrorKind {
    /// The input expiration passed before the envelope settled.
    TtlTimeout,
    /// The chain rejected or failed the contract invocation.
    ContractInvocation,
    /// A chain-confirmed scope lacks the record group this execution wrote.
    RecordGroupMissing,
    /// A counter-party refused the envelope.
    PeerRejected,
}

/// An error attached to an envelope document, visible to every party.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvelopeError {
    pub id: Uuid,
    pub kind: EnvelopeErrorKind,
    pub message: String,
    /// Party that observed the failure.
    pub reported_by: PartyKey,
    pub at: Timestamp,
}

impl EnvelopeError {
    pub fn new(
        kind: EnvelopeErrorKind,
        message: impl Into<String>,
        reported_by: PartyKey,
        at: Timestamp,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            message: message.into(),
            reported_by,
            at,
        }
    }

    pub fn ttl_expired(expiration: Timestamp, reported_by: PartyKey, at: Timestamp) -> Self {
        Self::new(
            EnvelopeErrorKind::TtlTimeout,
            format!("envelope expired at {expiration}"),
            reported_by,
            at,
        )
    }
}

/// One side of the envelope: the proposed input or the executed result.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubEnvelope {
    pub execution_id: ExecutionId,
    pub group_id: GroupId,
    pub scope_id: ScopeId,
    /// Contract reference (class name or spec hash).
    pub contract: String,
    pub recitals: Vec<Recital>,
    /// Deadline after which the envelope may no longer settle.
    pub expiration: Option<Timestamp>,
    pub signatures: Vec<PartySignature>,
    /// Outputs pending chain confirmation, later merged with chain facts.
    pub outputs: Vec<Fact>,
    /// Phase this side was last committed at.
    pub status: EnvelopeStatus,
    pub errors: Vec<EnvelopeError>,
}

impl SubEnvelope {
    pub fn new(
        execution_id: ExecutionId,
        group_id: GroupId,
        scope_id: ScopeId,
        contract: impl Into<String>,
        recitals: Vec<Recital>,
        expiration: Option<Timestamp>,
    ) -> Self {
        Self {
            execution_id,
            group_id,
            scope_id,
            contract: contract.into(),
            recitals,
            expiration,
            signatures: Vec::new(),
            outputs: Vec::new(),
            status: EnvelopeStatus::Created,
            errors: Vec::new(),
        }
    }

    /// Every recital party other than `owner`, without duplicates.
    pub fn counter_parties(&self, owner: &PartyKey) -> Vec<PartyKey> {
        let mut parties: Vec<PartyKey> = Vec::new();
        for recital in &self.recitals {
            if &recital.party != owner && !parties.contains(&recital.party) {
                parties.push(recital.party.clone());
            }
        }
        parties
    }

    pub fn is_signed_by(&self, party: &PartyKey) -> bool {
        self.signatures.iter().any(|s| &s.signer == party)
    }

    /// Whether every recital party has signed.
    pub fn is_fully_signed(&self) -> bool {
        !self.recitals.is_empty() && self.recitals.iter().all(|r| self.is_signed_by(&r.party))
    }

    /// Adopt signatures from `other` that this side lacks. Returns how many were added.
    pub fn merge_signatures(&mut self, other: &SubEnvelope) -> usize {
        let mut added = 0;
        for signature in &other.signatures {
            if !self.is_signed_by(&signature.signer) {
                self.signatures.push(signature.clone());
                added += 1;
            }
        }
        added
    }

    /// Merge facts by name; a fact with an existing name replaces it.
    pub fn merge_outputs(&mut self, facts: &[Fact]) {
        for fact in facts {
            match self.outputs.iter_mut().find(|f| f.name == fact.name) {
                Some(existing) => *existing = fact.clone(),
                None => self.outputs.push(fact.clone()),
            }
        }
    }

    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.expiration.is_some_and(|deadline| deadline.has_passed(now))
    }
}

/// One timestamp per lifecycle phase.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseStamps {
    pub fragmented_at: Option<Timestamp>,
    pub inboxed_at: Option<Timestamp>,
    pub executed_at: Option<Timestamp>,
    pub outboxed_at: Option<Timestamp>,
    pub signed_at: Option<Timestamp>,
    pub chaincoded_at: Option<Timestamp>,
    pub indexed_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
}

impl PhaseStamps {
    fn slot(&mut self, phase: EnvelopeStatus) -> Option<&mut Option<Timestamp>> {
        match phase {
            EnvelopeStatus::Fragment => Some(&mut self.fragmented_at),
            EnvelopeStatus::Inbox => Some(&mut self.inboxed_at),
            EnvelopeStatus::Executed => Some(&mut self.executed_at),
            EnvelopeStatus::Outbox => Some(&mut self.outboxed_at),
            EnvelopeStatus::Signed => Some(&mut self.signed_at),
            EnvelopeStatus::Chaincode => Some(&mut self.chaincoded_at),
            EnvelopeStatus::Index => Some(&mut self.indexed_at),
            EnvelopeStatus::Complete => Some(&mut self.completed_at),
            EnvelopeStatus::Created | EnvelopeStatus::Error => None,
        }
    }

    /// Timestamp recorded for `phase`, if any.
    pub fn get(&self, phase: EnvelopeStatus) -> Option<Timestamp> {
        match phase {
            EnvelopeStatus::Fragment => self.fragmented_at,
            EnvelopeStatus::Inbox => self.inboxed_at,
            EnvelopeStatus::Executed => self.executed_at,
            EnvelopeStatus::Outbox => self.outboxed_at,
            EnvelopeStatus::Signed => self.signed_at,
            EnvelopeStatus::Chaincode => self.chaincoded_at,
            EnvelopeStatus::Index => self.indexed_at,
            EnvelopeStatus::Complete => self.completed_at,
            EnvelopeStatus::Created | EnvelopeStatus::Error => None,
        }
    }

    /// Record `at` for `phase`. Stamps never move backwards.
    pub fn set(&mut self, phase: EnvelopeStatus, at: Timestamp) {
        if let Some(slot) = self.slot(phase) {
            *slot = Some(slot.map_or(at, |prev| prev.max(at)));
        }
    }

    pub fn has(&self, phase: EnvelopeStatus) -> bool {
        self.get(phase).is_some()
    }
}

/// The full state document.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvelopeDocument {
    pub input: SubEnvelope,
    pub result: Option<SubEnvelope>,
    pub is_invoker: bool,
    pub stamps: PhaseStamps,
    pub read_at: Option<Timestamp>,
    pub error_at: Option<Timestamp>,
    pub chain_tx: Option<TxHash>,
}

impl EnvelopeDocument {
    pub fn new(input: SubEnvelope, is_invoker: bool) -> Self {
        Self {
            input,
            result: None,
            is_invoker,
            stamps: PhaseStamps::default(),
            read_at: None,
            error_at: None,
            chain_tx: None,
        }
    }

    /// The side phases are committed on: the result once it exists.
    pub fn current(&self) -> &SubEnvelope {
        self.result.as_ref().unwrap_or(&self.input)
    }

    pub fn current_mut(&mut self) -> &mut SubEnvelope {
        match self.result {
            Some(ref mut result) => result,
            None => &mut self.input,
        }
    }

    /// Phase recorded in the document.
    pub fn status(&self) -> EnvelopeStatus {
        self.current().status
    }

    /// Every attached error, input side first.
    pub fn errors(&self) -> impl Iterator<Item = &EnvelopeError> {
        self.input
            .errors
            .iter()
            .chain(self.result.iter().flat_map(|r| r.errors.iter()))
    }

    pub fn last_error(&self) -> Option<&EnvelopeError> {
        self.errors().max_by_key(|e| e.at)
    }
}
