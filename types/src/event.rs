//! Dispatch events: durable single-slot triggers per (envelope, kind).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

use crate::{EnvelopeId, SnapshotKey, Timestamp, TypesError};

/// Kinds of pending work, one handler per kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "&'static str", try_from = "String")]
pub enum EventType {
    EnvelopeFragment,
    EnvelopeChaincode,
    EnvelopeError,
    ScopeIndex,
    ScopeIndexFragment,
}

impl EventType {
    pub const ALL: [EventType; 5] = [
        Self::EnvelopeFragment,
        Self::EnvelopeChaincode,
        Self::EnvelopeError,
        Self::ScopeIndex,
        Self::ScopeIndexFragment,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EnvelopeFragment => "ENVELOPE_FRAGMENT",
            Self::EnvelopeChaincode => "ENVELOPE_CHAINCODE",
            Self::EnvelopeError => "ENVELOPE_ERROR",
            Self::ScopeIndex => "SCOPE_INDEX",
            Self::ScopeIndexFragment => "SCOPE_INDEX_FRAGMENT",
        }
    }

    /// Single-byte tag used as the kind suffix of storage keys.
    pub fn code(&self) -> u8 {
        match self {
            Self::EnvelopeFragment => 1,
            Self::EnvelopeChaincode => 2,
            Self::EnvelopeError => 3,
            Self::ScopeIndex => 4,
            Self::ScopeIndexFragment => 5,
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = TypesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s))
            .copied()
            .ok_or_else(|| TypesError::UnknownEventType(s.to_string()))
    }
}

/// Outcome of handling a trigger.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "&'static str", try_from = "String")]
pub enum EventStatus {
    Created,
    Complete,
    Error,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::Complete => "COMPLETE",
            Self::Error => "ERROR",
        }
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventStatus {
    type Err = TypesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [Self::Created, Self::Complete, Self::Error]
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| TypesError::UnknownEventStatus(s.to_string()))
    }
}

/// What the handler needs beyond the envelope id.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventPayload {
    Envelope,
    Snapshot(SnapshotKey),
}

/// Why the last handling attempt failed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchFailure {
    pub message: String,
    /// Whether re-firing the trigger can succeed.
    pub retryable: bool,
}

/// The latest trigger of one kind for one envelope.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchEvent {
    /// Identity of this trigger instance; a newer upsert replaces it.
    pub id: Uuid,
    pub envelope_id: EnvelopeId,
    pub event_type: EventType,
    pub payload: EventPayload,
    pub status: EventStatus,
    pub attempts: u32,
    pub failure: Option<DispatchFailure>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl DispatchEvent {
    pub fn new(
        envelope_id: EnvelopeId,
        event_type: EventType,
        payload: EventPayload,
        now: Timestamp,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            envelope_id,
            event_type,
            payload,
            status: EventStatus::Created,
            attempts: 0,
            failure: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn envelope(envelope_id: EnvelopeId, event_type: EventType, now: Timestamp) -> Self {
        Self::new(envelope_id, event_type, EventPayload::Envelope, now)
    }

    /// Snapshot key carried by the payload, if any.
    pub fn snapshot_key(&self) -> Option<&SnapshotKey> {
        match &self.payload {
            EventPayload::Snapshot(key) => Some(key),
            EventPayload::Envelope => None,
        }
    }

    /// Still unhandled after `after` has elapsed since the last update.
    pub fn is_stuck(&self, now: Timestamp, after: Duration) -> bool {
        self.status == EventStatus::Created && self.updated_at.elapsed_since(now) >= after
    }

    /// Failed with a failure that re-firing may fix.
    pub fn is_retryable(&self) -> bool {
        self.status == EventStatus::Error && self.failure.as_ref().is_some_and(|f| f.retryable)
    }
}

serde_by_name!(EventType);
serde_by_name!(EventStatus);
