//! Envelope lifecycle status.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::TypesError;

/// Lifecycle phase of an envelope.
///
/// Phases are totally ordered; `Error` sits outside the order and absorbs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "&'static str", try_from = "String")]
pub enum EnvelopeStatus {
    /// Proposed locally, not yet sent to counter-parties.
    Created,
    /// Input delivered to counter-parties for signature.
    Fragment,
    /// Received from a peer; set by the inbound-delivery path.
    Inbox,
    /// Contract executed locally; a result exists.
    Executed,
    /// Signed result sent back to the invoker.
    Outbox,
    /// Every recital party has signed the result.
    Signed,
    /// Result submitted to the chain.
    Chaincode,
    /// Chain-confirmed scope observed and indexed.
    Index,
    /// Acknowledged by the owning party.
    Complete,
    /// Failed; terminal.
    Error,
}

impl EnvelopeStatus {
    /// All phases in lifecycle order (excluding `Error`).
    pub const ORDERED: [EnvelopeStatus; 9] = [
        Self::Created,
        Self::Fragment,
        Self::Inbox,
        Self::Executed,
        Self::Outbox,
        Self::Signed,
        Self::Chaincode,
        Self::Index,
        Self::Complete,
    ];

    /// Position in the lifecycle; `None` for `Error`.
    pub fn rank(&self) -> Option<u8> {
        Self::ORDERED
            .iter()
            .position(|s| s == self)
            .map(|p| p as u8)
    }

    /// The phase after this one, if any.
    pub fn next(&self) -> Option<EnvelopeStatus> {
        let rank = self.rank()? as usize;
        Self::ORDERED.get(rank + 1).copied()
    }

    /// Whether this status already lies strictly beyond `other` in the lifecycle.
    pub fn is_past(&self, other: EnvelopeStatus) -> bool {
        match (self.rank(), other.rank()) {
            (Some(a), Some(b)) => a > b,
            _ => false,
        }
    }

    /// Whether no further transition is possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Error)
    }

    /// Column name used in storage and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::Fragment => "FRAGMENT",
            Self::Inbox => "INBOX",
            Self::Executed => "EXECUTED",
            Self::Outbox => "OUTBOX",
            Self::Signed => "SIGNED",
            Self::Chaincode => "CHAINCODE",
            Self::Index => "INDEX",
            Self::Complete => "COMPLETE",
            Self::Error => "ERROR",
        }
    }
}

impl fmt::Display for EnvelopeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EnvelopeStatus {
    type Err = TypesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ORDERED
            .iter()
            .chain(std::iter::once(&Self::Error))
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
            .copied()
            .ok_or_else(|| TypesError::UnknownStatus(s.to_string()))
    }
}

serde_by_name!(EnvelopeStatus);
