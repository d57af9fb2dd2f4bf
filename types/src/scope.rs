//! Chain-side scopes and the snapshots the checkpointer records of them.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::{ExecutionId, Fact, GroupId, PartyKey, ScopeId, Timestamp, TxHash, TypesError};

/// A set of facts written by one execution, as recorded on chain.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordGroup {
    pub group_id: GroupId,
    pub execution_id: ExecutionId,
    pub contract: String,
    pub facts: Vec<Fact>,
    pub created_at: Timestamp,
    pub updated_at: Option<Timestamp>,
}

impl RecordGroup {
    /// Most recent of creation and last update.
    pub fn touched_at(&self) -> Timestamp {
        self.updated_at.map_or(self.created_at, |u| u.max(self.created_at))
    }
}

/// A chain scope: owners plus the record groups written into it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scope {
    pub scope_id: ScopeId,
    pub owners: Vec<PartyKey>,
    pub record_groups: Vec<RecordGroup>,
}

impl Scope {
    pub fn new(scope_id: ScopeId, owners: Vec<PartyKey>) -> Self {
        Self {
            scope_id,
            owners,
            record_groups: Vec::new(),
        }
    }

    pub fn record_group(&self, group_id: &GroupId) -> Option<&RecordGroup> {
        self.record_groups.iter().find(|g| &g.group_id == group_id)
    }

    /// The most recently created-or-updated record group.
    pub fn latest_group(&self) -> Option<&RecordGroup> {
        self.record_groups.iter().max_by_key(|g| g.touched_at())
    }

    /// Facts of `group_id`, empty when the group is absent.
    pub fn facts_for(&self, group_id: &GroupId) -> &[Fact] {
        self.record_group(group_id)
            .map(|g| g.facts.as_slice())
            .unwrap_or(&[])
    }
}

/// The kind of mutation a chain event reports for a scope.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "&'static str", try_from = "String")]
pub enum ScopeEventKind {
    Created,
    Updated,
    Ownership,
}

impl ScopeEventKind {
    pub const ALL: [ScopeEventKind; 3] = [Self::Created, Self::Updated, Self::Ownership];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::Updated => "UPDATED",
            Self::Ownership => "OWNERSHIP",
        }
    }

    /// Chain event type that reports this mutation.
    pub fn chain_event_type(&self) -> &'static str {
        match self {
            Self::Created => "scope_created",
            Self::Updated => "scope_updated",
            Self::Ownership => "scope_ownership",
        }
    }

    /// Map a chain event type back to its mutation kind.
    pub fn from_chain_event(event_type: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|k| k.chain_event_type() == event_type)
    }

    fn code(&self) -> u8 {
        match self {
            Self::Created => 1,
            Self::Updated => 2,
            Self::Ownership => 3,
        }
    }

    fn from_code(code: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.code() == code)
    }
}

impl fmt::Display for ScopeEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScopeEventKind {
    type Err = TypesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|k| k.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| TypesError::UnknownScopeEvent(s.to_string()))
    }
}

/// Identity of one observed scope mutation: the same transaction reporting the
/// same kind of change for the same scope is recorded once.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SnapshotKey {
    pub scope_id: ScopeId,
    pub tx_hash: TxHash,
    pub kind: ScopeEventKind,
}

impl SnapshotKey {
    pub const LEN: usize = 16 + 32 + 1;

    pub fn new(scope_id: ScopeId, tx_hash: TxHash, kind: ScopeEventKind) -> Self {
        Self {
            scope_id,
            tx_hash,
            kind,
        }
    }

    /// Storage key: scope id, then tx hash, then kind tag.
    pub fn to_bytes(&self) -> [u8; Self::LEN] {
        let mut out = [0u8; Self::LEN];
        out[..16].copy_from_slice(self.scope_id.as_bytes());
        out[16..48].copy_from_slice(self.tx_hash.as_bytes());
        out[48] = self.kind.code();
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TypesError> {
        if bytes.len() != Self::LEN {
            return Err(TypesError::InvalidSnapshotKey(bytes.len()));
        }
        let mut scope = [0u8; 16];
        scope.copy_from_slice(&bytes[..16]);
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&bytes[16..48]);
        let kind = ScopeEventKind::from_code(bytes[48])
            .ok_or_else(|| TypesError::UnknownScopeEvent(bytes[48].to_string()))?;
        Ok(Self::new(ScopeId::from_bytes(scope), TxHash::new(hash), kind))
    }
}

impl fmt::Display for SnapshotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.scope_id, self.tx_hash, self.kind)
    }
}

/// A chain-observed scope mutation awaiting indexing.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeSnapshot {
    pub key: SnapshotKey,
    pub block_height: u64,
    /// The group the mutation wrote; absent for ownership changes.
    pub group_id: Option<GroupId>,
    pub scope: Scope,
    pub indexed: bool,
    pub created_at: Timestamp,
}

impl ScopeSnapshot {
    pub fn kind(&self) -> ScopeEventKind {
        self.key.kind
    }

    /// Select the record group this mutation concerns.
    ///
    /// Ownership changes carry no group and resolve to the most recently
    /// touched group. Creates and updates must name a group present in the
    /// observed scope.
    pub fn relevant_group(&self) -> Result<&RecordGroup, TypesError> {
        match (self.key.kind, &self.group_id) {
            (ScopeEventKind::Ownership, _) | (_, None) => self
                .scope
                .latest_group()
                .ok_or_else(|| TypesError::ScopeEmpty(self.scope.scope_id.to_string())),
            (_, Some(group_id)) => {
                self.scope
                    .record_group(group_id)
                    .ok_or_else(|| TypesError::RecordGroupMissing {
                        scope: self.scope.scope_id.to_string(),
                        group: group_id.to_string(),
                    })
            }
        }
    }
}

serde_by_name!(ScopeEventKind);
