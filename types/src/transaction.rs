//! Chain transactions submitted on behalf of envelopes.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::{ExecutionId, Timestamp, TxHash, TypesError};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "&'static str", try_from = "String")]
pub enum TxStatus {
    Pending,
    Error,
    Success,
}

impl TxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Error => "ERROR",
            Self::Success => "SUCCESS",
        }
    }
}

impl fmt::Display for TxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TxStatus {
    type Err = TypesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [Self::Pending, Self::Error, Self::Success]
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| TypesError::UnknownTxStatus(s.to_string()))
    }
}

/// A submitted chain transaction and the executions it settles.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingTransaction {
    pub tx_hash: TxHash,
    pub execution_ids: Vec<ExecutionId>,
    pub status: TxStatus,
    pub raw_log: Option<String>,
    pub submitted_at: Timestamp,
    pub updated_at: Timestamp,
}

impl PendingTransaction {
    pub fn new(tx_hash: TxHash, execution_ids: Vec<ExecutionId>, now: Timestamp) -> Self {
        Self {
            tx_hash,
            execution_ids,
            status: TxStatus::Pending,
            raw_log: None,
            submitted_at: now,
            updated_at: now,
        }
    }

    /// Record the chain outcome. Only a pending transaction settles.
    pub fn settle(&mut self, status: TxStatus, raw_log: Option<String>, now: Timestamp) -> bool {
        if self.status != TxStatus::Pending || status == TxStatus::Pending {
            return false;
        }
        self.status = status;
        self.raw_log = raw_log;
        self.updated_at = now;
        true
    }

    pub fn is_timed_out(&self, now: Timestamp, timeout: Duration) -> bool {
        self.status == TxStatus::Pending && self.submitted_at.elapsed_since(now) >= timeout
    }
}

serde_by_name!(TxStatus);
