//! Fundamental types for the envelope saga.
//!
//! This crate defines the types shared across every other crate in the workspace:
//! identifiers, timestamps, the envelope row and its state document, dispatch
//! events, chain-observed scope snapshots, stream checkpoints and pending chain
//! transactions.

#[macro_use]
mod macros;

pub mod checkpoint;
pub mod clock;
pub mod document;
pub mod envelope;
pub mod error;
pub mod event;
pub mod hash;
pub mod ids;
pub mod scope;
pub mod status;
pub mod time;
pub mod transaction;

pub use checkpoint::StreamCheckpoint;
pub use clock::{Clock, SystemClock};
pub use document::{
    EnvelopeDocument, EnvelopeError, EnvelopeErrorKind, Fact, PartySignature, PhaseStamps,
    Recital, SubEnvelope,
};
pub use envelope::{Envelope, MirrorMismatch};
pub use error::TypesError;
pub use event::{DispatchEvent, DispatchFailure, EventPayload, EventStatus, EventType};
pub use hash::TxHash;
pub use ids::{EnvelopeId, ExecutionId, GroupId, PartyKey, ScopeId};
pub use scope::{RecordGroup, Scope, ScopeEventKind, ScopeSnapshot, SnapshotKey};
pub use status::EnvelopeStatus;
pub use time::Timestamp;
pub use transaction::{PendingTransaction, TxStatus};
