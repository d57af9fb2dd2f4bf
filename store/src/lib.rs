//! Abstract storage traits for the envelope saga.
//!
//! Every storage backend (LMDB, in-memory for testing) implements these
//! traits. The rest of the codebase depends only on the traits.
//!
//! All access goes through transactions. A [`WriteTxn`] is exclusive: a
//! backend admits one open write transaction at a time, which serializes
//! concurrent handlers touching the same rows. Dropping a write transaction
//! without calling [`WriteTxn::commit`] discards every staged change.
//!
//! Transactions are not `Send` and must not be held across an `.await`.

pub mod checkpoint;
pub mod envelope;
pub mod error;
pub mod event;
pub mod snapshot;
pub mod transaction;

pub use checkpoint::{CheckpointReader, CheckpointWriter};
pub use envelope::{EnvelopeReader, EnvelopeWriter};
pub use error::StoreError;
pub use event::{EventReader, EventWriter};
pub use snapshot::{SnapshotReader, SnapshotWriter};
pub use transaction::{TransactionReader, TransactionWriter};

/// Read access to every table, as of the moment the transaction began.
pub trait ReadTxn:
    EnvelopeReader + EventReader + CheckpointReader + SnapshotReader + TransactionReader
{
}

/// Exclusive read-write access to every table.
pub trait WriteTxn:
    ReadTxn + EnvelopeWriter + EventWriter + CheckpointWriter + SnapshotWriter + TransactionWriter
{
    /// Make every staged change durable, atomically.
    fn commit(self: Box<Self>) -> Result<(), StoreError>;
}

/// A transactional store.
pub trait SagaStore: Send + Sync {
    fn read(&self) -> Result<Box<dyn ReadTxn + '_>, StoreError>;

    /// Begin the exclusive write transaction, blocking until it is available.
    fn write(&self) -> Result<Box<dyn WriteTxn + '_>, StoreError>;
}
