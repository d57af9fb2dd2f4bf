//! Read and write transaction handles implementing the store traits.
//!
//! A write transaction that is dropped without [`WriteTxn::commit`] aborts,
//! rolling back everything staged in it.

use heed::{RoTxn, RwTxn};

use saga_store::{
    CheckpointReader, CheckpointWriter, EnvelopeReader, EnvelopeWriter, EventReader, EventWriter,
    ReadTxn, SnapshotReader, SnapshotWriter, StoreError, TransactionReader, TransactionWriter,
    WriteTxn,
};
use saga_types::{
    DispatchEvent, Envelope, EnvelopeId, EventType, ExecutionId, GroupId, PendingTransaction,
    ScopeId, ScopeSnapshot, SnapshotKey, StreamCheckpoint, TxHash,
};

use crate::environment::Databases;
use crate::tables;

pub struct LmdbReadTxn<'e> {
    txn: RoTxn<'e>,
    dbs: Databases,
}

impl<'e> LmdbReadTxn<'e> {
    pub(crate) fn new(txn: RoTxn<'e>, dbs: Databases) -> Self {
        Self { txn, dbs }
    }

    fn ro(&self) -> &RoTxn<'e> {
        &self.txn
    }
}

pub struct LmdbWriteTxn<'e> {
    txn: RwTxn<'e>,
    dbs: Databases,
}

impl<'e> LmdbWriteTxn<'e> {
    pub(crate) fn new(txn: RwTxn<'e>, dbs: Databases) -> Self {
        Self { txn, dbs }
    }

    fn ro(&self) -> &RoTxn<'e> {
        &self.txn
    }
}

/// Implement every reader trait by delegating to `tables` through `ro()`.
macro_rules! impl_readers {
    ($ty:ident) => {
        impl EnvelopeReader for $ty<'_> {
            fn get_envelope(&self, id: &EnvelopeId) -> Result<Option<Envelope>, StoreError> {
                Ok(tables::get_envelope(self.ro(), &self.dbs, id)?)
            }

            fn envelopes_by_execution(
                &self,
                execution: &ExecutionId,
            ) -> Result<Vec<Envelope>, StoreError> {
                Ok(tables::envelopes_by_index(
                    self.ro(),
                    &self.dbs,
                    self.dbs.by_execution,
                    "envelope_by_execution",
                    execution.as_bytes(),
                )?)
            }

            fn envelopes_by_group(&self, group: &GroupId) -> Result<Vec<Envelope>, StoreError> {
                Ok(tables::envelopes_by_index(
                    self.ro(),
                    &self.dbs,
                    self.dbs.by_group,
                    "envelope_by_group",
                    group.as_bytes(),
                )?)
            }

            fn envelopes_by_scope(&self, scope: &ScopeId) -> Result<Vec<Envelope>, StoreError> {
                Ok(tables::envelopes_by_index(
                    self.ro(),
                    &self.dbs,
                    self.dbs.by_scope,
                    "envelope_by_scope",
                    scope.as_bytes(),
                )?)
            }

            fn envelope_count(&self) -> Result<u64, StoreError> {
                Ok(tables::envelope_count(self.ro(), &self.dbs)?)
            }
        }

        impl EventReader for $ty<'_> {
            fn get_event(
                &self,
                envelope: &EnvelopeId,
                event_type: EventType,
            ) -> Result<Option<DispatchEvent>, StoreError> {
                Ok(tables::get_event(self.ro(), &self.dbs, envelope, event_type)?)
            }

            fn events_for_envelope(
                &self,
                envelope: &EnvelopeId,
            ) -> Result<Vec<DispatchEvent>, StoreError> {
                Ok(tables::events_for_envelope(self.ro(), &self.dbs, envelope)?)
            }

            fn iter_events(&self) -> Result<Vec<DispatchEvent>, StoreError> {
                Ok(tables::iter_events(self.ro(), &self.dbs)?)
            }
        }

        impl CheckpointReader for $ty<'_> {
            fn get_checkpoint(
                &self,
                consumer: &str,
            ) -> Result<Option<StreamCheckpoint>, StoreError> {
                Ok(tables::get_checkpoint(self.ro(), &self.dbs, consumer)?)
            }
        }

        impl SnapshotReader for $ty<'_> {
            fn get_snapshot(&self, key: &SnapshotKey) -> Result<Option<ScopeSnapshot>, StoreError> {
                Ok(tables::get_snapshot(self.ro(), &self.dbs, key)?)
            }

            fn snapshots_for_scope(
                &self,
                scope: &ScopeId,
            ) -> Result<Vec<ScopeSnapshot>, StoreError> {
                Ok(tables::snapshots_for_scope(self.ro(), &self.dbs, scope)?)
            }
        }

        impl TransactionReader for $ty<'_> {
            fn get_transaction(
                &self,
                hash: &TxHash,
            ) -> Result<Option<PendingTransaction>, StoreError> {
                Ok(tables::get_transaction(self.ro(), &self.dbs, hash)?)
            }

            fn iter_transactions(&self) -> Result<Vec<PendingTransaction>, StoreError> {
                Ok(tables::iter_transactions(self.ro(), &self.dbs)?)
            }
        }

        impl ReadTxn for $ty<'_> {}
    };
}

impl_readers!(LmdbReadTxn);
impl_readers!(LmdbWriteTxn);

impl EnvelopeWriter for LmdbWriteTxn<'_> {
    fn write_envelope_row(&mut self, envelope: &Envelope) -> Result<(), StoreError> {
        if let Some(existing) = tables::get_envelope(self.ro(), &self.dbs, &envelope.id)? {
            if existing.execution_id != envelope.execution_id
                || existing.group_id != envelope.group_id
                || existing.scope_id != envelope.scope_id
                || existing.owner_key != envelope.owner_key
            {
                return Err(StoreError::Immutable(envelope.id));
            }
        }
        Ok(tables::put_envelope(&mut self.txn, &self.dbs, envelope)?)
    }
}

impl EventWriter for LmdbWriteTxn<'_> {
    fn put_event(&mut self, event: &DispatchEvent) -> Result<(), StoreError> {
        Ok(tables::put_event(&mut self.txn, &self.dbs, event)?)
    }
}

impl CheckpointWriter for LmdbWriteTxn<'_> {
    fn put_checkpoint(&mut self, checkpoint: &StreamCheckpoint) -> Result<(), StoreError> {
        Ok(tables::put_checkpoint(&mut self.txn, &self.dbs, checkpoint)?)
    }
}

impl SnapshotWriter for LmdbWriteTxn<'_> {
    fn put_snapshot(&mut self, snapshot: &ScopeSnapshot) -> Result<(), StoreError> {
        Ok(tables::put_snapshot(&mut self.txn, &self.dbs, snapshot)?)
    }
}

impl TransactionWriter for LmdbWriteTxn<'_> {
    fn put_transaction(&mut self, tx: &PendingTransaction) -> Result<(), StoreError> {
        Ok(tables::put_transaction(&mut self.txn, &self.dbs, tx)?)
    }
}

impl WriteTxn for LmdbWriteTxn<'_> {
    fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.txn.commit().map_err(crate::LmdbError::from)?;
        Ok(())
    }
}
