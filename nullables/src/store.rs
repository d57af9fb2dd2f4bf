//! Nullable store: thread-safe in-memory transactional storage for testing.
//!
//! Reads see a snapshot taken when the transaction began. A write
//! transaction holds the store lock for its whole lifetime and works on a
//! staged copy that replaces the live tables on commit, so dropping it rolls
//! everything back.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use saga_store::{
    CheckpointReader, CheckpointWriter, EnvelopeReader, EnvelopeWriter, EventReader, EventWriter,
    ReadTxn, SagaStore, SnapshotReader, SnapshotWriter, StoreError, TransactionReader,
    TransactionWriter, WriteTxn,
};
use saga_types::{
    DispatchEvent, Envelope, EnvelopeId, EventType, ExecutionId, GroupId, PendingTransaction,
    ScopeId, ScopeSnapshot, SnapshotKey, StreamCheckpoint, TxHash,
};

#[derive(Clone, Default)]
struct Tables {
    envelopes: BTreeMap<EnvelopeId, Envelope>,
    events: BTreeMap<(EnvelopeId, EventType), DispatchEvent>,
    checkpoints: HashMap<String, StreamCheckpoint>,
    snapshots: BTreeMap<SnapshotKey, ScopeSnapshot>,
    transactions: BTreeMap<TxHash, PendingTransaction>,
}

impl Tables {
    fn envelopes_where(&self, pred: impl Fn(&Envelope) -> bool) -> Vec<Envelope> {
        self.envelopes.values().filter(|e| pred(e)).cloned().collect()
    }
}

/// An in-memory store for testing.
/// Thread-safe for use with tokio's multi-threaded runtime.
#[derive(Default)]
pub struct NullStore {
    tables: Mutex<Tables>,
    commits: AtomicUsize,
    fail_next_commit: AtomicBool,
}

impl NullStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of committed write transactions.
    pub fn commit_count(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    /// Make the next commit fail with a backend error, discarding its writes.
    pub fn fail_next_commit(&self) {
        self.fail_next_commit.store(true, Ordering::SeqCst);
    }

    fn lock(&self) -> Result<MutexGuard<'_, Tables>, StoreError> {
        self.tables
            .lock()
            .map_err(|_| StoreError::Backend("null store lock poisoned".into()))
    }
}

impl SagaStore for NullStore {
    fn read(&self) -> Result<Box<dyn ReadTxn + '_>, StoreError> {
        let snapshot = self.lock()?.clone();
        Ok(Box::new(NullReadTxn { tables: snapshot }))
    }

    fn write(&self) -> Result<Box<dyn WriteTxn + '_>, StoreError> {
        let live = self.lock()?;
        let staged = live.clone();
        Ok(Box::new(NullWriteTxn {
            store: self,
            live,
            staged,
        }))
    }
}

struct NullReadTxn {
    tables: Tables,
}

impl NullReadTxn {
    fn tables(&self) -> &Tables {
        &self.tables
    }
}

struct NullWriteTxn<'a> {
    store: &'a NullStore,
    live: MutexGuard<'a, Tables>,
    staged: Tables,
}

impl NullWriteTxn<'_> {
    fn tables(&self) -> &Tables {
        &self.staged
    }
}

macro_rules! impl_readers {
    ($ty:ty) => {
        impl EnvelopeReader for $ty {
            fn get_envelope(&self, id: &EnvelopeId) -> Result<Option<Envelope>, StoreError> {
                Ok(self.tables().envelopes.get(id).cloned())
            }

            fn envelopes_by_execution(
                &self,
                execution: &ExecutionId,
            ) -> Result<Vec<Envelope>, StoreError> {
                Ok(self
                    .tables()
                    .envelopes_where(|e| &e.execution_id == execution))
            }

            fn envelopes_by_group(&self, group: &GroupId) -> Result<Vec<Envelope>, StoreError> {
                Ok(self.tables().envelopes_where(|e| &e.group_id == group))
            }

            fn envelopes_by_scope(&self, scope: &ScopeId) -> Result<Vec<Envelope>, StoreError> {
                Ok(self.tables().envelopes_where(|e| &e.scope_id == scope))
            }

            fn envelope_count(&self) -> Result<u64, StoreError> {
                Ok(self.tables().envelopes.len() as u64)
            }
        }

        impl EventReader for $ty {
            fn get_event(
                &self,
                envelope: &EnvelopeId,
                event_type: EventType,
            ) -> Result<Option<DispatchEvent>, StoreError> {
                Ok(self.tables().events.get(&(*envelope, event_type)).cloned())
            }

            fn events_for_envelope(
                &self,
                envelope: &EnvelopeId,
            ) -> Result<Vec<DispatchEvent>, StoreError> {
                Ok(self
                    .tables()
                    .events
                    .values()
                    .filter(|e| &e.envelope_id == envelope)
                    .cloned()
                    .collect())
            }

            fn iter_events(&self) -> Result<Vec<DispatchEvent>, StoreError> {
                Ok(self.tables().events.values().cloned().collect())
            }
        }

        impl CheckpointReader for $ty {
            fn get_checkpoint(
                &self,
                consumer: &str,
            ) -> Result<Option<StreamCheckpoint>, StoreError> {
                Ok(self.tables().checkpoints.get(consumer).cloned())
            }
        }

        impl SnapshotReader for $ty {
            fn get_snapshot(&self, key: &SnapshotKey) -> Result<Option<ScopeSnapshot>, StoreError> {
                Ok(self.tables().snapshots.get(key).cloned())
            }

            fn snapshots_for_scope(
                &self,
                scope: &ScopeId,
            ) -> Result<Vec<ScopeSnapshot>, StoreError> {
                Ok(self
                    .tables()
                    .snapshots
                    .values()
                    .filter(|s| &s.key.scope_id == scope)
                    .cloned()
                    .collect())
            }
        }

        impl TransactionReader for $ty {
            fn get_transaction(
                &self,
                hash: &TxHash,
            ) -> Result<Option<PendingTransaction>, StoreError> {
                Ok(self.tables().transactions.get(hash).cloned())
            }

            fn iter_transactions(&self) -> Result<Vec<PendingTransaction>, StoreError> {
                Ok(self.tables().transactions.values().cloned().collect())
            }
        }

        impl ReadTxn for $ty {}
    };
}

impl_readers!(NullReadTxn);
impl_readers!(NullWriteTxn<'_>);

impl EnvelopeWriter for NullWriteTxn<'_> {
    fn write_envelope_row(&mut self, envelope: &Envelope) -> Result<(), StoreError> {
        if let Some(existing) = self.staged.envelopes.get(&envelope.id) {
            if existing.execution_id != envelope.execution_id
                || existing.group_id != envelope.group_id
                || existing.scope_id != envelope.scope_id
                || existing.owner_key != envelope.owner_key
            {
                return Err(StoreError::Immutable(envelope.id));
            }
        }
        self.staged.envelopes.insert(envelope.id, envelope.clone());
        Ok(())
    }
}

impl EventWriter for NullWriteTxn<'_> {
    fn put_event(&mut self, event: &DispatchEvent) -> Result<(), StoreError> {
        self.staged
            .events
            .insert((event.envelope_id, event.event_type), event.clone());
        Ok(())
    }
}

impl CheckpointWriter for NullWriteTxn<'_> {
    fn put_checkpoint(&mut self, checkpoint: &StreamCheckpoint) -> Result<(), StoreError> {
        self.staged
            .checkpoints
            .insert(checkpoint.id.clone(), checkpoint.clone());
        Ok(())
    }
}

impl SnapshotWriter for NullWriteTxn<'_> {
    fn put_snapshot(&mut self, snapshot: &ScopeSnapshot) -> Result<(), StoreError> {
        self.staged.snapshots.insert(snapshot.key, snapshot.clone());
        Ok(())
    }
}

impl TransactionWriter for NullWriteTxn<'_> {
    fn put_transaction(&mut self, tx: &PendingTransaction) -> Result<(), StoreError> {
        self.staged.transactions.insert(tx.tx_hash, tx.clone());
        Ok(())
    }
}

impl WriteTxn for NullWriteTxn<'_> {
    fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let NullWriteTxn {
            store,
            mut live,
            staged,
        } = *self;
        if store.fail_next_commit.swap(false, Ordering::SeqCst) {
            return Err(StoreError::Backend("injected commit failure".into()));
        }
        *live = staged;
        store.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
