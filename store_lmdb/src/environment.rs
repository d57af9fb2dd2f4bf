//! LMDB environment setup.

use std::fs;
use std::path::Path;

use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions};

use saga_store::{ReadTxn, SagaStore, StoreError, WriteTxn};

use crate::txn::{LmdbReadTxn, LmdbWriteTxn};
use crate::LmdbError;

/// Database names, in creation order.
pub const DATABASES: &[&str] = &[
    "envelope",
    "envelope_by_execution",
    "envelope_by_group",
    "envelope_by_scope",
    "event",
    "event_stream",
    "index_scope",
    "transaction_status",
];

/// Every database handle in the environment.
#[derive(Clone, Copy)]
pub(crate) struct Databases {
    /// envelope id -> envelope row
    pub envelope: Database<Bytes, Bytes>,
    /// execution id ++ envelope id -> ()
    pub by_execution: Database<Bytes, Bytes>,
    /// group id ++ envelope id -> ()
    pub by_group: Database<Bytes, Bytes>,
    /// scope id ++ envelope id -> ()
    pub by_scope: Database<Bytes, Bytes>,
    /// envelope id ++ event type code -> dispatch event
    pub event: Database<Bytes, Bytes>,
    /// consumer id -> checkpoint
    pub event_stream: Database<Bytes, Bytes>,
    /// snapshot key -> scope snapshot
    pub index_scope: Database<Bytes, Bytes>,
    /// tx hash -> pending transaction
    pub transaction_status: Database<Bytes, Bytes>,
}

/// Wraps the LMDB environment and all database handles.
pub struct LmdbEnvironment {
    env: Env,
    dbs: Databases,
}

impl LmdbEnvironment {
    /// Open or create an LMDB environment at the given path.
    pub fn open(path: &Path, map_size: usize) -> Result<Self, LmdbError> {
        fs::create_dir_all(path).map_err(|e| LmdbError::Heed(e.to_string()))?;

        // SAFETY: the environment is opened once per process for this path and
        // the memory map is never handed out beyond heed's own borrows.
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(map_size)
                .max_dbs(DATABASES.len() as u32)
                .open(path)?
        };

        let mut wtxn = env.write_txn()?;
        let mut create = |name: &str| env.create_database::<Bytes, Bytes>(&mut wtxn, Some(name));
        let dbs = Databases {
            envelope: create("envelope")?,
            by_execution: create("envelope_by_execution")?,
            by_group: create("envelope_by_group")?,
            by_scope: create("envelope_by_scope")?,
            event: create("event")?,
            event_stream: create("event_stream")?,
            index_scope: create("index_scope")?,
            transaction_status: create("transaction_status")?,
        };
        wtxn.commit()?;

        tracing::info!(path = %path.display(), map_size, "opened LMDB environment");
        Ok(Self { env, dbs })
    }

    pub fn env(&self) -> &Env {
        &self.env
    }

    pub fn read_txn(&self) -> Result<LmdbReadTxn<'_>, LmdbError> {
        Ok(LmdbReadTxn::new(self.env.read_txn()?, self.dbs))
    }

    pub fn write_txn(&self) -> Result<LmdbWriteTxn<'_>, LmdbError> {
        Ok(LmdbWriteTxn::new(self.env.write_txn()?, self.dbs))
    }
}

impl SagaStore for LmdbEnvironment {
    fn read(&self) -> Result<Box<dyn ReadTxn + '_>, StoreError> {
        Ok(Box::new(self.read_txn()?))
    }

    fn write(&self) -> Result<Box<dyn WriteTxn + '_>, StoreError> {
        Ok(Box::new(self.write_txn()?))
    }
}
