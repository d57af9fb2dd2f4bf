//! LMDB storage backend for the envelope saga.
//!
//! Implements the `saga-store` traits using the `heed` LMDB bindings. Each
//! table maps to one LMDB database within a single environment; secondary
//! indexes are separate databases with composite keys and empty values.

pub mod environment;
pub mod error;
pub mod integrity;
mod tables;
mod txn;

pub use environment::LmdbEnvironment;
pub use error::LmdbError;
pub use integrity::{check_data_dir, check_integrity, IntegrityReport};
pub use txn::{LmdbReadTxn, LmdbWriteTxn};
