//! Chain-observed scope snapshots.

use saga_types::{ScopeId, ScopeSnapshot, SnapshotKey};

use crate::StoreError;

pub trait SnapshotReader {
    fn get_snapshot(&self, key: &SnapshotKey) -> Result<Option<ScopeSnapshot>, StoreError>;

    fn snapshots_for_scope(&self, scope: &ScopeId) -> Result<Vec<ScopeSnapshot>, StoreError>;
}

pub trait SnapshotWriter {
    fn put_snapshot(&mut self, snapshot: &ScopeSnapshot) -> Result<(), StoreError>;
}
