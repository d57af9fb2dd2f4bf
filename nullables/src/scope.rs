//! Nullable scope lookup backed by a map the test fills in.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use saga_collab::{CollabError, ScopeLookup};
use saga_types::{PartyKey, Scope, ScopeId};

#[derive(Default)]
pub struct NullScopeLookup {
    scopes: Mutex<HashMap<ScopeId, Scope>>,
    failure: Mutex<Option<CollabError>>,
}

impl NullScopeLookup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_scope(&self, scope: Scope) {
        self.scopes.lock().unwrap().insert(scope.scope_id, scope);
    }

    /// Fail every lookup with `error` until cleared.
    pub fn set_failure(&self, error: Option<CollabError>) {
        *self.failure.lock().unwrap() = error;
    }

    fn lookup(&self, scope_id: &ScopeId) -> Result<Option<Scope>, CollabError> {
        if let Some(error) = self.failure.lock().unwrap().clone() {
            return Err(error);
        }
        Ok(self.scopes.lock().unwrap().get(scope_id).cloned())
    }
}

#[async_trait]
impl ScopeLookup for NullScopeLookup {
    async fn find_scope_by_owner_and_id(
        &self,
        owner: &PartyKey,
        scope_id: &ScopeId,
    ) -> Result<Option<Scope>, CollabError> {
        Ok(self
            .lookup(scope_id)?
            .filter(|scope| scope.owners.contains(owner)))
    }

    async fn fetch_scope(&self, scope_id: &ScopeId) -> Result<Option<Scope>, CollabError> {
        self.lookup(scope_id)
    }
}
