use async_trait::async_trait;
use saga_types::{PartyKey, Scope, ScopeId};

use crate::CollabError;

/// Read access to chain-held scopes.
#[async_trait]
pub trait ScopeLookup: Send + Sync {
    /// The scope as visible to `owner`, if the chain holds it.
    async fn find_scope_by_owner_and_id(
        &self,
        owner: &PartyKey,
        scope_id: &ScopeId,
    ) -> Result<Option<Scope>, CollabError>;

    /// The scope as of the latest block.
    async fn fetch_scope(&self, scope_id: &ScopeId) -> Result<Option<Scope>, CollabError>;
}
