use async_trait::async_trait;
use saga_types::{PartyKey, Scope};
use serde_json::{Map, Value};

use crate::CollabError;

/// A flat search document.
pub type SearchDocument = Map<String, Value>;

/// Turns a chain scope into searchable fields, decrypting with the owner's
/// key material.
#[async_trait]
pub trait FieldExtractor: Send + Sync {
    async fn extract_fields(
        &self,
        scope: &Scope,
        key_material: &PartyKey,
    ) -> Result<SearchDocument, CollabError>;
}

#[async_trait]
pub trait SearchIndex: Send + Sync {
    /// Create or replace `document_id` in `index`.
    async fn index_document(
        &self,
        index: &str,
        document_id: &str,
        document: SearchDocument,
    ) -> Result<(), CollabError>;
}
