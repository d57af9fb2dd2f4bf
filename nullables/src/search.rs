//! Nullable field extraction and search index.

use std::sync::Mutex;

use async_trait::async_trait;
use saga_collab::{CollabError, FieldExtractor, SearchDocument, SearchIndex};
use saga_types::{PartyKey, Scope};
use serde_json::Value;

/// Extracts a fixed set of fields: the scope id, the reading party and the
/// number of record groups.
#[derive(Default)]
pub struct NullFieldExtractor;

#[async_trait]
impl FieldExtractor for NullFieldExtractor {
    async fn extract_fields(
        &self,
        scope: &Scope,
        key_material: &PartyKey,
    ) -> Result<SearchDocument, CollabError> {
        let mut doc = SearchDocument::new();
        doc.insert("scope_id".into(), Value::String(scope.scope_id.to_string()));
        doc.insert("party".into(), Value::String(key_material.to_string()));
        doc.insert(
            "record_groups".into(),
            Value::from(scope.record_groups.len() as u64),
        );
        Ok(doc)
    }
}

/// One recorded search write.
#[derive(Clone, Debug, PartialEq)]
pub struct IndexedDocument {
    pub index: String,
    pub document_id: String,
    pub document: SearchDocument,
}

#[derive(Default)]
pub struct NullSearchIndex {
    writes: Mutex<Vec<IndexedDocument>>,
    failure: Mutex<Option<CollabError>>,
}

impl NullSearchIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn writes(&self) -> Vec<IndexedDocument> {
        self.writes.lock().unwrap().clone()
    }

    pub fn set_failure(&self, error: Option<CollabError>) {
        *self.failure.lock().unwrap() = error;
    }
}

#[async_trait]
impl SearchIndex for NullSearchIndex {
    async fn index_document(
        &self,
        index: &str,
        document_id: &str,
        document: SearchDocument,
    ) -> Result<(), CollabError> {
        if let Some(error) = self.failure.lock().unwrap().clone() {
            return Err(error);
        }
        self.writes.lock().unwrap().push(IndexedDocument {
            index: index.to_string(),
            document_id: document_id.to_string(),
            document,
        });
        Ok(())
    }
}
