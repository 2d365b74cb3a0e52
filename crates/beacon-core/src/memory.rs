//! In-process store.
//!
//! Mirrors the bulk semantics of a search index closely enough for tests and
//! single-node deployments: upsert by id, 404 on deleting an absent document,
//! 400 on a body that is not a JSON object.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use serde_json::Value;
use std::collections::HashMap;

use crate::store::{
    BulkAction, BulkItemResponse, BulkOperation, ErrorCause, IndexCreation, IndexStore,
    StoreError,
};

#[derive(Debug)]
struct MemoryIndex {
    mappings: Value,
    documents: HashMap<String, Bytes>,
}

/// An in-memory index store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    indices: DashMap<String, MemoryIndex>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of documents in an index.
    #[must_use]
    pub fn document_count(&self, index: &str) -> usize {
        self.indices
            .get(index)
            .map(|entry| entry.documents.len())
            .unwrap_or(0)
    }

    fn apply(index: &mut MemoryIndex, op: &BulkOperation) -> BulkItemResponse {
        let id = op.document_id.clone();
        match op.action {
            BulkAction::Index => {
                let valid = op
                    .body
                    .as_deref()
                    .and_then(|body| serde_json::from_slice::<Value>(body).ok())
                    .is_some_and(|value| value.is_object());
                if !valid {
                    return BulkItemResponse {
                        id,
                        status: 400,
                        result: None,
                        error: Some(ErrorCause {
                            kind: "mapper_parsing_exception".into(),
                            reason: Some("document source must be a JSON object".into()),
                        }),
                    };
                }
                let body = op.body.clone().unwrap_or_default();
                let (status, result) = match index.documents.insert(id.clone(), body) {
                    Some(_) => (200, "updated"),
                    None => (201, "created"),
                };
                BulkItemResponse {
                    id,
                    status,
                    result: Some(result.into()),
                    error: None,
                }
            }
            BulkAction::Delete => {
                let (status, result) = match index.documents.remove(&id) {
                    Some(_) => (200, "deleted"),
                    None => (404, "not_found"),
                };
                BulkItemResponse {
                    id,
                    status,
                    result: Some(result.into()),
                    error: None,
                }
            }
        }
    }
}

fn index_not_found(index: &str) -> StoreError {
    StoreError::Status {
        status: 404,
        body: format!("index_not_found_exception: {index}"),
    }
}

#[async_trait]
impl IndexStore for MemoryStore {
    async fn create_index(&self, index: &str, body: &Value) -> Result<IndexCreation, StoreError> {
        if self.indices.contains_key(index) {
            return Ok(IndexCreation::AlreadyExists);
        }
        let mappings = body.get("mappings").cloned().unwrap_or(Value::Null);
        let mut created = false;
        self.indices.entry(index.to_string()).or_insert_with(|| {
            created = true;
            MemoryIndex {
                mappings,
                documents: HashMap::new(),
            }
        });
        Ok(if created {
            IndexCreation::Created
        } else {
            IndexCreation::AlreadyExists
        })
    }

    async fn get_mapping(&self, index: &str) -> Result<Value, StoreError> {
        self.indices
            .get(index)
            .map(|entry| entry.mappings.clone())
            .ok_or_else(|| index_not_found(index))
    }

    async fn bulk(
        &self,
        index: &str,
        operations: &[BulkOperation],
    ) -> Result<Vec<BulkItemResponse>, StoreError> {
        let mut entry = self
            .indices
            .get_mut(index)
            .ok_or_else(|| index_not_found(index))?;
        Ok(operations
            .iter()
            .map(|op| Self::apply(&mut entry, op))
            .collect())
    }

    async fn get_document(&self, index: &str, id: &str) -> Result<Option<Value>, StoreError> {
        let entry = self.indices.get(index).ok_or_else(|| index_not_found(index))?;
        entry
            .documents
            .get(id)
            .map(|body| serde_json::from_slice(body).map_err(StoreError::from))
            .transpose()
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
