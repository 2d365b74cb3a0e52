//! Search-index store abstraction.
//!
//! The batching pipeline only needs four primitives from a backend: create
//! an index, read its mapping, execute a bulk request and fetch a document.

use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;

/// Fields persisted for every event, with their index types.
pub const SCHEMA_FIELDS: &[(&str, &str)] = &[
    ("id", "keyword"),
    ("pubkey", "keyword"),
    ("kind", "integer"),
    ("tags", "keyword"),
    ("created_at", "date"),
];

/// Index creation body: settings plus the strict event schema.
///
/// Fields outside the schema are kept in `_source` but never indexed.
#[must_use]
pub fn index_body(shards: u32, replicas: u32) -> Value {
    let properties: serde_json::Map<String, Value> = SCHEMA_FIELDS
        .iter()
        .map(|(field, kind)| ((*field).to_string(), json!({ "type": kind })))
        .collect();

    json!({
        "settings": {
            "number_of_shards": shards,
            "number_of_replicas": replicas,
        },
        "mappings": {
            "dynamic": false,
            "properties": properties,
        }
    })
}

/// Store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// HTTP transport error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Unexpected response status.
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    /// Malformed JSON.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Response did not have the expected shape.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Backend refused the request but may accept it later.
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Whether retrying the same request may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Http(err) => err.is_timeout() || err.is_connect(),
            StoreError::Status { status, .. } => *status == 429 || *status >= 500,
            StoreError::Unavailable(_) => true,
            StoreError::Json(_) | StoreError::InvalidResponse(_) => false,
        }
    }
}

/// Outcome of an index creation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexCreation {
    /// The index was created.
    Created,
    /// An index with that name already existed.
    AlreadyExists,
}

/// Bulk action kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkAction {
    /// Upsert a document by id.
    Index,
    /// Delete a document by id.
    Delete,
}

impl BulkAction {
    /// The action name used in bulk requests.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            BulkAction::Index => "index",
            BulkAction::Delete => "delete",
        }
    }
}

/// One operation inside a bulk request.
#[derive(Debug, Clone)]
pub struct BulkOperation {
    /// What to do.
    pub action: BulkAction,
    /// Target document id.
    pub document_id: String,
    /// Document source, for `Index`.
    pub body: Option<Bytes>,
}

/// Error details attached to a failed bulk item.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ErrorCause {
    /// Error type, e.g. `mapper_parsing_exception`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Human-readable reason.
    #[serde(default)]
    pub reason: Option<String>,
}

/// Per-item result of a bulk request.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BulkItemResponse {
    /// Document id.
    #[serde(rename = "_id", default)]
    pub id: String,
    /// HTTP-style status for this item.
    pub status: u16,
    /// Result, e.g. `created`, `updated`, `deleted`, `not_found`.
    #[serde(default)]
    pub result: Option<String>,
    /// Error, when the item failed.
    #[serde(default)]
    pub error: Option<ErrorCause>,
}

impl BulkItemResponse {
    /// Whether the item succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Whether the target document did not exist.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        self.status == 404
    }
}

/// A search-index backend.
#[async_trait]
pub trait IndexStore: Send + Sync {
    /// Create an index. An existing index is reported, not treated as an error.
    async fn create_index(&self, index: &str, body: &Value) -> Result<IndexCreation, StoreError>;

    /// Fetch the `mappings` object of an index.
    async fn get_mapping(&self, index: &str) -> Result<Value, StoreError>;

    /// Execute a bulk request. Returns one response per operation, in order.
    async fn bulk(
        &self,
        index: &str,
        operations: &[BulkOperation],
    ) -> Result<Vec<BulkItemResponse>, StoreError>;

    /// Fetch a document's source by id.
    async fn get_document(&self, index: &str, id: &str) -> Result<Option<Value>, StoreError>;

    /// Backend name (e.g., "elasticsearch", "memory").
    fn name(&self) -> &'static str;
}
