//! Elasticsearch store over the REST API.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, trace};

use crate::store::{
    BulkAction, BulkItemResponse, BulkOperation, IndexCreation, IndexStore, StoreError,
};

const ALREADY_EXISTS: &str = "resource_already_exists_exception";

#[derive(Debug, Deserialize)]
struct BulkResponse {
    #[serde(default)]
    errors: bool,
    items: Vec<HashMap<String, BulkItemResponse>>,
}

/// Elasticsearch-compatible store.
pub struct ElasticsearchStore {
    client: Client,
    base_url: String,
}

impl ElasticsearchStore {
    /// Create a client for the cluster at `url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, StoreError> {
        let client = Client::builder().timeout(timeout).build()?;
        let base_url = url.into().trim_end_matches('/').to_string();
        Ok(Self { client, base_url })
    }

    /// The cluster base URL.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    async fn check(response: Response) -> Result<Response, StoreError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(StoreError::Status {
            status: status.as_u16(),
            body: body.chars().take(512).collect(),
        })
    }
}

/// Encode bulk operations as NDJSON.
pub(crate) fn encode_bulk(operations: &[BulkOperation]) -> Result<Vec<u8>, StoreError> {
    let mut buf = Vec::new();
    for op in operations {
        let mut header = serde_json::Map::new();
        header.insert(
            op.action.as_str().to_string(),
            json!({ "_id": op.document_id }),
        );
        serde_json::to_writer(&mut buf, &header)?;
        buf.push(b'\n');
        if op.action == BulkAction::Index {
            let body = op.body.as_deref().ok_or_else(|| {
                StoreError::InvalidResponse(format!("index of {} without body", op.document_id))
            })?;
            buf.extend_from_slice(body);
            buf.push(b'\n');
        }
    }
    Ok(buf)
}

#[async_trait]
impl IndexStore for ElasticsearchStore {
    async fn create_index(&self, index: &str, body: &Value) -> Result<IndexCreation, StoreError> {
        let response = self.client.put(self.url(index)).json(body).send().await?;

        let status = response.status();
        if status.is_success() {
            debug!(index = %index, "Created index");
            return Ok(IndexCreation::Created);
        }

        let text = response.text().await.unwrap_or_default();
        if status == StatusCode::BAD_REQUEST && text.contains(ALREADY_EXISTS) {
            debug!(index = %index, "Index already exists");
            return Ok(IndexCreation::AlreadyExists);
        }

        Err(StoreError::Status {
            status: status.as_u16(),
            body: text,
        })
    }

    async fn get_mapping(&self, index: &str) -> Result<Value, StoreError> {
        let response = self
            .client
            .get(self.url(&format!("{index}/_mapping")))
            .send()
            .await?;
        let value: Value = Self::check(response).await?.json().await?;

        // Keyed by the concrete index name, which differs from `index` behind an alias.
        value
            .as_object()
            .and_then(|indices| indices.values().next())
            .and_then(|entry| entry.get("mappings"))
            .cloned()
            .ok_or_else(|| StoreError::InvalidResponse(format!("no mappings for {index}")))
    }

    async fn bulk(
        &self,
        index: &str,
        operations: &[BulkOperation],
    ) -> Result<Vec<BulkItemResponse>, StoreError> {
        if operations.is_empty() {
            return Ok(Vec::new());
        }

        let body = encode_bulk(operations)?;
        trace!(index = %index, operations = operations.len(), bytes = body.len(), "Sending bulk request");

        let response = self
            .client
            .post(self.url(&format!("{index}/_bulk")))
            .header("Content-Type", "application/x-ndjson")
            .body(body)
            .send()
            .await?;
        let parsed: BulkResponse = Self::check(response).await?.json().await?;

        if parsed.errors {
            debug!(index = %index, "Bulk response contains item errors");
        }

        parsed
            .items
            .into_iter()
            .map(|mut item| {
                item.drain()
                    .map(|(_, response)| response)
                    .next()
                    .ok_or_else(|| StoreError::InvalidResponse("empty bulk item".into()))
            })
            .collect()
    }

    async fn get_document(&self, index: &str, id: &str) -> Result<Option<Value>, StoreError> {
        let response = self
            .client
            .get(self.url(&format!("{index}/_doc/{id}")))
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let mut value: Value = Self::check(response).await?.json().await?;
        Ok(value.get_mut("_source").map(Value::take))
    }

    fn name(&self) -> &'static str {
        "elasticsearch"
    }
}
