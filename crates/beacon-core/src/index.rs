//! Durable event index.
//!
//! Turns the callback-based bulk pipeline into call-and-return writes: every
//! `save_event` / `delete_event` queues one item carrying a private oneshot
//! sender and awaits that item's outcome only, not the rest of its batch.

use std::sync::Arc;
use std::time::Duration;

use beacon_protocol::Event;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::bulk::{BulkIndexer, BulkIndexerConfig, BulkItem, BulkStats};
use crate::store::{
    index_body, BulkItemResponse, IndexCreation, IndexStore, StoreError, SCHEMA_FIELDS,
};

/// Errors from [`EventIndex::init`].
#[derive(Debug, Error)]
pub enum InitError {
    /// The store could not be reached or refused the request.
    #[error("Store unavailable: {0}")]
    Store(#[from] StoreError),

    /// An existing index has a mapping incompatible with the event schema.
    #[error("Index {index} has an incompatible mapping for field {field}")]
    SchemaConflict { index: String, field: String },
}

/// Errors from event writes.
#[derive(Debug, Error)]
pub enum WriteError {
    /// The pipeline refused the item (e.g., shutting down).
    #[error("Write rejected: index is closed")]
    Rejected,

    /// The event could not be serialized.
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The store rejected this item.
    #[error("{kind}: {reason}")]
    Item { kind: String, reason: String },

    /// The request carrying this item failed.
    #[error("Store error: {0}")]
    Store(Arc<StoreError>),

    /// The completion deadline elapsed before the item was acknowledged.
    #[error("Timed out after {0:?} waiting for acknowledgment")]
    Timeout(Duration),

    /// The item was dropped without an outcome.
    #[error("Write abandoned before acknowledgment")]
    Abandoned,
}

impl WriteError {
    fn from_item(response: BulkItemResponse) -> Self {
        match response.error {
            Some(cause) => WriteError::Item {
                kind: cause.kind,
                reason: cause.reason.unwrap_or_default(),
            },
            None => WriteError::Item {
                kind: format!("status {}", response.status),
                reason: response.result.unwrap_or_default(),
            },
        }
    }
}

/// Event index configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Index name.
    #[serde(default = "default_index_name")]
    pub index_name: String,

    /// Primary shards when the index is created.
    #[serde(default = "default_shards")]
    pub number_of_shards: u32,

    /// Replicas when the index is created.
    #[serde(default)]
    pub number_of_replicas: u32,

    /// Upper bound on waiting for an acknowledgment, in milliseconds.
    #[serde(default)]
    pub ack_timeout_ms: Option<u64>,

    /// Batching pipeline settings.
    #[serde(default)]
    pub bulk: BulkIndexerConfig,
}

fn default_index_name() -> String {
    "events".to_string()
}

fn default_shards() -> u32 {
    1
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            index_name: default_index_name(),
            number_of_shards: default_shards(),
            number_of_replicas: 0,
            ack_timeout_ms: None,
            bulk: BulkIndexerConfig::default(),
        }
    }
}

type Completion = Result<(), WriteError>;

/// Wire one item's callbacks to a oneshot completion signal.
///
/// Both callbacks own a share of the sender; whichever fires takes it. The
/// send result is ignored so a caller that stopped waiting costs nothing.
fn with_completion(
    item: BulkItem,
    not_found_ok: bool,
) -> (BulkItem, oneshot::Receiver<Completion>) {
    let (tx, rx) = oneshot::channel::<Completion>();
    let slot = Arc::new(std::sync::Mutex::new(Some(tx)));
    let failure_slot = slot.clone();

    let take = |slot: &std::sync::Mutex<Option<oneshot::Sender<Completion>>>| {
        slot.lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
    };

    let item = item
        .on_success(move |_response| {
            if let Some(tx) = take(&slot) {
                let _ = tx.send(Ok(()));
            }
        })
        .on_failure(move |response, error| {
            let outcome = match (response, error) {
                (Some(response), _) if not_found_ok && response.is_not_found() => Ok(()),
                (Some(response), _) => Err(WriteError::from_item(response)),
                (None, Some(error)) => Err(WriteError::Store(error)),
                (None, None) => Err(WriteError::Abandoned),
            };
            if let Some(tx) = take(&failure_slot) {
                let _ = tx.send(outcome);
            }
        });

    (item, rx)
}

/// Durable, batched event index.
pub struct EventIndex {
    store: Arc<dyn IndexStore>,
    indexer: BulkIndexer,
    config: IndexConfig,
}

impl EventIndex {
    /// Ensure the index exists with a compatible schema and start the pipeline.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unreachable or the existing mapping conflicts.
    pub async fn init(store: Arc<dyn IndexStore>, config: IndexConfig) -> Result<Self, InitError> {
        let index = config.index_name.clone();
        let body = index_body(config.number_of_shards, config.number_of_replicas);

        match store.create_index(&index, &body).await? {
            IndexCreation::Created => info!(index = %index, store = store.name(), "Created event index"),
            IndexCreation::AlreadyExists => {
                let mapping = store.get_mapping(&index).await?;
                check_mapping(&index, &mapping)?;
                debug!(index = %index, "Reusing existing event index");
            }
        }

        let indexer = BulkIndexer::new(store.clone(), index, config.bulk.clone());

        Ok(Self {
            store,
            indexer,
            config,
        })
    }

    /// Upsert an event by id.
    ///
    /// Returns once this event has been acknowledged by the store.
    ///
    /// # Errors
    ///
    /// Returns an error if the pipeline is closed, serialization fails, or the store rejects it.
    pub async fn save_event(&self, event: &Event) -> Result<(), WriteError> {
        let body = Bytes::from(serde_json::to_vec(event)?);
        let (item, rx) = with_completion(BulkItem::index(event.id.clone(), body), false);

        let result = self.submit(item, rx).await;
        if let Err(e) = &result {
            warn!(id = %event.id, error = %e, "Save failed");
        }
        result
    }

    /// Delete an event by id.
    ///
    /// Deleting an event that does not exist succeeds. The author is only
    /// used for logging; ownership checks belong to the caller.
    ///
    /// # Errors
    ///
    /// Returns an error if the pipeline is closed or the store reports any other failure.
    pub async fn delete_event(&self, id: &str, pubkey: &str) -> Result<(), WriteError> {
        let (item, rx) = with_completion(BulkItem::delete(id), true);

        let result = self.submit(item, rx).await;
        match &result {
            Ok(()) => debug!(id = %id, pubkey = %pubkey, "Deleted event"),
            Err(e) => warn!(id = %id, pubkey = %pubkey, error = %e, "Delete failed"),
        }
        result
    }

    /// Fetch a stored event by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails or the stored source is not an event.
    pub async fn get_event(&self, id: &str) -> Result<Option<Event>, WriteError> {
        let source = self
            .store
            .get_document(&self.config.index_name, id)
            .await
            .map_err(|e| WriteError::Store(Arc::new(e)))?;
        source
            .map(serde_json::from_value::<Event>)
            .transpose()
            .map_err(WriteError::from)
    }

    async fn submit(&self, item: BulkItem, rx: oneshot::Receiver<Completion>) -> Completion {
        let Some(limit) = self.config.ack_timeout_ms.map(Duration::from_millis) else {
            self.indexer
                .add(item)
                .await
                .map_err(|_| WriteError::Rejected)?;
            return rx.await.unwrap_or(Err(WriteError::Abandoned));
        };

        // One deadline covers both waiting for queue space and the acknowledgment.
        let deadline = Instant::now() + limit;
        timeout_at(deadline, self.indexer.add(item))
            .await
            .map_err(|_| WriteError::Timeout(limit))?
            .map_err(|_| WriteError::Rejected)?;

        timeout_at(deadline, rx)
            .await
            .map_err(|_| WriteError::Timeout(limit))?
            .unwrap_or(Err(WriteError::Abandoned))
    }

    /// Pipeline counters.
    #[must_use]
    pub fn stats(&self) -> BulkStats {
        self.indexer.stats()
    }

    /// The index name.
    #[must_use]
    pub fn index_name(&self) -> &str {
        &self.config.index_name
    }

    /// Flush pending writes and stop the pipeline. Later writes are rejected.
    pub async fn close(&self) {
        self.indexer.close().await;
    }
}

/// Every schema field must be mapped with the expected type.
fn check_mapping(index: &str, mapping: &Value) -> Result<(), InitError> {
    for (field, kind) in SCHEMA_FIELDS {
        let actual = mapping
            .get("properties")
            .and_then(|props| props.get(*field))
            .and_then(|prop| prop.get("type"))
            .and_then(Value::as_str);
        if actual != Some(*kind) {
            return Err(InitError::SchemaConflict {
                index: index.to_string(),
                field: (*field).to_string(),
            });
        }
    }
    Ok(())
}
