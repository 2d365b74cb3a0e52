//! # beacon-core
//!
//! Durable, batched event index for the Beacon relay.
//!
//! - **EventIndex** - Call-and-return `save_event` / `delete_event` over a batched store
//! - **BulkIndexer** - Worker pool that groups writes into bulk requests
//! - **IndexStore** - Backend trait, with Elasticsearch and in-memory implementations
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │ EventIndex  │────▶│ BulkIndexer │────▶│ IndexStore  │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!        ▲                   │
//!        └──── oneshot ──────┘
//! ```

pub mod bulk;
pub mod elastic;
pub mod index;
pub mod memory;
pub mod store;

pub use bulk::{BulkError, BulkIndexer, BulkIndexerConfig, BulkItem, BulkStats};
pub use elastic::ElasticsearchStore;
pub use index::{EventIndex, IndexConfig, InitError, WriteError};
pub use memory::MemoryStore;
pub use store::{BulkItemResponse, IndexCreation, IndexStore, StoreError};
