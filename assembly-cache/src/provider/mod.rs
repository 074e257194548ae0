//! Low-level storage behind the element cache.
//!
//! Architecture:
//! ```text
//! ┌──────────────┐  add_changed_elements  ┌─────────────────────┐
//! │ ElementCache │ ─────────────────────► │ CacheProvider       │
//! │              │ ◄───────────────────── │  ├─ elements        │
//! └──────────────┘   get_* / data_since   │  ├─ change log      │
//!                                         │  └─ meta (schema,   │
//!                                         │     change ids)     │
//!                                         └─────────────────────┘
//!                      MemoryCacheProvider ─┘  └─ RocksCacheProvider
//! ```
//!
//! Both implementations honour the same contract, so the cache never
//! branches on which one is active:
//! - a batch is committed in full (data, change-log entry, counter) or not
//!   at all;
//! - change ids are strictly increasing and start at 1 after a reset,
//!   or right after the id given to `advance_change_id`;
//! - `get_data_since(n)` returns the current value of every element touched
//!   by a batch with id > n (`None` for deleted elements).

pub mod memory;
pub mod rocks;

pub use memory::MemoryCacheProvider;
pub use rocks::{RocksCacheProvider, RocksConfig};

use std::collections::BTreeMap;

use async_trait::async_trait;
use thiserror::Error;

use crate::element::{Element, ElementId};

/// Errors raised by a cache provider.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    /// The backing store failed or could not be reached.
    #[error("database error: {0}")]
    Database(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("compression error: {0}")]
    Compression(String),
}

impl From<rocksdb::Error> for ProviderError {
    fn from(e: rocksdb::Error) -> Self {
        ProviderError::Database(e.to_string())
    }
}

pub type ProviderResult<T> = Result<T, ProviderError>;

/// Elements touched since a change id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DataSince {
    /// Current data per touched element, `None` when it was deleted.
    pub elements: BTreeMap<ElementId, Option<Element>>,
    /// Change id the result is consistent with.
    pub to_change_id: u64,
}

#[async_trait]
pub trait CacheProvider: Send + Sync {
    async fn get_element(&self, element_id: &ElementId) -> ProviderResult<Option<Element>>;

    /// All elements of a collection keyed by id; empty for unknown collections.
    async fn get_collection(&self, collection: &str) -> ProviderResult<BTreeMap<u64, Element>>;

    async fn get_all(&self) -> ProviderResult<BTreeMap<ElementId, Element>>;

    /// Atomically apply a batch and return the change id assigned to it.
    async fn add_changed_elements(
        &self,
        changes: Vec<(ElementId, Option<Element>)>,
    ) -> ProviderResult<u64>;

    async fn get_data_since(&self, change_id: u64) -> ProviderResult<DataSince>;

    /// Replace all elements with a repopulated dataset. No change-log entry
    /// is written; the dataset becomes the base for later deltas.
    async fn set_full_data(&self, data: BTreeMap<ElementId, Element>) -> ProviderResult<()>;

    /// Clear elements, change log, counters and schema version.
    async fn reset(&self) -> ProviderResult<()>;

    /// Raise the current and the lowest change id to `change_id` without a
    /// change-log entry. Deltas from any earlier id become unavailable.
    /// Never lowers either counter.
    async fn advance_change_id(&self, change_id: u64) -> ProviderResult<()>;

    async fn current_change_id(&self) -> ProviderResult<u64>;

    /// Smallest change id from which a complete delta can be computed.
    async fn lowest_change_id(&self) -> ProviderResult<u64>;

    async fn get_schema_version(&self) -> ProviderResult<Option<String>>;

    async fn set_schema_version(&self, version: &str) -> ProviderResult<()>;

    /// Persist buffered writes.
    async fn flush(&self) -> ProviderResult<()> {
        Ok(())
    }
}
