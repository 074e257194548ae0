//! In-process cache provider for single-worker deployments.
//!
//! Not durable: all state is lost on restart, which the schema check turns
//! into a repopulation. Every mutation runs inside one write-lock scope with
//! no suspension point, so a cancelled caller never leaves partial state.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{CacheProvider, DataSince, ProviderResult};
use crate::element::{Element, ElementId};

/// Default number of batches kept in the change log.
pub const DEFAULT_CHANGE_LOG_RETENTION: usize = 10_000;

#[derive(Debug, Default)]
struct MemoryState {
    data: BTreeMap<ElementId, Element>,
    /// change id → element ids touched by that batch
    changes: BTreeMap<u64, Vec<ElementId>>,
    change_id: u64,
    lowest_change_id: u64,
    schema_version: Option<String>,
}

impl MemoryState {
    /// Drop the oldest batches beyond `retention`.
    fn prune(&mut self, retention: usize) {
        while self.changes.len() > retention {
            match self.changes.pop_first() {
                Some((change_id, _)) => self.lowest_change_id = change_id,
                None => break,
            }
        }
    }
}

/// Map-backed provider guarded by a single async lock.
pub struct MemoryCacheProvider {
    state: RwLock<MemoryState>,
    retention: usize,
}

impl MemoryCacheProvider {
    pub fn new() -> Self {
        Self::with_retention(DEFAULT_CHANGE_LOG_RETENTION)
    }

    /// Keep at most `retention` batches in the change log (minimum 1).
    pub fn with_retention(retention: usize) -> Self {
        Self {
            state: RwLock::new(MemoryState::default()),
            retention: retention.max(1),
        }
    }

    /// Number of batches currently held in the change log.
    pub async fn change_log_len(&self) -> usize {
        self.state.read().await.changes.len()
    }
}

impl Default for MemoryCacheProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheProvider for MemoryCacheProvider {
    async fn get_element(&self, element_id: &ElementId) -> ProviderResult<Option<Element>> {
        Ok(self.state.read().await.data.get(element_id).cloned())
    }

    async fn get_collection(&self, collection: &str) -> ProviderResult<BTreeMap<u64, Element>> {
        let state = self.state.read().await;
        Ok(state
            .data
            .iter()
            .filter(|(element_id, _)| element_id.collection() == collection)
            .map(|(element_id, element)| (element_id.id(), element.clone()))
            .collect())
    }

    async fn get_all(&self) -> ProviderResult<BTreeMap<ElementId, Element>> {
        Ok(self.state.read().await.data.clone())
    }

    async fn add_changed_elements(
        &self,
        changes: Vec<(ElementId, Option<Element>)>,
    ) -> ProviderResult<u64> {
        let mut state = self.state.write().await;
        let change_id = state.change_id + 1;

        let mut touched = Vec::with_capacity(changes.len());
        for (element_id, data) in changes {
            match data {
                Some(element) => {
                    state.data.insert(element_id.clone(), element);
                }
                None => {
                    state.data.remove(&element_id);
                }
            }
            touched.push(element_id);
        }

        state.changes.insert(change_id, touched);
        state.change_id = change_id;
        state.prune(self.retention);
        Ok(change_id)
    }

    async fn get_data_since(&self, change_id: u64) -> ProviderResult<DataSince> {
        let state = self.state.read().await;
        let touched: BTreeSet<&ElementId> = state
            .changes
            .range((Bound::Excluded(change_id), Bound::Unbounded))
            .flat_map(|(_, ids)| ids.iter())
            .collect();

        let elements = touched
            .into_iter()
            .map(|element_id| (element_id.clone(), state.data.get(element_id).cloned()))
            .collect();

        Ok(DataSince {
            elements,
            to_change_id: state.change_id.max(change_id),
        })
    }

    async fn set_full_data(&self, data: BTreeMap<ElementId, Element>) -> ProviderResult<()> {
        let mut state = self.state.write().await;
        state.data = data;
        state.lowest_change_id = state.change_id;
        Ok(())
    }

    async fn reset(&self) -> ProviderResult<()> {
        *self.state.write().await = MemoryState::default();
        Ok(())
    }

    async fn advance_change_id(&self, change_id: u64) -> ProviderResult<()> {
        let mut state = self.state.write().await;
        if change_id > state.change_id {
            state.change_id = change_id;
            state.lowest_change_id = change_id;
            state.changes.clear();
        }
        Ok(())
    }

    async fn current_change_id(&self) -> ProviderResult<u64> {
        Ok(self.state.read().await.change_id)
    }

    async fn lowest_change_id(&self) -> ProviderResult<u64> {
        Ok(self.state.read().await.lowest_change_id)
    }

    async fn get_schema_version(&self) -> ProviderResult<Option<String>> {
        Ok(self.state.read().await.schema_version.clone())
    }

    async fn set_schema_version(&self, version: &str) -> ProviderResult<()> {
        self.state.write().await.schema_version = Some(version.to_string());
        Ok(())
    }
}
