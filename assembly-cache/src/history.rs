//! Append-only audit history of element changes.
//!
//! The element cache notifies a [`HistorySink`] of every committed batch.
//! [`HistoryStore`] is the in-process sink: one [`HistoryRecord`] per
//! element per batch, each pointing to a [`HistoryData`] snapshot of the
//! element's full data (`None` for deletions). Records are never updated;
//! [`HistoryStore::rebuild`] is the only way to remove them.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::cache::{CacheResult, ElementCache};
use crate::element::{group_by_collection, Element, ElementId};

/// Collection holding config variables; always completed in data points.
pub const CONFIG_COLLECTION: &str = "core/config";

/// Seconds since the Unix epoch.
pub fn now_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// One element of a committed batch as seen by the history.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    pub element_id: ElementId,
    pub information: Vec<String>,
    pub user_id: Option<u64>,
    pub full_data: Option<Element>,
}

/// A committed batch.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryBatch {
    pub change_id: u64,
    pub timestamp: u64,
    /// Elements with history disabled are left out, possibly all of them.
    pub entries: Vec<HistoryEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HistoryError {
    #[error("history is full ({0} records)")]
    Full(usize),
}

/// Receives every committed batch. Failures never fail the cache write.
pub trait HistorySink: Send + Sync {
    fn record(&self, batch: &HistoryBatch) -> Result<(), HistoryError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub element_id: ElementId,
    pub timestamp: u64,
    pub information: Vec<String>,
    pub user_id: Option<u64>,
    pub full_data_id: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryData {
    pub id: u64,
    pub full_data: Option<Element>,
}

/// Search result for an element's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryInformation {
    pub element_id: ElementId,
    pub timestamp: u64,
    pub information: Vec<String>,
    pub user_id: Option<u64>,
}

#[derive(Debug, Default)]
struct HistoryState {
    /// Append order is chronological order.
    records: Vec<HistoryRecord>,
    data: HashMap<u64, HistoryData>,
    next_data_id: u64,
}

impl HistoryState {
    fn append(
        &mut self,
        element_id: ElementId,
        timestamp: u64,
        information: Vec<String>,
        user_id: Option<u64>,
        full_data: Option<Element>,
    ) {
        self.next_data_id += 1;
        let id = self.next_data_id;
        self.data.insert(id, HistoryData { id, full_data });
        self.records.push(HistoryRecord {
            element_id,
            timestamp,
            information,
            user_id,
            full_data_id: id,
        });
    }
}

pub struct HistoryStore {
    state: Mutex<HistoryState>,
    max_records: usize,
}

impl HistoryStore {
    pub fn new() -> Self {
        Self::with_capacity(usize::MAX)
    }

    /// Refuse batches that would grow the history beyond `max_records`.
    pub fn with_capacity(max_records: usize) -> Self {
        Self {
            state: Mutex::new(HistoryState::default()),
            max_records,
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn records(&self) -> Vec<HistoryRecord> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .records
            .clone()
    }

    pub fn full_data(&self, full_data_id: u64) -> Option<HistoryData> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .data
            .get(&full_data_id)
            .cloned()
    }

    /// Records of one element that carry information, newest first.
    pub fn search(&self, element_id: &ElementId) -> Vec<HistoryInformation> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state
            .records
            .iter()
            .rev()
            .filter(|record| &record.element_id == element_id && !record.information.is_empty())
            .map(|record| HistoryInformation {
                element_id: record.element_id.clone(),
                timestamp: record.timestamp,
                information: record.information.clone(),
                user_id: record.user_id,
            })
            .collect()
    }

    /// The dataset as of `until` (inclusive, all history when `None`).
    ///
    /// Config variables present in `current_config` whose `key` is missing
    /// from the historical config collection are added, so the result always
    /// has every config variable the running code knows about.
    pub fn data_point(
        &self,
        until: Option<u64>,
        current_config: &BTreeMap<u64, Element>,
    ) -> BTreeMap<String, Vec<Element>> {
        let mut dataset: BTreeMap<ElementId, Element> = {
            let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let mut latest: HashMap<&ElementId, u64> = HashMap::new();
            for record in &state.records {
                if until.is_some_and(|until| record.timestamp > until) {
                    continue;
                }
                latest.insert(&record.element_id, record.full_data_id);
            }
            latest
                .into_iter()
                .filter_map(|(element_id, data_id)| {
                    let data = state.data.get(&data_id)?.full_data.clone()?;
                    Some((element_id.clone(), data))
                })
                .collect()
        };

        let known_keys: HashSet<String> = dataset
            .iter()
            .filter(|(element_id, _)| element_id.collection() == CONFIG_COLLECTION)
            .filter_map(|(_, element)| element.get("key").and_then(Value::as_str))
            .map(str::to_string)
            .collect();
        for (id, config) in current_config {
            let Some(key) = config.get("key").and_then(Value::as_str) else {
                continue;
            };
            if known_keys.contains(key) {
                continue;
            }
            if let Ok(element_id) = ElementId::new(CONFIG_COLLECTION, *id) {
                dataset.insert(element_id, config.clone());
            }
        }

        group_by_collection(dataset)
    }

    /// Delete all records and snapshots and start over from `current`, one
    /// record per element in collection/id order. Returns the record count.
    pub fn rebuild(&self, current: &BTreeMap<ElementId, Element>, timestamp: u64) -> usize {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        *state = HistoryState::default();
        for (element_id, element) in current {
            state.append(element_id.clone(), timestamp, Vec::new(), None, Some(element.clone()));
        }
        log::info!("History rebuilt with {} records", state.records.len());
        state.records.len()
    }

    /// Rebuild from the cache's current full dataset.
    pub async fn rebuild_from_cache(&self, cache: &ElementCache) -> CacheResult<usize> {
        let current = cache.get_all_elements().await?;
        Ok(self.rebuild(&current, now_timestamp()))
    }

    /// Data point with the config completed from the cache.
    pub async fn data_point_from_cache(
        &self,
        cache: &ElementCache,
        until: Option<u64>,
    ) -> CacheResult<BTreeMap<String, Vec<Element>>> {
        let current_config = cache.get_collection_data(CONFIG_COLLECTION, None).await?;
        Ok(self.data_point(until, &current_config))
    }
}

impl Default for HistoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl HistorySink for HistoryStore {
    fn record(&self, batch: &HistoryBatch) -> Result<(), HistoryError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.records.len().saturating_add(batch.entries.len()) > self.max_records {
            return Err(HistoryError::Full(state.records.len()));
        }
        for entry in &batch.entries {
            state.append(
                entry.element_id.clone(),
                batch.timestamp,
                entry.information.clone(),
                entry.user_id,
                entry.full_data.clone(),
            );
        }
        Ok(())
    }
}
