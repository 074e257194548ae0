//! The element cache service.
//!
//! [`ElementCache`] owns the provider, the restriction engine and the
//! autoupdate dispatcher. Reads are restricted per user on the way out.
//! Writes go through [`ElementCache::change_elements`], which commits a batch
//! and then, without suspending again, invalidates cached restrictions,
//! notifies the history sink and fans the batch out to connected sessions.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::autoupdate::{restrict_changes, AutoupdateDispatcher, AutoupdateMessage, SessionTransport};
use crate::element::{
    element_numeric_id, group_by_collection, strip_internal_fields, Element, ElementChange,
    ElementId, ElementIdError,
};
use crate::history::{now_timestamp, HistoryBatch, HistoryEntry, HistorySink};
use crate::provider::{CacheProvider, ProviderError};
use crate::restriction::{RestrictionEngine, UserId};

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("element not found: {0}")]
    NotFound(String),

    #[error("cache provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("invalid change batch: {0}")]
    Validation(String),

    #[error("element cache is shut down")]
    ShutDown,
}

impl From<ProviderError> for CacheError {
    fn from(e: ProviderError) -> Self {
        CacheError::ProviderUnavailable(e.to_string())
    }
}

impl From<PopulateError> for CacheError {
    fn from(e: PopulateError) -> Self {
        CacheError::ProviderUnavailable(e.to_string())
    }
}

impl From<ElementIdError> for CacheError {
    fn from(e: ElementIdError) -> Self {
        CacheError::Validation(e.to_string())
    }
}

pub type CacheResult<T> = Result<T, CacheError>;

#[derive(Debug, Error)]
pub enum PopulateError {
    #[error("primary store failed: {0}")]
    Source(String),

    #[error("element in {0} has no integer id")]
    MissingId(String),

    #[error(transparent)]
    InvalidCollection(#[from] ElementIdError),
}

/// Source of the full dataset, used to rebuild the cache after a schema
/// version change.
#[async_trait]
pub trait Populate: Send + Sync {
    /// Every element of every collection. Elements carry an integer `"id"`.
    async fn full_data(&self) -> Result<BTreeMap<String, Vec<Element>>, PopulateError>;
}

#[async_trait]
impl Populate for BTreeMap<String, Vec<Element>> {
    async fn full_data(&self) -> Result<BTreeMap<String, Vec<Element>>, PopulateError> {
        Ok(self.clone())
    }
}

/// Element cache configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Schema version of the running code. A different stored version
    /// forces a rebuild from the populator.
    pub schema_version: String,
    /// Largest accepted change batch.
    pub max_batch_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            schema_version: env!("CARGO_PKG_VERSION").to_string(),
            max_batch_size: 10_000,
        }
    }
}

impl CacheConfig {
    pub fn for_testing() -> Self {
        Self {
            schema_version: "test".to_string(),
            max_batch_size: 100,
        }
    }
}

/// Restriction-aware element cache.
pub struct ElementCache {
    provider: Arc<dyn CacheProvider>,
    restrictions: Arc<RestrictionEngine>,
    dispatcher: Arc<AutoupdateDispatcher>,
    populator: Option<Arc<dyn Populate>>,
    history: Option<Arc<dyn HistorySink>>,
    config: CacheConfig,
    schema_ready: AtomicBool,
    /// Single-flight guard for rebuilds.
    rebuild_lock: Mutex<()>,
    /// Orders commit and dispatch of batches.
    write_lock: Mutex<()>,
    shut_down: AtomicBool,
}

impl ElementCache {
    pub fn new(
        provider: Arc<dyn CacheProvider>,
        restrictions: Arc<RestrictionEngine>,
        config: CacheConfig,
    ) -> Self {
        Self {
            provider,
            restrictions,
            dispatcher: Arc::new(AutoupdateDispatcher::new()),
            populator: None,
            history: None,
            config,
            schema_ready: AtomicBool::new(false),
            rebuild_lock: Mutex::new(()),
            write_lock: Mutex::new(()),
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn with_populator(mut self, populator: Arc<dyn Populate>) -> Self {
        self.populator = Some(populator);
        self
    }

    pub fn with_history_sink(mut self, history: Arc<dyn HistorySink>) -> Self {
        self.history = Some(history);
        self
    }

    pub fn autoupdate(&self) -> &Arc<AutoupdateDispatcher> {
        &self.dispatcher
    }

    pub fn restrictions(&self) -> &Arc<RestrictionEngine> {
        &self.restrictions
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Bring the cache up: verify the schema version, rebuilding if needed.
    pub async fn init(&self) -> CacheResult<()> {
        self.ensure_schema_version().await?;
        log::info!(
            "Element cache ready at change id {} (schema {})",
            self.provider.current_change_id().await?,
            self.config.schema_version
        );
        Ok(())
    }

    /// Rebuild from the populator when the stored schema version differs
    /// from the expected one. Only one rebuild runs at a time; concurrent
    /// callers wait for it and then re-check.
    pub async fn ensure_schema_version(&self) -> CacheResult<()> {
        if self.schema_ready.load(Ordering::Acquire) {
            return Ok(());
        }
        let _rebuild = self.rebuild_lock.lock().await;
        if self.schema_ready.load(Ordering::Acquire) {
            return Ok(());
        }

        let stored = self.provider.get_schema_version().await?;
        if stored.as_deref() != Some(self.config.schema_version.as_str()) {
            log::warn!(
                "Cache schema version mismatch (stored {:?}, expected {:?}), rebuilding",
                stored,
                self.config.schema_version
            );
            self.rebuild().await?;
        }
        self.schema_ready.store(true, Ordering::Release);
        Ok(())
    }

    /// Drop the cache and rebuild it from the populator. Connected sessions
    /// are disconnected and every earlier change id answers with full data.
    pub async fn force_rebuild(&self) -> CacheResult<()> {
        let _write = self.write_lock.lock().await;
        if self.is_shut_down() {
            return Err(CacheError::ShutDown);
        }
        let _rebuild = self.rebuild_lock.lock().await;
        self.schema_ready.store(false, Ordering::Release);
        self.rebuild().await?;
        self.schema_ready.store(true, Ordering::Release);
        Ok(())
    }

    async fn rebuild(&self) -> CacheResult<()> {
        let populator = self.populator.as_ref().ok_or_else(|| {
            CacheError::ProviderUnavailable("no populator configured".to_string())
        })?;
        let source = populator.full_data().await?;

        let mut data = BTreeMap::new();
        for (collection, elements) in source {
            for element in elements {
                let id = element_numeric_id(&element)
                    .ok_or_else(|| PopulateError::MissingId(collection.clone()))?;
                let element_id = ElementId::new(collection.as_str(), id).map_err(PopulateError::from)?;
                data.insert(element_id, element);
            }
        }
        let count = data.len();

        // The rebuilt dataset takes its own change id so that ids handed
        // out before the rebuild can never resume with a delta.
        let previous = self.provider.current_change_id().await?;
        self.provider.reset().await?;
        self.provider.set_full_data(data).await?;
        if previous > 0 {
            self.provider.advance_change_id(previous + 1).await?;
        }
        self.provider.set_schema_version(&self.config.schema_version).await?;
        self.restrictions.clear();
        self.dispatcher.disconnect_all();
        log::info!("Element cache rebuilt with {count} elements");
        Ok(())
    }

    pub async fn current_change_id(&self) -> CacheResult<u64> {
        Ok(self.provider.current_change_id().await?)
    }

    /// One element, restricted for `user` when given.
    ///
    /// `Err(NotFound)` when the element does not exist, `Ok(None)` when it
    /// exists but `user` may not see it.
    pub async fn get_element_data(
        &self,
        collection: &str,
        id: u64,
        user: Option<UserId>,
    ) -> CacheResult<Option<Element>> {
        self.ensure_schema_version().await?;
        let element_id = ElementId::new(collection, id)?;
        let computed_at = self.provider.current_change_id().await?;
        let element = self
            .provider
            .get_element(&element_id)
            .await?
            .ok_or_else(|| CacheError::NotFound(element_id.encode()))?;
        Ok(self
            .restrict(&element_id, element, user, computed_at)
            .map(strip_internal_fields))
    }

    /// Every visible element of a collection, keyed by id.
    pub async fn get_collection_data(
        &self,
        collection: &str,
        user: Option<UserId>,
    ) -> CacheResult<BTreeMap<u64, Element>> {
        self.ensure_schema_version().await?;
        let computed_at = self.provider.current_change_id().await?;
        let elements = self.provider.get_collection(collection).await?;

        let mut visible = BTreeMap::new();
        for (id, element) in elements {
            let element_id = ElementId::new(collection, id)?;
            if let Some(element) = self.restrict(&element_id, element, user, computed_at) {
                visible.insert(id, strip_internal_fields(element));
            }
        }
        Ok(visible)
    }

    /// Every visible element, grouped by collection. Used for client bootstrap.
    pub async fn get_all_data_list(
        &self,
        user: Option<UserId>,
    ) -> CacheResult<BTreeMap<String, Vec<Element>>> {
        self.ensure_schema_version().await?;
        let computed_at = self.provider.current_change_id().await?;
        Ok(self.restrict_all(self.provider.get_all().await?, user, computed_at))
    }

    /// The unrestricted dataset as stored, internal fields included.
    pub async fn get_all_elements(&self) -> CacheResult<BTreeMap<ElementId, Element>> {
        self.ensure_schema_version().await?;
        Ok(self.provider.get_all().await?)
    }

    /// Changes after `change_id`, restricted for `user`.
    ///
    /// When the change log can not answer (`change_id` is 0, older than the
    /// retained log or newer than the cache) the full dataset is returned
    /// with `all_data` set.
    pub async fn get_data_since(
        &self,
        change_id: u64,
        user: Option<UserId>,
    ) -> CacheResult<AutoupdateMessage> {
        self.ensure_schema_version().await?;
        self.data_since(change_id, user).await
    }

    async fn data_since(&self, change_id: u64, user: Option<UserId>) -> CacheResult<AutoupdateMessage> {
        let current = self.provider.current_change_id().await?;
        let lowest = self.provider.lowest_change_id().await?;

        if change_id == 0 || change_id < lowest || change_id > current {
            log::debug!(
                "Full data for change id {change_id} (log covers {lowest}..={current})"
            );
            let changed = self.restrict_all(self.provider.get_all().await?, user, current);
            return Ok(AutoupdateMessage {
                changed,
                deleted: Vec::new(),
                from_change_id: change_id,
                to_change_id: current,
                all_data: true,
            });
        }

        let since = self.provider.get_data_since(change_id).await?;
        let (changed, deleted) =
            restrict_changes(since.elements.iter(), user, &self.restrictions, current);
        Ok(AutoupdateMessage {
            changed,
            deleted,
            from_change_id: change_id,
            to_change_id: since.to_change_id,
            all_data: false,
        })
    }

    /// Apply a batch and return its change id.
    ///
    /// The batch is validated first; an invalid batch is rejected as a
    /// whole before any change id is assigned.
    pub async fn change_elements(&self, changes: Vec<ElementChange>) -> CacheResult<u64> {
        self.validate(&changes)?;
        self.ensure_schema_version().await?;

        let _write = self.write_lock.lock().await;
        if self.is_shut_down() {
            return Err(CacheError::ShutDown);
        }

        let batch: Vec<(ElementId, Option<Element>)> = changes
            .iter()
            .map(|change| (change.element_id.clone(), change.data.clone()))
            .collect();
        let change_id = self.provider.add_changed_elements(batch.clone()).await?;

        // Committed. Nothing below may suspend.
        self.restrictions
            .invalidate(batch.iter().map(|(element_id, _)| element_id), change_id);
        self.record_history(change_id, changes);
        self.dispatcher.dispatch(change_id, &batch, &self.restrictions);

        log::debug!("Applied batch {change_id} with {} elements", batch.len());
        Ok(change_id)
    }

    /// Register a session and compute what it missed since `change_id`.
    ///
    /// Runs under the write lock, so no batch falls between the returned
    /// message and the first dispatched one.
    pub async fn connect_session(
        &self,
        user: UserId,
        change_id: u64,
        transport: Arc<dyn SessionTransport>,
    ) -> CacheResult<(Uuid, AutoupdateMessage)> {
        self.ensure_schema_version().await?;
        let _write = self.write_lock.lock().await;
        if self.is_shut_down() {
            return Err(CacheError::ShutDown);
        }
        let initial = self.data_since(change_id, Some(user)).await?;
        let session_id = self.dispatcher.connect(user, transport);
        Ok((session_id, initial))
    }

    /// Wait for in-flight writes, reject later ones, disconnect every
    /// session and flush the provider.
    pub async fn shutdown(&self) -> CacheResult<()> {
        let _write = self.write_lock.lock().await;
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.dispatcher.disconnect_all();
        self.provider.flush().await?;
        log::info!("Element cache shut down");
        Ok(())
    }

    fn validate(&self, changes: &[ElementChange]) -> CacheResult<()> {
        if changes.is_empty() {
            return Err(CacheError::Validation("empty batch".to_string()));
        }
        if changes.len() > self.config.max_batch_size {
            return Err(CacheError::Validation(format!(
                "batch of {} elements exceeds the limit of {}",
                changes.len(),
                self.config.max_batch_size
            )));
        }

        let mut seen = HashSet::with_capacity(changes.len());
        for change in changes {
            if !seen.insert(&change.element_id) {
                return Err(CacheError::Validation(format!(
                    "{} appears twice in one batch",
                    change.element_id
                )));
            }
            let Some(data) = &change.data else { continue };
            if let Some(id) = data.get("id") {
                if id.as_u64() != Some(change.element_id.id()) {
                    return Err(CacheError::Validation(format!(
                        "{} carries id {id}",
                        change.element_id
                    )));
                }
            }
        }
        Ok(())
    }

    fn restrict(
        &self,
        element_id: &ElementId,
        element: Element,
        user: Option<UserId>,
        computed_at: u64,
    ) -> Option<Element> {
        match user {
            None => Some(element),
            Some(user_id) => self
                .restrictions
                .restrict(element_id, &element, user_id, computed_at),
        }
    }

    fn restrict_all(
        &self,
        elements: BTreeMap<ElementId, Element>,
        user: Option<UserId>,
        computed_at: u64,
    ) -> BTreeMap<String, Vec<Element>> {
        let visible = elements.into_iter().filter_map(|(element_id, element)| {
            let element = self.restrict(&element_id, element, user, computed_at)?;
            Some((element_id, strip_internal_fields(element)))
        });
        group_by_collection(visible)
    }

    fn record_history(&self, change_id: u64, changes: Vec<ElementChange>) {
        let Some(history) = &self.history else { return };
        let entries: Vec<HistoryEntry> = changes
            .into_iter()
            .filter(|change| !change.disable_history)
            .map(|change| HistoryEntry {
                element_id: change.element_id,
                information: change.information,
                user_id: change.user_id,
                full_data: change.data,
            })
            .collect();
        let batch = HistoryBatch {
            change_id,
            timestamp: now_timestamp(),
            entries,
        };
        if let Err(e) = history.record(&batch) {
            log::error!("History write for batch {change_id} failed: {e}");
        }
    }
}
