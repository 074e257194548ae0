//! RocksDB-backed cache provider.
//!
//! Column families:
//! - `elements`: current element data, JSON (LZ4 compressed), keyed by `collection:id`
//! - `changes`: change log, keyed by change id (8 bytes big-endian),
//!   value is the bincode-encoded list of touched element ids
//! - `meta`: schema version, current change id, lowest change id
//!
//! Every batch is a single `WriteBatch`, so element data, change-log entry and
//! counters commit together. Change-id assignment is serialized by an async
//! mutex; the counter is recovered from `meta` on open so a restart continues
//! the sequence.
//!
//! Reads that combine several keys (`get_data_since`) run against a RocksDB
//! snapshot so they see a single committed state.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamily, ColumnFamilyDescriptor, DBCompressionType,
    DBWithThreadMode, Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use tokio::sync::Mutex;

use super::{CacheProvider, DataSince, ProviderError, ProviderResult};
use crate::element::{Element, ElementId};

const CF_ELEMENTS: &str = "elements";
const CF_CHANGES: &str = "changes";
const CF_META: &str = "meta";

const COLUMN_FAMILIES: &[&str] = &[CF_ELEMENTS, CF_CHANGES, CF_META];

const KEY_SCHEMA_VERSION: &[u8] = b"schema_version";
const KEY_CHANGE_ID: &[u8] = b"change_id";
const KEY_LOWEST_CHANGE_ID: &[u8] = b"lowest_change_id";

/// Store configuration.
#[derive(Debug, Clone)]
pub struct RocksConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 128MB)
    pub block_cache_size: usize,
    /// Enable fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 32MB)
    pub write_buffer_size: usize,
    /// Number of batches kept in the change log (default: 10,000)
    pub change_log_retention: u64,
}

impl Default for RocksConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("assembly_cache"),
            block_cache_size: 128 * 1024 * 1024,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 32 * 1024 * 1024,
            change_log_retention: 10_000,
        }
    }
}

impl RocksConfig {
    /// Config for testing (small caches, given directory).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
            change_log_retention: 10_000,
        }
    }
}

/// Durable provider on top of a RocksDB database.
pub struct RocksCacheProvider {
    db: DBWithThreadMode<SingleThreaded>,
    config: RocksConfig,
    /// Serializes every mutation of the database.
    write_lock: Mutex<()>,
    change_id: AtomicU64,
    lowest_change_id: AtomicU64,
}

impl RocksCacheProvider {
    /// Open the database, creating it and its column families if missing.
    pub fn open(config: RocksConfig) -> ProviderResult<Self> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        let provider = Self {
            db,
            config,
            write_lock: Mutex::new(()),
            change_id: AtomicU64::new(0),
            lowest_change_id: AtomicU64::new(0),
        };
        let change_id = provider.read_meta_u64(KEY_CHANGE_ID)?;
        let lowest_change_id = provider.read_meta_u64(KEY_LOWEST_CHANGE_ID)?;
        provider.change_id.store(change_id, Ordering::SeqCst);
        provider.lowest_change_id.store(lowest_change_id, Ordering::SeqCst);

        log::info!(
            "Opened element store at {} (change id {change_id}, lowest {lowest_change_id})",
            provider.config.path.display()
        );
        Ok(provider)
    }

    fn cf_options(name: &str, config: &RocksConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(10.0, false);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_ELEMENTS => {
                // Values are already LZ4 compressed.
                opts.set_compression_type(DBCompressionType::None);
                opts.set_max_write_buffer_number(4);
            }
            CF_CHANGES => {
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.set_max_write_buffer_number(2);
            }
            CF_META => {
                opts.set_compression_type(DBCompressionType::None);
                opts.optimize_for_point_lookup(8 * 1024 * 1024);
            }
            _ => {}
        }

        opts
    }

    /// Get the database path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // ─── Encoding ─────────────────────────────────────────────────────

    fn encode_element(element: &Element) -> ProviderResult<Vec<u8>> {
        let json =
            serde_json::to_vec(element).map_err(|e| ProviderError::Serialization(e.to_string()))?;
        Ok(lz4_flex::compress_prepend_size(&json))
    }

    fn decode_element(bytes: &[u8]) -> ProviderResult<Element> {
        let json = lz4_flex::decompress_size_prepended(bytes)
            .map_err(|e| ProviderError::Compression(e.to_string()))?;
        serde_json::from_slice(&json).map_err(|e| ProviderError::Deserialization(e.to_string()))
    }

    fn decode_element_id(key: &[u8]) -> ProviderResult<ElementId> {
        let key = std::str::from_utf8(key)
            .map_err(|e| ProviderError::Deserialization(e.to_string()))?;
        ElementId::decode(key).map_err(|e| ProviderError::Deserialization(e.to_string()))
    }

    fn encode_change_entry(element_ids: &[ElementId]) -> ProviderResult<Vec<u8>> {
        let encoded: Vec<String> = element_ids.iter().map(ElementId::encode).collect();
        bincode::serde::encode_to_vec(&encoded, bincode::config::standard())
            .map_err(|e| ProviderError::Serialization(e.to_string()))
    }

    fn decode_change_entry(bytes: &[u8]) -> ProviderResult<Vec<ElementId>> {
        let (encoded, _): (Vec<String>, _) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|e| ProviderError::Deserialization(e.to_string()))?;
        encoded
            .iter()
            .map(|s| ElementId::decode(s).map_err(|e| ProviderError::Deserialization(e.to_string())))
            .collect()
    }

    fn change_key(change_id: u64) -> [u8; 8] {
        change_id.to_be_bytes()
    }

    fn decode_u64(bytes: &[u8]) -> ProviderResult<u64> {
        let buf: [u8; 8] = bytes
            .try_into()
            .map_err(|_| ProviderError::Deserialization("invalid u64 value".into()))?;
        Ok(u64::from_be_bytes(buf))
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn cf(&self, name: &str) -> ProviderResult<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| ProviderError::Database(format!("Column family '{name}' not found")))
    }

    fn read_meta_u64(&self, key: &[u8]) -> ProviderResult<u64> {
        let cf = self.cf(CF_META)?;
        match self.db.get_cf(cf, key)? {
            Some(bytes) => Self::decode_u64(&bytes),
            None => Ok(0),
        }
    }

    fn write_options(&self) -> WriteOptions {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        write_opts
    }

    /// Queue deletion of every key of a column family.
    fn clear_cf(&self, batch: &mut WriteBatch, name: &str) -> ProviderResult<()> {
        let cf = self.cf(name)?;
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            batch.delete_cf(cf, &key);
        }
        Ok(())
    }

    /// Queue deletion of change-log entries up to and including `up_to`.
    fn prune_changes(&self, batch: &mut WriteBatch, up_to: u64) -> ProviderResult<()> {
        let cf = self.cf(CF_CHANGES)?;
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            if Self::decode_u64(&key)? > up_to {
                break;
            }
            batch.delete_cf(cf, &key);
        }
        Ok(())
    }
}

#[async_trait]
impl CacheProvider for RocksCacheProvider {
    async fn get_element(&self, element_id: &ElementId) -> ProviderResult<Option<Element>> {
        let cf = self.cf(CF_ELEMENTS)?;
        match self.db.get_cf(cf, element_id.encode().as_bytes())? {
            Some(bytes) => Ok(Some(Self::decode_element(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn get_collection(&self, collection: &str) -> ProviderResult<BTreeMap<u64, Element>> {
        let cf = self.cf(CF_ELEMENTS)?;
        // Collections never contain ':', so this prefix matches exactly one collection.
        let prefix = format!("{collection}:");
        let mut elements = BTreeMap::new();

        let iter = self.db.iterator_cf(
            cf,
            IteratorMode::From(prefix.as_bytes(), Direction::Forward),
        );
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(prefix.as_bytes()) {
                break;
            }
            let element_id = Self::decode_element_id(&key)?;
            elements.insert(element_id.id(), Self::decode_element(&value)?);
        }
        Ok(elements)
    }

    async fn get_all(&self) -> ProviderResult<BTreeMap<ElementId, Element>> {
        let cf = self.cf(CF_ELEMENTS)?;
        let mut elements = BTreeMap::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, value) = item?;
            elements.insert(Self::decode_element_id(&key)?, Self::decode_element(&value)?);
        }
        Ok(elements)
    }

    async fn add_changed_elements(
        &self,
        changes: Vec<(ElementId, Option<Element>)>,
    ) -> ProviderResult<u64> {
        let _guard = self.write_lock.lock().await;
        let cf_elements = self.cf(CF_ELEMENTS)?;
        let cf_changes = self.cf(CF_CHANGES)?;
        let cf_meta = self.cf(CF_META)?;

        let change_id = self.change_id.load(Ordering::SeqCst) + 1;
        let mut batch = WriteBatch::default();
        let mut touched = Vec::with_capacity(changes.len());

        for (element_id, data) in &changes {
            let key = element_id.encode();
            match data {
                Some(element) => batch.put_cf(cf_elements, key.as_bytes(), Self::encode_element(element)?),
                None => batch.delete_cf(cf_elements, key.as_bytes()),
            }
            touched.push(element_id.clone());
        }
        batch.put_cf(cf_changes, Self::change_key(change_id), Self::encode_change_entry(&touched)?);
        batch.put_cf(cf_meta, KEY_CHANGE_ID, change_id.to_be_bytes());

        let mut lowest = self.lowest_change_id.load(Ordering::SeqCst);
        let retention = self.config.change_log_retention.max(1);
        if change_id - lowest > retention {
            let new_lowest = change_id - retention;
            self.prune_changes(&mut batch, new_lowest)?;
            batch.put_cf(cf_meta, KEY_LOWEST_CHANGE_ID, new_lowest.to_be_bytes());
            lowest = new_lowest;
        }

        self.db.write_opt(batch, &self.write_options())?;
        // Counters move only after the batch is durable in RocksDB.
        self.change_id.store(change_id, Ordering::SeqCst);
        self.lowest_change_id.store(lowest, Ordering::SeqCst);
        Ok(change_id)
    }

    async fn get_data_since(&self, change_id: u64) -> ProviderResult<DataSince> {
        let cf_elements = self.cf(CF_ELEMENTS)?;
        let cf_changes = self.cf(CF_CHANGES)?;
        let cf_meta = self.cf(CF_META)?;
        let snapshot = self.db.snapshot();

        let current = match snapshot.get_cf(cf_meta, KEY_CHANGE_ID)? {
            Some(bytes) => Self::decode_u64(&bytes)?,
            None => 0,
        };

        let mut touched = BTreeSet::new();
        if change_id < u64::MAX {
            let start = Self::change_key(change_id + 1);
            let iter = snapshot.iterator_cf(cf_changes, IteratorMode::From(&start, Direction::Forward));
            for item in iter {
                let (_, value) = item?;
                touched.extend(Self::decode_change_entry(&value)?);
            }
        }

        let mut elements = BTreeMap::new();
        for element_id in touched {
            let data = match snapshot.get_cf(cf_elements, element_id.encode().as_bytes())? {
                Some(bytes) => Some(Self::decode_element(&bytes)?),
                None => None,
            };
            elements.insert(element_id, data);
        }

        Ok(DataSince {
            elements,
            to_change_id: current.max(change_id),
        })
    }

    async fn set_full_data(&self, data: BTreeMap<ElementId, Element>) -> ProviderResult<()> {
        let _guard = self.write_lock.lock().await;
        let cf_elements = self.cf(CF_ELEMENTS)?;
        let cf_meta = self.cf(CF_META)?;

        let mut batch = WriteBatch::default();
        self.clear_cf(&mut batch, CF_ELEMENTS)?;
        for (element_id, element) in &data {
            batch.put_cf(cf_elements, element_id.encode().as_bytes(), Self::encode_element(element)?);
        }
        let change_id = self.change_id.load(Ordering::SeqCst);
        batch.put_cf(cf_meta, KEY_LOWEST_CHANGE_ID, change_id.to_be_bytes());

        self.db.write_opt(batch, &self.write_options())?;
        self.lowest_change_id.store(change_id, Ordering::SeqCst);
        log::debug!("Stored {} repopulated elements", data.len());
        Ok(())
    }

    async fn reset(&self) -> ProviderResult<()> {
        let _guard = self.write_lock.lock().await;
        let mut batch = WriteBatch::default();
        for name in COLUMN_FAMILIES {
            self.clear_cf(&mut batch, name)?;
        }
        self.db.write_opt(batch, &self.write_options())?;
        self.change_id.store(0, Ordering::SeqCst);
        self.lowest_change_id.store(0, Ordering::SeqCst);
        log::info!("Cleared element store at {}", self.config.path.display());
        Ok(())
    }

    async fn advance_change_id(&self, change_id: u64) -> ProviderResult<()> {
        let _guard = self.write_lock.lock().await;
        if change_id <= self.change_id.load(Ordering::SeqCst) {
            return Ok(());
        }
        let cf_meta = self.cf(CF_META)?;
        let mut batch = WriteBatch::default();
        self.clear_cf(&mut batch, CF_CHANGES)?;
        batch.put_cf(cf_meta, KEY_CHANGE_ID, change_id.to_be_bytes());
        batch.put_cf(cf_meta, KEY_LOWEST_CHANGE_ID, change_id.to_be_bytes());
        self.db.write_opt(batch, &self.write_options())?;
        self.change_id.store(change_id, Ordering::SeqCst);
        self.lowest_change_id.store(change_id, Ordering::SeqCst);
        Ok(())
    }

    async fn current_change_id(&self) -> ProviderResult<u64> {
        Ok(self.change_id.load(Ordering::SeqCst))
    }

    async fn lowest_change_id(&self) -> ProviderResult<u64> {
        Ok(self.lowest_change_id.load(Ordering::SeqCst))
    }

    async fn get_schema_version(&self) -> ProviderResult<Option<String>> {
        let cf = self.cf(CF_META)?;
        match self.db.get_cf(cf, KEY_SCHEMA_VERSION)? {
            Some(bytes) => String::from_utf8(bytes)
                .map(Some)
                .map_err(|e| ProviderError::Deserialization(e.to_string())),
            None => Ok(None),
        }
    }

    async fn set_schema_version(&self, version: &str) -> ProviderResult<()> {
        let _guard = self.write_lock.lock().await;
        let cf = self.cf(CF_META)?;
        self.db
            .put_cf_opt(cf, KEY_SCHEMA_VERSION, version.as_bytes(), &self.write_options())?;
        Ok(())
    }

    async fn flush(&self) -> ProviderResult<()> {
        self.db.flush()?;
        Ok(())
    }
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn tag(id: u64, name: &str) -> (ElementId, Option<Element>) {
        let element = json!({ "id": id, "name": name }).as_object().unwrap().clone();
        (ElementId::new("core/tag", id).unwrap(), Some(element))
    }

    fn tag_id(id: u64) -> ElementId {
        ElementId::new("core/tag", id).unwrap()
    }

    #[tokio::test]
    async fn test_store_open_close() {
        let dir = tempdir().unwrap();
        let provider = RocksCacheProvider::open(RocksConfig::for_testing(dir.path().join("db"))).unwrap();
        assert!(provider.path().exists());
        assert_eq!(provider.current_change_id().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_batches_and_reads() {
        let dir = tempdir().unwrap();
        let provider = RocksCacheProvider::open(RocksConfig::for_testing(dir.path().join("db"))).unwrap();

        let first = provider
            .add_changed_elements(vec![tag(1, "a"), tag(2, "b")])
            .await
            .unwrap();
        assert_eq!(first, 1);

        let element = provider.get_element(&tag_id(2)).await.unwrap().unwrap();
        assert_eq!(element["name"], "b");

        // A collection whose name is a prefix of another must not leak into it.
        let (_, data) = tag(5, "other");
        provider
            .add_changed_elements(vec![(ElementId::new("core/tags", 5).unwrap(), data)])
            .await
            .unwrap();
        let collection = provider.get_collection("core/tag").await.unwrap();
        assert_eq!(collection.keys().copied().collect::<Vec<_>>(), vec![1, 2]);

        assert_eq!(provider.get_all().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_data_since_reports_tombstones() {
        let dir = tempdir().unwrap();
        let provider = RocksCacheProvider::open(RocksConfig::for_testing(dir.path().join("db"))).unwrap();

        provider.add_changed_elements(vec![tag(1, "a")]).await.unwrap();
        let second = provider
            .add_changed_elements(vec![(tag_id(1), None)])
            .await
            .unwrap();
        assert_eq!(second, 2);

        let since = provider.get_data_since(1).await.unwrap();
        assert_eq!(since.to_change_id, 2);
        assert_eq!(since.elements.len(), 1);
        assert!(since.elements[&tag_id(1)].is_none());
        assert!(provider.get_element(&tag_id(1)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_change_id_recovery_after_reopen() {
        let dir = tempdir().unwrap();
        let config = RocksConfig::for_testing(dir.path().join("db"));

        {
            let provider = RocksCacheProvider::open(config.clone()).unwrap();
            provider.add_changed_elements(vec![tag(1, "a")]).await.unwrap();
            provider.add_changed_elements(vec![tag(2, "b")]).await.unwrap();
            provider.set_schema_version("v3").await.unwrap();
            provider.flush().await.unwrap();
        }

        let provider = RocksCacheProvider::open(config).unwrap();
        assert_eq!(provider.current_change_id().await.unwrap(), 2);
        assert_eq!(provider.get_schema_version().await.unwrap().as_deref(), Some("v3"));
        let next = provider.add_changed_elements(vec![tag(3, "c")]).await.unwrap();
        assert_eq!(next, 3);
        assert_eq!(provider.get_all().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_retention_prunes_change_log() {
        let dir = tempdir().unwrap();
        let mut config = RocksConfig::for_testing(dir.path().join("db"));
        config.change_log_retention = 3;
        let provider = RocksCacheProvider::open(config).unwrap();

        for id in 1..=6 {
            provider.add_changed_elements(vec![tag(id, "x")]).await.unwrap();
        }
        assert_eq!(provider.lowest_change_id().await.unwrap(), 3);

        let since = provider.get_data_since(0).await.unwrap();
        let ids: Vec<u64> = since.elements.keys().map(|e| e.id()).collect();
        assert_eq!(ids, vec![4, 5, 6]);
    }

    #[tokio::test]
    async fn test_reset_clears_everything() {
        let dir = tempdir().unwrap();
        let provider = RocksCacheProvider::open(RocksConfig::for_testing(dir.path().join("db"))).unwrap();
        provider.add_changed_elements(vec![tag(1, "a")]).await.unwrap();
        provider.set_schema_version("v1").await.unwrap();

        provider.reset().await.unwrap();
        assert_eq!(provider.current_change_id().await.unwrap(), 0);
        assert!(provider.get_all().await.unwrap().is_empty());
        assert!(provider.get_schema_version().await.unwrap().is_none());
        assert!(provider.get_data_since(0).await.unwrap().elements.is_empty());

        let mut full = BTreeMap::new();
        let (id, data) = tag(9, "seed");
        full.insert(id, data.unwrap());
        provider.set_full_data(full).await.unwrap();
        assert_eq!(provider.get_all().await.unwrap().len(), 1);
        assert_eq!(provider.add_changed_elements(vec![tag(10, "n")]).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_advanced_change_id_survives_reopen() {
        let dir = tempdir().unwrap();
        let config = RocksConfig::for_testing(dir.path().join("db"));

        {
            let provider = RocksCacheProvider::open(config.clone()).unwrap();
            provider.add_changed_elements(vec![tag(1, "a")]).await.unwrap();
            provider.advance_change_id(5).await.unwrap();
            // Lowering is ignored.
            provider.advance_change_id(2).await.unwrap();
            provider.flush().await.unwrap();
        }

        let provider = RocksCacheProvider::open(config).unwrap();
        assert_eq!(provider.current_change_id().await.unwrap(), 5);
        assert_eq!(provider.lowest_change_id().await.unwrap(), 5);
        assert!(provider.get_data_since(0).await.unwrap().elements.is_empty());
        assert_eq!(provider.add_changed_elements(vec![tag(2, "b")]).await.unwrap(), 6);
    }
}
