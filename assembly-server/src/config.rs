use anyhow::{Context, Result};
use std::path::PathBuf;

use assembly_cache::{CacheConfig, RocksConfig, ServerConfig};

const DEFAULT_BIND: &str = "127.0.0.1:9090";
const DEFAULT_SESSION_QUEUE_CAPACITY: usize = 256;
const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 30;
const DEFAULT_CHANGE_LOG_RETENTION: usize = 10_000;

// Service configuration sourced from environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    // WebSocket listener bind address.
    pub bind_addr: String,
    // RocksDB directory; the in-memory provider is used when unset.
    pub data_path: Option<PathBuf>,
    // JSON fixture with data, permissions and restrictions.
    pub fixture_path: Option<PathBuf>,
    // Expected cache schema version.
    pub schema_version: String,
    // Let anonymous (user 0) sessions connect.
    pub anonymous_enabled: bool,
    pub session_queue_capacity: usize,
    pub heartbeat_interval_secs: u64,
    // Batches kept in the change log before clients fall back to full data.
    pub change_log_retention: usize,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let bind_addr = lookup("ASSEMBLY_BIND").unwrap_or_else(|| DEFAULT_BIND.to_string());
        bind_addr
            .parse::<std::net::SocketAddr>()
            .with_context(|| format!("parse ASSEMBLY_BIND {bind_addr:?}"))?;
        let data_path = lookup("ASSEMBLY_DATA_PATH").map(PathBuf::from);
        let fixture_path = lookup("ASSEMBLY_FIXTURE").map(PathBuf::from);
        let schema_version = lookup("ASSEMBLY_SCHEMA_VERSION")
            .unwrap_or_else(|| CacheConfig::default().schema_version);
        let anonymous_enabled = lookup("ASSEMBLY_ANONYMOUS")
            .map(|value| matches!(value.as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);
        let session_queue_capacity = parse_positive(&lookup, "ASSEMBLY_SESSION_QUEUE")?
            .unwrap_or(DEFAULT_SESSION_QUEUE_CAPACITY);
        let heartbeat_interval_secs = parse_positive(&lookup, "ASSEMBLY_HEARTBEAT_SECS")?
            .unwrap_or(DEFAULT_HEARTBEAT_INTERVAL_SECS);
        let change_log_retention = parse_positive(&lookup, "ASSEMBLY_CHANGE_LOG_RETENTION")?
            .unwrap_or(DEFAULT_CHANGE_LOG_RETENTION);

        Ok(Self {
            bind_addr,
            data_path,
            fixture_path,
            schema_version,
            anonymous_enabled,
            session_queue_capacity,
            heartbeat_interval_secs,
            change_log_retention,
        })
    }

    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            schema_version: self.schema_version.clone(),
            ..CacheConfig::default()
        }
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            bind_addr: self.bind_addr.clone(),
            session_queue_capacity: self.session_queue_capacity,
            heartbeat_interval_secs: self.heartbeat_interval_secs,
            ..ServerConfig::default()
        }
    }

    pub fn rocks_config(&self) -> Option<RocksConfig> {
        self.data_path.as_ref().map(|path| RocksConfig {
            path: path.clone(),
            change_log_retention: self.change_log_retention as u64,
            ..RocksConfig::default()
        })
    }
}

fn parse_positive<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr + PartialOrd + Default,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let Some(value) = lookup(key) else {
        return Ok(None);
    };
    let parsed = value
        .parse::<T>()
        .with_context(|| format!("parse {key} {value:?}"))?;
    Ok((parsed > T::default()).then_some(parsed))
}
