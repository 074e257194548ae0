//! Assembly autoupdate service.
//!
//! Serves the element cache over WebSocket. Data, session tokens,
//! permissions and restriction rules come from a JSON fixture
//! (`ASSEMBLY_FIXTURE`); the cache
//! lives in RocksDB when `ASSEMBLY_DATA_PATH` is set, in memory otherwise.

mod config;
mod fixture;

use anyhow::{Context, Result};
use log::info;
use std::sync::Arc;
use tokio::sync::watch;

use assembly_cache::{
    AutoupdateServer, CacheProvider, ElementCache, MemoryCacheProvider, RestrictionEngine,
    RocksCacheProvider,
};
use config::AppConfig;
use fixture::Fixture;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let config = AppConfig::from_env()?;
    let fixture = Arc::new(match &config.fixture_path {
        Some(path) => Fixture::load(path)?,
        None => Fixture::default(),
    });
    info!(
        "Loaded fixture with {} elements in {} collections",
        fixture.element_count(),
        fixture.data.len()
    );

    let provider: Arc<dyn CacheProvider> = match config.rocks_config() {
        Some(rocks) => {
            let path = rocks.path.display().to_string();
            Arc::new(RocksCacheProvider::open(rocks).with_context(|| format!("open element store {path}"))?)
        }
        None => Arc::new(MemoryCacheProvider::with_retention(config.change_log_retention)),
    };

    let restrictions = RestrictionEngine::new(fixture.registry(), fixture.clone())
        .with_anonymous(config.anonymous_enabled);
    let cache = Arc::new(
        ElementCache::new(provider, Arc::new(restrictions), config.cache_config())
            .with_populator(fixture.clone()),
    );
    cache.init().await.context("initialize element cache")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = AutoupdateServer::new(config.server_config(), cache.clone(), fixture.clone());
    let mut serving = tokio::spawn(async move { server.run(shutdown_rx).await });

    tokio::select! {
        finished = &mut serving => {
            // The listener failed before any shutdown was requested.
            finished.context("server task")??;
            return Ok(());
        }
        signal = tokio::signal::ctrl_c() => signal.context("listen for ctrl-c")?,
    }

    info!("Shutting down");
    let _ = shutdown_tx.send(true);
    cache.shutdown().await.context("shut down element cache")?;
    serving.await.context("server task")??;
    Ok(())
}
