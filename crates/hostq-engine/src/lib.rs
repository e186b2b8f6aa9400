//! Imperative shell around the pure queue and reconciliation logic.
//!
//! [`Engine`] owns the store, the transport and the clock. Every public
//! operation reads what it needs from the store, asks `hostq-core` what to do,
//! and writes the outcome back through the store's atomic operations.

pub mod canceller;
pub mod clock;
pub mod config;
pub mod queue;
pub mod reconcile;
pub mod seed;
pub mod summary;
pub mod tracker;
pub mod transport;

use std::path::Path;
use std::sync::Arc;

use anyhow::Result as AnyResult;
use hostq_core::{Error, Host, HostId, Result, Target, TargetId};
use hostq_storage::Store;
use hostq_storage_sqlite::SqliteStore;

pub use clock::{Clock, FixedClock, SystemClock};
pub use config::EngineConfig;
pub use queue::EnqueueRequest;
pub use seed::{load_world, seed_store, World};
pub use transport::{NoopTransport, RecordingTransport, Transport};

pub struct Engine {
    store: Arc<dyn Store>,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
}

impl Engine {
    pub fn new(
        store: Arc<dyn Store>,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            transport,
            clock,
            config,
        }
    }

    /// Opens the engine for a working directory, writing a default config on
    /// first use.
    pub fn open(root: &Path) -> AnyResult<Self> {
        let config = Self::load_or_init_config(root)?;
        let store = SqliteStore::open(&config.store_path(root))?;
        Ok(Self::new(
            Arc::new(store),
            Arc::new(NoopTransport),
            Arc::new(SystemClock),
            config,
        ))
    }

    /// Writes the default config if there is none and creates the database
    /// schema.
    pub fn init(root: &Path) -> AnyResult<EngineConfig> {
        let config = Self::load_or_init_config(root)?;
        let db_path = config.store_path(root);
        let store = SqliteStore::open(&db_path)?;
        drop(store);
        tracing::info!(path = %db_path.display(), "store initialized");
        Ok(config)
    }

    fn load_or_init_config(root: &Path) -> AnyResult<EngineConfig> {
        let path = EngineConfig::config_path(root);
        if path.exists() {
            return EngineConfig::load_from(&path);
        }
        let config = EngineConfig::default();
        config.save_to(&path)?;
        Ok(config)
    }

    pub fn store(&self) -> &dyn Store {
        self.store.as_ref()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn now(&self) -> i64 {
        self.clock.now_unix()
    }

    fn host(&self, id: HostId) -> Result<Host> {
        self.store
            .get_host(id)?
            .ok_or_else(|| Error::not_found("host", id))
    }

    fn target(&self, id: &TargetId) -> Result<Target> {
        self.store
            .get_target(id)?
            .ok_or_else(|| Error::not_found("target", id))
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_keeps_state_under_root() {
        let dir = tempfile::tempdir().unwrap();
        let config = Engine::init(dir.path()).unwrap();
        assert_eq!(config.store_path(dir.path()), dir.path().join(".hostq").join("hostq.db"));
        assert!(dir.path().join(".hostq/hostq.toml").is_file());
        assert!(dir.path().join(".hostq/hostq.db").is_file());

        let engine = Engine::open(dir.path()).unwrap();
        assert!(engine.store().list_hosts(None).unwrap().is_empty());
    }
}
