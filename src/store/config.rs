use super::{InMemoryStore, LeaseStore, SledStore};
use crate::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Which store backs the lock. Resolved once at startup by [`open_store`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum StoreConfig {
    Memory(InMemoryStoreConfig),
    Sled(SledStoreConfig),
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::Memory(InMemoryStoreConfig::default())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InMemoryStoreConfig {
    /// Artificial per-operation latency, for rehearsing slow stores
    pub latency_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SledStoreConfig {
    pub path: PathBuf,
    pub tree: String,
    pub flush_on_write: bool,
}

impl Default for SledStoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("listen-lock.db"),
            tree: "leases".to_string(),
            flush_on_write: true,
        }
    }
}

pub fn open_store(config: &StoreConfig) -> Result<Arc<dyn LeaseStore>> {
    match config {
        StoreConfig::Memory(memory) => {
            info!(latency_ms = ?memory.latency_ms, "using in-memory lease store");
            let store = match memory.latency_ms {
                Some(ms) => InMemoryStore::with_latency(Duration::from_millis(ms)),
                None => InMemoryStore::new(),
            };
            Ok(Arc::new(store))
        }
        StoreConfig::Sled(sled) => {
            info!(path = %sled.path.display(), tree = %sled.tree, "opening sled lease store");
            Ok(Arc::new(SledStore::open(
                &sled.path,
                &sled.tree,
                sled.flush_on_write,
            )?))
        }
    }
}
