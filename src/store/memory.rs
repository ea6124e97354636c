use super::{CasOutcome, LeaseStore, Versioned};
use crate::{Error, Result};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

/// Process-local CAS store.
///
/// Serves single-process deployments and tests. Every operation is atomic per
/// key through the map's entry locking. Outages and latency can be injected
/// to exercise failure handling.
#[derive(Debug)]
pub struct InMemoryStore {
    data: DashMap<String, Versioned>,
    next_version: AtomicU64,
    available: AtomicBool,
    latency: Option<Duration>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            data: DashMap::new(),
            next_version: AtomicU64::new(1),
            available: AtomicBool::new(true),
            latency: None,
        }
    }

    /// Delay every operation by `latency` before it touches the map
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency: Some(latency),
            ..Self::new()
        }
    }

    /// Simulate losing (or regaining) connectivity to the store
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Overwrite `key` unconditionally, bypassing the codec. For fault
    /// injection and operator repair only.
    pub fn put_raw(&self, key: &str, value: Vec<u8>) -> u64 {
        let version = self.bump();
        self.data.insert(key.to_string(), Versioned { value, version });
        version
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn bump(&self) -> u64 {
        self.next_version.fetch_add(1, Ordering::SeqCst)
    }

    async fn enter(&self, key: &str) -> Result<()> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::store(key, "in-memory store marked unavailable"))
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LeaseStore for InMemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Versioned>> {
        self.enter(key).await?;
        Ok(self.data.get(key).map(|v| v.clone()))
    }

    async fn cas_create(&self, key: &str, value: Vec<u8>) -> Result<CasOutcome> {
        self.enter(key).await?;
        match self.data.entry(key.to_string()) {
            Entry::Occupied(_) => Ok(CasOutcome::Conflict),
            Entry::Vacant(slot) => {
                let version = self.bump();
                slot.insert(Versioned { value, version });
                Ok(CasOutcome::Applied { version })
            }
        }
    }

    async fn cas_replace(
        &self,
        key: &str,
        expected: &Versioned,
        value: Vec<u8>,
    ) -> Result<CasOutcome> {
        self.enter(key).await?;
        match self.data.get_mut(key) {
            Some(mut current) if *current == *expected => {
                let version = self.bump();
                *current = Versioned { value, version };
                Ok(CasOutcome::Applied { version })
            }
            _ => Ok(CasOutcome::Conflict),
        }
    }

    async fn cas_delete(&self, key: &str, expected: &Versioned) -> Result<bool> {
        self.enter(key).await?;
        Ok(self
            .data
            .remove_if(key, |_, current| current == expected)
            .is_some())
    }
}
