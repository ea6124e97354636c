// Lease store adapters
//
// The lock only needs four single-key primitives from the shared store. All
// mutual exclusion comes from the atomicity of these calls; nothing above
// this layer takes a lock around read-then-write sequences.

use crate::Result;
use async_trait::async_trait;

pub mod config;
pub mod memory;
pub mod sled_store;

pub use config::{open_store, InMemoryStoreConfig, SledStoreConfig, StoreConfig};
pub use memory::InMemoryStore;
pub use sled_store::SledStore;

/// A stored value with the version the store assigned to the write.
///
/// Versions come from one strictly increasing counter per store and are
/// never reused, so they double as fencing tokens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned {
    pub value: Vec<u8>,
    pub version: u64,
}

/// Outcome of a conditional write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    Applied { version: u64 },
    /// The key did not hold what the caller expected
    Conflict,
}

impl CasOutcome {
    pub fn applied(self) -> Option<u64> {
        match self {
            Self::Applied { version } => Some(version),
            Self::Conflict => None,
        }
    }
}

#[async_trait]
pub trait LeaseStore: Send + Sync + std::fmt::Debug {
    async fn get(&self, key: &str) -> Result<Option<Versioned>>;

    /// Write `value` only if `key` is absent
    async fn cas_create(&self, key: &str, value: Vec<u8>) -> Result<CasOutcome>;

    /// Write `value` only if `key` still holds exactly `expected`
    async fn cas_replace(&self, key: &str, expected: &Versioned, value: Vec<u8>)
        -> Result<CasOutcome>;

    /// Delete `key` only if it still holds exactly `expected`
    async fn cas_delete(&self, key: &str, expected: &Versioned) -> Result<bool>;
}
