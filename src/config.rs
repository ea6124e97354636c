// Lock configuration
//
// One immutable snapshot is built at startup (TOML file, then LISTEN_LOCK_*
// environment overrides) and handed to the engine by value. Nothing reads
// configuration lazily afterwards.

use crate::store::{SledStoreConfig, StoreConfig};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Lease timing and retry policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Lease validity window used when the caller doesn't pick one
    pub default_ttl_ms: u64,
    /// Renew every `ttl / renew_fraction`
    pub renew_fraction: u32,
    /// Extra renew attempts after a store error before giving the lease up
    pub renew_retries: u32,
    /// Base delay between renew retries; jittered and doubled per attempt
    pub retry_backoff_ms: u64,
    /// How long a corrupt value must sit unchanged before it may be
    /// reclaimed. Defaults to the contender's ttl.
    pub corrupt_grace_ms: Option<u64>,
    /// Without a liveness answer, a lease is only reclaimed once it is this
    /// many ttl windows old
    pub skew_grace_multiplier: u32,
    /// Rounds of lost CAS races `try_acquire` absorbs before giving up
    pub max_cas_attempts: u32,
    pub acquire_backoff_initial_ms: u64,
    pub acquire_backoff_max_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            default_ttl_ms: 30_000,
            renew_fraction: 3,
            renew_retries: 2,
            retry_backoff_ms: 100,
            corrupt_grace_ms: None,
            skew_grace_multiplier: 2,
            max_cas_attempts: 3,
            acquire_backoff_initial_ms: 50,
            acquire_backoff_max_ms: 2_000,
        }
    }
}

impl LockConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_millis(self.default_ttl_ms)
    }

    pub fn renew_interval(&self, ttl: Duration) -> Duration {
        ttl / self.renew_fraction.max(1)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn corrupt_grace(&self, ttl: Duration) -> Duration {
        self.corrupt_grace_ms.map_or(ttl, Duration::from_millis)
    }

    pub fn acquire_backoff_initial(&self) -> Duration {
        Duration::from_millis(self.acquire_backoff_initial_ms)
    }

    pub fn acquire_backoff_max(&self) -> Duration {
        Duration::from_millis(self.acquire_backoff_max_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.default_ttl_ms == 0 {
            return Err(Error::Config("default_ttl_ms must be positive".to_string()));
        }
        if self.renew_fraction < 2 {
            return Err(Error::Config(format!(
                "renew_fraction must be at least 2, got {}",
                self.renew_fraction
            )));
        }
        if self.skew_grace_multiplier < 1 {
            return Err(Error::Config(
                "skew_grace_multiplier must be at least 1".to_string(),
            ));
        }
        if self.max_cas_attempts == 0 {
            return Err(Error::Config("max_cas_attempts must be positive".to_string()));
        }
        if self.acquire_backoff_initial_ms > self.acquire_backoff_max_ms {
            return Err(Error::Config(
                "acquire_backoff_initial_ms exceeds acquire_backoff_max_ms".to_string(),
            ));
        }
        Ok(())
    }
}

/// Everything a node needs to run the lock
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Stable cluster member name; a random one is used when unset
    pub node_id: Option<String>,
    pub lock: LockConfig,
    pub store: StoreConfig,
}

impl ServiceConfig {
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::Config(e.to_string()))
    }

    /// Read `path` (if given) and apply environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => Self::from_toml(&std::fs::read_to_string(path)?)?,
            None => Self::default(),
        };
        let config = config.with_env(std::env::vars())?;
        config.lock.validate()?;
        Ok(config)
    }

    /// Apply `LISTEN_LOCK_*` overrides from `vars`
    pub fn with_env<I>(mut self, vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (name, value) in vars {
            match name.as_str() {
                "LISTEN_LOCK_NODE_ID" => self.node_id = Some(value),
                "LISTEN_LOCK_TTL_MS" => self.lock.default_ttl_ms = parse(&name, &value)?,
                "LISTEN_LOCK_RENEW_FRACTION" => self.lock.renew_fraction = parse(&name, &value)?,
                "LISTEN_LOCK_RENEW_RETRIES" => self.lock.renew_retries = parse(&name, &value)?,
                "LISTEN_LOCK_SKEW_GRACE" => {
                    self.lock.skew_grace_multiplier = parse(&name, &value)?;
                }
                "LISTEN_LOCK_STORE_PATH" => {
                    self.store = StoreConfig::Sled(SledStoreConfig {
                        path: PathBuf::from(value),
                        ..SledStoreConfig::default()
                    });
                }
                _ => {}
            }
        }
        Ok(self)
    }
}

fn parse<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| Error::Config(format!("{name}: cannot parse {value:?}")))
}
