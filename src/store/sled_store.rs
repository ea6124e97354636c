use super::{CasOutcome, LeaseStore, Versioned};
use crate::{Error, Result};
use async_trait::async_trait;
use std::path::Path;

/// Persistent CAS store on top of `sled`.
///
/// Each stored entry is the 8-byte big-endian version followed by the lease
/// payload, so a compare-and-swap on the raw bytes also checks the version.
/// Versions come from `Db::generate_id`, which never repeats across restarts.
#[derive(Debug, Clone)]
pub struct SledStore {
    db: sled::Db,
    tree: sled::Tree,
    flush_on_write: bool,
}

const VERSION_LEN: usize = 8;

impl SledStore {
    pub fn open(path: &Path, tree: &str, flush_on_write: bool) -> Result<Self> {
        let db = sled::open(path).map_err(|e| Error::store(tree, e))?;
        let tree = db.open_tree(tree).map_err(|e| Error::store(tree, e))?;
        Ok(Self {
            db,
            tree,
            flush_on_write,
        })
    }

    /// Throwaway store that lives in memory and is removed on drop
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(|e| Error::store("", e))?;
        let tree = db.open_tree("leases").map_err(|e| Error::store("", e))?;
        Ok(Self {
            db,
            tree,
            flush_on_write: false,
        })
    }

    /// Run a blocking sled call off the async worker threads
    async fn blocking<T, F>(&self, key: &str, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&sled::Db, &sled::Tree) -> sled::Result<T> + Send + 'static,
    {
        let db = self.db.clone();
        let tree = self.tree.clone();
        let flush = self.flush_on_write;
        tokio::task::spawn_blocking(move || -> sled::Result<T> {
            let out = op(&db, &tree)?;
            if flush {
                tree.flush()?;
            }
            Ok(out)
        })
        .await
        .map_err(|e| Error::store(key, e))?
        .map_err(|e: sled::Error| Error::store(key, e))
    }
}

fn join(versioned: &Versioned) -> Vec<u8> {
    if versioned.version == 0 {
        // Foreign bytes we never versioned; compare them as-is
        return versioned.value.clone();
    }
    let mut raw = Vec::with_capacity(VERSION_LEN + versioned.value.len());
    raw.extend_from_slice(&versioned.version.to_be_bytes());
    raw.extend_from_slice(&versioned.value);
    raw
}

fn split(raw: &[u8]) -> Versioned {
    match raw.split_first_chunk::<VERSION_LEN>() {
        Some((version, value)) if u64::from_be_bytes(*version) != 0 => Versioned {
            value: value.to_vec(),
            version: u64::from_be_bytes(*version),
        },
        _ => Versioned {
            value: raw.to_vec(),
            version: 0,
        },
    }
}

fn next_version(db: &sled::Db) -> sled::Result<u64> {
    // generate_id starts at 0, which is reserved for unversioned bytes
    Ok(db.generate_id()? + 1)
}

#[async_trait]
impl LeaseStore for SledStore {
    async fn get(&self, key: &str) -> Result<Option<Versioned>> {
        let k = key.to_string();
        let raw = self.blocking(key, move |_, tree| tree.get(k)).await?;
        Ok(raw.map(|raw| split(&raw)))
    }

    async fn cas_create(&self, key: &str, value: Vec<u8>) -> Result<CasOutcome> {
        let k = key.to_string();
        self.blocking(key, move |db, tree| {
            let version = next_version(db)?;
            let new = join(&Versioned { value, version });
            Ok(match tree.compare_and_swap(k, None::<&[u8]>, Some(new))? {
                Ok(()) => CasOutcome::Applied { version },
                Err(_) => CasOutcome::Conflict,
            })
        })
        .await
    }

    async fn cas_replace(
        &self,
        key: &str,
        expected: &Versioned,
        value: Vec<u8>,
    ) -> Result<CasOutcome> {
        let k = key.to_string();
        let old = join(expected);
        self.blocking(key, move |db, tree| {
            let version = next_version(db)?;
            let new = join(&Versioned { value, version });
            Ok(match tree.compare_and_swap(k, Some(old), Some(new))? {
                Ok(()) => CasOutcome::Applied { version },
                Err(_) => CasOutcome::Conflict,
            })
        })
        .await
    }

    async fn cas_delete(&self, key: &str, expected: &Versioned) -> Result<bool> {
        let k = key.to_string();
        let old = join(expected);
        self.blocking(key, move |_, tree| {
            Ok(tree
                .compare_and_swap(k, Some(old), None::<Vec<u8>>)?
                .is_ok())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_join() {
        let v = Versioned {
            value: b"LL1payload".to_vec(),
            version: 7,
        };
        assert_eq!(split(&join(&v)), v);

        // Short or unversioned bytes come back with version zero
        let foreign = split(b"abc");
        assert_eq!(foreign.version, 0);
        assert_eq!(join(&foreign), b"abc");
    }

    #[tokio::test]
    async fn test_cas_cycle() {
        let store = SledStore::temporary().unwrap();

        let v1 = store.cas_create("k", b"a".to_vec()).await.unwrap().applied().unwrap();
        assert_eq!(
            store.cas_create("k", b"b".to_vec()).await.unwrap(),
            CasOutcome::Conflict
        );

        let current = store.get("k").await.unwrap().unwrap();
        assert_eq!(current, Versioned { value: b"a".to_vec(), version: v1 });

        let v2 = store
            .cas_replace("k", &current, b"b".to_vec())
            .await
            .unwrap()
            .applied()
            .unwrap();
        assert!(v2 > v1);
        assert_eq!(
            store.cas_replace("k", &current, b"c".to_vec()).await.unwrap(),
            CasOutcome::Conflict
        );

        let current = store.get("k").await.unwrap().unwrap();
        assert!(store.cas_delete("k", &current).await.unwrap());
        assert!(!store.cas_delete("k", &current).await.unwrap());
        assert!(store.get("k").await.unwrap().is_none());
    }
}
