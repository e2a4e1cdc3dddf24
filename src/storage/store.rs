//! Content-addressed store over a [`BlockStore`]
//!
//! Values are encoded with bincode, hashed into a [`Cid`] and written once.
//! Reads go through an LRU of decoded-ready byte blocks; anything coming from
//! the backend is re-hashed before it is handed out.

use super::{BlockStore, Cid, StorageError, StorageResult};
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// One line of [`ContentStore::manifest`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockInfo {
    pub cid: Cid,
    pub size: usize,
    pub pinned: bool,
}

/// Cache counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub cached_blocks: usize,
    pub capacity: usize,
}

pub struct ContentStore {
    backend: Box<dyn BlockStore>,
    cache: Option<Mutex<LruCache<Cid, Arc<Vec<u8>>>>>,
    capacity: usize,
    pinned: RwLock<HashSet<Cid>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ContentStore {
    /// Wrap `backend`; a `cache_capacity` of zero disables caching
    pub fn new(backend: Box<dyn BlockStore>, cache_capacity: usize) -> Self {
        info!(
            "Content store on {} backend, cache capacity {}",
            backend.kind(),
            cache_capacity
        );
        Self {
            cache: NonZeroUsize::new(cache_capacity).map(|cap| Mutex::new(LruCache::new(cap))),
            capacity: cache_capacity,
            backend,
            pinned: RwLock::new(HashSet::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn backend_kind(&self) -> &'static str {
        self.backend.kind()
    }

    /// Encode and store `value`, returning its CID
    pub fn store<T: Serialize>(&self, value: &T) -> StorageResult<Cid> {
        let bytes = bincode::serialize(value)?;
        self.put_bytes(bytes)
    }

    /// Fetch and decode the block at `cid`
    pub fn retrieve<T: DeserializeOwned>(&self, cid: &Cid) -> StorageResult<T> {
        let bytes = self.get_bytes(cid)?;
        Ok(bincode::deserialize(&bytes)?)
    }

    pub fn put_bytes(&self, bytes: Vec<u8>) -> StorageResult<Cid> {
        let cid = Cid::of(&bytes);
        self.backend.put(&cid, &bytes)?;
        if let Some(cache) = &self.cache {
            cache.lock().put(cid, Arc::new(bytes));
        }
        Ok(cid)
    }

    pub fn get_bytes(&self, cid: &Cid) -> StorageResult<Arc<Vec<u8>>> {
        if let Some(cache) = &self.cache {
            if let Some(bytes) = cache.lock().get(cid) {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(Arc::clone(bytes));
            }
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        let bytes = Arc::new(self.get_verified(cid)?);
        if let Some(cache) = &self.cache {
            cache.lock().put(*cid, Arc::clone(&bytes));
        }
        Ok(bytes)
    }

    /// Read `cid` from the backend, bypassing the cache, and re-hash it
    pub fn get_verified(&self, cid: &Cid) -> StorageResult<Vec<u8>> {
        let bytes = self.backend.get(cid)?.ok_or(StorageError::NotFound(*cid))?;
        let actual = Cid::of(&bytes);
        if actual != *cid {
            warn!("Block {} failed integrity check (hashes to {})", cid, actual);
            return Err(StorageError::Integrity { cid: *cid, actual });
        }
        Ok(bytes)
    }

    /// [`ContentStore::retrieve`] straight from the backend
    pub fn retrieve_verified<T: DeserializeOwned>(&self, cid: &Cid) -> StorageResult<T> {
        let bytes = self.get_verified(cid)?;
        Ok(bincode::deserialize(&bytes)?)
    }

    pub fn contains(&self, cid: &Cid) -> StorageResult<bool> {
        if let Some(cache) = &self.cache {
            if cache.lock().contains(cid) {
                return Ok(true);
            }
        }
        self.backend.contains(cid)
    }

    /// Remove a block regardless of pins
    pub fn delete(&self, cid: &Cid) -> StorageResult<bool> {
        if let Some(cache) = &self.cache {
            cache.lock().pop(cid);
        }
        self.backend.delete(cid)
    }

    pub fn set_root(&self, name: &str, cid: Option<&Cid>) -> StorageResult<()> {
        debug!("Root {} -> {:?}", name, cid);
        self.backend.set_root(name, cid)
    }

    pub fn root(&self, name: &str) -> StorageResult<Option<Cid>> {
        self.backend.root(name)
    }

    pub fn flush(&self) -> StorageResult<()> {
        self.backend.flush()
    }

    pub fn pin(&self, cid: &Cid) {
        self.pinned.write().insert(*cid);
    }

    pub fn unpin(&self, cid: &Cid) -> bool {
        self.pinned.write().remove(cid)
    }

    pub fn is_pinned(&self, cid: &Cid) -> bool {
        self.pinned.read().contains(cid)
    }

    /// Every block with its size and pin state
    pub fn manifest(&self) -> StorageResult<Vec<BlockInfo>> {
        let pinned = self.pinned.read();
        self.backend
            .list()?
            .into_iter()
            .map(|cid| {
                let size = self.backend.get(&cid)?.map(|b| b.len()).unwrap_or(0);
                Ok(BlockInfo {
                    cid,
                    size,
                    pinned: pinned.contains(&cid),
                })
            })
            .collect()
    }

    /// Delete every unpinned block not in `keep`; returns the number removed
    pub fn gc(&self, keep: &HashSet<Cid>) -> StorageResult<usize> {
        let pinned = self.pinned.read().clone();
        let mut removed = 0;
        for cid in self.backend.list()? {
            if keep.contains(&cid) || pinned.contains(&cid) {
                continue;
            }
            if self.delete(&cid)? {
                removed += 1;
            }
        }
        info!("Garbage collection removed {} blocks", removed);
        Ok(removed)
    }

    /// CIDs of blocks whose bytes no longer hash to their key
    pub fn check_integrity(&self) -> StorageResult<Vec<Cid>> {
        let mut corrupt = Vec::new();
        for cid in self.backend.list()? {
            if let Some(bytes) = self.backend.get(&cid)? {
                if !cid.matches(&bytes) {
                    corrupt.push(cid);
                }
            }
        }
        Ok(corrupt)
    }

    pub fn cache_stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            cached_blocks: self.cache.as_ref().map(|c| c.lock().len()).unwrap_or(0),
            capacity: self.capacity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryBackend;
    use std::collections::BTreeMap;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        name: String,
        tags: BTreeMap<String, i64>,
    }

    fn sample() -> Sample {
        let mut tags = BTreeMap::new();
        tags.insert("a".to_string(), 1);
        tags.insert("b".to_string(), 2);
        Sample {
            name: "block".to_string(),
            tags,
        }
    }

    #[test]
    fn test_store_retrieve() {
        let store = ContentStore::new(Box::new(MemoryBackend::new()), 8);
        let cid = store.store(&sample()).unwrap();
        let back: Sample = store.retrieve(&cid).unwrap();
        assert_eq!(back, sample());
        // Same content, same address
        assert_eq!(store.store(&sample()).unwrap(), cid);
    }

    #[test]
    fn test_missing_block() {
        let store = ContentStore::new(Box::new(MemoryBackend::new()), 8);
        let cid = Cid::of(b"nothing");
        assert!(matches!(
            store.retrieve::<Sample>(&cid),
            Err(StorageError::NotFound(_))
        ));
    }

    #[test]
    fn test_integrity_failure() {
        let backend = MemoryBackend::new();
        let cid = Cid::of(b"original");
        backend.put(&cid, b"tampered").unwrap();
        let store = ContentStore::new(Box::new(backend), 0);
        assert!(matches!(
            store.get_bytes(&cid),
            Err(StorageError::Integrity { .. })
        ));
        assert_eq!(store.check_integrity().unwrap(), vec![cid]);
    }

    #[test]
    fn test_verified_read_sees_disk_damage_behind_cache() {
        use crate::storage::FileBackend;
        use tempfile::TempDir;

        let dir = TempDir::new().unwrap();
        let store = ContentStore::new(Box::new(FileBackend::open(dir.path()).unwrap()), 8);
        let cid = store.store(&sample()).unwrap();
        let hex = cid.to_hex();
        std::fs::write(dir.path().join("blocks").join(&hex[..2]).join(&hex), b"garbage").unwrap();

        // the cached copy still decodes
        let cached: Sample = store.retrieve(&cid).unwrap();
        assert_eq!(cached, sample());
        assert!(matches!(store.get_verified(&cid), Err(StorageError::Integrity { .. })));
        assert!(matches!(
            store.retrieve_verified::<Sample>(&cid),
            Err(StorageError::Integrity { .. })
        ));
    }

    #[test]
    fn test_cache_hits() {
        let store = ContentStore::new(Box::new(MemoryBackend::new()), 2);
        let cid = store.store(&"x".to_string()).unwrap();
        let _: String = store.retrieve(&cid).unwrap();
        let _: String = store.retrieve(&cid).unwrap();
        let stats = store.cache_stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 0);
        assert_eq!(stats.cached_blocks, 1);
    }

    #[test]
    fn test_gc_respects_pins_and_keep() {
        let store = ContentStore::new(Box::new(MemoryBackend::new()), 4);
        let a = store.store(&1u64).unwrap();
        let b = store.store(&2u64).unwrap();
        let c = store.store(&3u64).unwrap();
        store.pin(&a);
        let keep: HashSet<Cid> = [b].into_iter().collect();
        assert_eq!(store.gc(&keep).unwrap(), 1);
        assert!(store.contains(&a).unwrap());
        assert!(store.contains(&b).unwrap());
        assert!(!store.contains(&c).unwrap());

        let manifest = store.manifest().unwrap();
        assert_eq!(manifest.len(), 2);
        assert!(manifest.iter().any(|info| info.cid == a && info.pinned));
    }
}
