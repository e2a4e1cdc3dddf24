//! Block backends
//!
//! A backend is a dumb key/value store of immutable blocks keyed by CID plus a
//! handful of mutable named roots (`wal/head`, `snapshot/latest`). It never
//! interprets block contents.

use super::{Cid, StorageError, StorageResult};
use parking_lot::RwLock;
use rocksdb::{ColumnFamilyDescriptor, IteratorMode, Options, DB};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info};

/// Pluggable block persistence
pub trait BlockStore: Send + Sync {
    /// Store `bytes` under `cid`. Writing an existing block is a no-op.
    fn put(&self, cid: &Cid, bytes: &[u8]) -> StorageResult<()>;

    fn get(&self, cid: &Cid) -> StorageResult<Option<Vec<u8>>>;

    /// Returns whether the block existed
    fn delete(&self, cid: &Cid) -> StorageResult<bool>;

    fn contains(&self, cid: &Cid) -> StorageResult<bool> {
        Ok(self.get(cid)?.is_some())
    }

    /// Every block CID held by the backend
    fn list(&self) -> StorageResult<Vec<Cid>>;

    /// Point a named root at `cid`, or clear it with `None`
    fn set_root(&self, name: &str, cid: Option<&Cid>) -> StorageResult<()>;

    fn root(&self, name: &str) -> StorageResult<Option<Cid>>;

    /// Make previous writes durable
    fn flush(&self) -> StorageResult<()> {
        Ok(())
    }

    fn kind(&self) -> &'static str;
}

/// Volatile backend for tests and in-memory databases
#[derive(Default)]
pub struct MemoryBackend {
    blocks: RwLock<HashMap<Cid, Vec<u8>>>,
    roots: RwLock<HashMap<String, Cid>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BlockStore for MemoryBackend {
    fn put(&self, cid: &Cid, bytes: &[u8]) -> StorageResult<()> {
        self.blocks.write().entry(*cid).or_insert_with(|| bytes.to_vec());
        Ok(())
    }

    fn get(&self, cid: &Cid) -> StorageResult<Option<Vec<u8>>> {
        Ok(self.blocks.read().get(cid).cloned())
    }

    fn delete(&self, cid: &Cid) -> StorageResult<bool> {
        Ok(self.blocks.write().remove(cid).is_some())
    }

    fn contains(&self, cid: &Cid) -> StorageResult<bool> {
        Ok(self.blocks.read().contains_key(cid))
    }

    fn list(&self) -> StorageResult<Vec<Cid>> {
        let mut cids: Vec<Cid> = self.blocks.read().keys().copied().collect();
        cids.sort();
        Ok(cids)
    }

    fn set_root(&self, name: &str, cid: Option<&Cid>) -> StorageResult<()> {
        let mut roots = self.roots.write();
        match cid {
            Some(cid) => {
                roots.insert(name.to_string(), *cid);
            }
            None => {
                roots.remove(name);
            }
        }
        Ok(())
    }

    fn root(&self, name: &str) -> StorageResult<Option<Cid>> {
        Ok(self.roots.read().get(name).copied())
    }

    fn kind(&self) -> &'static str {
        "memory"
    }
}

/// One file per block under `<dir>/blocks/<xx>/<hex>`, roots under `<dir>/roots/`
pub struct FileBackend {
    dir: PathBuf,
}

impl FileBackend {
    pub fn open(dir: impl AsRef<Path>) -> StorageResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(dir.join("blocks")).map_err(io_error)?;
        fs::create_dir_all(dir.join("roots")).map_err(io_error)?;
        info!("Opened filesystem block store at {}", dir.display());
        Ok(Self { dir })
    }

    fn block_path(&self, cid: &Cid) -> PathBuf {
        let hex = cid.to_hex();
        self.dir.join("blocks").join(&hex[..2]).join(&hex)
    }

    fn root_path(&self, name: &str) -> PathBuf {
        // "wal/head" -> "wal.head"
        let file: String = name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '.' })
            .collect();
        self.dir.join("roots").join(file)
    }

    /// Write through a private temp file in the target directory, then rename
    /// over `path`. Concurrent writers of the same path never share a temp file.
    fn write_atomic(path: &Path, bytes: &[u8]) -> StorageResult<()> {
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        let mut file = NamedTempFile::new_in(parent).map_err(io_error)?;
        file.write_all(bytes).map_err(io_error)?;
        file.as_file().sync_all().map_err(io_error)?;
        file.persist(path).map_err(|e| io_error(e.error))?;
        Ok(())
    }
}

impl BlockStore for FileBackend {
    fn put(&self, cid: &Cid, bytes: &[u8]) -> StorageResult<()> {
        let path = self.block_path(cid);
        if path.exists() {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_error)?;
        }
        match Self::write_atomic(&path, bytes) {
            // a concurrent writer stored the same content first
            Err(_) if path.exists() => Ok(()),
            other => other,
        }
    }

    fn get(&self, cid: &Cid) -> StorageResult<Option<Vec<u8>>> {
        match fs::read(self.block_path(cid)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error(e)),
        }
    }

    fn delete(&self, cid: &Cid) -> StorageResult<bool> {
        match fs::remove_file(self.block_path(cid)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(io_error(e)),
        }
    }

    fn contains(&self, cid: &Cid) -> StorageResult<bool> {
        Ok(self.block_path(cid).exists())
    }

    fn list(&self) -> StorageResult<Vec<Cid>> {
        let mut cids = Vec::new();
        for shard in fs::read_dir(self.dir.join("blocks")).map_err(io_error)? {
            let shard = shard.map_err(io_error)?;
            if !shard.path().is_dir() {
                continue;
            }
            for entry in fs::read_dir(shard.path()).map_err(io_error)? {
                let entry = entry.map_err(io_error)?;
                let name = entry.file_name();
                let name = name.to_string_lossy();
                // Skip leftover temp files from an interrupted write
                if name.len() != 64 {
                    continue;
                }
                cids.push(Cid::parse(&format!("b{}", name))?);
            }
        }
        cids.sort();
        Ok(cids)
    }

    fn set_root(&self, name: &str, cid: Option<&Cid>) -> StorageResult<()> {
        let path = self.root_path(name);
        match cid {
            Some(cid) => Self::write_atomic(&path, cid.to_string().as_bytes()),
            None => match fs::remove_file(&path) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(io_error(e)),
            },
        }
    }

    fn root(&self, name: &str) -> StorageResult<Option<Cid>> {
        match fs::read_to_string(self.root_path(name)) {
            Ok(text) => Ok(Some(Cid::parse(text.trim())?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error(e)),
        }
    }

    fn kind(&self) -> &'static str {
        "filesystem"
    }
}

const BLOCKS_CF: &str = "blocks";
const ROOTS_CF: &str = "roots";

/// RocksDB backend with `blocks` and `roots` column families
pub struct RocksBackend {
    db: DB,
    path: PathBuf,
}

impl RocksBackend {
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref().to_path_buf();
        info!("Opening RocksDB block store at {}", path.display());

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        opts.set_write_buffer_size(64 * 1024 * 1024);
        opts.set_max_write_buffer_number(3);
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        opts.set_wal_recovery_mode(rocksdb::DBRecoveryMode::PointInTime);

        let mut blocks_opts = Options::default();
        // Blocks are written once and read often; compress harder
        blocks_opts.set_compression_type(rocksdb::DBCompressionType::Zstd);

        let cfs = vec![
            ColumnFamilyDescriptor::new(BLOCKS_CF, blocks_opts),
            ColumnFamilyDescriptor::new(ROOTS_CF, Options::default()),
        ];
        let db = DB::open_cf_descriptors(&opts, &path, cfs)?;
        Ok(Self { db, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn cf(&self, name: &str) -> StorageResult<&rocksdb::ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StorageError::Connectivity(format!("missing column family {}", name)))
    }
}

impl BlockStore for RocksBackend {
    fn put(&self, cid: &Cid, bytes: &[u8]) -> StorageResult<()> {
        let cf = self.cf(BLOCKS_CF)?;
        self.db.put_cf(cf, cid.as_bytes(), bytes)?;
        Ok(())
    }

    fn get(&self, cid: &Cid) -> StorageResult<Option<Vec<u8>>> {
        let cf = self.cf(BLOCKS_CF)?;
        Ok(self.db.get_cf(cf, cid.as_bytes())?)
    }

    fn delete(&self, cid: &Cid) -> StorageResult<bool> {
        let cf = self.cf(BLOCKS_CF)?;
        let existed = self.db.get_cf(cf, cid.as_bytes())?.is_some();
        if existed {
            self.db.delete_cf(cf, cid.as_bytes())?;
        }
        Ok(existed)
    }

    fn list(&self) -> StorageResult<Vec<Cid>> {
        let cf = self.cf(BLOCKS_CF)?;
        let mut cids = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            let bytes: [u8; 32] = key
                .as_ref()
                .try_into()
                .map_err(|_| StorageError::InvalidCid(format!("{} byte key", key.len())))?;
            cids.push(Cid::from_bytes(bytes));
        }
        Ok(cids)
    }

    fn set_root(&self, name: &str, cid: Option<&Cid>) -> StorageResult<()> {
        let cf = self.cf(ROOTS_CF)?;
        match cid {
            Some(cid) => self.db.put_cf(cf, name.as_bytes(), cid.as_bytes())?,
            None => self.db.delete_cf(cf, name.as_bytes())?,
        }
        Ok(())
    }

    fn root(&self, name: &str) -> StorageResult<Option<Cid>> {
        let cf = self.cf(ROOTS_CF)?;
        match self.db.get_cf(cf, name.as_bytes())? {
            Some(value) => {
                let bytes: [u8; 32] = value
                    .as_slice()
                    .try_into()
                    .map_err(|_| StorageError::InvalidCid(format!("root {} is corrupt", name)))?;
                Ok(Some(Cid::from_bytes(bytes)))
            }
            None => Ok(None),
        }
    }

    fn flush(&self) -> StorageResult<()> {
        debug!("Flushing RocksDB block store");
        self.db.flush()?;
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "rocksdb"
    }
}

fn io_error(e: std::io::Error) -> StorageError {
    StorageError::Connectivity(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn exercise(backend: &dyn BlockStore) {
        let cid = Cid::of(b"abc");
        assert!(!backend.contains(&cid).unwrap());
        backend.put(&cid, b"abc").unwrap();
        backend.put(&cid, b"abc").unwrap();
        assert!(backend.contains(&cid).unwrap());
        assert_eq!(backend.get(&cid).unwrap().unwrap(), b"abc".to_vec());
        assert_eq!(backend.list().unwrap(), vec![cid]);

        backend.set_root("wal/head", Some(&cid)).unwrap();
        assert_eq!(backend.root("wal/head").unwrap(), Some(cid));
        backend.set_root("wal/head", None).unwrap();
        assert_eq!(backend.root("wal/head").unwrap(), None);

        assert!(backend.delete(&cid).unwrap());
        assert!(!backend.delete(&cid).unwrap());
        assert!(backend.get(&cid).unwrap().is_none());
    }

    #[test]
    fn test_memory_backend() {
        exercise(&MemoryBackend::new());
    }

    #[test]
    fn test_file_backend() {
        let dir = TempDir::new().unwrap();
        let backend = FileBackend::open(dir.path()).unwrap();
        exercise(&backend);
    }

    #[test]
    fn test_file_backend_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let cid = Cid::of(b"persisted");
        {
            let backend = FileBackend::open(dir.path()).unwrap();
            backend.put(&cid, b"persisted").unwrap();
            backend.set_root("snapshot/latest", Some(&cid)).unwrap();
        }
        let backend = FileBackend::open(dir.path()).unwrap();
        assert_eq!(backend.root("snapshot/latest").unwrap(), Some(cid));
        assert_eq!(backend.get(&cid).unwrap().unwrap(), b"persisted".to_vec());
    }

    #[test]
    fn test_concurrent_puts_of_one_block() {
        use std::sync::{Arc, Barrier};
        use std::thread;

        let dir = TempDir::new().unwrap();
        let backend = Arc::new(FileBackend::open(dir.path()).unwrap());
        for round in 0..20u8 {
            let bytes = vec![round; 20_000];
            let cid = Cid::of(&bytes);
            let barrier = Arc::new(Barrier::new(8));
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let backend = Arc::clone(&backend);
                    let barrier = Arc::clone(&barrier);
                    let bytes = bytes.clone();
                    thread::spawn(move || {
                        barrier.wait();
                        backend.put(&cid, &bytes)
                    })
                })
                .collect();
            for handle in handles {
                handle.join().unwrap().unwrap();
            }
            assert_eq!(backend.get(&cid).unwrap().unwrap(), bytes);
        }
        assert_eq!(backend.list().unwrap().len(), 20);
    }

    #[test]
    fn test_concurrent_root_updates_last_write_wins() {
        use std::sync::{Arc, Barrier};
        use std::thread;

        let dir = TempDir::new().unwrap();
        let backend = Arc::new(FileBackend::open(dir.path()).unwrap());
        let cids: Vec<Cid> = (0..8u8).map(|i| Cid::of(&[i])).collect();
        let barrier = Arc::new(Barrier::new(cids.len()));
        let handles: Vec<_> = cids
            .iter()
            .copied()
            .map(|cid| {
                let backend = Arc::clone(&backend);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    backend.set_root("wal/head", Some(&cid))
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap().unwrap();
        }
        let head = backend.root("wal/head").unwrap().unwrap();
        assert!(cids.contains(&head));
        // "wal/tmp" shares the stem of "wal/head" on disk
        backend.set_root("wal/tmp", Some(&cids[0])).unwrap();
        assert_eq!(backend.root("wal/head").unwrap(), Some(head));
    }

    #[test]
    fn test_rocks_backend() {
        let dir = TempDir::new().unwrap();
        let backend = RocksBackend::open(dir.path()).unwrap();
        exercise(&backend);
        backend.flush().unwrap();
    }
}
