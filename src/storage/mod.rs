//! Content-addressed block storage
//!
//! Everything durable (WAL entries, snapshot manifests, entity and
//! relationship blocks) is written through [`ContentStore`], which hashes each
//! encoded block into a [`Cid`] and hands the bytes to a pluggable
//! [`BlockStore`] backend.

pub mod backend;
pub mod cid;
pub mod store;

pub use backend::{BlockStore, FileBackend, MemoryBackend, RocksBackend};
pub use cid::Cid;
pub use store::{BlockInfo, CacheStats, ContentStore};

use thiserror::Error;

/// Storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    /// Block is not in the backend
    #[error("Block not found: {0}")]
    NotFound(Cid),

    /// Stored bytes do not hash to their CID
    #[error("Integrity check failed for {cid}: content hashes to {actual}")]
    Integrity { cid: Cid, actual: Cid },

    /// Encode/decode failure
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Backend unreachable or failing I/O
    #[error("Storage backend unavailable: {0}")]
    Connectivity(String),

    #[error("Invalid CID: {0}")]
    InvalidCid(String),
}

impl StorageError {
    /// Transient backend failures may succeed on retry
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageError::Connectivity(_))
    }
}

impl From<bincode::Error> for StorageError {
    fn from(e: bincode::Error) -> Self {
        StorageError::Serialization(e.to_string())
    }
}

impl From<rocksdb::Error> for StorageError {
    fn from(e: rocksdb::Error) -> Self {
        StorageError::Connectivity(e.to_string())
    }
}

pub type StorageResult<T> = Result<T, StorageError>;
