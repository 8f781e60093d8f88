//! Durable storage for cache entries.
//!
//! Entries are stored as opaque blobs, keyed by their index ID and partitioned by
//! [`IndexType`]. The storage never looks inside of the blobs. Encoding and decoding them is
//! the job of the [`LeaseCache`](crate::LeaseCache).
//!
//! There are two backends: an LMDB environment stored in a single file which survives
//! restarts of the agent, and an in-memory map that is mostly useful for tests.

use std::fmt;
use std::io;

use serde::{Deserialize, Serialize};

mod config;
mod file;
mod memory;

pub use config::{FilePersistConfig, MemoryPersistConfig, PersistBackendConfig, PersistConfig};
pub use file::FileStorage;
pub use memory::MemoryStorage;

/// The partition a cache entry is persisted in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexType {
    /// Entries which represent an authentication token.
    Token,
    /// Entries which represent a lease on a secret.
    Lease,
}

impl IndexType {
    /// All partitions, in the order they have to be restored in.
    pub const ALL: [IndexType; 2] = [IndexType::Token, IndexType::Lease];

    pub fn as_str(&self) -> &'static str {
        match self {
            IndexType::Token => "token",
            IndexType::Lease => "lease",
        }
    }
}

impl fmt::Display for IndexType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An error accessing the persistent storage.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("failed to access the persistent cache file")]
    Io(#[from] io::Error),
    #[error("persistent cache database error")]
    Database(#[from] heed::Error),
    #[error("persistent storage task failed")]
    Join(#[from] tokio::task::JoinError),
}

/// The backend used to persist cache entries.
///
/// All methods block the current thread, the file backend in particular performs disk I/O
/// inside of LMDB transactions. Async callers should move the calls onto a blocking thread.
#[derive(Debug)]
pub enum PersistentStorage {
    Memory(MemoryStorage),
    File(FileStorage),
}

impl PersistentStorage {
    /// Opens the storage backend described by `config`.
    ///
    /// The file backend creates its data file and both partitions if they do not exist yet.
    pub fn open(config: &PersistConfig) -> Result<Self, StorageError> {
        let storage = match &config.backend {
            PersistBackendConfig::Memory(_) => Self::Memory(MemoryStorage::new()),
            PersistBackendConfig::File(cfg) => Self::File(FileStorage::open(cfg)?),
        };
        tracing::debug!(backend = storage.name(), "opened persistent cache storage");
        Ok(storage)
    }

    /// A short name of the backend, used in logs and metrics.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Memory(_) => "memory",
            Self::File(_) => "file",
        }
    }

    /// Stores `blob` under `id` in the partition for `kind`, replacing any previous value.
    pub fn set(&self, id: &str, blob: &[u8], kind: IndexType) -> Result<(), StorageError> {
        match self {
            Self::Memory(storage) => {
                storage.set(id, blob, kind);
                Ok(())
            }
            Self::File(storage) => storage.set(id, blob, kind),
        }
    }

    /// Removes `id` from whichever partition holds it.
    ///
    /// Deleting an id that is not stored is not an error.
    pub fn delete(&self, id: &str) -> Result<(), StorageError> {
        match self {
            Self::Memory(storage) => {
                storage.delete(id);
                Ok(())
            }
            Self::File(storage) => storage.delete(id),
        }
    }

    /// Returns all blobs stored in the partition for `kind`, in no particular order.
    pub fn get_by_kind(&self, kind: IndexType) -> Result<Vec<Vec<u8>>, StorageError> {
        match self {
            Self::Memory(storage) => Ok(storage.get_by_kind(kind)),
            Self::File(storage) => storage.get_by_kind(kind),
        }
    }

    /// Removes all blobs from both partitions.
    pub fn clear(&self) -> Result<(), StorageError> {
        match self {
            Self::Memory(storage) => {
                storage.clear();
                Ok(())
            }
            Self::File(storage) => storage.clear(),
        }
    }
}
