use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryPersistConfig {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilePersistConfig {
    /// Path of the cache file.
    ///
    /// LMDB keeps a lock file with a `-lock` suffix right next to it.
    pub path: PathBuf,

    /// The maximum size the cache file may grow to, in bytes.
    #[serde(default = "default_map_size")]
    pub map_size: usize,
}

/// The backend to use for persisting the cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PersistBackendConfig {
    Memory(MemoryPersistConfig),
    File(FilePersistConfig),
}

/// Persistence of cache entries across agent restarts.
///
/// Every cached token and lease is written to the backend as soon as it is cached, and
/// removed as soon as it is evicted. On startup, the backend is read back via
/// [`LeaseCache::restore`](crate::LeaseCache::restore).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistConfig {
    /// Fail the restore if any single entry cannot be read back.
    ///
    /// By default, broken entries are logged and skipped.
    #[serde(default)]
    pub exit_on_err: bool,

    /// The backend to use for persisting the cache.
    #[serde(flatten)]
    pub backend: PersistBackendConfig,
}

fn default_map_size() -> usize {
    64 * 1024 * 1024
}
