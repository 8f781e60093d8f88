use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use heed::types::{Bytes, Str};
use heed::{Database, Env, EnvFlags, EnvOpenOptions};

use super::{FilePersistConfig, IndexType, StorageError};

/// Persistent storage backed by an LMDB environment in a single file.
///
/// The environment holds one named database per [`IndexType`], both created when the file is
/// opened. Every write runs in its own write transaction, reads see a consistent snapshot of
/// the file.
pub struct FileStorage {
    path: PathBuf,
    env: Env,
    tokens: Database<Str, Bytes>,
    leases: Database<Str, Bytes>,
}

impl fmt::Debug for FileStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileStorage")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl FileStorage {
    /// Opens or creates the cache file at the configured path.
    pub fn open(config: &FilePersistConfig) -> Result<Self, StorageError> {
        if let Some(parent) = config.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut options = EnvOpenOptions::new();
        options
            .map_size(config.map_size)
            .max_dbs(IndexType::ALL.len() as u32);

        // SAFETY: The cache file is owned by this agent. Nothing else in this process opens the
        // same path with different flags, and it is never truncated while mapped.
        let env = unsafe {
            options.flags(EnvFlags::NO_SUB_DIR);
            options.open(&config.path)?
        };
        restrict_permissions(&config.path)?;

        let mut wtxn = env.write_txn()?;
        let tokens = env.create_database(&mut wtxn, Some(IndexType::Token.as_str()))?;
        let leases = env.create_database(&mut wtxn, Some(IndexType::Lease.as_str()))?;
        wtxn.commit()?;

        Ok(Self {
            path: config.path.clone(),
            env,
            tokens,
            leases,
        })
    }

    /// The path of the cache file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn partition(&self, kind: IndexType) -> Database<Str, Bytes> {
        match kind {
            IndexType::Token => self.tokens,
            IndexType::Lease => self.leases,
        }
    }

    pub fn set(&self, id: &str, blob: &[u8], kind: IndexType) -> Result<(), StorageError> {
        let mut wtxn = self.env.write_txn()?;
        self.partition(kind).put(&mut wtxn, id, blob)?;
        wtxn.commit()?;
        Ok(())
    }

    pub fn delete(&self, id: &str) -> Result<(), StorageError> {
        let mut wtxn = self.env.write_txn()?;
        for kind in IndexType::ALL {
            self.partition(kind).delete(&mut wtxn, id)?;
        }
        wtxn.commit()?;
        Ok(())
    }

    pub fn get_by_kind(&self, kind: IndexType) -> Result<Vec<Vec<u8>>, StorageError> {
        let rtxn = self.env.read_txn()?;
        let mut blobs = Vec::new();
        for item in self.partition(kind).iter(&rtxn)? {
            let (_, blob) = item?;
            blobs.push(blob.to_vec());
        }
        Ok(blobs)
    }

    pub fn clear(&self) -> Result<(), StorageError> {
        let mut wtxn = self.env.write_txn()?;
        for kind in IndexType::ALL {
            self.partition(kind).clear(&mut wtxn)?;
        }
        wtxn.commit()?;
        Ok(())
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<(), StorageError> {
    use std::os::unix::fs::PermissionsExt;

    fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<(), StorageError> {
    Ok(())
}
