use std::collections::HashMap;
use std::sync::RwLock;

use super::IndexType;

/// Persistent storage that only lives as long as the process.
///
/// Holds one map per [`IndexType`]. The blobs are kept as-is.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    tokens: RwLock<HashMap<String, Vec<u8>>>,
    leases: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn partition(&self, kind: IndexType) -> &RwLock<HashMap<String, Vec<u8>>> {
        match kind {
            IndexType::Token => &self.tokens,
            IndexType::Lease => &self.leases,
        }
    }

    pub fn set(&self, id: &str, blob: &[u8], kind: IndexType) {
        self.partition(kind)
            .write()
            .unwrap()
            .insert(id.to_owned(), blob.to_vec());
    }

    pub fn delete(&self, id: &str) {
        for kind in IndexType::ALL {
            self.partition(kind).write().unwrap().remove(id);
        }
    }

    pub fn get_by_kind(&self, kind: IndexType) -> Vec<Vec<u8>> {
        self.partition(kind)
            .read()
            .unwrap()
            .values()
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        for kind in IndexType::ALL {
            self.partition(kind).write().unwrap().clear();
        }
    }
}
