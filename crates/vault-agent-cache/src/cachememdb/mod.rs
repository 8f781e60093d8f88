//! The in-memory index of cached entries.
//!
//! Every entry is reachable by its ID and by each of its secondary keys. All secondary indexes
//! are updated under a single write lock, so readers never observe an entry that is only
//! partially indexed.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::RwLock;

mod index;

pub use index::{Index, Lifetime, RenewCtx};

/// A key to look up entries by.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IndexKey<'a> {
    /// The index ID, unique.
    Id(&'a str),
    /// The token of a token entry, unique.
    Token(&'a str),
    /// The accessor of a token entry, unique.
    TokenAccessor(&'a str),
    /// The parent token of token entries.
    TokenParent(&'a str),
    /// The lease of a lease entry, unique.
    Lease(&'a str),
    /// The token of lease entries.
    LeaseToken(&'a str),
    /// The namespace and request path of the request which created the entries.
    RequestPath { namespace: &'a str, path: &'a str },
}

/// An error updating the index.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("{index} is already indexed for entry {existing}")]
    Conflict {
        index: &'static str,
        existing: String,
    },
}

#[derive(Debug, Default)]
struct Tables {
    entries: HashMap<String, Index>,
    tokens: HashMap<String, String>,
    token_accessors: HashMap<String, String>,
    leases: HashMap<String, String>,
    token_parents: BTreeMap<String, BTreeSet<String>>,
    lease_tokens: BTreeMap<String, BTreeSet<String>>,
    /// Keyed by namespace and request path, separated by a NUL byte.
    request_paths: BTreeMap<String, BTreeSet<String>>,
}

fn request_path_key(namespace: &str, path: &str) -> String {
    format!("{namespace}\0{path}")
}

fn add_multi(table: &mut BTreeMap<String, BTreeSet<String>>, key: &str, id: &str) {
    table.entry(key.to_owned()).or_default().insert(id.to_owned());
}

fn remove_multi(table: &mut BTreeMap<String, BTreeSet<String>>, key: &str, id: &str) {
    if let Some(ids) = table.get_mut(key) {
        ids.remove(id);
        if ids.is_empty() {
            table.remove(key);
        }
    }
}

impl Tables {
    /// Checks that `index` does not take a unique key of another entry.
    fn check_unique(&self, index: &Index) -> Result<(), IndexError> {
        let unique = [
            ("token", &self.tokens, &index.token),
            ("token_accessor", &self.token_accessors, &index.token_accessor),
            ("lease", &self.leases, &index.lease),
        ];
        for (name, table, key) in unique {
            let Some(key) = key else { continue };
            if let Some(existing) = table.get(key) {
                if *existing != index.id {
                    return Err(IndexError::Conflict {
                        index: name,
                        existing: existing.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    fn insert(&mut self, index: Index) {
        let id = &index.id;
        if let Some(token) = &index.token {
            self.tokens.insert(token.clone(), id.clone());
        }
        if let Some(accessor) = &index.token_accessor {
            self.token_accessors.insert(accessor.clone(), id.clone());
        }
        if let Some(lease) = &index.lease {
            self.leases.insert(lease.clone(), id.clone());
        }
        if let Some(parent) = &index.token_parent {
            add_multi(&mut self.token_parents, parent, id);
        }
        if let Some(lease_token) = &index.lease_token {
            add_multi(&mut self.lease_tokens, lease_token, id);
        }
        let key = request_path_key(&index.namespace, &index.request_path);
        add_multi(&mut self.request_paths, &key, id);

        self.entries.insert(id.clone(), index);
    }

    fn remove(&mut self, id: &str) -> Option<Index> {
        let index = self.entries.remove(id)?;

        if let Some(token) = &index.token {
            self.tokens.remove(token);
        }
        if let Some(accessor) = &index.token_accessor {
            self.token_accessors.remove(accessor);
        }
        if let Some(lease) = &index.lease {
            self.leases.remove(lease);
        }
        if let Some(parent) = &index.token_parent {
            remove_multi(&mut self.token_parents, parent, id);
        }
        if let Some(lease_token) = &index.lease_token {
            remove_multi(&mut self.lease_tokens, lease_token, id);
        }
        let key = request_path_key(&index.namespace, &index.request_path);
        remove_multi(&mut self.request_paths, &key, id);

        Some(index)
    }

    /// Returns the IDs of all entries matching `key` exactly.
    fn ids(&self, key: &IndexKey<'_>) -> Vec<String> {
        let unique = |table: &HashMap<String, String>, key: &str| -> Vec<String> {
            table.get(key).cloned().into_iter().collect()
        };
        let multi = |table: &BTreeMap<String, BTreeSet<String>>, key: &str| -> Vec<String> {
            table
                .get(key)
                .map(|ids| ids.iter().cloned().collect())
                .unwrap_or_default()
        };

        match *key {
            IndexKey::Id(id) => self
                .entries
                .get(id)
                .map(|index| index.id.clone())
                .into_iter()
                .collect(),
            IndexKey::Token(token) => unique(&self.tokens, token),
            IndexKey::TokenAccessor(accessor) => unique(&self.token_accessors, accessor),
            IndexKey::Lease(lease) => unique(&self.leases, lease),
            IndexKey::TokenParent(parent) => multi(&self.token_parents, parent),
            IndexKey::LeaseToken(token) => multi(&self.lease_tokens, token),
            IndexKey::RequestPath { namespace, path } => {
                multi(&self.request_paths, &request_path_key(namespace, path))
            }
        }
    }

    /// Returns the IDs of all entries whose key starts with `key`.
    ///
    /// For [`IndexKey::RequestPath`], the namespace has to match exactly and only the path is
    /// matched as a prefix.
    fn ids_by_prefix(&self, key: &IndexKey<'_>) -> Vec<String> {
        fn unique(table: &HashMap<String, String>, prefix: &str) -> Vec<String> {
            table
                .iter()
                .filter(|(key, _)| key.starts_with(prefix))
                .map(|(_, id)| id.clone())
                .collect()
        }

        fn multi(table: &BTreeMap<String, BTreeSet<String>>, prefix: &str) -> Vec<String> {
            table
                .range(prefix.to_owned()..)
                .take_while(|(key, _)| key.starts_with(prefix))
                .flat_map(|(_, ids)| ids.iter().cloned())
                .collect()
        }

        match *key {
            IndexKey::Id(prefix) => self
                .entries
                .keys()
                .filter(|id| id.starts_with(prefix))
                .cloned()
                .collect(),
            IndexKey::Token(prefix) => unique(&self.tokens, prefix),
            IndexKey::TokenAccessor(prefix) => unique(&self.token_accessors, prefix),
            IndexKey::Lease(prefix) => unique(&self.leases, prefix),
            IndexKey::TokenParent(prefix) => multi(&self.token_parents, prefix),
            IndexKey::LeaseToken(prefix) => multi(&self.lease_tokens, prefix),
            IndexKey::RequestPath { namespace, path } => {
                multi(&self.request_paths, &request_path_key(namespace, path))
            }
        }
    }

    fn collect(&self, ids: Vec<String>) -> Vec<Index> {
        ids.iter()
            .filter_map(|id| self.entries.get(id))
            .cloned()
            .collect()
    }
}

/// A concurrent, multi-key indexed collection of cache entries.
///
/// Lookups return clones of the stored entries. Entries are replaced as a whole with
/// [`set`](Self::set), or modified in place with [`update`](Self::update).
#[derive(Default)]
pub struct CacheMemDb {
    tables: RwLock<Tables>,
}

impl fmt::Debug for CacheMemDb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheMemDb")
            .field("entries", &self.len())
            .finish()
    }
}

impl CacheMemDb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the first entry matching `key` exactly.
    pub fn get(&self, key: IndexKey<'_>) -> Option<Index> {
        let tables = self.tables.read().unwrap();
        let id = tables.ids(&key).into_iter().next()?;
        tables.entries.get(&id).cloned()
    }

    /// Returns all entries matching `key` exactly.
    pub fn get_all(&self, key: IndexKey<'_>) -> Vec<Index> {
        let tables = self.tables.read().unwrap();
        let ids = tables.ids(&key);
        tables.collect(ids)
    }

    /// Returns all entries whose key starts with the given one.
    pub fn get_by_prefix(&self, key: IndexKey<'_>) -> Vec<Index> {
        let tables = self.tables.read().unwrap();
        let ids = tables.ids_by_prefix(&key);
        tables.collect(ids)
    }

    /// Inserts an entry, replacing the entry with the same ID.
    ///
    /// Returns the replaced entry, whose renewal the caller has to stop. Fails without
    /// modifying anything if the entry would take a unique key which is already taken by a
    /// different entry.
    pub fn set(&self, index: Index) -> Result<Option<Index>, IndexError> {
        let mut tables = self.tables.write().unwrap();
        tables.check_unique(&index)?;
        let replaced = tables.remove(&index.id);
        tables.insert(index);
        Ok(replaced)
    }

    /// Modifies the entry with the given ID in place.
    ///
    /// Returns the updated entry, or `None` if the entry is not indexed (anymore). The entry
    /// is re-indexed afterwards, the closure must not take unique keys of other entries.
    pub fn update<F>(&self, id: &str, f: F) -> Option<Index>
    where
        F: FnOnce(&mut Index),
    {
        let mut tables = self.tables.write().unwrap();
        let mut index = tables.remove(id)?;
        f(&mut index);
        tables.insert(index.clone());
        Some(index)
    }

    /// Removes all entries matching `key` exactly, and returns them.
    pub fn evict(&self, key: IndexKey<'_>) -> Vec<Index> {
        let mut tables = self.tables.write().unwrap();
        let ids = tables.ids(&key);
        ids.iter().filter_map(|id| tables.remove(id)).collect()
    }

    /// Removes all entries, and returns them.
    pub fn evict_all(&self) -> Vec<Index> {
        let mut tables = self.tables.write().unwrap();
        let taken = std::mem::take(&mut *tables);
        taken.entries.into_values().collect()
    }

    /// Returns all entries.
    pub fn entries(&self) -> Vec<Index> {
        self.tables
            .read()
            .unwrap()
            .entries
            .values()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tables.read().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
