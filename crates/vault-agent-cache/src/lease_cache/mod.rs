//! The lease cache.
//!
//! The [`LeaseCache`] sits between the agent's listener and the remote server. Responses that
//! create a token or carry a lease are cached under the [index ID](crate::keys) of the request
//! that produced them, and kept alive in the background until they expire, are revoked, or are
//! cleared. Everything else passes through untouched.
//!
//! Cached entries form a tree: tokens hang off the token that created them, and leases off
//! the token they were issued to. Evicting a token evicts everything below it.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::Utc;
use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::api::Secret;
use crate::cachememdb::{CacheMemDb, Index, IndexKey, Lifetime, RenewCtx};
use crate::config::RenewalConfig;
use crate::error::LeaseCacheError;
use crate::keys::{self, ROOT_NAMESPACE};
use crate::metric;
use crate::persist::{IndexType, PersistentStorage, StorageError};
use crate::proxy::{CacheMeta, Proxier, SendRequest, SendResponse};
use crate::renewer::{LifetimeEvent, LifetimeWatcher, RenewClient, RenewTarget, Renewal};

mod clear;
mod revocation;

pub use clear::{CacheClearRequest, ClearTarget};

/// Everything a [`LeaseCache`] needs to operate.
pub struct LeaseCacheConfig {
    /// Forwards cache misses to the remote server.
    pub proxier: Arc<dyn Proxier>,
    /// Renews cached tokens and leases.
    pub client: Arc<dyn RenewClient>,
    /// Where entries are persisted to, if anywhere.
    pub storage: Option<Arc<PersistentStorage>>,
    pub renewal: RenewalConfig,
    /// The scope all background renewals run in.
    ///
    /// Cancelling it stops all renewals without evicting anything.
    pub base: CancellationToken,
}

/// The fields of a request which are needed after it was handed to the proxier.
#[derive(Debug)]
struct RequestParts {
    token: String,
    method: String,
    headers: BTreeMap<String, Vec<String>>,
    body: Bytes,
}

impl RequestParts {
    fn new(req: &SendRequest) -> Self {
        let mut headers: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (name, value) in req.request.headers() {
            headers
                .entry(name.as_str().to_owned())
                .or_default()
                .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
        }

        Self {
            token: req.token.clone(),
            method: req.request.method().as_str().to_owned(),
            headers,
            body: req.request.body().clone(),
        }
    }
}

/// A single write to the persistent storage.
#[derive(Clone, Debug)]
enum StorageWrite {
    Set {
        id: String,
        blob: Vec<u8>,
        kind: IndexType,
    },
    Delete(String),
    Clear,
}

impl StorageWrite {
    fn apply(&self, storage: &PersistentStorage) -> Result<(), StorageError> {
        match self {
            StorageWrite::Set { id, blob, kind } => storage.set(id, blob, *kind),
            StorageWrite::Delete(id) => storage.delete(id),
            StorageWrite::Clear => storage.clear(),
        }
    }

    fn id(&self) -> Option<&str> {
        match self {
            StorageWrite::Set { id, .. } | StorageWrite::Delete(id) => Some(id),
            StorageWrite::Clear => None,
        }
    }
}

struct Inner {
    proxier: Arc<dyn Proxier>,
    client: Arc<dyn RenewClient>,
    storage: Option<Arc<PersistentStorage>>,
    renewal: RenewalConfig,
    db: CacheMemDb,
    /// The scope handed in by the caller.
    root: CancellationToken,
    /// The scope of all renewals that do not descend from a cached token.
    ///
    /// Replaced with a fresh child of `root` whenever the whole cache is cleared.
    base: Mutex<CancellationToken>,
    auto_auth_tokens: RwLock<HashSet<String>>,
}

/// A cache of token and lease responses.
///
/// Cloning is cheap and yields a handle to the same cache.
#[derive(Clone)]
pub struct LeaseCache {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for LeaseCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseCache")
            .field("db", &self.inner.db)
            .field("storage", &self.inner.storage)
            .finish()
    }
}

impl LeaseCache {
    pub fn new(config: LeaseCacheConfig) -> Self {
        let base = config.base.child_token();
        Self {
            inner: Arc::new(Inner {
                proxier: config.proxier,
                client: config.client,
                storage: config.storage,
                renewal: config.renewal,
                db: CacheMemDb::new(),
                root: config.base,
                base: Mutex::new(base),
                auto_auth_tokens: RwLock::new(HashSet::new()),
            }),
        }
    }

    /// Returns the entry matching `key`.
    pub fn get(&self, key: IndexKey<'_>) -> Option<Index> {
        self.inner.db.get(key)
    }

    /// Returns all cached entries, in no particular order.
    pub fn entries(&self) -> Vec<Index> {
        self.inner.db.entries()
    }

    pub fn len(&self) -> usize {
        self.inner.db.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.db.is_empty()
    }

    fn base_scope(&self) -> CancellationToken {
        self.inner.base.lock().unwrap().clone()
    }

    /// The renewal scope of the cached token entry for `token`, if there is one.
    fn token_scope(&self, token: &str) -> Option<CancellationToken> {
        let index = self.inner.db.get(IndexKey::Token(token))?;
        Some(index.renew_ctx?.cancel)
    }

    /// Whether leases issued to `token` may be cached.
    fn is_known_token(&self, token: &str) -> bool {
        self.inner.auto_auth_tokens.read().unwrap().contains(token)
            || self.inner.db.get(IndexKey::Token(token)).is_some()
    }

    /// Registers the token the agent authenticated itself with.
    ///
    /// Leases and tokens created with this token become cacheable, and revoking it evicts
    /// them. The token is indexed with a placeholder entry that is never renewed.
    pub async fn register_auto_auth_token(&self, token: &str) -> Result<(), LeaseCacheError> {
        self.inner
            .auto_auth_tokens
            .write()
            .unwrap()
            .insert(token.to_owned());

        if self.inner.db.get(IndexKey::Token(token)).is_some() {
            return Ok(());
        }

        let id = Uuid::new_v4().to_string();
        let mut index = Index::new(id.clone(), IndexType::Token);
        index.token = Some(token.to_owned());
        index.namespace = Uuid::new_v4().to_string();
        index.request_path = Uuid::new_v4().to_string();

        let blob = index.serialize()?;
        index.renew_ctx = Some(RenewCtx::idle(&id, &self.base_scope()));
        self.inner.db.set(index)?;
        tracing::debug!(id, "registered auto-auth token");

        self.write_storage(StorageWrite::Set {
            id,
            blob,
            kind: IndexType::Token,
        })
        .await;
        Ok(())
    }

    /// Sends a request, serving it from the cache if possible.
    ///
    /// Responses that create a token, or carry a lease issued to a known token, are cached and
    /// renewed in the background. Failed requests and everything else are passed through.
    pub async fn send(&self, req: SendRequest) -> Result<SendResponse, LeaseCacheError> {
        let id = keys::compute_index_id(&req);

        if let Some(index) = self.inner.db.get(IndexKey::Id(&id)) {
            match SendResponse::from_wire(&index.response) {
                Ok(mut response) => {
                    let age = (Utc::now() - index.last_renewed)
                        .to_std()
                        .unwrap_or_default();
                    response.cache_meta = Some(CacheMeta { hit: true, age });
                    metric!(counter("leasecache.send") += 1, "result" => "hit");
                    tracing::debug!(id, path = index.request_path, "returning cached response");
                    return Ok(response);
                }
                Err(err) => {
                    tracing::warn!(id, error = ?err, "failed to decode cached response");
                }
            }
        }

        let (namespace, path) = keys::derive_namespace_and_revocation_path(&req);
        let parts = RequestParts::new(&req);

        let mut response = match self.inner.proxier.send(req).await {
            Ok(response) => response,
            Err(err) => {
                metric!(counter("leasecache.send") += 1, "result" => "error");
                return Err(LeaseCacheError::Proxy(err));
            }
        };
        response.cache_meta = Some(CacheMeta {
            hit: false,
            age: Duration::ZERO,
        });

        if !response.status.is_success() {
            metric!(counter("leasecache.send") += 1, "result" => "uncached");
            return Ok(response);
        }

        if self.handle_revocation(&parts, &namespace, &path).await {
            metric!(counter("leasecache.send") += 1, "result" => "uncached");
            return Ok(response);
        }

        let Some(secret) = Secret::parse(&response.body) else {
            tracing::trace!(id, path, "response is not a secret, not caching");
            metric!(counter("leasecache.send") += 1, "result" => "uncached");
            return Ok(response);
        };

        let (mut index, parent) = if let Some(auth) = secret.client_token() {
            let mut index = Index::new(id.clone(), IndexType::Token);
            index.token = Some(auth.client_token.clone());
            index.token_accessor = Some(auth.accessor.clone()).filter(|acc| !acc.is_empty());
            if !auth.orphan && !parts.token.is_empty() && parts.token != auth.client_token {
                index.token_parent = Some(parts.token.clone());
            }
            let parent = index
                .token_parent
                .as_deref()
                .and_then(|parent| self.token_scope(parent));
            (index, parent)
        } else if let Some(lease) = secret.lease() {
            if !self.is_known_token(&parts.token) {
                tracing::debug!(id, path, "lease issued to an unknown token, not caching");
                metric!(counter("leasecache.send") += 1, "result" => "uncached");
                return Ok(response);
            }
            let mut index = Index::new(id.clone(), IndexType::Lease);
            index.lease = Some(lease.to_owned());
            index.lease_token = Some(parts.token.clone());
            let parent = self.token_scope(&parts.token);
            (index, parent)
        } else {
            metric!(counter("leasecache.send") += 1, "result" => "uncached");
            return Ok(response);
        };

        index.namespace = namespace;
        index.request_path = path;
        index.response = response.to_wire();
        index.request_method = parts.method;
        index.request_token = parts.token;
        index.request_header = parts.headers;
        index.request_body = parts.body.to_vec();
        index.last_renewed = Utc::now();

        let blob = index.serialize()?;
        let kind = index.kind;
        let ctx = RenewCtx::new(&id, &parent.unwrap_or_else(|| self.base_scope()));
        index.renew_ctx = Some(ctx.clone());

        let replaced = match self.inner.db.set(index.clone()) {
            Ok(replaced) => replaced,
            Err(err) => {
                // The secret is cached for another request already, e.g. a token renewing itself.
                tracing::debug!(
                    id,
                    error = &err as &dyn std::error::Error,
                    "secret is already cached, not caching"
                );
                metric!(counter("leasecache.send") += 1, "result" => "uncached");
                return Ok(response);
            }
        };
        tracing::debug!(id, kind = %kind, path = index.request_path, "cached response");
        metric!(counter("leasecache.send") += 1, "result" => "miss");
        metric!(gauge("leasecache.entries") = self.len() as u64);

        self.write_storage(StorageWrite::Set {
            id: id.clone(),
            blob,
            kind,
        })
        .await;
        self.spawn_renewer(&index, ctx, Renewal::from_secret(&secret));
        self.retire_replaced(replaced, &index).await;

        Ok(response)
    }

    /// Stops the renewal of an entry that was replaced by `current`, which has the same ID.
    ///
    /// Entries depending on the replaced token move under `current` if it holds the same
    /// token, and into the base scope otherwise.
    async fn retire_replaced(&self, replaced: Option<Index>, current: &Index) {
        let Some(replaced) = replaced else {
            return;
        };

        let dependents: Vec<Index> = match replaced.token.as_deref() {
            Some(token) => self
                .inner
                .db
                .get_all(IndexKey::TokenParent(token))
                .into_iter()
                .chain(self.inner.db.get_all(IndexKey::LeaseToken(token)))
                .filter(|index| index.id != current.id)
                .collect(),
            None => Vec::new(),
        };
        if let Some(ctx) = &replaced.renew_ctx {
            ctx.cancel.cancel();
        }
        tracing::debug!(id = replaced.id, dependents = dependents.len(), "replaced cache entry");

        let parent = match &current.renew_ctx {
            Some(ctx) if current.token.is_some() && current.token == replaced.token => {
                ctx.cancel.clone()
            }
            _ => self.base_scope(),
        };
        for dependent in dependents {
            self.rescope(dependent, parent.clone()).await;
        }
    }

    /// Starts renewing the secret of `index` in the scope `ctx`.
    fn spawn_renewer(&self, index: &Index, ctx: RenewCtx, lifetime: Renewal) {
        let target = match index.kind {
            IndexType::Token => RenewTarget {
                token: index.token.clone().unwrap_or_default(),
                lease: None,
                namespace: index.namespace.clone(),
            },
            IndexType::Lease => RenewTarget {
                token: index.lease_token.clone().unwrap_or_default(),
                lease: index.lease.clone(),
                namespace: index.namespace.clone(),
            },
        };

        let mut watcher = LifetimeWatcher::new(
            self.inner.client.clone(),
            target,
            lifetime,
            self.inner.renewal,
            ctx.cancel.clone(),
        );

        let cache = self.clone();
        let RenewCtx { id, cancel, done } = ctx;
        tokio::spawn(async move {
            let _done = done.drop_guard();
            loop {
                let event = watcher.next().await;
                // The entry was evicted or replaced in the meantime, its ID may belong to
                // another entry by now.
                if cancel.is_cancelled() {
                    tracing::trace!(id, "renewal cancelled");
                    break;
                }
                match event {
                    LifetimeEvent::Renewed(renewal) => {
                        tracing::trace!(id, ttl = ?renewal.ttl, "renewed secret");
                        cache.record_renewal(&id, renewal).await;
                    }
                    LifetimeEvent::Done(reason) => {
                        tracing::debug!(id, reason = reason.as_str(), "secret is gone, evicting");
                        cache.evict_from_renewer(&id, reason.as_str()).await;
                        break;
                    }
                    LifetimeEvent::Cancelled => {
                        tracing::trace!(id, "renewal cancelled");
                        break;
                    }
                }
            }
        });
    }

    async fn record_renewal(&self, id: &str, renewal: Renewal) {
        let Some(index) = self.inner.db.update(id, |index| {
            index.last_renewed = Utc::now();
            index.renewed = Some(Lifetime {
                renewable: renewal.renewable,
                ttl: renewal.ttl,
            });
        }) else {
            return;
        };

        match index.serialize() {
            Ok(blob) => {
                self.write_storage(StorageWrite::Set {
                    id: index.id,
                    blob,
                    kind: index.kind,
                })
                .await
            }
            Err(err) => {
                tracing::error!(id, error = &err as &dyn std::error::Error, "failed to encode cache entry");
            }
        }
    }

    async fn evict_from_renewer(&self, id: &str, reason: &'static str) {
        if let Some(index) = self.inner.db.get(IndexKey::Id(id)) {
            self.evict_entries(vec![index], reason, Some(id)).await;
        }
    }

    /// Evicts the entry of `token` along with all tokens and leases derived from it.
    ///
    /// Derived entries are evicted even if the token itself has no entry, as happens to the
    /// auto-auth token after the whole cache was cleared.
    async fn evict_token(&self, token: &str, reason: &'static str) -> usize {
        let mut roots = self.inner.db.get_all(IndexKey::Token(token));
        roots.extend(self.inner.db.get_all(IndexKey::TokenParent(token)));
        roots.extend(self.inner.db.get_all(IndexKey::LeaseToken(token)));
        self.evict_entries(roots, reason, None).await
    }

    /// Evicts `roots` and, recursively, every entry created by or issued to a token among them.
    ///
    /// `current` is the ID of the entry whose renewer is calling, its done signal is not
    /// awaited.
    async fn evict_entries(
        &self,
        roots: Vec<Index>,
        reason: &'static str,
        current: Option<&str>,
    ) -> usize {
        let mut seen = HashSet::new();
        let mut entries = Vec::new();
        let mut queue = VecDeque::from(roots);

        while let Some(index) = queue.pop_front() {
            if !seen.insert(index.id.clone()) {
                continue;
            }
            if let Some(token) = index.token.as_deref() {
                queue.extend(self.inner.db.get_all(IndexKey::TokenParent(token)));
                queue.extend(self.inner.db.get_all(IndexKey::LeaseToken(token)));
            }
            entries.push(index);
        }

        self.remove_entries(entries, reason, current).await
    }

    /// Cancels the renewers of `entries`, waits for them to stop, and removes the entries from
    /// the index and the persistent storage.
    async fn remove_entries(
        &self,
        entries: Vec<Index>,
        reason: &'static str,
        current: Option<&str>,
    ) -> usize {
        if entries.is_empty() {
            return 0;
        }

        for ctx in entries.iter().filter_map(|index| index.renew_ctx.as_ref()) {
            ctx.cancel.cancel();
        }
        let stopped = entries
            .iter()
            .filter(|index| Some(index.id.as_str()) != current)
            .filter_map(|index| index.renew_ctx.as_ref())
            .map(|ctx| ctx.done.cancelled());
        join_all(stopped).await;

        let mut evicted = 0;
        for index in &entries {
            evicted += self.inner.db.evict(IndexKey::Id(&index.id)).len();
        }
        for index in entries {
            self.write_storage(StorageWrite::Delete(index.id)).await;
        }

        tracing::debug!(evicted, reason, "evicted cache entries");
        metric!(counter("leasecache.evictions") += evicted as i64, "reason" => reason);
        metric!(gauge("leasecache.entries") = self.len() as u64);
        evicted
    }

    /// Evicts everything and wipes the persistent storage.
    async fn evict_all(&self) -> usize {
        let previous = {
            let mut base = self.inner.base.lock().unwrap();
            std::mem::replace(&mut *base, self.inner.root.child_token())
        };
        previous.cancel();

        let entries = self.inner.db.entries();
        join_all(
            entries
                .iter()
                .filter_map(|index| index.renew_ctx.as_ref())
                .map(|ctx| ctx.done.cancelled()),
        )
        .await;

        let evicted = self.inner.db.evict_all();
        // Entries cached while waiting may run in the new base scope.
        for ctx in evicted.iter().filter_map(|index| index.renew_ctx.as_ref()) {
            ctx.cancel.cancel();
        }
        self.write_storage(StorageWrite::Clear).await;

        tracing::debug!(evicted = evicted.len(), "cleared cache");
        metric!(counter("leasecache.evictions") += evicted.len() as i64, "reason" => "clear");
        metric!(gauge("leasecache.entries") = 0u64);
        evicted.len()
    }

    /// Stops all renewals without evicting anything.
    ///
    /// Persisted entries stay in the storage, so they can be restored on the next start.
    pub async fn shutdown(&self) {
        self.base_scope().cancel();
        let entries = self.inner.db.entries();
        join_all(
            entries
                .iter()
                .filter_map(|index| index.renew_ctx.as_ref())
                .map(|ctx| ctx.done.cancelled()),
        )
        .await;
        tracing::debug!(entries = entries.len(), "stopped all renewals");
    }

    /// Writes to the persistent storage, if there is one.
    ///
    /// Failed writes are retried once, and then dropped. The in-memory index stays
    /// authoritative either way.
    async fn write_storage(&self, write: StorageWrite) {
        let Some(storage) = self.inner.storage.clone() else {
            return;
        };

        for attempt in 1..=2 {
            let storage = storage.clone();
            let op = write.clone();
            let result = tokio::task::spawn_blocking(move || op.apply(&storage))
                .await
                .map_err(StorageError::from)
                .and_then(|result| result);

            let err = match result {
                Ok(()) => return,
                Err(err) => err,
            };
            if attempt == 1 {
                tracing::warn!(
                    id = write.id(),
                    error = &err as &dyn std::error::Error,
                    "failed to write to persistent storage, retrying"
                );
            } else {
                tracing::error!(
                    id = write.id(),
                    error = &err as &dyn std::error::Error,
                    "failed to write to persistent storage, dropping write"
                );
                metric!(counter("leasecache.persist") += 1, "status" => "dropped");
                sentry::capture_error(&err);
            }
        }
    }

    /// Encodes all cached entries.
    pub fn serialize(&self) -> Result<Vec<u8>, LeaseCacheError> {
        let mut entries = self.inner.db.entries();
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(serde_json::to_vec(&entries)?)
    }

    /// Restores entries encoded by [`serialize`](Self::serialize), and resumes their renewal.
    ///
    /// Restored entries are written to the persistent storage. Entries which already expired
    /// are skipped.
    pub async fn deserialize(&self, bytes: &[u8]) -> Result<usize, LeaseCacheError> {
        let entries: Vec<Index> = serde_json::from_slice(bytes)?;

        let mut restored = 0;
        for index in restore_order(entries) {
            let Some(index) = self.restore_entry(index).await? else {
                continue;
            };
            let blob = index.serialize()?;
            self.write_storage(StorageWrite::Set {
                id: index.id,
                blob,
                kind: index.kind,
            })
            .await;
            restored += 1;
        }

        metric!(gauge("leasecache.entries") = self.len() as u64);
        Ok(restored)
    }

    /// Restores all entries from `storage`, and resumes their renewal.
    ///
    /// Expired entries are deleted from the storage. Entries that cannot be decoded are
    /// skipped, unless `exit_on_err` is set.
    pub async fn restore(
        &self,
        storage: Arc<PersistentStorage>,
        exit_on_err: bool,
    ) -> Result<usize, LeaseCacheError> {
        let start = Instant::now();
        let mut entries = Vec::new();
        for kind in IndexType::ALL {
            let storage = storage.clone();
            let blobs = tokio::task::spawn_blocking(move || storage.get_by_kind(kind))
                .await
                .map_err(StorageError::from)??;

            for blob in blobs {
                match Index::deserialize(&blob) {
                    Ok(index) => entries.push(index),
                    Err(err) if exit_on_err => return Err(err.into()),
                    Err(err) => {
                        tracing::error!(
                            kind = %kind,
                            error = &err as &dyn std::error::Error,
                            "failed to decode persisted cache entry, skipping"
                        );
                    }
                }
            }
        }

        let mut restored = 0;
        let mut expired = Vec::new();
        for index in restore_order(entries) {
            let id = index.id.clone();
            match self.restore_entry(index).await? {
                Some(_) => restored += 1,
                None => expired.push(id),
            }
        }

        for id in expired {
            let storage = storage.clone();
            let result = tokio::task::spawn_blocking(move || storage.delete(&id))
                .await
                .map_err(StorageError::from)
                .and_then(|result| result);
            if let Err(err) = result {
                tracing::warn!(
                    error = &err as &dyn std::error::Error,
                    "failed to delete expired cache entry"
                );
            }
        }

        tracing::info!(restored, storage = storage.name(), "restored lease cache");
        metric!(timer("leasecache.restore.duration") = start.elapsed(), "storage" => storage.name());
        metric!(gauge("leasecache.entries") = self.len() as u64);
        Ok(restored)
    }

    /// Indexes a decoded entry and resumes its renewal.
    ///
    /// Returns `None` for entries which already expired.
    async fn restore_entry(&self, mut index: Index) -> Result<Option<Index>, LeaseCacheError> {
        let lifetime = match stored_lifetime(&index) {
            Some(lifetime) => match remaining_lifetime(lifetime, &index) {
                Some(remaining) => Some(remaining),
                None => {
                    tracing::debug!(id = index.id, "skipping expired cache entry");
                    return Ok(None);
                }
            },
            None => None,
        };

        let parent_token = match index.kind {
            IndexType::Token => index.token_parent.as_deref(),
            IndexType::Lease => index.lease_token.as_deref(),
        };
        let parent = parent_token.and_then(|token| self.token_scope(token));
        index.orphaned = parent_token.is_some() && parent.is_none();

        let ctx = RenewCtx::new(&index.id, &parent.unwrap_or_else(|| self.base_scope()));
        index.renew_ctx = Some(ctx.clone());
        let replaced = self.inner.db.set(index.clone())?;

        match lifetime {
            Some(lifetime) => self.spawn_renewer(&index, ctx, lifetime),
            // placeholders have nothing to renew
            None => ctx.done.cancel(),
        }
        self.retire_replaced(replaced, &index).await;
        Ok(Some(index))
    }
}

/// The current lifetime of the secret cached in `index`.
///
/// This is the lifetime granted by the most recent renewal, or the one in the cached response
/// if the secret was never renewed. `None` for entries without a cached secret, such as
/// auto-auth placeholders.
fn stored_lifetime(index: &Index) -> Option<Renewal> {
    if let Some(lifetime) = index.renewed {
        return Some(Renewal {
            renewable: lifetime.renewable,
            ttl: lifetime.ttl,
        });
    }
    let response = SendResponse::from_wire(&index.response).ok()?;
    let secret = Secret::parse(&response.body)?;
    Some(Renewal::from_secret(&secret))
}

/// What is left of `lifetime` since `index` was last renewed.
///
/// `None` if the secret already expired.
fn remaining_lifetime(lifetime: Renewal, index: &Index) -> Option<Renewal> {
    if lifetime.ttl.is_zero() {
        return Some(lifetime);
    }
    let elapsed = (Utc::now() - index.last_renewed)
        .to_std()
        .unwrap_or_default();
    let ttl = lifetime.ttl.checked_sub(elapsed).filter(|ttl| !ttl.is_zero())?;
    Some(Renewal { ttl, ..lifetime })
}

/// Orders entries so that every token comes after the token it was created with, and leases
/// come last.
fn restore_order(entries: Vec<Index>) -> Vec<Index> {
    let (mut pending, leases): (Vec<_>, Vec<_>) = entries
        .into_iter()
        .partition(|index| index.kind == IndexType::Token);

    let mut ordered = Vec::with_capacity(pending.len() + leases.len());
    while !pending.is_empty() {
        let tokens: HashSet<String> = pending
            .iter()
            .filter_map(|index| index.token.clone())
            .collect();
        let (ready, rest): (Vec<_>, Vec<_>) = pending.into_iter().partition(|index| {
            index
                .token_parent
                .as_ref()
                .is_none_or(|parent| !tokens.contains(parent))
        });

        if ready.is_empty() {
            // a cycle, which only corrupted data can produce
            ordered.extend(rest);
            break;
        }
        ordered.extend(ready);
        pending = rest;
    }

    ordered.extend(leases);
    ordered
}

/// The namespace a cache clear request applies to.
fn clear_namespace(namespace: Option<&str>) -> String {
    let namespace = namespace.map(keys::canonicalize_namespace).unwrap_or_default();
    if namespace.is_empty() {
        ROOT_NAMESPACE.to_owned()
    } else {
        namespace
    }
}
