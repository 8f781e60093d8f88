//! Keeps the cache in sync with revocations proxied to the remote server.

use std::collections::VecDeque;

use tokio_util::sync::CancellationToken;

use crate::cachememdb::{Index, IndexKey, RenewCtx};
use crate::persist::IndexType;

use super::{LeaseCache, RequestParts, StorageWrite, remaining_lifetime, stored_lifetime};

const REVOKE_PREFIX: &str = "/v1/sys/leases/revoke-prefix/";
const REVOKE_FORCE: &str = "/v1/sys/leases/revoke-force/";
const REVOKE_LEASE: &str = "/v1/sys/leases/revoke";

/// Reads a string field from a JSON request body.
fn body_field(body: &[u8], field: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_slice(body).ok()?;
    let field = value.get(field)?.as_str()?;
    Some(field).filter(|field| !field.is_empty()).map(Into::into)
}

impl LeaseCache {
    /// Evicts whatever a successful revocation request revoked.
    ///
    /// `namespace` and `path` are the derived namespace and namespace-relative path of the
    /// request. Returns `false` if the request was not a revocation.
    pub(super) async fn handle_revocation(
        &self,
        request: &RequestParts,
        namespace: &str,
        path: &str,
    ) -> bool {
        match path {
            "/v1/auth/token/revoke" => {
                if let Some(token) = body_field(&request.body, "token") {
                    self.evict_token(&token, "revoked").await;
                }
            }
            "/v1/auth/token/revoke-self" => {
                self.evict_token(&request.token, "revoked").await;
            }
            "/v1/auth/token/revoke-accessor" => {
                if let Some(accessor) = body_field(&request.body, "accessor") {
                    let entries = self.inner.db.get_all(IndexKey::TokenAccessor(&accessor));
                    self.evict_entries(entries, "revoked", None).await;
                }
            }
            "/v1/auth/token/revoke-orphan" => {
                if let Some(token) = body_field(&request.body, "token") {
                    self.revoke_orphan(&token).await;
                }
            }
            _ => {
                if let Some(prefix) = path
                    .strip_prefix(REVOKE_PREFIX)
                    .or_else(|| path.strip_prefix(REVOKE_FORCE))
                {
                    let prefix = format!("/v1/{}", prefix.trim_start_matches('/'));
                    let leases: Vec<Index> = self
                        .inner
                        .db
                        .get_by_prefix(IndexKey::RequestPath {
                            namespace,
                            path: &prefix,
                        })
                        .into_iter()
                        .filter(|index| index.kind == IndexType::Lease)
                        .collect();
                    self.remove_entries(leases, "revoked", None).await;
                } else if let Some(rest) = path.strip_prefix(REVOKE_LEASE) {
                    let lease = match rest.strip_prefix('/') {
                        Some(lease) if !lease.is_empty() => Some(lease.to_owned()),
                        _ if rest.is_empty() => body_field(&request.body, "lease_id"),
                        // some other endpoint, such as revoke-self
                        _ => return false,
                    };
                    if let Some(lease) = lease {
                        let leases = self.inner.db.get_all(IndexKey::Lease(&lease));
                        self.remove_entries(leases, "revoked", None).await;
                    }
                } else {
                    return false;
                }
            }
        }
        true
    }

    /// Evicts a token revoked without its children, along with its leases.
    ///
    /// The child tokens stay cached without a parent, and their renewals continue in the base
    /// scope.
    async fn revoke_orphan(&self, token: &str) {
        let Some(index) = self.inner.db.get(IndexKey::Token(token)) else {
            return;
        };

        let children = self.inner.db.get_all(IndexKey::TokenParent(token));
        let mut entries = self.inner.db.get_all(IndexKey::LeaseToken(token));
        entries.push(index);
        // Cancels the renewals of the children and everything below them as well.
        self.remove_entries(entries, "revoked", None).await;

        let base = self.base_scope();
        for child in children {
            let Some(child) = self.inner.db.update(&child.id, |index| {
                index.token_parent = None;
            }) else {
                continue;
            };
            match child.serialize() {
                Ok(blob) => {
                    self.write_storage(StorageWrite::Set {
                        id: child.id.clone(),
                        blob,
                        kind: child.kind,
                    })
                    .await
                }
                Err(err) => {
                    tracing::error!(
                        id = child.id,
                        error = &err as &dyn std::error::Error,
                        "failed to encode cache entry"
                    );
                }
            }
            self.rescope(child, base.clone()).await;
        }
    }

    /// Moves the renewals of `root` and everything below it into a new scope under `parent`.
    pub(super) async fn rescope(&self, root: Index, parent: CancellationToken) {
        let mut queue = VecDeque::from([(root.id, parent)]);
        let mut expired = Vec::new();

        while let Some((id, parent)) = queue.pop_front() {
            let Some(index) = self.inner.db.get(IndexKey::Id(&id)) else {
                continue;
            };
            if let Some(ctx) = &index.renew_ctx {
                ctx.cancel.cancel();
                ctx.done.cancelled().await;
            }

            let ctx = RenewCtx::new(&id, &parent);
            let Some(index) = self.inner.db.update(&id, |index| {
                index.renew_ctx = Some(ctx.clone());
            }) else {
                continue;
            };

            match stored_lifetime(&index) {
                Some(lifetime) => match remaining_lifetime(lifetime, &index) {
                    Some(remaining) => self.spawn_renewer(&index, ctx.clone(), remaining),
                    None => {
                        ctx.done.cancel();
                        expired.push(index.clone());
                    }
                },
                None => ctx.done.cancel(),
            }

            if let Some(token) = index.token.as_deref() {
                let dependents = self
                    .inner
                    .db
                    .get_all(IndexKey::TokenParent(token))
                    .into_iter()
                    .chain(self.inner.db.get_all(IndexKey::LeaseToken(token)));
                for dependent in dependents {
                    queue.push_back((dependent.id, ctx.cancel.clone()));
                }
            }
        }

        self.evict_entries(expired, "expired", None).await;
    }
}
