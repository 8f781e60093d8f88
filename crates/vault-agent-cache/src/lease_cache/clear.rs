//! The cache clear endpoint.

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use bytes::Bytes;
use serde::Deserialize;

use crate::cachememdb::IndexKey;
use crate::error::{LeaseCacheError, ResponseError};

use super::{LeaseCache, clear_namespace};

/// JSON body of the cache clear request.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct CacheClearRequest {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: String,
    pub namespace: Option<String>,
}

/// What to evict from the cache.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClearTarget {
    /// Entries created by requests below a path.
    RequestPath { namespace: String, path: String },
    /// A token and everything derived from it.
    Token(String),
    /// The token with the given accessor and everything derived from it.
    TokenAccessor(String),
    /// A single lease.
    Lease(String),
    /// Everything, including the persistent storage.
    All,
}

impl TryFrom<CacheClearRequest> for ClearTarget {
    type Error = LeaseCacheError;

    fn try_from(request: CacheClearRequest) -> Result<Self, Self::Error> {
        let CacheClearRequest {
            kind,
            value,
            namespace,
        } = request;

        match kind.as_str() {
            "" => return Err(LeaseCacheError::InvalidRequest("missing clear type".into())),
            "all" => return Ok(ClearTarget::All),
            _ => {}
        }
        if value.is_empty() {
            return Err(LeaseCacheError::InvalidRequest(format!(
                "missing value for clear type {kind}"
            )));
        }

        Ok(match kind.as_str() {
            "request_path" => ClearTarget::RequestPath {
                namespace: clear_namespace(namespace.as_deref()),
                path: value,
            },
            "token" => ClearTarget::Token(value),
            "token_accessor" => ClearTarget::TokenAccessor(value),
            "lease" => ClearTarget::Lease(value),
            other => {
                return Err(LeaseCacheError::InvalidRequest(format!(
                    "invalid clear type {other}"
                )));
            }
        })
    }
}

impl LeaseCache {
    /// Evicts the entries described by `target`.
    ///
    /// Returns the number of evicted entries. Clearing something that is not cached is not an
    /// error.
    pub async fn clear(&self, target: ClearTarget) -> Result<usize, LeaseCacheError> {
        let evicted = match &target {
            ClearTarget::RequestPath { namespace, path } => {
                let entries = self.inner.db.get_by_prefix(IndexKey::RequestPath {
                    namespace,
                    path,
                });
                self.evict_entries(entries, "cleared", None).await
            }
            ClearTarget::Token(token) => self.evict_token(token, "cleared").await,
            ClearTarget::TokenAccessor(accessor) => {
                let entries = self.inner.db.get_all(IndexKey::TokenAccessor(accessor));
                self.evict_entries(entries, "cleared", None).await
            }
            ClearTarget::Lease(lease) => {
                let entries = self.inner.db.get_all(IndexKey::Lease(lease));
                self.remove_entries(entries, "cleared", None).await
            }
            ClearTarget::All => self.evict_all().await,
        };

        tracing::info!(?target, evicted, "cleared cache entries");
        Ok(evicted)
    }

    /// Returns the handler for cache clear requests.
    ///
    /// The router answers `POST /` with a JSON [`CacheClearRequest`], and is meant to be
    /// nested under the agent's own API.
    pub fn handle_cache_clear(&self) -> Router {
        Router::new()
            .route("/", post(clear_cache))
            .with_state(self.clone())
    }
}

async fn clear_cache(
    State(cache): State<LeaseCache>,
    body: Bytes,
) -> Result<StatusCode, ResponseError> {
    if body.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "missing request body").into());
    }

    let request: CacheClearRequest = serde_json::from_slice(&body)?;
    let target = ClearTarget::try_from(request)?;
    cache.clear(target).await?;

    Ok(StatusCode::OK)
}
