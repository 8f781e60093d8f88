use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use axum::http::{HeaderMap, Request, StatusCode};
use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use vault_agent_cache::config::RenewalConfig;
use vault_agent_cache::keys::NAMESPACE_HEADER;
use vault_agent_cache::persist::MemoryStorage;
use vault_agent_cache::renewer::{RenewError, RenewTarget, Renewal};
use vault_agent_cache::{
    LeaseCache, LeaseCacheConfig, PersistentStorage, Proxier, RenewClient, SendRequest,
    SendResponse,
};
use vault_agent_cache_test as test;

pub use test::{setup, tempdir};

/// A [`Proxier`] that answers with a fixed sequence of responses.
///
/// Once all responses are used up, every further request fails.
pub struct MockProxier {
    responses: Mutex<VecDeque<(StatusCode, String)>>,
    requests: AtomicUsize,
}

impl MockProxier {
    pub fn new(responses: &[(u16, &str)]) -> Arc<Self> {
        let responses = responses
            .iter()
            .map(|(status, body)| (StatusCode::from_u16(*status).unwrap(), body.to_string()))
            .collect();

        Arc::new(Self {
            responses: Mutex::new(responses),
            requests: AtomicUsize::new(0),
        })
    }

    /// The number of requests that reached the proxier.
    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Proxier for MockProxier {
    async fn send(&self, _request: SendRequest) -> anyhow::Result<SendResponse> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        let (status, body) = self
            .responses
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| anyhow!("no scripted response left"))?;

        let mut headers = HeaderMap::new();
        headers.insert("content-type", "application/json".parse().unwrap());
        Ok(SendResponse::new(status, headers, body))
    }
}

/// A [`RenewClient`] that either renews every secret with a fixed lifetime, or rejects every
/// renewal.
pub struct MockRenewClient {
    renewal: Option<Renewal>,
    calls: Mutex<Vec<RenewTarget>>,
}

impl MockRenewClient {
    pub fn renewing(renewable: bool, ttl: Duration) -> Arc<Self> {
        Arc::new(Self {
            renewal: Some(Renewal { renewable, ttl }),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn revoking() -> Arc<Self> {
        Arc::new(Self {
            renewal: None,
            calls: Mutex::new(Vec::new()),
        })
    }

    /// All renewals requested so far.
    pub fn calls(&self) -> Vec<RenewTarget> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl RenewClient for MockRenewClient {
    async fn renew(
        &self,
        target: &RenewTarget,
        _increment: Option<Duration>,
    ) -> Result<Renewal, RenewError> {
        self.calls.lock().unwrap().push(target.clone());
        self.renewal
            .ok_or_else(|| RenewError::Revoked("permission denied".into()))
    }
}

/// Creates a lease cache on top of the given mocks.
pub fn lease_cache(
    proxier: Arc<MockProxier>,
    client: Arc<MockRenewClient>,
    storage: Option<Arc<PersistentStorage>>,
) -> LeaseCache {
    LeaseCache::new(LeaseCacheConfig {
        proxier,
        client,
        storage,
        renewal: RenewalConfig::default(),
        base: CancellationToken::new(),
    })
}

/// Creates an empty in-memory storage backend.
pub fn memory_storage() -> Arc<PersistentStorage> {
    Arc::new(PersistentStorage::Memory(MemoryStorage::new()))
}

/// Creates a request to the remote server.
pub fn request(method: &str, uri: &str, token: &str, body: &str) -> SendRequest {
    SendRequest {
        token: token.to_owned(),
        request: Request::builder()
            .method(method)
            .uri(uri)
            .body(Bytes::from(body.to_owned()))
            .unwrap(),
    }
}

/// Creates a request to the remote server, scoped to a namespace.
pub fn namespaced_request(
    method: &str,
    uri: &str,
    namespace: &str,
    token: &str,
    body: &str,
) -> SendRequest {
    let mut req = request(method, uri, token, body);
    req.request
        .headers_mut()
        .insert(NAMESPACE_HEADER, namespace.parse().unwrap());
    req
}

/// A response body creating a token.
pub fn token_body(token: &str, renewable: bool, lease_duration: u64) -> String {
    serde_json::json!({
        "auth": {
            "client_token": token,
            "accessor": format!("{token}-accessor"),
            "renewable": renewable,
            "lease_duration": lease_duration,
        }
    })
    .to_string()
}

/// A response body carrying a lease.
pub fn lease_body(lease: &str, renewable: bool, lease_duration: u64) -> String {
    serde_json::json!({
        "lease_id": lease,
        "renewable": renewable,
        "lease_duration": lease_duration,
        "data": {"value": "secret"},
    })
    .to_string()
}
