//! Background renewal of cached tokens and leases.
//!
//! Every cached secret is watched by a [`LifetimeWatcher`], which keeps renewing it with the
//! remote server through a [`RenewClient`] until it expires, gets revoked, or the watcher is
//! cancelled. The [`LeaseCache`](crate::LeaseCache) drives the watcher and evicts the entry
//! once it reports a terminal state.

use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use axum::http::StatusCode;
use serde::Serialize;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;

use crate::api::Secret;
use crate::config::{RemoteConfig, RenewalConfig};
use crate::keys::{NAMESPACE_HEADER, ROOT_NAMESPACE};
use crate::metric;

/// Header carrying the token a request is authenticated with.
pub const TOKEN_HEADER: &str = "X-Vault-Token";

/// The secret a renewal is requested for.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RenewTarget {
    /// The token to authenticate with.
    ///
    /// For token entries this is the token being renewed, for leases it is the token the lease
    /// belongs to.
    pub token: String,
    /// The lease to renew, `None` to renew the token itself.
    pub lease: Option<String>,
    /// The namespace the secret lives in.
    pub namespace: String,
}

/// The lifetime of a secret, as reported by the remote server.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Renewal {
    pub renewable: bool,
    /// Zero means the secret does not expire.
    pub ttl: Duration,
}

impl Renewal {
    pub fn from_secret(secret: &Secret) -> Self {
        Self {
            renewable: secret.is_renewable(),
            ttl: secret.ttl(),
        }
    }
}

/// An error renewing a secret.
#[derive(Debug, thiserror::Error)]
pub enum RenewError {
    /// The remote server refused the renewal, the secret is gone for good.
    #[error("renewal rejected: {0}")]
    Revoked(String),
    #[error("failed to reach the remote server")]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Renews tokens and leases with the remote server.
#[async_trait]
pub trait RenewClient: Send + Sync + 'static {
    async fn renew(
        &self,
        target: &RenewTarget,
        increment: Option<Duration>,
    ) -> Result<Renewal, RenewError>;
}

#[derive(Serialize)]
struct RenewBody<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    lease_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    increment: Option<u64>,
}

/// A [`RenewClient`] talking to the remote server over HTTP.
#[derive(Debug, Clone)]
pub struct HttpRenewClient {
    client: reqwest::Client,
    address: url::Url,
}

impl HttpRenewClient {
    pub fn new(config: &RemoteConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()?;

        Ok(Self {
            client,
            address: config.address.clone(),
        })
    }
}

#[async_trait]
impl RenewClient for HttpRenewClient {
    async fn renew(
        &self,
        target: &RenewTarget,
        increment: Option<Duration>,
    ) -> Result<Renewal, RenewError> {
        let path = match target.lease {
            Some(_) => "v1/sys/leases/renew",
            None => "v1/auth/token/renew-self",
        };
        let url = self.address.join(path).map_err(|err| anyhow!(err))?;
        let body = RenewBody {
            lease_id: target.lease.as_deref(),
            increment: increment.map(|increment| increment.as_secs()),
        };

        let mut request = self
            .client
            .put(url)
            .header(TOKEN_HEADER, &target.token)
            .json(&body);
        if !target.namespace.is_empty() && target.namespace != ROOT_NAMESPACE {
            request = request.header(NAMESPACE_HEADER, &target.namespace);
        }

        let response = request.send().await?;
        let status = response.status();
        if matches!(
            status,
            StatusCode::BAD_REQUEST | StatusCode::FORBIDDEN | StatusCode::NOT_FOUND
        ) {
            let details = response.text().await.unwrap_or_default();
            return Err(RenewError::Revoked(format!("{status}: {}", details.trim())));
        }
        if !status.is_success() {
            return Err(anyhow!("unexpected status {status}").into());
        }

        let body = response.bytes().await?;
        let secret = Secret::parse(&body).ok_or_else(|| anyhow!("malformed renewal response"))?;
        Ok(Renewal::from_secret(&secret))
    }
}

/// Why a watched secret reached the end of its life.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TerminalReason {
    /// The TTL elapsed without a successful renewal.
    Expired,
    /// The remote server rejected the renewal.
    Revoked(String),
}

impl TerminalReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TerminalReason::Expired => "expired",
            TerminalReason::Revoked(_) => "revoked",
        }
    }
}

/// What happened to a watched secret.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LifetimeEvent {
    /// The secret was renewed.
    Renewed(Renewal),
    /// The secret is gone, its cache entry should be evicted.
    Done(TerminalReason),
    /// The watcher was cancelled.
    Cancelled,
}

/// Keeps a single secret alive.
///
/// Renewable secrets are renewed after two thirds of their TTL. Secrets which cannot be renewed
/// are watched until their TTL elapses, secrets without a TTL until cancelled.
pub struct LifetimeWatcher {
    client: Arc<dyn RenewClient>,
    target: RenewTarget,
    config: RenewalConfig,
    cancel: CancellationToken,
    renewal: Renewal,
    expires_at: Option<Instant>,
}

impl LifetimeWatcher {
    /// Creates a watcher for a secret with the given remaining lifetime.
    pub fn new(
        client: Arc<dyn RenewClient>,
        target: RenewTarget,
        lifetime: Renewal,
        config: RenewalConfig,
        cancel: CancellationToken,
    ) -> Self {
        let mut watcher = Self {
            client,
            target,
            config,
            cancel,
            renewal: lifetime,
            expires_at: None,
        };
        watcher.reset(lifetime);
        watcher
    }

    fn reset(&mut self, renewal: Renewal) {
        self.renewal = renewal;
        self.expires_at = (!renewal.ttl.is_zero()).then(|| Instant::now() + renewal.ttl);
    }

    fn renew_interval(&self) -> Duration {
        (self.renewal.ttl * 2 / 3).max(self.config.min_interval)
    }

    /// Waits for the next thing to happen to the secret.
    ///
    /// Once this returned [`LifetimeEvent::Done`] or [`LifetimeEvent::Cancelled`], the watcher
    /// should not be polled again.
    pub async fn next(&mut self) -> LifetimeEvent {
        let Some(expires_at) = self.expires_at else {
            self.cancel.cancelled().await;
            return LifetimeEvent::Cancelled;
        };

        if !self.renewal.renewable {
            return tokio::select! {
                biased;
                _ = self.cancel.cancelled() => LifetimeEvent::Cancelled,
                _ = time::sleep_until(expires_at) => LifetimeEvent::Done(TerminalReason::Expired),
            };
        }

        let renew_at = (Instant::now() + self.renew_interval()).min(expires_at);
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return LifetimeEvent::Cancelled,
            _ = time::sleep_until(renew_at) => {}
        }

        loop {
            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return LifetimeEvent::Cancelled,
                result = self.client.renew(&self.target, self.config.increment) => result,
            };

            match result {
                Ok(renewal) => {
                    metric!(counter("leasecache.renewals") += 1, "status" => "renewed");
                    self.reset(renewal);
                    return LifetimeEvent::Renewed(renewal);
                }
                Err(RenewError::Revoked(reason)) => {
                    metric!(counter("leasecache.renewals") += 1, "status" => "revoked");
                    return LifetimeEvent::Done(TerminalReason::Revoked(reason));
                }
                Err(err) => {
                    metric!(counter("leasecache.renewals") += 1, "status" => "failed");
                    tracing::warn!(
                        error = &err as &dyn std::error::Error,
                        lease = self.target.lease.as_deref(),
                        "failed to renew secret, retrying"
                    );
                }
            }

            let retry_at = (Instant::now() + self.config.retry_interval).min(expires_at);
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return LifetimeEvent::Cancelled,
                _ = time::sleep_until(retry_at) => {}
            }
            if Instant::now() >= expires_at {
                return LifetimeEvent::Done(TerminalReason::Expired);
            }
        }
    }
}
