use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::persist::IndexType;

/// The background renewal scope of a cache entry.
///
/// Cancelling `cancel` asks the renewer to stop, `done` is cancelled once it has stopped.
/// Scopes form a tree: the scope of a lease or child token is derived from the scope of its
/// parent token, so cancelling a parent stops all renewals below it.
#[derive(Clone, Debug)]
pub struct RenewCtx {
    /// The ID of the entry this scope belongs to.
    pub id: String,
    pub cancel: CancellationToken,
    pub done: CancellationToken,
}

impl RenewCtx {
    /// Creates a scope derived from `parent`.
    pub fn new(id: impl Into<String>, parent: &CancellationToken) -> Self {
        Self {
            id: id.into(),
            cancel: parent.child_token(),
            done: CancellationToken::new(),
        }
    }

    /// Creates a scope for an entry which has no renewer to wait for.
    pub fn idle(id: impl Into<String>, parent: &CancellationToken) -> Self {
        let ctx = Self::new(id, parent);
        ctx.done.cancel();
        ctx
    }
}

/// The lifetime the remote server granted on the most recent renewal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lifetime {
    pub renewable: bool,
    /// Counted from [`Index::last_renewed`].
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
}

/// A cached response, with everything needed to find, renew and evict it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Index {
    /// The index ID of the request which produced this entry.
    pub id: String,

    /// The token created by the response, for token entries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// The token that was used to create [`token`](Self::token).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_parent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_accessor: Option<String>,

    /// The lease in the response, for lease entries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease: Option<String>,
    /// The token the lease belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_token: Option<String>,

    pub namespace: String,
    pub request_path: String,
    #[serde(rename = "type")]
    pub kind: IndexType,

    /// The response in HTTP/1.1 wire format.
    #[serde(with = "hex")]
    pub response: Vec<u8>,

    pub request_method: String,
    pub request_token: String,
    pub request_header: BTreeMap<String, Vec<String>>,
    #[serde(with = "hex")]
    pub request_body: Vec<u8>,

    /// When the secret was cached or last renewed.
    pub last_renewed: DateTime<Utc>,
    /// Replaces the lifetime in the cached response once the secret was renewed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub renewed: Option<Lifetime>,

    /// The renewal scope, only set while the entry is live.
    #[serde(skip)]
    pub renew_ctx: Option<RenewCtx>,
    /// Set on restore when the token this entry depends on was not restored.
    #[serde(skip)]
    pub orphaned: bool,
}

impl Index {
    /// Creates an entry without any token or lease information.
    pub fn new(id: String, kind: IndexType) -> Self {
        Self {
            id,
            token: None,
            token_parent: None,
            token_accessor: None,
            lease: None,
            lease_token: None,
            namespace: String::new(),
            request_path: String::new(),
            kind,
            response: Vec::new(),
            request_method: String::new(),
            request_token: String::new(),
            request_header: BTreeMap::new(),
            request_body: Vec::new(),
            last_renewed: Utc::now(),
            renewed: None,
            renew_ctx: None,
            orphaned: false,
        }
    }

    /// Encodes this entry for the persistent storage.
    ///
    /// The renewal scope is not part of the encoding.
    pub fn serialize(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Decodes an entry from the persistent storage.
    pub fn deserialize(blob: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(blob)
    }
}
