//! The subset of the remote server's JSON responses the cache looks at.

use std::time::Duration;

use serde::Deserialize;

/// A secret as returned by the remote server.
///
/// Only the fields which decide whether and how a response is cached are parsed, everything
/// else in the payload is ignored.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct Secret {
    pub lease_id: String,
    pub lease_duration: u64,
    pub renewable: bool,
    pub auth: Option<SecretAuth>,
}

/// Authentication information attached to a secret, present when a token was created.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct SecretAuth {
    pub client_token: String,
    pub accessor: String,
    pub renewable: bool,
    pub lease_duration: u64,
    pub orphan: bool,
}

impl Secret {
    /// Parses a response body.
    ///
    /// Returns `None` for bodies which are not a JSON object.
    pub fn parse(body: &[u8]) -> Option<Self> {
        serde_json::from_slice(body).ok()
    }

    /// The token created by this response, if any.
    pub fn client_token(&self) -> Option<&SecretAuth> {
        self.auth.as_ref().filter(|auth| !auth.client_token.is_empty())
    }

    /// The lease attached to this response, if any.
    pub fn lease(&self) -> Option<&str> {
        Some(self.lease_id.as_str()).filter(|lease| !lease.is_empty())
    }

    /// Whether the token or the lease in this response can be renewed.
    pub fn is_renewable(&self) -> bool {
        match self.client_token() {
            Some(auth) => auth.renewable,
            None => self.renewable,
        }
    }

    /// The lifetime of the token or lease in this response.
    ///
    /// A zero duration means the secret does not expire.
    pub fn ttl(&self) -> Duration {
        let seconds = match self.client_token() {
            Some(auth) => auth.lease_duration,
            None => self.lease_duration,
        };
        Duration::from_secs(seconds)
    }
}
