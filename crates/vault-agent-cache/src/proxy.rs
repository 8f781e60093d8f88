//! The requests and responses passing through the cache, and the proxier forwarding them.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::http::header::{AGE, CONTENT_LENGTH};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;

/// Headers which only describe a single connection, and are never stored.
const CONNECTION_HEADERS: [&str; 7] = [
    "connection",
    "keep-alive",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Header telling clients whether a response was served from the cache.
pub const CACHE_HEADER: &str = "X-Cache";

/// A request on its way to the remote server.
///
/// The body is read in full before the request reaches the cache, so it can be part of the
/// index ID and be inspected without consuming it.
#[derive(Debug)]
pub struct SendRequest {
    /// The token used to authenticate the request.
    ///
    /// This is either the token the client sent, or the auto-auth token the agent injected.
    pub token: String,
    pub request: Request<Bytes>,
}

/// Whether a response came from the cache, and how old it is.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CacheMeta {
    pub hit: bool,
    pub age: Duration,
}

/// A response from the remote server, with its body read in full.
#[derive(Clone, Debug)]
pub struct SendResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Set by the cache for responses it has looked at.
    pub cache_meta: Option<CacheMeta>,
}

impl SendResponse {
    pub fn new(status: StatusCode, headers: HeaderMap, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers,
            body: body.into(),
            cache_meta: None,
        }
    }

    /// Serializes the response into its HTTP/1.1 wire format.
    ///
    /// Headers are written in sorted order, connection-level headers are left out.
    pub fn to_wire(&self) -> Vec<u8> {
        let mut wire = Vec::with_capacity(self.body.len() + 256);
        let reason = self.status.canonical_reason().unwrap_or_default();
        wire.extend_from_slice(format!("HTTP/1.1 {} {reason}\r\n", self.status.as_u16()).as_bytes());

        let mut names: Vec<&HeaderName> = self
            .headers
            .keys()
            .filter(|name| !CONNECTION_HEADERS.contains(&name.as_str()) && **name != CONTENT_LENGTH)
            .collect();
        names.sort_by(|a, b| a.as_str().cmp(b.as_str()));

        for name in names {
            for value in self.headers.get_all(name) {
                wire.extend_from_slice(name.as_str().as_bytes());
                wire.extend_from_slice(b": ");
                wire.extend_from_slice(value.as_bytes());
                wire.extend_from_slice(b"\r\n");
            }
        }
        wire.extend_from_slice(format!("content-length: {}\r\n", self.body.len()).as_bytes());
        wire.extend_from_slice(b"\r\n");
        wire.extend_from_slice(&self.body);
        wire
    }

    /// Parses a response previously serialized with [`to_wire`](Self::to_wire).
    pub fn from_wire(wire: &[u8]) -> Result<Self> {
        let head_end = wire
            .windows(4)
            .position(|window| window == b"\r\n\r\n")
            .context("missing end of response head")?;
        let head = std::str::from_utf8(&wire[..head_end]).context("response head is not utf-8")?;
        let body = Bytes::copy_from_slice(&wire[head_end + 4..]);

        let mut lines = head.split("\r\n");
        let status_line = lines.next().context("missing status line")?;
        let status = status_line
            .split(' ')
            .nth(1)
            .context("missing status code")?
            .parse::<u16>()
            .context("invalid status code")?;
        let status = StatusCode::from_u16(status).context("invalid status code")?;

        let mut headers = HeaderMap::new();
        for line in lines {
            let (name, value) = line.split_once(": ").context("malformed header line")?;
            headers.append(
                HeaderName::from_bytes(name.as_bytes()).context("invalid header name")?,
                HeaderValue::from_str(value).context("invalid header value")?,
            );
        }

        Ok(Self::new(status, headers, body))
    }
}

impl IntoResponse for SendResponse {
    fn into_response(self) -> Response {
        let mut response = (self.status, self.headers, self.body).into_response();
        if let Some(meta) = self.cache_meta {
            let headers = response.headers_mut();
            let cache = if meta.hit { "HIT" } else { "MISS" };
            headers.insert(CACHE_HEADER, HeaderValue::from_static(cache));
            if meta.hit {
                headers.insert(AGE, HeaderValue::from(meta.age.as_secs()));
            }
        }
        response
    }
}

/// Forwards requests to the remote server.
///
/// Implementations return responses with any status, including errors. An `Err` means that no
/// response was received at all.
#[async_trait]
pub trait Proxier: Send + Sync + 'static {
    async fn send(&self, request: SendRequest) -> Result<SendResponse>;
}
