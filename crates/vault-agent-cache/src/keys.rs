//! Index IDs and namespace routing for proxied requests.

use std::io::{self, Write};

use axum::http::header::{CONTENT_LENGTH, HOST, TRAILER, TRANSFER_ENCODING, USER_AGENT};
use axum::http::{HeaderMap, HeaderName, Method};
use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};

use crate::proxy::SendRequest;

/// Header carrying the namespace a request is scoped to.
pub const NAMESPACE_HEADER: &str = "X-Vault-Namespace";

/// The namespace requests without a namespace header are scoped to.
pub const ROOT_NAMESPACE: &str = "root/";

const DEFAULT_USER_AGENT: &str = "Go-http-client/1.1";

/// Headers that are written as part of the request head, or not at all.
const EXCLUDED_HEADERS: [HeaderName; 5] =
    [HOST, USER_AGENT, CONTENT_LENGTH, TRANSFER_ENCODING, TRAILER];

/// Paths, relative to `/v1`, of the endpoints that revoke tokens or leases.
///
/// They may be preceded by namespace segments, and the lease endpoints may be followed by a
/// lease ID or prefix.
const REVOCATION_PATHS: [&str; 8] = [
    "/auth/token/revoke",
    "/auth/token/revoke-self",
    "/auth/token/revoke-accessor",
    "/auth/token/revoke-orphan",
    "/sys/leases/revoke",
    "/sys/leases/revoke-self",
    "/sys/leases/revoke-force",
    "/sys/leases/revoke-prefix",
];

type Blake2b256 = Blake2b<U32>;

/// Computes the index ID of a request.
///
/// The ID is a hex-encoded BLAKE2b-256 hash over the HTTP/1.1 encoding of the request followed
/// by the request token. Any difference in method, URL, headers, body or token yields a
/// different ID.
pub fn compute_index_id(req: &SendRequest) -> String {
    let request = &req.request;
    let uri = request.uri();
    let request_uri = uri.path_and_query().map_or("/", |pq| pq.as_str());
    let host = request
        .headers()
        .get(HOST)
        .and_then(|value| value.to_str().ok())
        .or_else(|| uri.authority().map(|authority| authority.as_str()))
        .unwrap_or_default();

    let mut builder = IndexIdBuilder::new();
    builder.write_request(
        request.method(),
        request_uri,
        host,
        request.headers(),
        request.body(),
    );
    builder.write_token(&req.token);
    builder.build()
}

/// A builder for index IDs.
///
/// This builder implements the [`Write`](std::io::Write) trait, and accumulates the stable
/// encoding of a request. The accumulated bytes are hashed in [`build`](Self::build).
#[derive(Debug, Default)]
pub struct IndexIdBuilder {
    encoded: Vec<u8>,
}

impl IndexIdBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes the HTTP/1.1 wire encoding of a request.
    ///
    /// Headers other than `Host`, `User-Agent` and `Content-Length` are written in sorted
    /// order with canonical casing, so the encoding does not depend on the order the client
    /// sent them in.
    pub fn write_request(
        &mut self,
        method: &Method,
        request_uri: &str,
        host: &str,
        headers: &HeaderMap,
        body: &[u8],
    ) {
        let user_agent = headers
            .get(USER_AGENT)
            .and_then(|value| value.to_str().ok())
            .unwrap_or(DEFAULT_USER_AGENT);

        self.push(format_args!("{method} {request_uri} HTTP/1.1\r\n"));
        self.push(format_args!("Host: {host}\r\n"));
        self.push(format_args!("User-Agent: {user_agent}\r\n"));

        let sends_body = matches!(*method, Method::POST | Method::PUT | Method::PATCH);
        if !body.is_empty() || sends_body {
            self.push(format_args!("Content-Length: {}\r\n", body.len()));
        }

        let mut names: Vec<&HeaderName> = headers
            .keys()
            .filter(|name| !EXCLUDED_HEADERS.contains(*name))
            .collect();
        names.sort_by_key(|name| canonical_header_name(name));

        for name in names {
            let canonical = canonical_header_name(name);
            for value in headers.get_all(name) {
                self.push(format_args!("{canonical}: "));
                self.encoded.extend_from_slice(value.as_bytes());
                self.encoded.extend_from_slice(b"\r\n");
            }
        }

        self.encoded.extend_from_slice(b"\r\n");
        self.encoded.extend_from_slice(body);
    }

    /// Appends the token that is used to authenticate the request.
    pub fn write_token(&mut self, token: &str) {
        self.encoded.extend_from_slice(token.as_bytes());
    }

    fn push(&mut self, args: std::fmt::Arguments<'_>) {
        // writing into a `Vec` cannot fail
        let _ = self.write_fmt(args);
    }

    /// Finalize the index ID.
    pub fn build(self) -> String {
        hex::encode(Blake2b256::digest(&self.encoded))
    }
}

impl Write for IndexIdBuilder {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.encoded.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Converts a header name into its canonical form, e.g. `x-vault-namespace` into
/// `X-Vault-Namespace`.
fn canonical_header_name(name: &HeaderName) -> String {
    let mut canonical = String::with_capacity(name.as_str().len());
    let mut upper = true;
    for c in name.as_str().chars() {
        if upper {
            canonical.extend(c.to_uppercase());
        } else {
            canonical.push(c);
        }
        upper = c == '-';
    }
    canonical
}

/// Normalizes a namespace path to have no leading and exactly one trailing slash.
pub fn canonicalize_namespace(namespace: &str) -> String {
    let trimmed = namespace.trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("{trimmed}/")
    }
}

/// Returns the namespace a request is scoped to by its namespace header.
///
/// Requests without the header are scoped to [`ROOT_NAMESPACE`].
pub fn header_namespace(headers: &HeaderMap) -> String {
    let namespace = headers
        .get(NAMESPACE_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(canonicalize_namespace)
        .unwrap_or_default();

    if namespace.is_empty() {
        ROOT_NAMESPACE.to_owned()
    } else {
        namespace
    }
}

/// Derives the namespace and the namespace-relative path of a revocation request.
///
/// Namespaces can be given both in the namespace header and as leading path segments. For
/// revocation endpoints, path segments in front of the endpoint are appended to the header
/// namespace, and the returned path is the endpoint path without them. Any other request
/// keeps its path and the header namespace.
pub fn derive_namespace_and_revocation_path(req: &SendRequest) -> (String, String) {
    let mut namespace = header_namespace(req.request.headers());
    let full_path = req.request.uri().path();
    let unversioned = full_path.strip_prefix("/v1").unwrap_or(full_path);

    for revocation_path in REVOCATION_PATHS {
        let Some(position) = unversioned.find(revocation_path) else {
            continue;
        };
        if position == 0 {
            break;
        }

        let path_namespace = canonicalize_namespace(&unversioned[..position]);
        if namespace == ROOT_NAMESPACE {
            namespace = path_namespace;
        } else {
            namespace.push_str(&path_namespace);
        }

        return (namespace, format!("/v1{}", &unversioned[position..]));
    }

    (namespace, full_path.to_owned())
}
