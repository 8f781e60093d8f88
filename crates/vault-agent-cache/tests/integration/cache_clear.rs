use std::time::Duration;

use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use tower::ServiceExt;
use vault_agent_cache::LeaseCache;
use vault_agent_cache::cachememdb::IndexKey;
use vault_agent_cache::persist::IndexType;

use crate::{
    MockProxier, MockRenewClient, lease_body, lease_cache, memory_storage, request, setup,
    token_body,
};

const AUTO_AUTH_TOKEN: &str = "autoauthtoken";

async fn post_clear(cache: &LeaseCache, body: &str) -> (StatusCode, String) {
    let request = Request::post("/")
        .header("content-type", "application/json")
        .body(Body::from(body.to_owned()))
        .unwrap();

    let response = cache.handle_cache_clear().oneshot(request).await.unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, String::from_utf8(body.to_vec()).unwrap())
}

/// Creates a cache holding a token, a child token, and a lease for each of them.
async fn populated_cache(storage: bool) -> LeaseCache {
    let proxier = MockProxier::new(&[
        (200, token_body("parent", false, 0).as_str()),
        (200, token_body("child", false, 0).as_str()),
        (200, lease_body("kv/parent", false, 0).as_str()),
        (200, lease_body("kv/child", false, 0).as_str()),
    ]);
    let storage = storage.then(memory_storage);
    let cache = lease_cache(
        proxier,
        MockRenewClient::renewing(true, Duration::from_secs(60)),
        storage,
    );
    cache.register_auto_auth_token(AUTO_AUTH_TOKEN).await.unwrap();

    let create = "http://example.com/v1/auth/token/create";
    for token in [AUTO_AUTH_TOKEN, "parent"] {
        cache
            .send(request("POST", create, token, "{}"))
            .await
            .unwrap();
    }
    for token in ["parent", "child"] {
        cache
            .send(request("GET", "http://example.com/v1/kv/secret", token, ""))
            .await
            .unwrap();
    }
    assert_eq!(cache.len(), 5);
    cache
}

#[tokio::test]
async fn test_clear_validation() {
    setup();

    let cache = lease_cache(
        MockProxier::new(&[]),
        MockRenewClient::renewing(true, Duration::from_secs(60)),
        None,
    );

    let cases = [
        ("", StatusCode::BAD_REQUEST),
        (r#"{"type": "foo", "value": ""}"#, StatusCode::BAD_REQUEST),
        (r#"{"type": "", "value": "bar"}"#, StatusCode::BAD_REQUEST),
        (r#"{"type": "token"}"#, StatusCode::BAD_REQUEST),
        ("not json", StatusCode::BAD_REQUEST),
        (r#"{"type": "all"}"#, StatusCode::OK),
        (r#"{"type": "request_path", "value": "foo"}"#, StatusCode::OK),
        (r#"{"type": "token", "value": "foo"}"#, StatusCode::OK),
        (r#"{"type": "token_accessor", "value": "foo"}"#, StatusCode::OK),
        (r#"{"type": "lease", "value": "foo"}"#, StatusCode::OK),
    ];
    for (body, expected) in cases {
        let (status, _) = post_clear(&cache, body).await;
        assert_eq!(status, expected, "{body}");
    }
}

#[tokio::test]
async fn test_clear_error_response() {
    setup();

    let cache = lease_cache(
        MockProxier::new(&[]),
        MockRenewClient::renewing(true, Duration::from_secs(60)),
        None,
    );

    let (status, body) = post_clear(&cache, r#"{"type": "foo", "value": "bar"}"#).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let body: serde_json::Value = serde_json::from_str(&body).unwrap();
    insta::assert_json_snapshot!(body, @r###"
    {
      "errors": [
        "invalid clear type foo"
      ]
    }
    "###);

    let request = Request::get("/").body(Body::empty()).unwrap();
    let response = cache.handle_cache_clear().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
}

#[tokio::test]
async fn test_clear_token_cascades() {
    setup();
    let cache = populated_cache(false).await;

    let (status, _) = post_clear(&cache, r#"{"type": "token", "value": "parent"}"#).await;
    assert_eq!(status, StatusCode::OK);

    assert!(cache.get(IndexKey::Token("parent")).is_none());
    assert!(cache.get(IndexKey::Token("child")).is_none());
    assert!(cache.get(IndexKey::Lease("kv/parent")).is_none());
    assert!(cache.get(IndexKey::Lease("kv/child")).is_none());
    assert_eq!(cache.len(), 1);
}

#[tokio::test]
async fn test_clear_token_accessor() {
    setup();
    let cache = populated_cache(false).await;

    let (status, _) = post_clear(
        &cache,
        r#"{"type": "token_accessor", "value": "child-accessor"}"#,
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    assert!(cache.get(IndexKey::Token("child")).is_none());
    assert!(cache.get(IndexKey::Lease("kv/child")).is_none());
    assert!(cache.get(IndexKey::Token("parent")).is_some());
    assert!(cache.get(IndexKey::Lease("kv/parent")).is_some());
    assert_eq!(cache.len(), 3);
}

#[tokio::test]
async fn test_clear_lease() {
    setup();
    let cache = populated_cache(false).await;

    let (status, _) = post_clear(&cache, r#"{"type": "lease", "value": "kv/parent"}"#).await;
    assert_eq!(status, StatusCode::OK);

    assert!(cache.get(IndexKey::Lease("kv/parent")).is_none());
    assert_eq!(cache.len(), 4);
}

#[tokio::test]
async fn test_clear_request_path() {
    setup();
    let cache = populated_cache(false).await;

    // Entries in other namespaces are not affected.
    let (status, _) = post_clear(
        &cache,
        r#"{"type": "request_path", "value": "/v1/kv", "namespace": "ns1"}"#,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(cache.len(), 5);

    let (status, _) = post_clear(&cache, r#"{"type": "request_path", "value": "/v1/kv"}"#).await;
    assert_eq!(status, StatusCode::OK);
    assert!(cache.get(IndexKey::Lease("kv/parent")).is_none());
    assert!(cache.get(IndexKey::Lease("kv/child")).is_none());
    assert_eq!(cache.len(), 3);
}

#[tokio::test]
async fn test_clear_all() {
    setup();
    let cache = populated_cache(true).await;
    let entries = cache.entries();

    let (status, _) = post_clear(&cache, r#"{"type": "all"}"#).await;
    assert_eq!(status, StatusCode::OK);

    assert!(cache.is_empty());
    for index in entries {
        let ctx = index.renew_ctx.unwrap();
        assert!(ctx.cancel.is_cancelled());
        assert!(ctx.done.is_cancelled());
    }
}

#[tokio::test]
async fn test_clear_all_wipes_storage() {
    setup();

    let storage = memory_storage();
    let proxier = MockProxier::new(&[
        (200, token_body("token", false, 0).as_str()),
        (200, lease_body("kv/lease", false, 0).as_str()),
    ]);
    let cache = lease_cache(
        proxier,
        MockRenewClient::renewing(true, Duration::from_secs(60)),
        Some(storage.clone()),
    );
    cache.register_auto_auth_token(AUTO_AUTH_TOKEN).await.unwrap();
    cache
        .send(request(
            "POST",
            "http://example.com/v1/auth/token/create",
            AUTO_AUTH_TOKEN,
            "{}",
        ))
        .await
        .unwrap();

    assert_eq!(storage.get_by_kind(IndexType::Token).unwrap().len(), 2);

    let (status, _) = post_clear(&cache, r#"{"type": "all"}"#).await;
    assert_eq!(status, StatusCode::OK);
    assert!(cache.is_empty());
    for kind in IndexType::ALL {
        assert!(storage.get_by_kind(kind).unwrap().is_empty());
    }

    // The cache keeps working, and the auto-auth token is still known.
    cache
        .send(request(
            "GET",
            "http://example.com/v1/kv/secret",
            AUTO_AUTH_TOKEN,
            "",
        ))
        .await
        .unwrap();
    let lease = cache.get(IndexKey::Lease("kv/lease")).unwrap();
    assert!(!lease.renew_ctx.unwrap().cancel.is_cancelled());
    assert_eq!(storage.get_by_kind(IndexType::Lease).unwrap().len(), 1);
}

#[tokio::test]
async fn test_clear_auto_auth_token_after_clear_all() {
    setup();

    let storage = memory_storage();
    let proxier = MockProxier::new(&[
        (200, lease_body("kv/lease", false, 0).as_str()),
        (200, token_body("token", false, 0).as_str()),
    ]);
    let cache = lease_cache(
        proxier,
        MockRenewClient::renewing(true, Duration::from_secs(60)),
        Some(storage.clone()),
    );
    cache.register_auto_auth_token(AUTO_AUTH_TOKEN).await.unwrap();
    let (status, _) = post_clear(&cache, r#"{"type": "all"}"#).await;
    assert_eq!(status, StatusCode::OK);

    // Only the secrets are cached again, the auto-auth token has no entry of its own.
    cache
        .send(request(
            "GET",
            "http://example.com/v1/kv/secret",
            AUTO_AUTH_TOKEN,
            "",
        ))
        .await
        .unwrap();
    cache
        .send(request(
            "POST",
            "http://example.com/v1/auth/token/create",
            AUTO_AUTH_TOKEN,
            "{}",
        ))
        .await
        .unwrap();
    assert_eq!(cache.len(), 2);
    assert!(cache.get(IndexKey::Token(AUTO_AUTH_TOKEN)).is_none());

    let body = format!(r#"{{"type": "token", "value": "{AUTO_AUTH_TOKEN}"}}"#);
    let (status, _) = post_clear(&cache, &body).await;
    assert_eq!(status, StatusCode::OK);

    assert!(cache.is_empty());
    for kind in IndexType::ALL {
        assert!(storage.get_by_kind(kind).unwrap().is_empty());
    }
}
