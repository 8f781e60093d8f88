use std::time::Duration;

use vault_agent_cache::LeaseCache;
use vault_agent_cache::cachememdb::{Index, IndexKey, Lifetime};
use vault_agent_cache::persist::IndexType;
use vault_agent_cache::renewer::RenewTarget;

use crate::{
    MockProxier, MockRenewClient, lease_body, lease_cache, memory_storage, request, setup,
    token_body,
};

const AUTO_AUTH_TOKEN: &str = "autoauthtoken";

async fn cache_lease(cache: &LeaseCache, token: &str) {
    cache.register_auto_auth_token(AUTO_AUTH_TOKEN).await.unwrap();
    cache
        .send(request(
            "GET",
            "http://example.com/v1/kv/secret",
            token,
            "",
        ))
        .await
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_revoked_lease_is_evicted() {
    setup();

    let client = MockRenewClient::revoking();
    let proxier = MockProxier::new(&[(200, lease_body("kv/lease", true, 3).as_str())]);
    let cache = lease_cache(proxier, client.clone(), None);
    cache_lease(&cache, AUTO_AUTH_TOKEN).await;

    let lease = cache.get(IndexKey::Lease("kv/lease")).unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert!(cache.get(IndexKey::Lease("kv/lease")).is_none());
    assert_eq!(client.calls().len(), 1);
    let ctx = lease.renew_ctx.unwrap();
    assert!(ctx.cancel.is_cancelled());
    assert!(ctx.done.is_cancelled());
}

#[tokio::test(start_paused = true)]
async fn test_expired_lease_is_evicted() {
    setup();

    let client = MockRenewClient::renewing(true, Duration::from_secs(60));
    let proxier = MockProxier::new(&[(200, lease_body("kv/lease", false, 2).as_str())]);
    let cache = lease_cache(proxier, client.clone(), None);
    cache_lease(&cache, AUTO_AUTH_TOKEN).await;
    assert_eq!(cache.len(), 2);

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(cache.get(IndexKey::Lease("kv/lease")).is_some());

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(cache.get(IndexKey::Lease("kv/lease")).is_none());
    assert!(client.calls().is_empty());
    assert_eq!(cache.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_renewed_lease_stays_cached() {
    setup();

    let client = MockRenewClient::renewing(true, Duration::from_secs(60));
    let proxier = MockProxier::new(&[(200, lease_body("kv/lease", true, 30).as_str())]);
    let cache = lease_cache(proxier.clone(), client.clone(), None);
    cache_lease(&cache, AUTO_AUTH_TOKEN).await;

    tokio::time::sleep(Duration::from_secs(25)).await;
    assert_eq!(
        client.calls(),
        [RenewTarget {
            token: AUTO_AUTH_TOKEN.into(),
            lease: Some("kv/lease".into()),
            namespace: "root/".into(),
        }]
    );

    // Past the original TTL, the entry is still served from the cache.
    tokio::time::sleep(Duration::from_secs(40)).await;
    assert_eq!(client.calls().len(), 2);
    let response = cache
        .send(request(
            "GET",
            "http://example.com/v1/kv/secret",
            AUTO_AUTH_TOKEN,
            "",
        ))
        .await
        .unwrap();
    assert!(response.cache_meta.unwrap().hit);
    assert_eq!(proxier.requests(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_revoked_token_evicts_dependents() {
    setup();

    let client = MockRenewClient::revoking();
    let proxier = MockProxier::new(&[
        (200, token_body("token", true, 3).as_str()),
        (200, lease_body("kv/lease", false, 0).as_str()),
    ]);
    let cache = lease_cache(proxier, client.clone(), None);
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
    cache_lease(&cache, "token").await;
    assert_eq!(cache.len(), 3);

    tokio::time::sleep(Duration::from_secs(5)).await;

    assert!(cache.get(IndexKey::Token("token")).is_none());
    assert!(cache.get(IndexKey::Lease("kv/lease")).is_none());
    assert!(cache.get(IndexKey::Token(AUTO_AUTH_TOKEN)).is_some());
    assert_eq!(cache.len(), 1);

    let calls = client.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].token, "token");
    assert_eq!(calls[0].lease, None);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_stops_renewals() {
    setup();

    let client = MockRenewClient::renewing(true, Duration::from_secs(60));
    let proxier = MockProxier::new(&[(200, lease_body("kv/lease", true, 30).as_str())]);
    let cache = lease_cache(proxier, client.clone(), None);
    cache_lease(&cache, AUTO_AUTH_TOKEN).await;

    cache.shutdown().await;
    tokio::time::sleep(Duration::from_secs(60)).await;

    assert!(client.calls().is_empty());
    let lease = cache.get(IndexKey::Lease("kv/lease")).unwrap();
    let ctx = lease.renew_ctx.unwrap();
    assert!(ctx.cancel.is_cancelled());
    assert!(ctx.done.is_cancelled());
}

#[tokio::test(start_paused = true)]
async fn test_renewal_is_persisted() {
    setup();

    let storage = memory_storage();
    let client = MockRenewClient::renewing(true, Duration::from_secs(3600));
    let proxier = MockProxier::new(&[(200, lease_body("kv/lease", true, 60).as_str())]);
    let cache = lease_cache(proxier, client.clone(), Some(storage.clone()));
    cache_lease(&cache, AUTO_AUTH_TOKEN).await;
    assert_eq!(cache.get(IndexKey::Lease("kv/lease")).unwrap().renewed, None);

    tokio::time::sleep(Duration::from_secs(45)).await;
    assert_eq!(client.calls().len(), 1);

    let lifetime = Some(Lifetime {
        renewable: true,
        ttl: Duration::from_secs(3600),
    });
    let lease = cache.get(IndexKey::Lease("kv/lease")).unwrap();
    assert_eq!(lease.renewed, lifetime);

    let stored = storage
        .get_by_kind(IndexType::Lease)
        .unwrap()
        .into_iter()
        .map(|blob| Index::deserialize(&blob).unwrap())
        .find(|index| index.id == lease.id)
        .unwrap();
    assert_eq!(stored.renewed, lifetime);
}
