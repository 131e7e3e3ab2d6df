// Certificate cache behaviour over the in-memory object store

use httpsd::cache::{CacheError, CertCache, Context, ObjectCache, DEFAULT_PREFIX};
use httpsd::store::{Acl, MemoryObjectStore, ServerSideEncryption};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_fetch_store_delete_contract() {
    let store = Arc::new(MemoryObjectStore::new());
    let cache = ObjectCache::from_shared(store.clone(), "certbucket", None).unwrap();
    let ctx = Context::new();

    assert!(cache.fetch(&ctx, "example.com").await.unwrap_err().is_miss());

    cache.store(&ctx, "example.com", b"bundle").await.unwrap();
    assert_eq!(cache.fetch(&ctx, "example.com").await.unwrap(), b"bundle");
    assert_eq!(
        store.keys("certbucket").await,
        vec!["acc-cache/example.com".to_string()]
    );

    let object = store.object("certbucket", "acc-cache/example.com").await.unwrap();
    assert_eq!(object.options.acl, Acl::Private);
    assert_eq!(object.options.encryption, ServerSideEncryption::Aes256);

    cache.delete(&ctx, "example.com").await.unwrap();
    cache.delete(&ctx, "example.com").await.unwrap();
    assert!(cache.fetch(&ctx, "example.com").await.unwrap_err().is_miss());
}

#[tokio::test]
async fn test_custom_prefix_is_used_verbatim() {
    let store = Arc::new(MemoryObjectStore::new());
    let cache = ObjectCache::from_shared(store.clone(), "certbucket", Some("edge/")).unwrap();

    cache.store(&Context::new(), "acme_account+key", b"k").await.unwrap();
    assert_eq!(
        store.keys("certbucket").await,
        vec!["edge/acme_account+key".to_string()]
    );
}

#[test]
fn test_empty_prefix_means_default_and_empty_bucket_is_fatal() {
    let cache = ObjectCache::new(MemoryObjectStore::new(), "b", Some("")).unwrap();
    assert_eq!(cache.prefix(), DEFAULT_PREFIX);

    let result = ObjectCache::new(MemoryObjectStore::new(), "", None);
    assert!(matches!(result, Err(CacheError::Config(_))));
}

#[tokio::test(start_paused = true)]
async fn test_caller_stops_waiting_but_store_finishes() {
    let store = Arc::new(MemoryObjectStore::with_latency(Duration::from_secs(5)));
    let cache = ObjectCache::from_shared(store.clone(), "certbucket", None).unwrap();

    let ctx = Context::with_timeout(Duration::from_secs(1));
    let err = cache.store(&ctx, "example.com", b"bundle").await.unwrap_err();
    assert!(matches!(err, CacheError::DeadlineExceeded));
    assert_eq!(store.completed_calls(), 0);

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(store.completed_calls(), 1);
    assert!(store.object("certbucket", "acc-cache/example.com").await.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_cancel_while_fetching() {
    let store = Arc::new(MemoryObjectStore::with_latency(Duration::from_secs(5)));
    let cache = Arc::new(ObjectCache::from_shared(store, "certbucket", None).unwrap());
    let ctx = Context::new();

    let fetch = tokio::spawn({
        let cache = cache.clone();
        let ctx = ctx.clone();
        async move { cache.fetch(&ctx, "example.com").await }
    });

    tokio::time::sleep(Duration::from_secs(1)).await;
    ctx.cancel();

    let err = fetch.await.unwrap().unwrap_err();
    assert!(matches!(err, CacheError::Cancelled));
}

#[tokio::test(start_paused = true)]
async fn test_delete_gives_up_at_deadline_and_finishes_later() {
    let store = Arc::new(MemoryObjectStore::with_latency(Duration::from_secs(60)));
    let cache = ObjectCache::from_shared(store.clone(), "certbucket", None).unwrap();
    let ctx = Context::new();

    // seeding pays the latency too
    cache.store(&ctx, "example.com", b"bundle").await.unwrap();

    let ctx = Context::with_timeout(Duration::from_millis(100));
    let start = tokio::time::Instant::now();
    let err = cache.delete(&ctx, "example.com").await.unwrap_err();
    assert!(matches!(err, CacheError::DeadlineExceeded));
    assert!(start.elapsed() < Duration::from_secs(1));
    assert!(store.object("certbucket", "acc-cache/example.com").await.is_some());

    tokio::time::sleep(Duration::from_secs(61)).await;
    assert!(store.object("certbucket", "acc-cache/example.com").await.is_none());
}
