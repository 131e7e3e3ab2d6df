//! Certificate cache on top of an object store
//!
//! Every name is stored at `prefix + name` in a single bucket. Objects are
//! written private and encrypted at rest. The cache never lists keys and
//! keeps nothing in memory between calls.
//!
//! Each call is launched on its own task. If the caller's [`Context`] is
//! cancelled first, the call returns immediately while the store request
//! carries on in the background: object stores cannot cancel a request
//! server side, so a cancelled `store` or `delete` may still take effect.
//! The number of such detached requests is bounded by a semaphore.

use async_trait::async_trait;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;

use super::{detach_bounded, CacheError, CertCache, Context, DEFAULT_MAX_IN_FLIGHT};
use crate::store::{ObjectStore, PutOptions};

/// Key prefix used when none is configured
pub const DEFAULT_PREFIX: &str = "acc-cache/";

/// [`CertCache`] persisted in an object store bucket
pub struct ObjectCache<S> {
    store: Arc<S>,
    bucket: String,
    prefix: String,
    in_flight: Arc<Semaphore>,
}

impl<S> ObjectCache<S>
where
    S: ObjectStore + 'static,
{
    /// Create a cache storing into `bucket`.
    ///
    /// An empty bucket is a configuration error. `prefix` falls back to
    /// [`DEFAULT_PREFIX`] when `None` or empty.
    pub fn new(store: S, bucket: &str, prefix: Option<&str>) -> Result<Self, CacheError> {
        Self::from_shared(Arc::new(store), bucket, prefix)
    }

    /// Same as [`ObjectCache::new`] for a store that is shared elsewhere
    pub fn from_shared(
        store: Arc<S>,
        bucket: &str,
        prefix: Option<&str>,
    ) -> Result<Self, CacheError> {
        if bucket.is_empty() {
            return Err(CacheError::Config("bucket must be set".to_string()));
        }

        let prefix = match prefix {
            Some(prefix) if !prefix.is_empty() => prefix,
            _ => DEFAULT_PREFIX,
        };

        Ok(Self {
            store,
            bucket: bucket.to_string(),
            prefix: prefix.to_string(),
            in_flight: Arc::new(Semaphore::new(DEFAULT_MAX_IN_FLIGHT)),
        })
    }

    /// Limit the number of store requests that may run at once
    pub fn with_max_in_flight(mut self, max: usize) -> Self {
        self.in_flight = Arc::new(Semaphore::new(max.max(1)));
        self
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Object key for a cache name
    pub fn key(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }

    async fn detach<T, F>(&self, ctx: &Context, call: F) -> Result<T, CacheError>
    where
        F: Future<Output = Result<T, CacheError>> + Send + 'static,
        T: Send + 'static,
    {
        detach_bounded(ctx, &self.in_flight, call).await
    }
}

impl<S> fmt::Debug for ObjectCache<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectCache")
            .field("bucket", &self.bucket)
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl<S> CertCache for ObjectCache<S>
where
    S: ObjectStore + 'static,
{
    async fn fetch(&self, ctx: &Context, name: &str) -> Result<Vec<u8>, CacheError> {
        let store = Arc::clone(&self.store);
        let bucket = self.bucket.clone();
        let key = self.key(name);

        self.detach(ctx, async move {
            match store.get_object(&bucket, &key).await {
                Ok(data) => Ok(data),
                Err(err) if err.is_no_such_key() => Err(CacheError::Miss),
                Err(err) => Err(err.into()),
            }
        })
        .await
    }

    async fn store(&self, ctx: &Context, name: &str, data: &[u8]) -> Result<(), CacheError> {
        let store = Arc::clone(&self.store);
        let bucket = self.bucket.clone();
        let key = self.key(name);
        let body = data.to_vec();

        self.detach(ctx, async move {
            store
                .put_object(&bucket, &key, body, PutOptions::default())
                .await
                .map_err(CacheError::from)
        })
        .await
    }

    async fn delete(&self, ctx: &Context, name: &str) -> Result<(), CacheError> {
        let store = Arc::clone(&self.store);
        let bucket = self.bucket.clone();
        let key = self.key(name);

        self.detach(ctx, async move {
            match store.delete_object(&bucket, &key).await {
                Err(err) if err.is_no_such_key() => Ok(()),
                other => other.map_err(CacheError::from),
            }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryObjectStore, MockObjectStore, StoreError};
    use std::io;
    use std::time::Duration;
    use tokio::time::Instant;

    fn denied() -> StoreError {
        StoreError::request(io::Error::new(io::ErrorKind::PermissionDenied, "access denied"))
    }

    #[test]
    fn test_empty_bucket_is_rejected() {
        let result = ObjectCache::new(MemoryObjectStore::new(), "", None);
        assert!(matches!(result, Err(CacheError::Config(_))));
    }

    #[test]
    fn test_prefix_defaults() {
        let cache = ObjectCache::new(MemoryObjectStore::new(), "certs", None).unwrap();
        assert_eq!(cache.prefix(), DEFAULT_PREFIX);
        assert_eq!(cache.key("example.com"), "acc-cache/example.com");

        let cache = ObjectCache::new(MemoryObjectStore::new(), "certs", Some("")).unwrap();
        assert_eq!(cache.prefix(), DEFAULT_PREFIX);

        let cache = ObjectCache::new(MemoryObjectStore::new(), "certs", Some("tls/")).unwrap();
        assert_eq!(cache.key("example.com"), "tls/example.com");
        assert_eq!(cache.bucket(), "certs");
    }

    #[tokio::test]
    async fn test_fetch_uses_prefixed_key() {
        let mut store = MockObjectStore::new();
        store
            .expect_get_object()
            .withf(|bucket, key| bucket == "certs" && key == "acc-cache/example.com")
            .times(1)
            .returning(|_, _| Ok(b"bundle".to_vec()));

        let cache = ObjectCache::new(store, "certs", None).unwrap();
        let data = cache.fetch(&Context::new(), "example.com").await.unwrap();
        assert_eq!(data, b"bundle");
    }

    #[tokio::test]
    async fn test_store_requests_private_encrypted_object() {
        let mut store = MockObjectStore::new();
        store
            .expect_put_object()
            .withf(|bucket, key, body, options| {
                bucket == "certs"
                    && key == "acc-cache/example.com"
                    && body == &b"bundle".to_vec()
                    && *options == PutOptions::default()
            })
            .times(1)
            .returning(|_, _, _, _| Ok(()));

        let cache = ObjectCache::new(store, "certs", None).unwrap();
        cache
            .store(&Context::new(), "example.com", b"bundle")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_not_found_becomes_miss() {
        let mut store = MockObjectStore::new();
        store.expect_get_object().returning(|bucket, key| {
            Err(StoreError::NoSuchKey {
                bucket: bucket.to_string(),
                key: key.to_string(),
            })
        });

        let cache = ObjectCache::new(store, "certs", None).unwrap();
        let err = cache.fetch(&Context::new(), "missing").await.unwrap_err();
        assert!(err.is_miss());
    }

    #[tokio::test]
    async fn test_other_store_errors_propagate() {
        let mut store = MockObjectStore::new();
        store.expect_get_object().returning(|_, _| Err(denied()));
        store.expect_put_object().returning(|_, _, _, _| Err(denied()));
        store.expect_delete_object().returning(|_, _| Err(denied()));

        let cache = ObjectCache::new(store, "certs", None).unwrap();
        let ctx = Context::new();

        let err = cache.fetch(&ctx, "a").await.unwrap_err();
        assert!(matches!(err, CacheError::Store(StoreError::Request(_))));
        assert!(!err.is_miss());

        let err = cache.store(&ctx, "a", b"x").await.unwrap_err();
        assert!(matches!(err, CacheError::Store(StoreError::Request(_))));

        let err = cache.delete(&ctx, "a").await.unwrap_err();
        assert!(matches!(err, CacheError::Store(StoreError::Request(_))));
    }

    #[tokio::test]
    async fn test_delete_of_missing_key_succeeds() {
        let mut store = MockObjectStore::new();
        store.expect_delete_object().returning(|bucket, key| {
            Err(StoreError::NoSuchKey {
                bucket: bucket.to_string(),
                key: key.to_string(),
            })
        });

        let cache = ObjectCache::new(store, "certs", None).unwrap();
        assert!(cache.delete(&Context::new(), "missing").await.is_ok());
    }

    #[tokio::test]
    async fn test_already_cancelled_context_does_not_call_store() {
        // no expectations: any call on the mock would panic
        let store = MockObjectStore::new();
        let cache = ObjectCache::new(store, "certs", None).unwrap();

        let ctx = Context::new();
        ctx.cancel();

        assert!(matches!(
            cache.fetch(&ctx, "a").await,
            Err(CacheError::Cancelled)
        ));
        assert!(matches!(
            cache.store(&ctx, "a", b"x").await,
            Err(CacheError::Cancelled)
        ));
        assert!(matches!(
            cache.delete(&ctx, "a").await,
            Err(CacheError::Cancelled)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_store_completes_in_background() {
        let store = Arc::new(MemoryObjectStore::with_latency(Duration::from_secs(5)));
        let cache = ObjectCache::from_shared(store.clone(), "certs", None).unwrap();

        let ctx = Context::with_timeout(Duration::from_millis(50));
        let start = Instant::now();
        let err = cache.store(&ctx, "example.com", b"late").await.unwrap_err();
        assert!(matches!(err, CacheError::DeadlineExceeded));
        assert!(start.elapsed() < Duration::from_secs(1));
        assert!(store.object("certs", "acc-cache/example.com").await.is_none());

        tokio::time::sleep(Duration::from_secs(6)).await;
        let object = store.object("certs", "acc-cache/example.com").await.unwrap();
        assert_eq!(object.body, b"late");
    }

    #[test]
    fn test_debug_shows_location() {
        let cache = ObjectCache::new(MemoryObjectStore::new(), "certs", None).unwrap();
        assert_eq!(
            format!("{:?}", cache),
            r#"ObjectCache { bucket: "certs", prefix: "acc-cache/", .. }"#
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_cancelled_mid_call_returns_promptly() {
        let store = Arc::new(MemoryObjectStore::with_latency(Duration::from_secs(60)));
        let cache = ObjectCache::from_shared(store.clone(), "certs", None).unwrap();

        let ctx = Context::with_timeout(Duration::from_millis(100));
        let start = Instant::now();
        let err = cache.delete(&ctx, "example.com").await.unwrap_err();
        assert!(matches!(err, CacheError::DeadlineExceeded));
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(store.completed_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_flight_limit_is_raced_with_context() {
        let store = MemoryObjectStore::with_latency(Duration::from_secs(10));
        let cache = ObjectCache::new(store, "certs", None)
            .unwrap()
            .with_max_in_flight(1);

        // occupies the only slot for 10s
        let first = Context::with_timeout(Duration::from_millis(10));
        assert!(cache.fetch(&first, "a").await.unwrap_err().is_cancelled());

        // waits for a slot and gives up at its own deadline
        let second = Context::with_timeout(Duration::from_secs(1));
        let start = Instant::now();
        assert!(matches!(
            cache.fetch(&second, "b").await,
            Err(CacheError::DeadlineExceeded)
        ));
        assert!(start.elapsed() < Duration::from_secs(2));

        // slot frees once the detached call finishes
        tokio::time::sleep(Duration::from_secs(10)).await;
        let third = Context::with_timeout(Duration::from_secs(30));
        assert!(cache.fetch(&third, "b").await.unwrap_err().is_miss());
    }
}
