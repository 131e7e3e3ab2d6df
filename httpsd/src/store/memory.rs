//! In-process object store
//!
//! Keeps objects in a map. An optional artificial latency is applied before
//! every call completes, which is how the cache's cancellation behaviour is
//! exercised without a real network.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use super::{ObjectStore, PutOptions, StoreError};

/// A stored object and the options it was written with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub body: Vec<u8>,
    pub options: PutOptions,
}

type ObjectKey = (String, String);

/// Map-backed [`ObjectStore`]
#[derive(Clone, Default)]
pub struct MemoryObjectStore {
    objects: Arc<RwLock<HashMap<ObjectKey, StoredObject>>>,
    latency: Option<Duration>,
    completed: Arc<AtomicUsize>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every call by `latency`
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency: Some(latency),
            ..Self::default()
        }
    }

    /// Inspect an object without going through the latency
    pub async fn object(&self, bucket: &str, key: &str) -> Option<StoredObject> {
        let objects = self.objects.read().await;
        objects.get(&(bucket.to_string(), key.to_string())).cloned()
    }

    /// All keys stored in `bucket`, sorted
    pub async fn keys(&self, bucket: &str) -> Vec<String> {
        let objects = self.objects.read().await;
        let mut keys: Vec<String> = objects
            .keys()
            .filter(|(b, _)| b == bucket)
            .map(|(_, k)| k.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Number of calls that ran to completion
    pub fn completed_calls(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    async fn delay(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn finish(&self) {
        self.completed.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn get_object(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StoreError> {
        self.delay().await;
        let result = self
            .object(bucket, key)
            .await
            .map(|object| object.body)
            .ok_or_else(|| StoreError::NoSuchKey {
                bucket: bucket.to_string(),
                key: key.to_string(),
            });
        self.finish();
        result
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Vec<u8>,
        options: PutOptions,
    ) -> Result<(), StoreError> {
        self.delay().await;
        self.objects.write().await.insert(
            (bucket.to_string(), key.to_string()),
            StoredObject { body, options },
        );
        self.finish();
        Ok(())
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<(), StoreError> {
        self.delay().await;
        self.objects
            .write()
            .await
            .remove(&(bucket.to_string(), key.to_string()));
        self.finish();
        Ok(())
    }
}
