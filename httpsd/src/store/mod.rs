//! Object store boundary
//!
//! The certificate cache only needs three remote calls: get, put and delete
//! of a single object addressed by bucket and key.

use async_trait::async_trait;
use thiserror::Error;

pub mod memory;
pub mod s3;

pub use memory::MemoryObjectStore;
pub use s3::S3ObjectStore;

/// Canned access control applied on upload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acl {
    Private,
}

/// Server-side encryption requested on upload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerSideEncryption {
    Aes256,
}

/// Options sent with every put
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PutOptions {
    pub acl: Acl,
    pub encryption: ServerSideEncryption,
}

impl Default for PutOptions {
    fn default() -> Self {
        Self {
            acl: Acl::Private,
            encryption: ServerSideEncryption::Aes256,
        }
    }
}

/// Errors reported by an object store
#[derive(Error, Debug)]
pub enum StoreError {
    /// The object does not exist
    #[error("no such key: {bucket}/{key}")]
    NoSuchKey { bucket: String, key: String },

    /// The request failed (permissions, network, service error)
    #[error("object store request failed: {0}")]
    Request(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// The object body could not be read
    #[error("failed to read object body: {0}")]
    Body(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl StoreError {
    pub fn request<E>(err: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        StoreError::Request(err.into())
    }

    pub fn is_no_such_key(&self) -> bool {
        matches!(self, StoreError::NoSuchKey { .. })
    }
}

/// Remote blob storage addressed by bucket and key
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch the full body of `bucket/key`
    async fn get_object(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StoreError>;

    /// Write `body` to `bucket/key`, replacing any existing object
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Vec<u8>,
        options: PutOptions,
    ) -> Result<(), StoreError>;

    /// Remove `bucket/key`
    async fn delete_object(&self, bucket: &str, key: &str) -> Result<(), StoreError>;
}
