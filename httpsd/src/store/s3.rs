//! Amazon S3 object store

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{ObjectCannedAcl, ServerSideEncryption as S3Encryption};
use aws_sdk_s3::Client;
use tracing::debug;

use super::{Acl, ObjectStore, PutOptions, ServerSideEncryption, StoreError};

/// [`ObjectStore`] backed by an S3 client
#[derive(Clone, Debug)]
pub struct S3ObjectStore {
    client: Client,
}

impl S3ObjectStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Build a client for `region` from the default credential chain
    pub async fn from_env(region: &str) -> Self {
        debug!("Loading AWS configuration for region {}", region);
        let config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(region.to_string()))
            .load()
            .await;
        Self::new(Client::new(&config))
    }
}

fn canned_acl(acl: Acl) -> ObjectCannedAcl {
    match acl {
        Acl::Private => ObjectCannedAcl::Private,
    }
}

fn encryption(sse: ServerSideEncryption) -> S3Encryption {
    match sse {
        ServerSideEncryption::Aes256 => S3Encryption::Aes256,
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn get_object(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StoreError> {
        let output = match self.client.get_object().bucket(bucket).key(key).send().await {
            Ok(output) => output,
            Err(SdkError::ServiceError(err)) if err.err().is_no_such_key() => {
                return Err(StoreError::NoSuchKey {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                });
            }
            Err(err) => return Err(StoreError::request(err)),
        };

        let body = output
            .body
            .collect()
            .await
            .map_err(|e| StoreError::Body(Box::new(e)))?;
        Ok(body.into_bytes().to_vec())
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Vec<u8>,
        options: PutOptions,
    ) -> Result<(), StoreError> {
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .acl(canned_acl(options.acl))
            .server_side_encryption(encryption(options.encryption))
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(StoreError::request)?;
        Ok(())
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<(), StoreError> {
        self.client
            .delete_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(StoreError::request)?;
        Ok(())
    }
}
