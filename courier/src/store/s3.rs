use crate::store::{ObjectStore, ObjectStoreConfig, StoreError};
use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::Client;
use aws_sdk_s3::primitives::ByteStream;

/// The production [`ObjectStore`]: Amazon S3, or any S3-compatible store via
/// a custom endpoint and path-style addressing.
///
/// Credentials and any unset coordinates resolve through the standard AWS
/// environment (environment variables, profiles, instance metadata).
pub struct S3Store {
    client: Client,
    bucket: String,
}

impl S3Store {
    /// Builds a store from the given configuration, loading the shared AWS
    /// configuration from the environment.
    pub async fn connect(config: &ObjectStoreConfig) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());

        if let Some(region) = config.region() {
            loader = loader.region(Region::new(region.to_string()));
        }
        if let Some(endpoint) = config.endpoint() {
            loader = loader.endpoint_url(endpoint);
        }

        let shared_config = loader.load().await;

        let mut builder = aws_sdk_s3::config::Builder::from(&shared_config);
        if config.force_path_style() {
            builder = builder.force_path_style(true);
        }

        Self {
            client: Client::from_conf(builder.build()),
            bucket: config.bucket().to_string(),
        }
    }

    /// Reports the bucket this store writes into.
    pub fn bucket(&self) -> &str {
        &self.bucket
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<(), StoreError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .body(ByteStream::from(bytes))
            .send()
            .await
            .map_err(|error| StoreError::Backend {
                key: key.to_string(),
                detail: error.to_string(),
            })?;

        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|error| StoreError::Backend {
                key: key.to_string(),
                detail: error.to_string(),
            })?;

        let aggregated = output
            .body
            .collect()
            .await
            .map_err(|error| StoreError::Backend {
                key: key.to_string(),
                detail: error.to_string(),
            })?;

        Ok(aggregated.into_bytes().to_vec())
    }
}
