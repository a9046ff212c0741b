use crate::codec::CodecError;
use crate::crypto::CryptoError;
use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

mod documents;
mod memory;
mod s3;

pub(crate) use self::documents::DocumentStore;
pub use self::memory::MemoryStore;
pub use self::s3::S3Store;

/// The byte-level object-store contract the library consumes: content-typed
/// PUT and GET by full key.
///
/// The production implementation is [`S3Store`]; tests (and embedded setups)
/// use [`MemoryStore`]. A custom backend can be injected on the
/// [`Hub`](crate::Hub).
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Writes the given bytes under the given key, overwriting any previous
    /// object.
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<(), StoreError>;

    /// Reads the bytes stored under the given key.
    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError>;
}

/// Represents a failure on the object-store path.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The backend rejected or failed the request.
    #[error("object store request failed for key '{key}': {detail}")]
    Backend {
        /// The object key of the failed request.
        key: String,
        /// The backend-reported failure detail.
        detail: String,
    },
    /// No object exists under the requested key.
    #[error("no object is stored under the key '{key}'")]
    Missing {
        /// The requested object key.
        key: String,
    },
    /// A stored document could not be encoded or decoded.
    #[error(transparent)]
    Codec(#[from] CodecError),
    /// A stored document could not be sealed or opened at rest.
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// Defines the object-store side of an endpoint: where offloaded documents
/// live, and whether they are encrypted at rest.
#[derive(Debug, Default, Clone, PartialEq, Deserialize)]
pub struct ObjectStoreConfig {
    bucket: String,
    #[serde(default)]
    prefix: String,
    #[serde(default)]
    region: Option<String>,
    #[serde(default)]
    endpoint: Option<String>,
    #[serde(default)]
    force_path_style: bool,
    #[serde(default)]
    encrypt_stored_objects: bool,
}

impl ObjectStoreConfig {
    /// Creates a new configuration for the given bucket.
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            ..Self::default()
        }
    }

    /// Re-creates this configuration with the given key prefix.
    pub fn with_prefix(self, prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            ..self
        }
    }

    /// Re-creates this configuration with the given region.
    pub fn with_region(self, region: impl Into<String>) -> Self {
        Self {
            region: Some(region.into()),
            ..self
        }
    }

    /// Re-creates this configuration with the given custom endpoint URL (for
    /// S3-compatible stores).
    pub fn with_endpoint(self, endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: Some(endpoint.into()),
            ..self
        }
    }

    /// Re-creates this configuration with path-style addressing forced on or
    /// off (for S3-compatible stores).
    pub fn with_force_path_style(self, force_path_style: bool) -> Self {
        Self {
            force_path_style,
            ..self
        }
    }

    /// Re-creates this configuration with at-rest encryption of stored
    /// documents switched on or off. Takes effect only when an encryption
    /// configuration is in effect for the call.
    pub fn with_encrypted_at_rest(self, encrypt_stored_objects: bool) -> Self {
        Self {
            encrypt_stored_objects,
            ..self
        }
    }
}

impl ObjectStoreConfig {
    /// Reports the bucket name.
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Reports the key prefix.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Reports the configured region, if any.
    pub fn region(&self) -> Option<&str> {
        self.region.as_deref()
    }

    /// Reports the custom endpoint URL, if any.
    pub fn endpoint(&self) -> Option<&str> {
        self.endpoint.as_deref()
    }

    /// Reports whether path-style addressing is forced.
    pub fn force_path_style(&self) -> bool {
        self.force_path_style
    }

    /// Reports whether stored documents are encrypted at rest.
    pub fn encrypt_stored_objects(&self) -> bool {
        self.encrypt_stored_objects
    }

    /// A cache key distinguishing backends built from different connection
    /// coordinates.
    pub(crate) fn backend_key(&self) -> String {
        format!(
            "{}|{}|{}|{}",
            self.bucket,
            self.region.as_deref().unwrap_or(""),
            self.endpoint.as_deref().unwrap_or(""),
            self.force_path_style,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn deserializes_with_defaults() {
        // Given
        let input = "bucket: payloads";

        // When
        let config: ObjectStoreConfig = serde_yml::from_str(input).unwrap();

        // Then
        assert_eq!("payloads", config.bucket());
        assert_eq!("", config.prefix());
        assert_eq!(None, config.region());
        assert!(!config.force_path_style());
        assert!(!config.encrypt_stored_objects());
    }

    #[test]
    fn deserializes_fully() {
        // Given
        let input = r#"
bucket: payloads
prefix: offload
region: eu-west-1
endpoint: http://localhost:9000
force_path_style: true
encrypt_stored_objects: true
"#;
        let expected = ObjectStoreConfig::new("payloads")
            .with_prefix("offload")
            .with_region("eu-west-1")
            .with_endpoint("http://localhost:9000")
            .with_force_path_style(true)
            .with_encrypted_at_rest(true);

        // When
        let actual: ObjectStoreConfig = serde_yml::from_str(input).unwrap();

        // Then
        assert_eq!(expected, actual);
    }
}
