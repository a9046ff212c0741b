use crate::codec::{STORED_ROOT, StoredMessage, WireFormat};
use crate::crypto::Cipher;
use crate::store::{ObjectStore, StoreError};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;

/// The typed layer over a byte-level [`ObjectStore`]: serializes stored
/// documents in the endpoint wire format and, when at-rest encryption is in
/// effect, transparently seals the whole serialized document on PUT and opens
/// it on GET.
pub(crate) struct DocumentStore {
    backend: Arc<dyn ObjectStore>,
    format: WireFormat,
    at_rest: Option<Cipher>,
}

impl DocumentStore {
    /// Creates a new document store over the given backend. Pass an at-rest
    /// cipher only when the endpoint both enables `encrypt_stored_objects`
    /// and carries an encryption configuration.
    pub(crate) fn new(
        backend: Arc<dyn ObjectStore>,
        format: WireFormat,
        at_rest: Option<Cipher>,
    ) -> Self {
        Self {
            backend,
            format,
            at_rest,
        }
    }

    /// Serializes and writes the given document under the given key,
    /// overwriting any previous version.
    pub(crate) async fn put_document<T>(
        &self,
        key: &str,
        document: &StoredMessage<T>,
    ) -> Result<(), StoreError>
    where
        T: Serialize + Send + Sync,
    {
        let mut bytes = self.format.encode(STORED_ROOT, document)?;
        let mut content_type = self.format.content_type();

        if let Some(cipher) = &self.at_rest {
            bytes = cipher.seal(&bytes)?.into_bytes();
            content_type = "text/plain";
        }

        self.backend.put(key, bytes, content_type).await
    }

    /// Reads and deserializes the document stored under the given key.
    pub(crate) async fn get_document<T>(&self, key: &str) -> Result<StoredMessage<T>, StoreError>
    where
        T: DeserializeOwned,
    {
        let mut bytes = self.backend.get(key).await?;

        if let Some(cipher) = &self.at_rest {
            // Tolerate plain documents under an encrypting configuration, so
            // flipping the flag does not strand previously stored objects.
            if let Ok(text) = std::str::from_utf8(&bytes) {
                if Cipher::is_sealed(text) {
                    bytes = cipher.open(text)?;
                }
            }
        }

        Ok(self.format.decode(&bytes)?)
    }
}
