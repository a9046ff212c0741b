use crate::codec::key::derive_object_key;
use crate::codec::{CodecError, Message, StoredMessage, WIRE_ROOT};
use crate::crypto::{Cipher, CryptoError};
use crate::endpoint::{Endpoint, EndpointError};
use crate::hub::{Link, TransportError};
use crate::store::{DocumentStore, StoreError};
use chrono::Utc;
use lapin::BasicProperties;
use lapin::options::BasicPublishOptions;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;
use tracing::{error, info};

/// The AMQP delivery mode for persistent messages.
const DELIVERY_MODE_PERSISTENT: u8 = 2;

/// Represents a failed publish call. Publisher-path failures always surface
/// to the caller; nothing is retried behind its back.
#[derive(Error, Debug)]
pub enum PublishError {
    /// The call was misconfigured (unknown endpoint, invalid pre-encrypted
    /// value, and so on).
    #[error(transparent)]
    Endpoint(#[from] EndpointError),
    /// The outgoing message could not be serialized.
    #[error(transparent)]
    Codec(#[from] CodecError),
    /// The outgoing message could not be sealed. Nothing was emitted.
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    /// The stored document could not be persisted. No broker message was
    /// emitted.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// The broker did not accept the message. When the payload had already
    /// been offloaded, the orphaned object is left in place and its key is
    /// reported here.
    #[error("the message failed to reach the broker: {source}")]
    Transport {
        /// The underlying transport failure.
        #[source]
        source: TransportError,
        /// The key of the already stored document, if offloading happened
        /// before the failure.
        stored_key: Option<String>,
    },
}

impl PublishError {
    /// Reports the key of the stored document orphaned by this failure, if
    /// any.
    pub fn stored_key(&self) -> Option<&str> {
        match self {
            PublishError::Transport { stored_key, .. } => stored_key.as_deref(),
            _ => None,
        }
    }
}

/// The offload seat of a publisher or subscriber: the configured key prefix
/// and the typed document store to write through.
pub(crate) struct Offload {
    pub(crate) prefix: String,
    pub(crate) documents: DocumentStore,
}

/// Publishes messages for one endpoint: serializes the payload, offloads it
/// when an object store is in effect, seals the broker-bound message when
/// encryption is in effect, and hands the bytes to the broker.
///
/// The order is normative and observable: the stored document exists before
/// the broker message that references it is ever emitted, and an
/// object-store failure prevents the broker publish entirely.
pub(crate) struct Publisher {
    name: Arc<str>,
    link: Arc<Link>,
    endpoint: Arc<Endpoint>,
    cipher: Option<Cipher>,
    offload: Option<Offload>,
}

impl Publisher {
    /// Creates a new publisher over the given connection cache and effective
    /// configuration.
    pub(crate) fn new(
        link: Arc<Link>,
        endpoint: Arc<Endpoint>,
        cipher: Option<Cipher>,
        offload: Option<Offload>,
    ) -> Self {
        let name = Self::compose_name(&endpoint);

        Self {
            name,
            link,
            endpoint,
            cipher,
            offload,
        }
    }

    /// Composes a globally unique, human-readable name for this publisher.
    fn compose_name(endpoint: &Endpoint) -> Arc<str> {
        static COUNTER: AtomicUsize = AtomicUsize::new(0);

        Arc::from(format!(
            "courier:pub:{}:{}",
            endpoint.name(),
            COUNTER.fetch_add(1, Ordering::Relaxed),
        ))
    }
}

impl Publisher {
    /// Publishes the given payload and returns the caller-visible message.
    pub(crate) async fn publish<T>(&self, payload: T) -> Result<Message<T>, PublishError>
    where
        T: Serialize + Clone + Send + Sync,
    {
        // Construct the message with a fresh identity
        let mut receipt = Message::new(payload);

        // Offload, seal and serialize
        let bytes = self.assemble(&mut receipt).await?;

        // Transmit
        self.transmit(&bytes, &mut receipt).await?;

        Ok(receipt)
    }

    /// Publishes a value sealed ahead of time; the wire shape is that of an
    /// encrypted envelope, with the hash as-is for the payload.
    pub(crate) async fn publish_presealed(
        &self,
        sealed: String,
    ) -> Result<Message<String>, PublishError> {
        let mut receipt = Message::new(sealed);
        let bytes = self
            .endpoint
            .format()
            .encode(WIRE_ROOT, &receipt)?;

        self.transmit(&bytes, &mut receipt).await?;

        Ok(receipt)
    }

    /// Runs the pre-transmission steps: offloads the payload when an object
    /// store is in effect, seals the broker-bound message when encryption is
    /// in effect, and serializes the result in the endpoint format.
    ///
    /// On return, the receipt carries the stored key when offloading took
    /// place.
    pub(crate) async fn assemble<T>(
        &self,
        receipt: &mut Message<T>,
    ) -> Result<Vec<u8>, PublishError>
    where
        T: Serialize + Clone + Send + Sync,
    {
        let format = self.endpoint.format();

        if let Some(offload) = &self.offload {
            // Derive the object key from the message identity
            let key = derive_object_key(
                &offload.prefix,
                self.endpoint.name(),
                receipt.created(),
                receipt.id(),
                format,
            );

            // Persist the stored document, preserving the payload as the
            // envelope; with encryption in effect the envelope is sealed
            // independently of the transport payload
            match &self.cipher {
                Some(cipher) => {
                    let sealed_envelope = cipher.seal_value(format, receipt.payload())?;
                    let document = StoredMessage::enclose(receipt, key.clone(), sealed_envelope);
                    offload.documents.put_document(&key, &document).await?;
                }
                None => {
                    let document =
                        StoredMessage::enclose(receipt, key.clone(), receipt.payload().clone());
                    offload.documents.put_document(&key, &document).await?;
                }
            }

            receipt.set_stored_key(key.clone());

            // Reduce the broker-bound message to a reference envelope, with
            // the key sealed when encryption is in effect
            let wire_payload = match &self.cipher {
                Some(cipher) => cipher.seal(key.as_bytes())?,
                None => key,
            };
            let wire = receipt.reshape(wire_payload);

            Ok(format.encode(WIRE_ROOT, &wire)?)
        } else if let Some(cipher) = &self.cipher {
            // Inline encrypted: the payload travels as a portable hash
            let sealed = cipher.seal_value(format, receipt.payload())?;
            let wire = receipt.reshape(sealed);

            Ok(format.encode(WIRE_ROOT, &wire)?)
        } else {
            // Inline plain
            Ok(format.encode(WIRE_ROOT, receipt)?)
        }
    }

    /// Hands the assembled bytes to the broker and stamps the receipt.
    async fn transmit<T>(
        &self,
        bytes: &[u8],
        receipt: &mut Message<T>,
    ) -> Result<(), PublishError> {
        let channel = self
            .link
            .channel()
            .await
            .map_err(|source| self.transport_failure(source, receipt.stored_key()))?;

        let properties = BasicProperties::default()
            .with_content_type(self.endpoint.format().content_type().into())
            .with_delivery_mode(DELIVERY_MODE_PERSISTENT)
            .with_message_id(receipt.id().to_string().into());

        // Default exchange, queue name as the routing key
        let result = channel
            .basic_publish(
                "",
                self.endpoint.queue(),
                BasicPublishOptions {
                    mandatory: true,
                    immediate: false, // not supported by RabbitMQ v3+
                },
                bytes,
                properties,
            )
            .await;

        match result {
            Ok(_confirmation) => {
                receipt.mark_published(Utc::now());

                if !self.endpoint.quiet() {
                    info!(
                        publisher = self.name.as_ref(),
                        message_id = %receipt.id(),
                        "Published a message",
                    );
                }

                Ok(())
            }
            Err(error) => {
                error!(
                    alert = true,
                    publisher = self.name.as_ref(),
                    message_id = %receipt.id(),
                    ?error,
                    error_message = %error,
                    "Failed to publish a message",
                );

                // The channel is suspect; the next call opens a fresh one
                self.link.invalidate_channel().await;

                Err(self.transport_failure(
                    TransportError::new(self.endpoint.name(), error),
                    receipt.stored_key(),
                ))
            }
        }
    }

    fn transport_failure(
        &self,
        source: TransportError,
        stored_key: Option<&str>,
    ) -> PublishError {
        PublishError::Transport {
            source,
            stored_key: stored_key.map(str::to_string),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::WireFormat;
    use crate::crypto::EncryptionConfig;
    use crate::endpoint::Endpoint;
    use crate::store::MemoryStore;
    use chrono::TimeZone;
    use chrono::Utc;
    use pretty_assertions::assert_eq;
    use serde::Deserialize;
    use uuid::Uuid;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Payload {
        v: Vec<u32>,
    }

    fn endpoint(name: &str) -> Arc<Endpoint> {
        Arc::new(Endpoint::builder().with_name(name).build().unwrap())
    }

    fn publisher(
        endpoint: Arc<Endpoint>,
        cipher: Option<Cipher>,
        offload: Option<Offload>,
    ) -> Publisher {
        let link = crate::hub::Hub::new().link_for(&endpoint);

        Publisher::new(link, endpoint, cipher, offload)
    }

    fn offload_into(store: &Arc<MemoryStore>, at_rest: Option<Cipher>) -> Offload {
        Offload {
            prefix: "prefix".to_string(),
            documents: DocumentStore::new(
                Arc::clone(store) as Arc<dyn crate::store::ObjectStore>,
                WireFormat::Json,
                at_rest,
            ),
        }
    }

    fn fixed_receipt() -> Message<Payload> {
        Message::restore(
            Uuid::parse_str("00000000-0000-0000-0000-0000000000aa").unwrap(),
            Utc.with_ymd_and_hms(2024, 3, 4, 9, 0, 0).unwrap(),
            Payload { v: vec![1, 2, 3] },
        )
    }

    #[tokio::test]
    async fn inline_plain_carries_the_payload() {
        // Given
        let publisher = publisher(endpoint("e1"), None, None);
        let mut receipt = fixed_receipt();

        // When
        let bytes = publisher.assemble(&mut receipt).await.unwrap();

        // Then
        let wire: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(serde_json::json!({ "v": [1, 2, 3] }), wire["payload"]);
        assert!(receipt.stored_key().is_none());
    }

    #[tokio::test]
    async fn inline_encrypted_hides_the_payload() {
        // Given
        let cipher = Cipher::new(&EncryptionConfig::new("secret").with_passes(2));
        let publisher = publisher(endpoint("e2"), Some(cipher), None);
        let mut receipt = Message::new(serde_json::json!({ "n": 42 }));

        // When
        let bytes = publisher.assemble(&mut receipt).await.unwrap();

        // Then
        let wire: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        let payload = wire["payload"].as_str().unwrap();
        assert!(!payload.is_empty());
        assert!(!payload.contains("42"));
        assert!(Cipher::is_sealed(payload));
    }

    #[tokio::test]
    async fn offloaded_message_references_the_stored_document() {
        // Given
        let store = Arc::new(MemoryStore::new());
        let publisher = publisher(endpoint("e3"), None, Some(offload_into(&store, None)));
        let mut receipt = fixed_receipt();
        let expected_key = "prefix/e3/2024/03/04/00000000-0000-0000-0000-0000000000aa.json";

        // When
        let bytes = publisher.assemble(&mut receipt).await.unwrap();

        // Then: the receipt exposes the key
        assert_eq!(Some(expected_key), receipt.stored_key());

        // The broker-bound message holds the key and no envelope
        let wire: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(expected_key, wire["payload"].as_str().unwrap());
        assert!(wire.get("envelope").is_none());

        // The stored document is self-referential and preserves the payload
        let at_rest = store.snapshot(expected_key).unwrap();
        let document: StoredMessage<Payload> = serde_json::from_slice(&at_rest).unwrap();
        assert_eq!(expected_key, document.payload());
        assert_eq!(&Payload { v: vec![1, 2, 3] }, document.envelope());
    }

    #[tokio::test]
    async fn offloaded_document_can_be_sealed_at_rest() {
        // Given
        let store = Arc::new(MemoryStore::new());
        let at_rest = Cipher::new(&EncryptionConfig::new("rest-secret"));
        let publisher = publisher(endpoint("e4"), None, Some(offload_into(&store, Some(at_rest))));
        let mut receipt = fixed_receipt();

        // When
        let bytes = publisher.assemble(&mut receipt).await.unwrap();

        // Then: the broker frame carries the plaintext key
        let wire: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        let key = wire["payload"].as_str().unwrap();
        assert!(key.ends_with(".json"));
        assert!(!Cipher::is_sealed(key));

        // While the object at rest is an opaque sealed blob
        let blob = String::from_utf8(store.snapshot(key).unwrap()).unwrap();
        assert!(Cipher::is_sealed(&blob));
    }

    #[tokio::test]
    async fn offloaded_and_encrypted_seals_key_and_envelope_independently() {
        // Given
        let store = Arc::new(MemoryStore::new());
        let cipher = Cipher::new(&EncryptionConfig::new("wire-secret"));
        let publisher = publisher(
            endpoint("e5"),
            Some(cipher),
            Some(offload_into(&store, None)),
        );
        let mut receipt = fixed_receipt();

        // When
        let bytes = publisher.assemble(&mut receipt).await.unwrap();

        // Then: the broker payload is a hash that opens back into the key
        let wire: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        let sealed_payload = wire["payload"].as_str().unwrap();
        assert!(Cipher::is_sealed(sealed_payload));

        let opener = Cipher::new(&EncryptionConfig::new("wire-secret"));
        let key = String::from_utf8(opener.open(sealed_payload).unwrap()).unwrap();
        assert_eq!(Some(key.as_str()), receipt.stored_key());

        // The stored envelope is sealed independently of the payload
        let at_rest = store.snapshot(&key).unwrap();
        let document: StoredMessage<String> = serde_json::from_slice(&at_rest).unwrap();
        assert!(Cipher::is_sealed(document.envelope()));
        assert_ne!(sealed_payload, document.envelope());

        let envelope: Payload = opener
            .open_value(WireFormat::Json, document.envelope())
            .unwrap();
        assert_eq!(Payload { v: vec![1, 2, 3] }, envelope);
    }

    #[tokio::test]
    async fn wire_shape_matches_across_variants() {
        // Given
        let store = Arc::new(MemoryStore::new());
        let publisher = publisher(endpoint("e3"), None, Some(offload_into(&store, None)));
        let mut receipt = fixed_receipt();

        // When
        let bytes = publisher.assemble(&mut receipt).await.unwrap();

        // Then: the reference envelope decodes as a Message<String>
        let wire: Message<String> = WireFormat::Json.decode(&bytes).unwrap();
        assert_eq!(receipt.id(), wire.id());
        assert_eq!(receipt.created(), wire.created());
    }
}
