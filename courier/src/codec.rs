use crate::rejection::RejectionReason;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod format;
pub mod key;

pub use self::format::{CodecError, WireFormat};

/// The XML document element for broker-bound messages. JSON bodies ignore it.
pub(crate) const WIRE_ROOT: &str = "message";

/// The XML document element for offloaded documents. JSON bodies ignore it.
pub(crate) const STORED_ROOT: &str = "storedMessage";

/// An in-transit message around a user payload of type `T`.
///
/// On the publishing side a message is created by the publisher, stamped with
/// a fresh identifier and creation timestamp, and returned to the caller once
/// the broker has accepted the frame. On the consuming side a message is
/// reconstituted from the delivery and handed to the user handler.
///
/// On the wire, the payload field holds either the user value itself (inline
/// variant), an object-store key (offloaded variant), or a portable hash
/// (encrypted variants). The same shape covers all four, driven by endpoint
/// configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message<T> {
    id: Uuid,
    created: DateTime<Utc>,
    #[serde(default)]
    published: Option<DateTime<Utc>>,
    #[serde(default)]
    consumed: Option<DateTime<Utc>>,
    #[serde(default)]
    rejected: Option<DateTime<Utc>>,
    payload: T,
    /// Publish-side only: the object key under which the payload was
    /// offloaded, if it was. Never serialized.
    #[serde(skip)]
    stored_key: Option<String>,
}

impl<T> Message<T> {
    /// Creates a new message around the given payload, with a fresh v4 UUID
    /// and the current UTC time as the creation timestamp.
    pub fn new(payload: T) -> Self {
        Self::restore(Uuid::new_v4(), Utc::now(), payload)
    }

    /// Re-creates a message with the given identity. Used when reconstituting
    /// a message from its wire form, and by tests that need determinism.
    pub(crate) fn restore(id: Uuid, created: DateTime<Utc>, payload: T) -> Self {
        Self {
            id,
            created,
            published: None,
            consumed: None,
            rejected: None,
            payload,
            stored_key: None,
        }
    }

    /// Rebuilds this message around a different payload, keeping the identity
    /// and every timestamp. This is how the codec moves between the inline,
    /// reference and encrypted shapes of the same logical message.
    pub(crate) fn reshape<U>(&self, payload: U) -> Message<U> {
        Message {
            id: self.id,
            created: self.created,
            published: self.published,
            consumed: self.consumed,
            rejected: self.rejected,
            payload,
            stored_key: self.stored_key.clone(),
        }
    }
}

impl<T> Message<T> {
    /// Reports the unique identifier of this message.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Reports when this message was created.
    pub fn created(&self) -> DateTime<Utc> {
        self.created
    }

    /// Reports when the broker accepted this message, if it has been
    /// published.
    pub fn published(&self) -> Option<DateTime<Utc>> {
        self.published
    }

    /// Reports when the subscriber received this message, if it has been
    /// consumed.
    pub fn consumed(&self) -> Option<DateTime<Utc>> {
        self.consumed
    }

    /// Reports when this message was rejected, if it was.
    pub fn rejected(&self) -> Option<DateTime<Utc>> {
        self.rejected
    }

    /// Exposes the payload of this message.
    pub fn payload(&self) -> &T {
        &self.payload
    }

    /// Consumes this message and returns its payload.
    pub fn into_payload(self) -> T {
        self.payload
    }

    /// Reports the object key under which the payload of this message was
    /// offloaded, if offloading took place. Populated only on the publishing
    /// side, on the message returned by a publish call.
    pub fn stored_key(&self) -> Option<&str> {
        self.stored_key.as_deref()
    }

    pub(crate) fn mark_published(&mut self, at: DateTime<Utc>) {
        self.published = Some(at);
    }

    pub(crate) fn mark_consumed(&mut self, at: DateTime<Utc>) {
        self.consumed = Some(at);
    }

    pub(crate) fn set_stored_key(&mut self, key: String) {
        self.stored_key = Some(key);
    }
}

/// The document persisted in the object store for an offloaded message.
///
/// Carries the wire fields of the corresponding broker message (whose payload
/// is the object key itself) plus the preserved original payload (the
/// envelope) and the terminal bookkeeping fields mutated by the subscriber.
/// Exactly one of `acknowledged` and `rejected` ends up set after the
/// delivery completes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredMessage<T> {
    id: Uuid,
    created: DateTime<Utc>,
    #[serde(default)]
    published: Option<DateTime<Utc>>,
    #[serde(default)]
    consumed: Option<DateTime<Utc>>,
    #[serde(default)]
    rejected: Option<DateTime<Utc>>,
    /// The object key under which this very document is stored.
    payload: String,
    /// The original user payload.
    envelope: T,
    #[serde(default)]
    acknowledged: Option<DateTime<Utc>>,
    #[serde(default)]
    rejected_reason: Option<RejectionReason>,
}

impl<T> StoredMessage<T> {
    /// Builds the stored document for the given message, under the given
    /// object key, preserving the given envelope.
    pub(crate) fn enclose<P>(message: &Message<P>, key: String, envelope: T) -> Self {
        Self {
            id: message.id,
            created: message.created,
            published: message.published,
            consumed: message.consumed,
            rejected: message.rejected,
            payload: key,
            envelope,
            acknowledged: None,
            rejected_reason: None,
        }
    }
}

impl<T> StoredMessage<T> {
    /// Reports the unique identifier of the offloaded message.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Reports the object key under which this document is stored.
    pub fn payload(&self) -> &str {
        &self.payload
    }

    /// Exposes the preserved original payload.
    pub fn envelope(&self) -> &T {
        &self.envelope
    }

    /// Consumes this document and returns the preserved original payload.
    pub fn into_envelope(self) -> T {
        self.envelope
    }

    /// Reports when the delivery of this message was acknowledged, if it was.
    pub fn acknowledged(&self) -> Option<DateTime<Utc>> {
        self.acknowledged
    }

    /// Reports when the delivery of this message was rejected, if it was.
    pub fn rejected(&self) -> Option<DateTime<Utc>> {
        self.rejected
    }

    /// Reports when the subscriber received the corresponding delivery.
    pub fn consumed(&self) -> Option<DateTime<Utc>> {
        self.consumed
    }

    /// Exposes the recorded cause of rejection, if the delivery was rejected.
    pub fn rejected_reason(&self) -> Option<&RejectionReason> {
        self.rejected_reason.as_ref()
    }

    /// Records the positive terminal state of the delivery.
    pub(crate) fn acknowledge(&mut self, at: DateTime<Utc>) {
        self.acknowledged = Some(at);
        self.consumed = Some(at);
    }

    /// Records the negative terminal state of the delivery, with its cause.
    pub(crate) fn reject(&mut self, at: DateTime<Utc>, reason: RejectionReason) {
        self.rejected = Some(at);
        self.rejected_reason = Some(reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Payload {
        text: String,
    }

    fn fixed_message() -> Message<Payload> {
        Message::restore(
            Uuid::parse_str("00000000-0000-0000-0000-0000000000aa").unwrap(),
            Utc.with_ymd_and_hms(2024, 3, 4, 10, 0, 0).unwrap(),
            Payload {
                text: "hello".to_string(),
            },
        )
    }

    #[test]
    fn wire_shape_is_stable_json() {
        // Given
        let message = fixed_message();
        let expected = concat!(
            r#"{"id":"00000000-0000-0000-0000-0000000000aa","#,
            r#""created":"2024-03-04T10:00:00Z","#,
            r#""published":null,"consumed":null,"rejected":null,"#,
            r#""payload":{"text":"hello"}}"#,
        );

        // When
        let actual = serde_json::to_string(&message).unwrap();

        // Then
        assert_eq!(expected, actual);
    }

    #[test]
    fn stored_key_never_reaches_the_wire() {
        // Given
        let mut message = fixed_message();
        message.set_stored_key("prefix/key".to_string());

        // When
        let wire = serde_json::to_string(&message).unwrap();

        // Then
        assert!(!wire.contains("prefix/key"));
        assert!(!wire.contains("storedKey"));
    }

    #[test]
    fn reshape_preserves_identity() {
        // Given
        let message = fixed_message();

        // When
        let reference = message.reshape("some/object/key".to_string());

        // Then
        assert_eq!(message.id(), reference.id());
        assert_eq!(message.created(), reference.created());
        assert_eq!("some/object/key", reference.payload());
    }

    #[test]
    fn enclosed_document_is_self_referential() {
        // Given
        let message = fixed_message();
        let key = "prefix/e1/2024/03/04/id.json".to_string();

        // When
        let stored = StoredMessage::enclose(&message, key.clone(), message.payload().clone());

        // Then
        assert_eq!(key, stored.payload());
        assert_eq!(message.payload(), stored.envelope());
        assert_eq!(None, stored.acknowledged());
        assert_eq!(None, stored.rejected());
    }

    #[test]
    fn terminal_states_round_trip() {
        // Given
        let message = fixed_message();
        let mut stored =
            StoredMessage::enclose(&message, "k".to_string(), message.payload().clone());
        let at = Utc.with_ymd_and_hms(2024, 3, 4, 11, 0, 0).unwrap();

        // When
        stored.reject(at, RejectionReason::from_message("boom"));
        let json = serde_json::to_string(&stored).unwrap();
        let back: StoredMessage<Payload> = serde_json::from_str(&json).unwrap();

        // Then
        assert_eq!(Some(at), back.rejected());
        assert_eq!("boom", back.rejected_reason().unwrap().message());
        assert!(json.contains("rejectedReason"));
    }
}
