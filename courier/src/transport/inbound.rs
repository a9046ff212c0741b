use crate::codec::{CodecError, Message, StoredMessage, WireFormat};
use crate::crypto::{Cipher, CryptoError};
use crate::endpoint::Endpoint;
use crate::hub::{Link, TransportError};
use crate::rejection::RejectionReason;
use crate::store::{DocumentStore, StoreError};
use crate::transport::outbound::Offload;
use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use lapin::acker::Acker;
use lapin::message::Delivery;
use lapin::options::{BasicAckOptions, BasicConsumeOptions, BasicRejectOptions};
use lapin::types::FieldTable;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// The outcome a message handler reports back to the subscriber.
pub type HandlerResult = Result<(), RejectionReason>;

/// A user-supplied message handler.
///
/// Implemented automatically for async closures of the shape
/// `Fn(Message<T>, CancellationToken) -> impl Future<Output = HandlerResult>`.
/// The handler owns the message for the duration of the dispatch. Returning
/// an `Err` rejects the delivery; inside the handler, `?` converts any
/// [`std::error::Error`] value into a [`RejectionReason`].
///
/// The cancellation token handed to the handler is the one the subscription
/// runs under; a handler observing cancellation mid-flight chooses between
/// completing normally (the delivery is acknowledged) and returning a
/// failure (the delivery is rejected).
#[async_trait]
pub trait Handler<T>: Send + Sync {
    /// Processes one delivered message.
    async fn handle(&self, message: Message<T>, cancel: CancellationToken) -> HandlerResult;
}

#[async_trait]
impl<T, F, Fut> Handler<T> for F
where
    T: Send + 'static,
    F: Fn(Message<T>, CancellationToken) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send,
{
    async fn handle(&self, message: Message<T>, cancel: CancellationToken) -> HandlerResult {
        self(message, cancel).await
    }
}

/// Represents a fatal subscribe-path failure: the channel could not be set up
/// or the consumer could not be created. Per-delivery failures never surface
/// here; they are converted to reject decisions and logged.
#[derive(Error, Debug)]
#[error(transparent)]
pub struct SubscribeError(#[from] TransportError);

/// Represents a failure to reconstitute a delivery into a user message.
#[derive(Error, Debug)]
enum ResolveError {
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("the recovered object key is not valid UTF-8")]
    KeyNotUtf8,
}

/// A fully reconstituted delivery, ready for dispatch.
struct Resolved<T> {
    message: Message<T>,
    stored_key: Option<String>,
}

/// A delivery that could not be reconstituted. When the object key had
/// already been recovered, it is carried along so the stored document can be
/// marked rejected too.
struct Poisoned {
    error: ResolveError,
    stored_key: Option<String>,
}

impl Poisoned {
    fn keyless(error: ResolveError) -> Self {
        Self {
            error,
            stored_key: None,
        }
    }
}

/// The terminal decision for one delivery.
enum Outcome {
    Acknowledged,
    Rejected(RejectionReason),
}

/// Consumes deliveries for one endpoint and drives each through the delivery
/// state machine: decode the wire shape, resolve the offloaded payload,
/// dispatch to the handler, then acknowledge or reject.
///
/// The broker decision always happens before the stored-document
/// bookkeeping; when the write-back fails after a successful broker
/// acknowledge or reject, the inconsistency is logged and the broker
/// decision stands.
pub(crate) struct Subscriber {
    name: Arc<str>,
    link: Arc<Link>,
    endpoint: Arc<Endpoint>,
    cipher: Option<Cipher>,
    offload: Option<Offload>,
}

impl Subscriber {
    /// Creates a new subscriber over the given connection cache and effective
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

    /// Composes a globally unique, human-readable name for this subscriber.
    fn compose_name(endpoint: &Endpoint) -> Arc<str> {
        static COUNTER: AtomicUsize = AtomicUsize::new(0);

        Arc::from(format!(
            "courier:sub:{}:{}",
            endpoint.name(),
            COUNTER.fetch_add(1, Ordering::Relaxed),
        ))
    }
}

impl Subscriber {
    /// Consumes deliveries until the cancellation token is signaled or the
    /// consumer ends. The channel comes with a prefetch of one, so at most
    /// one delivery is in flight at a time.
    pub(crate) async fn run<T, H>(
        &self,
        handler: &H,
        cancel: CancellationToken,
    ) -> Result<(), SubscribeError>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
        H: Handler<T>,
    {
        // Set up the channel (prefetch 1, passive queue declaration) and the
        // consumer; failures here are fatal to the subscribe call
        let channel = self.link.channel().await.map_err(SubscribeError::from)?;

        let mut consumer = channel
            .basic_consume(
                self.endpoint.queue(),
                &self.name,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|error| SubscribeError::from(TransportError::new(self.endpoint.name(), error)))?;

        if !self.endpoint.quiet() {
            info!(
                subscriber = self.name.as_ref(),
                queue = self.endpoint.queue(),
                "Started consuming",
            );
        }

        loop {
            let next = select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                next = consumer.next() => next,
            };

            match next {
                // The consumer is permanently out of deliveries (the channel
                // or connection is likely gone); let the caller re-subscribe
                None => {
                    debug!(
                        subscriber = self.name.as_ref(),
                        "The consumer ran out of deliveries",
                    );
                    self.link.invalidate_channel().await;

                    return Ok(());
                }

                // A consumer-level error; the stream may still recover
                Some(Err(error)) => {
                    warn!(
                        alert = true,
                        subscriber = self.name.as_ref(),
                        ?error,
                        error_message = %error,
                        "Received an error from the consumer",
                    );
                }

                Some(Ok(delivery)) => self.process::<T, H>(delivery, handler, &cancel).await,
            }
        }
    }

    /// Drives a single delivery through the state machine.
    async fn process<T, H>(&self, delivery: Delivery, handler: &H, cancel: &CancellationToken)
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
        H: Handler<T>,
    {
        // Cancellation observed at the entry of the delivery: return without
        // dispatching and without finalizing; the broker will redeliver
        if cancel.is_cancelled() {
            return;
        }

        let Delivery {
            data: bytes, acker, ..
        } = delivery;

        match self.resolve::<T>(&bytes).await {
            Ok(Resolved {
                message,
                stored_key,
            }) => {
                let message_id = message.id();

                // Dispatch to the user handler
                match handler.handle(message, cancel.clone()).await {
                    Ok(()) => {
                        // The broker acknowledge strictly precedes the
                        // stored-document bookkeeping
                        self.complete_delivery(&acker).await;

                        if let Some(key) = stored_key {
                            self.record_outcome::<T>(&key, Outcome::Acknowledged).await;
                        }

                        if !self.endpoint.quiet() {
                            info!(
                                subscriber = self.name.as_ref(),
                                message_id = %message_id,
                                "Dispatched and acknowledged a delivery",
                            );
                        }
                    }
                    Err(reason) => {
                        self.abandon_delivery(&acker).await;

                        warn!(
                            subscriber = self.name.as_ref(),
                            message_id = %message_id,
                            reason = %reason,
                            "The handler rejected a delivery",
                        );

                        if let Some(key) = stored_key {
                            self.record_outcome::<T>(&key, Outcome::Rejected(reason)).await;
                        }
                    }
                }
            }

            // A poisoned delivery: reject without re-queueing, and when an
            // object key was recovered, mark the stored document rejected too
            Err(Poisoned { error, stored_key }) => {
                error!(
                    alert = true,
                    subscriber = self.name.as_ref(),
                    ?error,
                    error_message = %error,
                    byte_preview = String::from_utf8_lossy(&bytes).as_ref(),
                    "Failed to reconstitute a delivery",
                );

                self.abandon_delivery(&acker).await;

                if let Some(key) = stored_key {
                    self.record_outcome::<T>(&key, Outcome::Rejected(RejectionReason::from(error)))
                        .await;
                }
            }
        }
    }

    /// Reconstitutes the delivered bytes into the user message, resolving the
    /// offloaded payload when the endpoint is object-store-backed.
    async fn resolve<T>(&self, bytes: &[u8]) -> Result<Resolved<T>, Poisoned>
    where
        T: DeserializeOwned,
    {
        let format = self.endpoint.format();

        if let Some(offload) = &self.offload {
            // The wire carries a reference envelope
            let wire: Message<String> = format
                .decode(bytes)
                .map_err(|error| Poisoned::keyless(error.into()))?;

            // Recover the object key, opening it first when sealed
            let key = match &self.cipher {
                Some(cipher) => {
                    let opened = cipher
                        .open(wire.payload())
                        .map_err(|error| Poisoned::keyless(error.into()))?;

                    String::from_utf8(opened)
                        .map_err(|_| Poisoned::keyless(ResolveError::KeyNotUtf8))?
                }
                None => wire.payload().clone(),
            };

            // From here on the key is known; failures also poison the stored
            // document
            let payload = fetch_envelope::<T>(&offload.documents, format, self.cipher.as_ref(), &key)
                .await
                .map_err(|error| Poisoned {
                    error,
                    stored_key: Some(key.clone()),
                })?;

            let mut message = wire.reshape(payload);
            message.mark_consumed(Utc::now());

            Ok(Resolved {
                message,
                stored_key: Some(key),
            })
        } else if let Some(cipher) = &self.cipher {
            // The wire carries an encrypted envelope
            let wire: Message<String> = format
                .decode(bytes)
                .map_err(|error| Poisoned::keyless(error.into()))?;

            let payload: T = cipher
                .open_value(format, wire.payload())
                .map_err(|error| Poisoned::keyless(error.into()))?;

            let mut message = wire.reshape(payload);
            message.mark_consumed(Utc::now());

            Ok(Resolved {
                message,
                stored_key: None,
            })
        } else {
            // The wire carries the payload inline
            let mut message: Message<T> = format
                .decode(bytes)
                .map_err(|error| Poisoned::keyless(error.into()))?;
            message.mark_consumed(Utc::now());

            Ok(Resolved {
                message,
                stored_key: None,
            })
        }
    }

    /// Records the terminal outcome on the stored document, as a
    /// read-modify-write under the key. A failure here is logged and
    /// swallowed: the broker decision has already been made and stands.
    async fn record_outcome<T>(&self, key: &str, outcome: Outcome)
    where
        T: Serialize + DeserializeOwned + Send + Sync,
    {
        // With transport encryption in effect the stored envelope is a
        // sealed string; otherwise it is the user payload itself
        let result = match &self.cipher {
            Some(_) => self.mark::<String>(key, outcome).await,
            None => self.mark::<T>(key, outcome).await,
        };

        if let Err(error) = result {
            warn!(
                alert = true,
                subscriber = self.name.as_ref(),
                key,
                ?error,
                error_message = %error,
                "The broker decision stands, but the stored document could not be updated",
            );
        }
    }

    /// Applies the outcome to the stored document of envelope type `E`.
    async fn mark<E>(&self, key: &str, outcome: Outcome) -> Result<(), StoreError>
    where
        E: Serialize + DeserializeOwned + Send + Sync,
    {
        let Some(offload) = &self.offload else {
            return Ok(());
        };

        let mut document: StoredMessage<E> = offload.documents.get_document(key).await?;

        match outcome {
            Outcome::Acknowledged => document.acknowledge(Utc::now()),
            Outcome::Rejected(reason) => document.reject(Utc::now(), reason),
        }

        offload.documents.put_document(key, &document).await
    }

    /// Acknowledges the delivery with the broker. A message must be finalized
    /// exactly once; failing to do so is logged at the error level.
    async fn complete_delivery(&self, acker: &Acker) {
        if let Err(error) = acker.ack(BasicAckOptions { multiple: false }).await {
            error!(
                alert = true,
                subscriber = self.name.as_ref(),
                ?error,
                error_message = %error,
                "Failed to acknowledge a delivery; the broker will redeliver",
            );
        }
    }

    /// Rejects the delivery with the broker, without re-queueing.
    async fn abandon_delivery(&self, acker: &Acker) {
        if let Err(error) = acker.reject(BasicRejectOptions { requeue: false }).await {
            error!(
                alert = true,
                subscriber = self.name.as_ref(),
                ?error,
                error_message = %error,
                "Failed to reject a delivery",
            );
        }
    }
}

/// Fetches the stored document under the given key and recovers the original
/// payload from its envelope, opening it first when transport encryption is
/// in effect.
async fn fetch_envelope<T>(
    documents: &DocumentStore,
    format: WireFormat,
    cipher: Option<&Cipher>,
    key: &str,
) -> Result<T, ResolveError>
where
    T: DeserializeOwned,
{
    match cipher {
        Some(cipher) => {
            let document: StoredMessage<String> = documents.get_document(key).await?;

            Ok(cipher.open_value(format, document.envelope())?)
        }
        None => {
            let document: StoredMessage<T> = documents.get_document(key).await?;

            Ok(document.into_envelope())
        }
    }
}
