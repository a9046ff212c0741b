#![doc = include_str!("../README.md")]
#![deny(missing_docs)]
#![cfg_attr(test, deny(warnings))]

/// Exposes an application configuration section.
mod config;
pub use self::config::CourierConfig;

/// Exposes the endpoint definition and its builder.
mod endpoint;
pub use self::endpoint::{Endpoint, EndpointBuilder, EndpointError, EndpointSet};

/// Exposes the message shapes, the wire formats, and the object-key rule.
mod codec;
pub use self::codec::key::derive_object_key;
pub use self::codec::{CodecError, Message, StoredMessage, WireFormat};

/// Exposes the symmetric encryption layer.
mod crypto;
pub use self::crypto::{Cipher, CryptoError, EncryptionConfig};

/// Exposes the object-store layer.
mod store;
pub use self::store::{MemoryStore, ObjectStore, ObjectStoreConfig, S3Store, StoreError};

/// Exposes the rejection-reason model.
mod rejection;
pub use self::rejection::{RejectionReason, TraceFrame};

/// Exposes the hub, the routes, and the per-endpoint connection caches.
mod hub;
pub use self::hub::{Hub, HubError, Route, TransportError};

/// Exposes machinery for transporting outgoing and incoming messages.
mod transport {
    pub mod inbound;
    pub mod outbound;
}
pub use self::transport::inbound::{Handler, HandlerResult, SubscribeError};
pub use self::transport::outbound::PublishError;

/// Exposes the hosted subscriber task.
mod runner;
pub use self::runner::SubscriberHandle;

/// Internal utilities.
mod util {
    pub(crate) mod backoff;
}

/// Re-exports the cancellation token this crate's subscribe surface is bound
/// to, to facilitate stand-alone usage.
pub use tokio_util::sync::CancellationToken;

/// Re-exports the message identifier type, as it is part of this crate's API.
pub use uuid::Uuid;
