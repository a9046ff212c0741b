use crate::codec::Message;
use crate::config::CourierConfig;
use crate::crypto::{Cipher, EncryptionConfig};
use crate::endpoint::{Endpoint, EndpointError};
use crate::runner::SubscriberHandle;
use crate::store::{DocumentStore, ObjectStore, ObjectStoreConfig, S3Store};
use crate::transport::inbound::{Handler, SubscribeError, Subscriber};
use crate::transport::outbound::{Offload, PublishError, Publisher};
use lapin::options::{BasicQosOptions, QueueDeclareOptions};
use lapin::types::FieldTable;
use lapin::{Channel, Connection, ConnectionProperties, Error as LapinError};
use parking_lot::{Mutex as SyncMutex, RwLock};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Represents a broker-level failure on some endpoint.
#[derive(Error, Debug)]
#[error("broker transport failure on endpoint '{endpoint}': {source}")]
pub struct TransportError {
    endpoint: String,
    #[source]
    source: LapinError,
}

impl TransportError {
    pub(crate) fn new(endpoint: &str, source: LapinError) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            source,
        }
    }
}

/// Represents a failure of a [`Hub`]-level operation.
#[derive(Error, Debug)]
pub enum HubError {
    /// The operation referenced an endpoint that could not be resolved.
    #[error(transparent)]
    Endpoint(#[from] EndpointError),
    /// The broker could not be reached, or refused the operation.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// The per-endpoint connection cache: one lazily established [`Connection`]
/// and one lazily opened [`Channel`], reused until
/// [`disconnect`](Hub::disconnect).
///
/// Opening the channel also applies the channel contract of this library:
/// QoS with a prefetch of one (non-global), and a passive declaration of the
/// endpoint queue (exists-or-fail). The lock around the state provides the
/// first-use synchronization that keeps two tasks from opening two
/// connections for the same endpoint.
pub(crate) struct Link {
    endpoint: Arc<Endpoint>,
    state: AsyncMutex<LinkState>,
}

#[derive(Default)]
struct LinkState {
    connection: Option<Connection>,
    channel: Option<Channel>,
}

impl Link {
    fn new(endpoint: Arc<Endpoint>) -> Self {
        Self {
            endpoint,
            state: AsyncMutex::new(LinkState::default()),
        }
    }

    /// Returns the memoized channel, establishing the connection and opening
    /// the channel first if needed.
    pub(crate) async fn channel(&self) -> Result<Channel, TransportError> {
        let mut state = self.state.lock().await;

        // Reuse the current channel while it looks healthy
        if let Some(channel) = state.channel.as_ref() {
            if channel.status().connected() {
                return Ok(channel.clone());
            }
            state.channel = None;
        }

        // Reuse the current connection, or establish a fresh one
        let connection = match state.connection.take() {
            Some(connection) if connection.status().connected() => connection,
            _ => self.establish().await?,
        };

        // Open a channel and apply the channel contract
        let channel = match self.open_channel(&connection).await {
            Ok(channel) => channel,
            Err(error) => {
                // Keep the connection; the failure may be channel-local
                // (e.g., the queue does not exist)
                state.connection = Some(connection);
                return Err(error);
            }
        };

        state.connection = Some(connection);
        state.channel = Some(channel.clone());

        Ok(channel)
    }

    /// Establishes a fresh connection to the broker behind this endpoint.
    async fn establish(&self) -> Result<Connection, TransportError> {
        let properties = ConnectionProperties::default()
            .with_executor(tokio_executor_trait::Tokio::current())
            .with_reactor(tokio_reactor_trait::Tokio);

        let connection = Connection::connect(self.endpoint.dsn().unsecure(), properties)
            .await
            .map_err(|error| {
                warn!(
                    endpoint = self.endpoint.name(),
                    identifier = self.endpoint.identifier(),
                    ?error,
                    error_message = %error,
                    "Failed to establish a broker connection",
                );

                TransportError::new(self.endpoint.name(), error)
            })?;

        if !self.endpoint.quiet() {
            info!(
                endpoint = self.endpoint.name(),
                identifier = self.endpoint.identifier(),
                "Established a broker connection",
            );
        }

        Ok(connection)
    }

    /// Opens a channel on the given connection, sets the prefetch to one, and
    /// passively declares the endpoint queue.
    async fn open_channel(&self, connection: &Connection) -> Result<Channel, TransportError> {
        let channel = connection
            .create_channel()
            .await
            .map_err(|error| TransportError::new(self.endpoint.name(), error))?;

        channel
            .basic_qos(1, BasicQosOptions { global: false })
            .await
            .map_err(|error| TransportError::new(self.endpoint.name(), error))?;

        channel
            .queue_declare(
                self.endpoint.queue(),
                QueueDeclareOptions {
                    passive: true,
                    durable: false,
                    exclusive: false,
                    auto_delete: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|error| {
                warn!(
                    endpoint = self.endpoint.name(),
                    queue = self.endpoint.queue(),
                    ?error,
                    error_message = %error,
                    "The endpoint queue failed its passive declaration",
                );

                TransportError::new(self.endpoint.name(), error)
            })?;

        Ok(channel)
    }

    /// Drops the memoized channel, forcing the next use to open a fresh one.
    pub(crate) async fn invalidate_channel(&self) {
        self.state.lock().await.channel = None;
    }

    /// Reports the broker-side depth of the endpoint queue.
    pub(crate) async fn message_count(&self) -> Result<u32, TransportError> {
        let channel = self.channel().await?;

        let queue = channel
            .queue_declare(
                self.endpoint.queue(),
                QueueDeclareOptions {
                    passive: true,
                    durable: false,
                    exclusive: false,
                    auto_delete: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|error| TransportError::new(self.endpoint.name(), error))?;

        Ok(queue.message_count())
    }

    /// Takes and closes the memoized connection, if any.
    pub(crate) async fn disconnect(&self) {
        let mut state = self.state.lock().await;
        state.channel = None;

        let Some(connection) = state.connection.take() else {
            return;
        };
        drop(state);

        match connection.close(200, "Disconnect requested").await {
            Ok(()) => {
                if !self.endpoint.quiet() {
                    info!(
                        endpoint = self.endpoint.name(),
                        identifier = self.endpoint.identifier(),
                        "Closed the broker connection",
                    );
                }
            }
            Err(LapinError::InvalidConnectionState(_)) => {
                // The connection was already gone; nothing to close
            }
            Err(error) => warn!(
                endpoint = self.endpoint.name(),
                identifier = self.endpoint.identifier(),
                ?error,
                error_message = %error,
                "Failed to cleanly close the broker connection",
            ),
        }
    }
}

#[derive(Default)]
struct Defaults {
    endpoint: Option<Arc<Endpoint>>,
    encryption: Option<EncryptionConfig>,
    store: Option<ObjectStoreConfig>,
}

#[derive(Default)]
struct HubInner {
    /// Registered endpoints, keyed by lower-cased name.
    registry: RwLock<HashMap<String, Arc<Endpoint>>>,
    /// Process-wide defaults.
    defaults: RwLock<Defaults>,
    /// Connection caches, keyed by lower-cased endpoint name.
    links: SyncMutex<HashMap<String, Arc<Link>>>,
    /// Object-store backends, keyed by connection coordinates.
    backends: AsyncMutex<HashMap<String, Arc<dyn ObjectStore>>>,
    /// An injected backend that overrides every configured one.
    backend_override: RwLock<Option<Arc<dyn ObjectStore>>>,
}

/// The entry point of this library: hosts the endpoint registry, the
/// process-wide defaults, and the per-endpoint connection caches.
///
/// A hub is cheaply cloneable; clones share all state. Endpoints are added
/// through explicit registration and are deduplicated case-insensitively on
/// both their name and their queue; they are never removed.
///
/// Publishing and consuming go through a [`Route`], obtained from
/// [`route`](Hub::route), [`default_route`](Hub::default_route) or
/// [`route_to`](Hub::route_to), which also carries the per-call encryption
/// and object-store overrides.
#[derive(Clone, Default)]
pub struct Hub {
    inner: Arc<HubInner>,
}

impl Hub {
    /// Creates a new hub with an empty registry and no defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a hub pre-populated from the given configuration section: the
    /// default endpoint, the extra named endpoints, and the process-wide
    /// encryption and object-store defaults.
    pub fn from_config(config: impl Into<CourierConfig>) -> Self {
        let hub = Self::new();
        let (default_endpoint, endpoints, encryption, store) = config.into().into_parts();

        if let Some(endpoint) = default_endpoint {
            hub.register_default_endpoint(endpoint);
        }
        hub.register_endpoints(endpoints);
        if let Some(encryption) = encryption {
            hub.register_default_encryption(encryption);
        }
        if let Some(store) = store {
            hub.register_default_object_store(store);
        }

        hub
    }
}

impl Hub {
    /// Registers the given endpoint. An existing registration with the same
    /// name or the same queue (case-insensitively) is replaced.
    pub fn register_endpoint(&self, endpoint: Endpoint) {
        self.install(Arc::new(endpoint));
    }

    /// Registers every endpoint of the given collection.
    pub fn register_endpoints(&self, endpoints: impl IntoIterator<Item = Endpoint>) {
        for endpoint in endpoints {
            self.register_endpoint(endpoint);
        }
    }

    /// Registers the given endpoint and makes it the process-wide default.
    pub fn register_default_endpoint(&self, endpoint: Endpoint) {
        let endpoint = Arc::new(endpoint);

        self.install(Arc::clone(&endpoint));
        self.inner.defaults.write().endpoint = Some(endpoint);
    }

    /// Sets the process-wide default encryption configuration.
    pub fn register_default_encryption(&self, encryption: EncryptionConfig) {
        self.inner.defaults.write().encryption = Some(encryption);
    }

    /// Sets the process-wide default object-store configuration.
    pub fn register_default_object_store(&self, store: ObjectStoreConfig) {
        self.inner.defaults.write().store = Some(store);
    }

    /// Overrides the object-store backend for every route of this hub,
    /// regardless of the configured coordinates. Intended for tests and for
    /// embedding custom stores.
    pub fn set_store_backend(&self, backend: Arc<dyn ObjectStore>) {
        *self.inner.backend_override.write() = Some(backend);
    }

    /// Installs the endpoint into the registry, deduplicating on name and
    /// queue, and drops any stale connection cache under the same name.
    fn install(&self, endpoint: Arc<Endpoint>) {
        let name_key = endpoint.name().to_lowercase();
        let queue_key = endpoint.queue().to_lowercase();

        let mut registry = self.inner.registry.write();
        registry.retain(|key, existing| {
            *key != name_key && existing.queue().to_lowercase() != queue_key
        });
        registry.insert(name_key.clone(), endpoint);
        drop(registry);

        self.inner.links.lock().remove(&name_key);
    }
}

impl Hub {
    /// Opens a route to the endpoint registered under the given name
    /// (case-insensitively).
    pub fn route(&self, name: impl AsRef<str>) -> Result<Route, EndpointError> {
        let name = name.as_ref();
        let endpoint = self
            .inner
            .registry
            .read()
            .get(&name.to_lowercase())
            .cloned()
            .ok_or_else(|| EndpointError::Unknown(name.to_string()))?;

        Ok(self.route_for(endpoint))
    }

    /// Opens a route to the process-wide default endpoint.
    pub fn default_route(&self) -> Result<Route, EndpointError> {
        let endpoint = self
            .inner
            .defaults
            .read()
            .endpoint
            .clone()
            .ok_or(EndpointError::NoDefault)?;

        Ok(self.route_for(endpoint))
    }

    /// Registers the given endpoint (replacing any same-named one) and opens
    /// a route to it.
    pub fn route_to(&self, endpoint: Endpoint) -> Route {
        let endpoint = Arc::new(endpoint);
        self.install(Arc::clone(&endpoint));

        self.route_for(endpoint)
    }

    fn route_for(&self, endpoint: Arc<Endpoint>) -> Route {
        Route {
            hub: self.clone(),
            endpoint,
            encryption: None,
            store: None,
        }
    }

    /// Reports the broker-side depth of the queue behind the named endpoint,
    /// or behind the default endpoint when no name is given.
    pub async fn message_count(&self, name: Option<&str>) -> Result<u32, HubError> {
        let route = match name {
            Some(name) => self.route(name)?,
            None => self.default_route()?,
        };

        Ok(route.message_count().await?)
    }

    /// Closes the cached broker connection of the named endpoint, or of every
    /// endpoint when no name is given. The endpoints stay registered; the
    /// next use reconnects.
    pub async fn disconnect(&self, name: Option<&str>) -> Result<(), EndpointError> {
        let links: Vec<Arc<Link>> = match name {
            Some(name) => {
                let key = name.to_lowercase();
                if !self.inner.registry.read().contains_key(&key) {
                    return Err(EndpointError::Unknown(name.to_string()));
                }
                self.inner.links.lock().remove(&key).into_iter().collect()
            }
            None => self.inner.links.lock().drain().map(|(_, link)| link).collect(),
        };

        for link in links {
            link.disconnect().await;
        }

        Ok(())
    }

    /// Returns the connection cache for the given endpoint, creating it on
    /// first use.
    pub(crate) fn link_for(&self, endpoint: &Arc<Endpoint>) -> Arc<Link> {
        let key = endpoint.name().to_lowercase();

        Arc::clone(
            self.inner
                .links
                .lock()
                .entry(key)
                .or_insert_with(|| Arc::new(Link::new(Arc::clone(endpoint)))),
        )
    }

    /// Returns the object-store backend for the given configuration, creating
    /// and memoizing it on first use. An injected override always wins.
    pub(crate) async fn backend_for(&self, config: &ObjectStoreConfig) -> Arc<dyn ObjectStore> {
        if let Some(backend) = self.inner.backend_override.read().as_ref() {
            return Arc::clone(backend);
        }

        let key = config.backend_key();
        let mut backends = self.inner.backends.lock().await;

        if let Some(backend) = backends.get(&key) {
            return Arc::clone(backend);
        }

        let backend: Arc<dyn ObjectStore> = Arc::new(S3Store::connect(config).await);
        backends.insert(key, Arc::clone(&backend));

        backend
    }
}

/// A per-call binding of an endpoint with optional encryption and
/// object-store overrides.
///
/// The effective configuration of every publish/subscribe call is composed
/// as: per-call override, then endpoint-embedded setting, then process-wide
/// default.
#[derive(Clone)]
pub struct Route {
    hub: Hub,
    endpoint: Arc<Endpoint>,
    encryption: Option<EncryptionConfig>,
    store: Option<ObjectStoreConfig>,
}

impl Route {
    /// Overrides the encryption configuration for calls made through this
    /// route.
    pub fn with_encryption(mut self, encryption: EncryptionConfig) -> Self {
        self.encryption = Some(encryption);

        self
    }

    /// Overrides the object-store configuration for calls made through this
    /// route.
    pub fn with_object_store(mut self, store: ObjectStoreConfig) -> Self {
        self.store = Some(store);

        self
    }

    /// Exposes the endpoint behind this route.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Composes the effective encryption configuration for this route.
    pub(crate) fn effective_encryption(&self) -> Option<EncryptionConfig> {
        self.encryption
            .clone()
            .or_else(|| self.endpoint.encryption().cloned())
            .or_else(|| self.hub.inner.defaults.read().encryption.clone())
    }

    /// Composes the effective object-store configuration for this route.
    pub(crate) fn effective_store(&self) -> Option<ObjectStoreConfig> {
        self.store
            .clone()
            .or_else(|| self.endpoint.store().cloned())
            .or_else(|| self.hub.inner.defaults.read().store.clone())
    }

    /// Publishes the given payload through this route and returns the
    /// published message, with its `published` timestamp set and, when the
    /// payload was offloaded, the object key it was stored under.
    pub async fn publish<T>(&self, payload: T) -> Result<Message<T>, PublishError>
    where
        T: Serialize + Clone + Send + Sync,
    {
        self.prepare_publisher().await.publish(payload).await
    }

    /// Publishes a value that was sealed ahead of time with the effective
    /// encryption configuration of this route. The value is checked against
    /// the portable-hash predicate and goes onto the wire as the payload of
    /// an encrypted envelope; offloading does not apply, since the plaintext
    /// is not available.
    pub async fn publish_sealed(
        &self,
        sealed: impl Into<String>,
    ) -> Result<Message<String>, PublishError> {
        let sealed = sealed.into();

        if !Cipher::is_sealed(&sealed) {
            return Err(PublishError::Endpoint(EndpointError::NotSealed));
        }
        if self.effective_encryption().is_none() {
            return Err(PublishError::Endpoint(EndpointError::SealedWithoutEncryption));
        }

        self.prepare_publisher().await.publish_presealed(sealed).await
    }

    /// Consumes deliveries from this route's queue, dispatching each to the
    /// given handler, until the cancellation token is signaled or the
    /// consumer ends. See the crate documentation for the full delivery
    /// contract.
    pub async fn subscribe<T, H>(
        &self,
        handler: &H,
        cancel: CancellationToken,
    ) -> Result<(), SubscribeError>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
        H: Handler<T>,
    {
        self.prepare_subscriber().await.run::<T, H>(handler, cancel).await
    }

    /// Spawns the long-lived subscriber task for this route: while the
    /// cancellation token is unsignaled, the subscription is re-established
    /// whenever it ends, with an exponential backoff after failures.
    pub fn spawn_subscriber<T, H>(&self, handler: H, cancel: CancellationToken) -> SubscriberHandle
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
        H: Handler<T> + 'static,
    {
        crate::runner::spawn::<T, H>(self.clone(), handler, cancel)
    }

    /// Reports the broker-side depth of the queue behind this route.
    pub async fn message_count(&self) -> Result<u32, TransportError> {
        self.hub.link_for(&self.endpoint).message_count().await
    }

    /// Builds the publisher for this route's effective configuration.
    pub(crate) async fn prepare_publisher(&self) -> Publisher {
        let encryption = self.effective_encryption();
        let offload = self.prepare_offload(&encryption).await;

        Publisher::new(
            self.hub.link_for(&self.endpoint),
            Arc::clone(&self.endpoint),
            encryption.as_ref().map(Cipher::new),
            offload,
        )
    }

    /// Builds the subscriber for this route's effective configuration.
    pub(crate) async fn prepare_subscriber(&self) -> Subscriber {
        let encryption = self.effective_encryption();
        let offload = self.prepare_offload(&encryption).await;

        Subscriber::new(
            self.hub.link_for(&self.endpoint),
            Arc::clone(&self.endpoint),
            encryption.as_ref().map(Cipher::new),
            offload,
        )
    }

    /// Builds the offload seat (key prefix plus document store) when an
    /// object-store configuration is in effect.
    async fn prepare_offload(&self, encryption: &Option<EncryptionConfig>) -> Option<Offload> {
        let config = self.effective_store()?;
        let backend = self.hub.backend_for(&config).await;

        let at_rest = match (encryption, config.encrypt_stored_objects()) {
            (Some(encryption), true) => Some(Cipher::new(encryption)),
            _ => None,
        };

        Some(Offload {
            prefix: config.prefix().to_string(),
            documents: DocumentStore::new(backend, self.endpoint.format(), at_rest),
        })
    }
}
