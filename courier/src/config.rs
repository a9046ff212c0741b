use crate::crypto::EncryptionConfig;
use crate::endpoint::{Endpoint, EndpointSet};
use crate::store::ObjectStoreConfig;
use serde::Deserialize;

/// The application-level configuration section covering everything this
/// library needs:
///
/// - a default [`Endpoint`] definition,
/// - extra named endpoints,
/// - a process-wide default [`EncryptionConfig`],
/// - a process-wide default [`ObjectStoreConfig`].
///
/// A host loads this section from its own configuration source and feeds it
/// to [`Hub::from_config`](crate::Hub::from_config).
#[derive(Debug, Default, Clone, PartialEq, Deserialize)]
pub struct CourierConfig {
    #[serde(default, alias = "default")]
    default_endpoint: Option<Endpoint>,
    #[serde(default, alias = "extra", alias = "extras")]
    endpoints: EndpointSet,
    #[serde(default)]
    encryption: Option<EncryptionConfig>,
    #[serde(default, alias = "store")]
    object_store: Option<ObjectStoreConfig>,
}

impl CourierConfig {
    /// Exposes the default endpoint definition, if one is configured.
    pub fn default_endpoint(&self) -> Option<&Endpoint> {
        self.default_endpoint.as_ref()
    }

    /// Exposes the extra named endpoints.
    pub fn endpoints(&self) -> &EndpointSet {
        &self.endpoints
    }

    /// Exposes the process-wide default encryption configuration, if any.
    pub fn encryption(&self) -> Option<&EncryptionConfig> {
        self.encryption.as_ref()
    }

    /// Exposes the process-wide default object-store configuration, if any.
    pub fn object_store(&self) -> Option<&ObjectStoreConfig> {
        self.object_store.as_ref()
    }

    /// Consumes this configuration and returns its parts, in declaration
    /// order.
    pub(crate) fn into_parts(
        self,
    ) -> (
        Option<Endpoint>,
        EndpointSet,
        Option<EncryptionConfig>,
        Option<ObjectStoreConfig>,
    ) {
        (
            self.default_endpoint,
            self.endpoints,
            self.encryption,
            self.object_store,
        )
    }
}

impl AsRef<CourierConfig> for CourierConfig {
    fn as_ref(&self) -> &CourierConfig {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn empty() {
        // Given
        let input = "{}";
        let expected = CourierConfig::default();

        // When
        let actual = serde_yml::from_str::<CourierConfig>(input).unwrap();

        // Then
        assert_eq!(expected, actual);
    }

    #[test]
    fn full() {
        // Given
        let input = r#"
default:
  queue: orders
  host: broker.internal
endpoints:
  billing:
    queue: billing-inbox
    encryption:
      secret: per-endpoint-secret
encryption:
  secret: process-wide-secret
  passes: 2
object_store:
  bucket: payloads
  prefix: offload
"#;

        // When
        let config = serde_yml::from_str::<CourierConfig>(input).unwrap();

        // Then
        let default = config.default_endpoint().unwrap();
        assert_eq!("orders", default.queue());
        assert!(default.identifier().contains("broker.internal"));

        assert_eq!(1, config.endpoints().len());
        let billing = config.endpoints().iter().next().unwrap();
        assert_eq!("billing", billing.name());
        assert_eq!("billing-inbox", billing.queue());
        assert!(billing.encryption().is_some());

        assert_eq!(2, config.encryption().unwrap().passes());
        assert_eq!("payloads", config.object_store().unwrap().bucket());
        assert_eq!("offload", config.object_store().unwrap().prefix());
    }

    #[test]
    fn aliases_are_accepted() {
        // Given
        let input = r#"
extra:
  orders: {}
store:
  bucket: payloads
"#;

        // When
        let config = serde_yml::from_str::<CourierConfig>(input).unwrap();

        // Then
        assert_eq!(1, config.endpoints().len());
        assert_eq!("payloads", config.object_store().unwrap().bucket());
    }
}
