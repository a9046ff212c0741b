//! Hermetic suites over the public surface: configuration composition and
//! the guards around pre-encrypted values. No broker or store is contacted.

#[cfg(test)]
mod tests {
    use courier::{
        Cipher, CourierConfig, Endpoint, EndpointError, EncryptionConfig, Hub,
        ObjectStoreConfig, PublishError, WireFormat, derive_object_key,
    };
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn publish_sealed_rejects_a_non_hash() {
        // Given
        let hub = Hub::new();
        hub.register_default_endpoint(
            Endpoint::builder()
                .with_name("orders")
                .with_encryption(EncryptionConfig::new("secret"))
                .build()
                .unwrap(),
        );

        // When
        let result = hub
            .default_route()
            .unwrap()
            .publish_sealed("not a portable hash")
            .await;

        // Then
        assert!(matches!(
            result,
            Err(PublishError::Endpoint(EndpointError::NotSealed)),
        ));
    }

    #[tokio::test]
    async fn publish_sealed_requires_an_encryption_configuration() {
        // Given
        let hub = Hub::new();
        hub.register_default_endpoint(Endpoint::builder().with_name("orders").build().unwrap());
        let sealed = Cipher::new(&EncryptionConfig::new("secret"))
            .seal(b"payload")
            .unwrap();

        // When
        let result = hub.default_route().unwrap().publish_sealed(sealed).await;

        // Then
        assert!(matches!(
            result,
            Err(PublishError::Endpoint(EndpointError::SealedWithoutEncryption)),
        ));
    }

    #[test]
    fn config_section_feeds_a_working_hub() {
        // Given
        let config: CourierConfig = serde_json::from_value(serde_json::json!({
            "default": { "queue": "orders" },
            "endpoints": {
                "billing": { "queue": "billing-inbox", "format": "xml" }
            },
            "encryption": { "secret": "process-wide", "passes": 3 },
            "object_store": { "bucket": "payloads", "prefix": "offload" }
        }))
        .unwrap();

        // When
        let hub = Hub::from_config(config);

        // Then
        let billing = hub.route("billing").unwrap();
        assert_eq!("billing-inbox", billing.endpoint().queue());
        assert_eq!(WireFormat::Xml, billing.endpoint().format());
        assert!(hub.default_route().is_ok());
        assert!(matches!(hub.route("nowhere"), Err(EndpointError::Unknown(_))));
    }

    #[test]
    fn object_keys_are_deterministic_and_collapsed() {
        // Given
        let config = ObjectStoreConfig::new("payloads").with_prefix("offload//nested/");
        let id: courier::Uuid = "00000000-0000-0000-0000-0000000000aa".parse().unwrap();
        let created: chrono::DateTime<chrono::Utc> = "2024-03-04T00:00:00Z".parse().unwrap();

        // When
        let key = derive_object_key(config.prefix(), "e3", created, id, WireFormat::Json);

        // Then
        assert_eq!(
            "offload/nested/e3/2024/03/04/00000000-0000-0000-0000-0000000000aa.json",
            key,
        );
    }
}
