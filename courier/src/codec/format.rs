use serde::Serialize;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use thiserror::Error;

/// Names the serialization format used on the wire and at rest for a single
/// endpoint.
///
/// Both formats carry the same logical envelope fields; a JSON consumer and an
/// XML consumer see the same message, differently spelled.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum WireFormat {
    /// JSON, via `serde_json`. The default.
    #[default]
    Json,
    /// XML, via `quick-xml`.
    Xml,
}

/// Represents a failure to encode or decode a message body.
#[derive(Error, Debug)]
pub enum CodecError {
    /// JSON encoding or decoding failed.
    #[error("failed to process a JSON body: {0}")]
    Json(#[from] serde_json::Error),
    /// XML encoding failed.
    #[error("failed to encode an XML body: {0}")]
    XmlEncode(String),
    /// XML decoding failed.
    #[error("failed to decode an XML body: {0}")]
    XmlDecode(String),
    /// The body bytes are not valid UTF-8 (relevant for XML bodies only).
    #[error("the body bytes are not valid UTF-8")]
    NotUtf8,
}

impl WireFormat {
    /// Reports the AMQP `content-type` property value for this format.
    pub const fn content_type(&self) -> &'static str {
        match self {
            WireFormat::Json => "application/json",
            WireFormat::Xml => "application/xml",
        }
    }

    /// Reports the object-key extension for this format (without the dot).
    pub const fn extension(&self) -> &'static str {
        match self {
            WireFormat::Json => "json",
            WireFormat::Xml => "xml",
        }
    }

    /// Encodes the given value into body bytes. The `root` names the document
    /// element for XML; JSON ignores it.
    pub(crate) fn encode<T>(&self, root: &str, value: &T) -> Result<Vec<u8>, CodecError>
    where
        T: Serialize,
    {
        match self {
            WireFormat::Json => Ok(serde_json::to_vec(value)?),
            WireFormat::Xml => {
                let text = quick_xml::se::to_string_with_root(root, value)
                    .map_err(|error| CodecError::XmlEncode(error.to_string()))?;

                Ok(text.into_bytes())
            }
        }
    }

    /// Decodes the given body bytes into a value of type `T`.
    pub(crate) fn decode<T>(&self, bytes: &[u8]) -> Result<T, CodecError>
    where
        T: DeserializeOwned,
    {
        match self {
            WireFormat::Json => Ok(serde_json::from_slice(bytes)?),
            WireFormat::Xml => {
                let text = std::str::from_utf8(bytes).map_err(|_| CodecError::NotUtf8)?;

                quick_xml::de::from_str(text).map_err(|error| CodecError::XmlDecode(error.to_string()))
            }
        }
    }
}

/// Accepts the format names case-insensitively (`json`, `JSON`, `Xml`, and so on).
impl<'de> Deserialize<'de> for WireFormat {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;

        match raw.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(WireFormat::Json),
            "xml" => Ok(WireFormat::Xml),
            other => Err(serde::de::Error::custom(format!(
                "unrecognized wire format '{}' (expected 'json' or 'xml')",
                other,
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        text: String,
        count: u32,
    }

    #[test]
    fn json_round_trip() {
        // Given
        let format = WireFormat::Json;
        let input = Sample {
            text: "hello".to_string(),
            count: 3,
        };

        // When
        let bytes = format.encode("sample", &input).unwrap();
        let output = format.decode::<Sample>(&bytes).unwrap();

        // Then
        assert_eq!(input, output);
    }

    #[test]
    fn xml_round_trip() {
        // Given
        let format = WireFormat::Xml;
        let input = Sample {
            text: "hello".to_string(),
            count: 3,
        };

        // When
        let bytes = format.encode("sample", &input).unwrap();
        let output = format.decode::<Sample>(&bytes).unwrap();

        // Then
        assert_eq!(input, output);
    }

    #[test]
    fn content_types_and_extensions() {
        assert_eq!(WireFormat::Json.content_type(), "application/json");
        assert_eq!(WireFormat::Xml.content_type(), "application/xml");
        assert_eq!(WireFormat::Json.extension(), "json");
        assert_eq!(WireFormat::Xml.extension(), "xml");
    }

    #[test]
    fn deserialize_case_insensitively() {
        // Given
        let inputs = ["json", "JSON", "Xml", "xml"];
        let expected = [
            WireFormat::Json,
            WireFormat::Json,
            WireFormat::Xml,
            WireFormat::Xml,
        ];

        // When / Then
        for (input, expected) in inputs.iter().zip(expected) {
            let actual: WireFormat =
                serde_yml::from_str(input).expect("recognized format name");
            assert_eq!(expected, actual);
        }
    }

    #[test]
    fn deserialize_rejects_unknown_format() {
        // Given
        let input = "yaml";

        // When
        let result = serde_yml::from_str::<WireFormat>(input);

        // Then
        assert!(result.is_err());
    }
}
