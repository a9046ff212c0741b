use crate::codec::format::WireFormat;
use chrono::{DateTime, Datelike, Utc};
use uuid::Uuid;

/// Derives the object-store key for an offloaded message.
///
/// The layout is `{prefix}/{endpoint}/{YYYY}/{MM}/{DD}/{message_id}.{ext}`,
/// where the date comes from the message creation timestamp and the extension
/// matches the endpoint wire format. Consecutive slashes are collapsed, so an
/// empty prefix or a prefix with a trailing slash both produce a clean path.
pub fn derive_object_key(
    prefix: &str,
    endpoint: &str,
    created: DateTime<Utc>,
    id: Uuid,
    format: WireFormat,
) -> String {
    let raw = format!(
        "{}/{}/{:04}/{:02}/{:02}/{}",
        prefix,
        endpoint,
        created.year(),
        created.month(),
        created.day(),
        id,
    );

    let mut key = collapse_slashes(&raw);
    key.push('.');
    key.push_str(format.extension());

    key
}

/// Collapses runs of consecutive `/` into a single one and drops a leading
/// slash, which would otherwise produce an empty path segment.
fn collapse_slashes(raw: &str) -> String {
    let mut collapsed = String::with_capacity(raw.len());
    let mut previous_was_slash = true;

    for character in raw.chars() {
        if character == '/' {
            if previous_was_slash {
                continue;
            }
            previous_was_slash = true;
        } else {
            previous_was_slash = false;
        }

        collapsed.push(character);
    }

    collapsed
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    fn fixed_date() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 4, 12, 30, 0).unwrap()
    }

    fn fixed_id() -> Uuid {
        Uuid::parse_str("00000000-0000-0000-0000-0000000000aa").unwrap()
    }

    #[test]
    fn derives_full_key() {
        // Given
        let expected = "offload/e3/2024/03/04/00000000-0000-0000-0000-0000000000aa.json";

        // When
        let actual = derive_object_key("offload", "e3", fixed_date(), fixed_id(), WireFormat::Json);

        // Then
        assert_eq!(expected, actual);
    }

    #[test]
    fn extension_follows_format() {
        // Given
        let expected = "offload/e3/2024/03/04/00000000-0000-0000-0000-0000000000aa.xml";

        // When
        let actual = derive_object_key("offload", "e3", fixed_date(), fixed_id(), WireFormat::Xml);

        // Then
        assert_eq!(expected, actual);
    }

    #[test]
    fn collapses_consecutive_slashes() {
        // Given
        let expected = "bucket/sub/e3/2024/03/04/00000000-0000-0000-0000-0000000000aa.json";

        // When
        let actual = derive_object_key(
            "bucket//sub/",
            "e3",
            fixed_date(),
            fixed_id(),
            WireFormat::Json,
        );

        // Then
        assert_eq!(expected, actual);
    }

    #[test]
    fn empty_prefix_produces_no_leading_slash() {
        // Given
        let expected = "e3/2024/03/04/00000000-0000-0000-0000-0000000000aa.json";

        // When
        let actual = derive_object_key("", "e3", fixed_date(), fixed_id(), WireFormat::Json);

        // Then
        assert_eq!(expected, actual);
    }

    #[test]
    fn derivation_is_idempotent() {
        // Given
        let first = derive_object_key("p", "e", fixed_date(), fixed_id(), WireFormat::Json);

        // When
        let second = derive_object_key("p", "e", fixed_date(), fixed_id(), WireFormat::Json);

        // Then
        assert_eq!(first, second);
    }
}
