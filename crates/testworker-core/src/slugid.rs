//! Slug ids: random v4 UUIDs encoded as 22 characters of URL-safe base64.
//!
//! The queue identifies tasks, task graphs and generated worker types with
//! slugs. "Nice" slugs have the top bit of the first byte cleared, so they
//! never start with `-` and are safe to pass as command-line arguments.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use uuid::Uuid;

/// Encode an arbitrary UUID as a slug.
pub fn encode(uuid: Uuid) -> String {
    URL_SAFE_NO_PAD.encode(uuid.as_bytes())
}

/// Decode a slug back into a UUID.
pub fn decode(slug: &str) -> Option<Uuid> {
    let bytes = URL_SAFE_NO_PAD.decode(slug).ok()?;
    Uuid::from_slice(&bytes).ok()
}

/// A random slug id.
pub fn v4() -> String {
    encode(Uuid::new_v4())
}

/// A random slug id that does not start with `-`.
pub fn nice() -> String {
    let mut bytes = *Uuid::new_v4().as_bytes();
    bytes[0] &= 0x7f;
    encode(Uuid::from_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slugs_are_22_url_safe_chars() {
        for _ in 0..200 {
            let slug = v4();
            assert_eq!(slug.len(), 22);
            assert!(
                slug.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'),
                "unexpected character in {slug}"
            );
        }
    }

    #[test]
    fn nice_slugs_never_start_with_dash() {
        for _ in 0..500 {
            let slug = nice();
            // First character encodes the top six bits of a byte below 0x80.
            assert!(matches!(slug.as_bytes()[0], b'A'..=b'Z' | b'a'..=b'f'), "{slug}");
        }
    }

    #[test]
    fn decode_inverts_encode() {
        let uuid = Uuid::new_v4();
        assert_eq!(decode(&encode(uuid)), Some(uuid));
    }

    #[test]
    fn known_encoding() {
        let uuid = Uuid::parse_str("804f3fc8-dfcb-4c49-8f6f-bbb7e2ae40d3").unwrap();
        assert_eq!(encode(uuid), "gE8_yN_LTEmPb7u34q5A0w");
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(decode("not a slug").is_none());
        assert!(decode("AAAA").is_none());
    }

    #[test]
    fn ids_are_unique() {
        let ids: std::collections::HashSet<String> = (0..1000).map(|_| v4()).collect();
        assert_eq!(ids.len(), 1000);
    }
}
