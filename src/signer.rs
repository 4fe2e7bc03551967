use md5::{Digest, Md5};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::Serialize;
use std::time::{SystemTime, UNIX_EPOCH};

/// Characters the backend's signing scheme leaves unescaped, on top of
/// alphanumerics: `~ ( ) * ! . ' - _` (the JavaScript `encodeURIComponent`
/// safe set plus `~` and `'`).
const SIGN_ESCAPE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'~')
    .remove(b'(')
    .remove(b')')
    .remove(b'*')
    .remove(b'!')
    .remove(b'.')
    .remove(b'\'')
    .remove(b'-')
    .remove(b'_');

/// Derives the `api-hash` header value for one outbound request.
///
/// The scheme is `md5(percent_encode("{timestamp}_{body}"))`, rendered as
/// lowercase hex. `body` must be the exact byte-for-byte string that will be
/// sent on the wire (empty when the request has no body). Pure function: the
/// same inputs always produce the same 32-character digest.
pub fn sign(timestamp: u64, body: &str) -> String {
    let raw = format!("{}_{}", timestamp, body);
    let encoded = utf8_percent_encode(&raw, SIGN_ESCAPE_SET).to_string();

    let mut hasher = Md5::new();
    hasher.update(encoded.as_bytes());
    hex::encode(hasher.finalize())
}

/// Serializes a request payload to the compact JSON form the signature is
/// computed over. `None` maps to the empty string.
pub fn payload_string<T: Serialize>(payload: Option<&T>) -> Result<String, serde_json::Error> {
    match payload {
        Some(p) => serde_json::to_string(p),
        None => Ok(String::new()),
    }
}

/// Current Unix time in whole seconds, as the backend expects in `api-time`.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sign_is_deterministic() {
        let a = sign(1700000000, "{\"data\":{}}");
        let b = sign(1700000000, "{\"data\":{}}");
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn sign_matches_known_vectors() {
        assert_eq!(sign(1700000000, ""), "9c0d4a07247e3021d6a8d0fc81ef888c");
        assert_eq!(
            sign(1700000000, "{\"data\":{}}"),
            "02e8d67dd7b9e016eda4ce66a2b74f0e"
        );
        assert_eq!(
            sign(1723456789, "{\"data\":1}"),
            "de09ba54e246963daa3032c967326369"
        );
        assert_eq!(
            sign(1700000000, "{\"data\":\"frog\"}"),
            "00fbeae04dfdf494d9570f5461b3ce7a"
        );
        assert_eq!(
            sign(1711111111, "{\"data\":{\"position\":2,\"buildingKey\":\"farm_1\"}}"),
            "cf4063f8b241a4fae03c6d88b0979a36"
        );
    }

    #[test]
    fn different_bodies_produce_different_hashes() {
        assert_ne!(sign(1700000000, "{\"data\":1}"), sign(1700000000, "{\"data\":2}"));
        assert_ne!(sign(1700000000, ""), sign(1700000001, ""));
    }

    #[test]
    fn payload_string_is_compact() {
        let body = payload_string(Some(&json!({"data": {"position": 2}}))).unwrap();
        assert_eq!(body, "{\"data\":{\"position\":2}}");

        let empty: Option<&serde_json::Value> = None;
        assert_eq!(payload_string(empty).unwrap(), "");
    }
}
