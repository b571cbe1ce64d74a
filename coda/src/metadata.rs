//! Custom call metadata: ASCII and binary key/value pairs exchanged in the
//! leading and trailing header blocks of a stream.
//!
//! Binary values use keys suffixed `-bin` and are base64-encoded on the wire
//! (unpadded when encoding; padded input is accepted when decoding).

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use base64::Engine as _;
use bytes::Bytes;
use http::header::{HeaderMap, HeaderName, HeaderValue};
use tracing::debug;

const BIN_SUFFIX: &str = "-bin";

/// Header names that belong to the protocol itself and are never surfaced as
/// (or accepted from) application metadata.
const RESERVED_HEADERS: &[&str] = &[
    "te",
    "content-type",
    "user-agent",
    "grpc-status",
    "grpc-message",
    "grpc-timeout",
    "grpc-encoding",
    "grpc-accept-encoding",
];

fn is_reserved(name: &str) -> bool {
    name.starts_with(':') || name.starts_with("grpc-") || RESERVED_HEADERS.contains(&name)
}

/// An ordered multimap of call metadata.
#[derive(Clone, Default)]
pub struct Metadata {
    headers: HeaderMap,
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.headers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    /// Appends an ASCII value. The key must be lowercase and must not end in
    /// `-bin`; the value must be a visible-ASCII string.
    pub fn append(&mut self, key: &str, value: &str) -> Result<(), InvalidMetadata> {
        if key.ends_with(BIN_SUFFIX) {
            return Err(InvalidMetadata::BinarySuffixOnAsciiKey);
        }
        let name = HeaderName::from_str(key).map_err(|_| InvalidMetadata::InvalidKey)?;
        let value = HeaderValue::from_str(value).map_err(|_| InvalidMetadata::InvalidValue)?;
        self.headers.append(name, value);
        Ok(())
    }

    /// Appends a binary value under a `-bin` key.
    pub fn append_bin(&mut self, key: &str, value: impl AsRef<[u8]>) -> Result<(), InvalidMetadata> {
        if !key.ends_with(BIN_SUFFIX) {
            return Err(InvalidMetadata::MissingBinarySuffix);
        }
        let name = HeaderName::from_str(key).map_err(|_| InvalidMetadata::InvalidKey)?;
        let encoded = STANDARD_NO_PAD.encode(value.as_ref());
        let value =
            HeaderValue::from_str(&encoded).map_err(|_| InvalidMetadata::InvalidValue)?;
        self.headers.append(name, value);
        Ok(())
    }

    /// Returns the first ASCII value for `key`, if any.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.headers.get(key).and_then(|v| v.to_str().ok())
    }

    /// Returns all ASCII values for `key`.
    pub fn get_all(&self, key: &str) -> Vec<&str> {
        self.headers
            .get_all(key)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect()
    }

    /// Returns the first binary value for a `-bin` key, base64-decoded.
    pub fn get_bin(&self, key: &str) -> Option<Bytes> {
        let value = self.headers.get(key)?;
        decode_bin(value.as_bytes())
    }

    /// Iterate over `(key, value)` pairs; binary values are yielded in their
    /// base64 wire form.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.headers
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_bytes()))
    }

    /// Appends every entry of `other` onto `self`.
    pub fn merge(&mut self, other: Metadata) {
        for (name, value) in other.headers {
            if let Some(name) = name {
                self.headers.append(name, value);
            }
        }
    }

    /// Copies these entries into an outgoing `HeaderMap`, skipping anything
    /// that would collide with reserved protocol headers.
    pub(crate) fn fill_headers(&self, out: &mut HeaderMap) {
        for (name, value) in self.headers.iter() {
            if is_reserved(name.as_str()) {
                debug!(key = name.as_str(), "dropping reserved metadata key");
                continue;
            }
            out.append(name.clone(), value.clone());
        }
    }

    /// Builds metadata from an incoming `HeaderMap`, skipping reserved
    /// protocol headers.
    pub(crate) fn from_headers(map: &HeaderMap) -> Metadata {
        let mut headers = HeaderMap::with_capacity(map.len());
        for (name, value) in map.iter() {
            if is_reserved(name.as_str()) {
                continue;
            }
            headers.append(name.clone(), value.clone());
        }
        Metadata { headers }
    }
}

fn decode_bin(wire: &[u8]) -> Option<Bytes> {
    // Unpadded is the canonical form; tolerate padded producers.
    STANDARD_NO_PAD
        .decode(wire)
        .or_else(|_| STANDARD.decode(wire))
        .ok()
        .map(Bytes::from)
}

impl fmt::Debug for Metadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.headers.iter().map(|(k, v)| (k.as_str(), v)))
            .finish()
    }
}

/// Error returned when a metadata key or value is not representable.
#[derive(Debug, PartialEq, Eq)]
pub enum InvalidMetadata {
    InvalidKey,
    InvalidValue,
    BinarySuffixOnAsciiKey,
    MissingBinarySuffix,
}

impl fmt::Display for InvalidMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            InvalidMetadata::InvalidKey => "invalid metadata key",
            InvalidMetadata::InvalidValue => "invalid metadata value",
            InvalidMetadata::BinarySuffixOnAsciiKey => "ascii metadata key ends in -bin",
            InvalidMetadata::MissingBinarySuffix => "binary metadata key must end in -bin",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for InvalidMetadata {}

// ===== grpc-timeout =====

/// Encodes a deadline-relative timeout as a `grpc-timeout` header value,
/// using the largest unit that still fits in the protocol's eight-digit
/// budget.
pub(crate) fn encode_timeout(timeout: Duration) -> String {
    const MAX_DIGITS: u128 = 99_999_999;
    let nanos = timeout.as_nanos();
    if nanos <= MAX_DIGITS {
        format!("{nanos}n")
    } else if nanos <= MAX_DIGITS * 1_000 {
        format!("{}u", nanos / 1_000)
    } else if nanos <= MAX_DIGITS * 1_000_000 {
        format!("{}m", nanos / 1_000_000)
    } else if nanos <= MAX_DIGITS * 1_000_000_000 {
        format!("{}S", nanos / 1_000_000_000)
    } else if nanos <= MAX_DIGITS * 60 * 1_000_000_000 {
        format!("{}M", nanos / (60 * 1_000_000_000))
    } else {
        let hours = (nanos / (3_600 * 1_000_000_000)).min(MAX_DIGITS);
        format!("{hours}H")
    }
}

/// Parses a `grpc-timeout` header value.
pub(crate) fn decode_timeout(value: &str) -> Option<Duration> {
    if value.len() < 2 || value.len() > 9 {
        return None;
    }
    let (digits, unit) = value.split_at(value.len() - 1);
    let n: u64 = digits.parse().ok()?;
    let duration = match unit {
        "n" => Duration::from_nanos(n),
        "u" => Duration::from_micros(n),
        "m" => Duration::from_millis(n),
        "S" => Duration::from_secs(n),
        "M" => Duration::from_secs(n.checked_mul(60)?),
        "H" => Duration::from_secs(n.checked_mul(3_600)?),
        _ => return None,
    };
    Some(duration)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ascii_round_trip() {
        let mut md = Metadata::new();
        md.append("x-request-id", "abc123").unwrap();
        md.append("x-request-id", "def456").unwrap();
        assert_eq!(md.get("x-request-id"), Some("abc123"));
        assert_eq!(md.get_all("x-request-id"), vec!["abc123", "def456"]);
    }

    #[test]
    fn binary_round_trip() {
        let mut md = Metadata::new();
        md.append_bin("trace-proto-bin", [0u8, 159, 146, 150]).unwrap();
        assert_eq!(
            md.get_bin("trace-proto-bin").unwrap().as_ref(),
            &[0u8, 159, 146, 150]
        );
    }

    #[test]
    fn binary_accepts_padded_input() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "blob-bin",
            HeaderValue::from_str(&STANDARD.encode(b"hi")).unwrap(),
        );
        let md = Metadata::from_headers(&headers);
        assert_eq!(md.get_bin("blob-bin").unwrap().as_ref(), b"hi");
    }

    #[test]
    fn suffix_rules() {
        let mut md = Metadata::new();
        assert_eq!(
            md.append("bad-bin", "x").unwrap_err(),
            InvalidMetadata::BinarySuffixOnAsciiKey
        );
        assert_eq!(
            md.append_bin("bad", b"x").unwrap_err(),
            InvalidMetadata::MissingBinarySuffix
        );
    }

    #[test]
    fn reserved_headers_are_filtered() {
        let mut headers = HeaderMap::new();
        headers.insert("grpc-status", HeaderValue::from_static("0"));
        headers.insert("te", HeaderValue::from_static("trailers"));
        headers.insert("x-app", HeaderValue::from_static("yes"));
        let md = Metadata::from_headers(&headers);
        assert_eq!(md.len(), 1);
        assert_eq!(md.get("x-app"), Some("yes"));
    }

    #[test]
    fn timeout_encode_picks_unit() {
        assert_eq!(encode_timeout(Duration::from_nanos(1)), "1n");
        assert_eq!(encode_timeout(Duration::from_millis(500)), "500000u");
        assert_eq!(encode_timeout(Duration::from_secs(100)), "100000m");
        assert_eq!(encode_timeout(Duration::from_secs(90_000_000)), "90000000S");
        assert_eq!(
            encode_timeout(Duration::from_secs(100_000_000)),
            "1666666M"
        );
    }

    #[test]
    fn timeout_decode_all_units() {
        assert_eq!(decode_timeout("7n"), Some(Duration::from_nanos(7)));
        assert_eq!(decode_timeout("7u"), Some(Duration::from_micros(7)));
        assert_eq!(decode_timeout("7m"), Some(Duration::from_millis(7)));
        assert_eq!(decode_timeout("7S"), Some(Duration::from_secs(7)));
        assert_eq!(decode_timeout("2M"), Some(Duration::from_secs(120)));
        assert_eq!(decode_timeout("1H"), Some(Duration::from_secs(3600)));
        assert_eq!(decode_timeout("H"), None);
        assert_eq!(decode_timeout("123456789S"), None);
        assert_eq!(decode_timeout("5x"), None);
    }

    #[test]
    fn timeout_round_trip() {
        for d in [
            Duration::from_nanos(12),
            Duration::from_millis(500),
            Duration::from_secs(3),
        ] {
            let parsed = decode_timeout(&encode_timeout(d)).unwrap();
            assert!(parsed <= d);
            assert!(d - parsed < Duration::from_millis(1));
        }
    }
}
