//! Raw header multimaps.
//!
//! Some metadata arrives outside HTTP proper: the `metadata` member of the
//! Connect end-of-stream JSON and the CRLF trailer block of gRPC-Web
//! responses. Both are string multimaps that must be key-lowercased before
//! they are merged with real headers, so that lookups behave the same on
//! every transport.

use std::collections::BTreeMap;

use http::header::{HeaderMap, HeaderName, HeaderValue};

/// A string-keyed header multimap as it appears on the wire.
pub type RawHeaders = BTreeMap<String, Vec<String>>;

/// Lowercase every key, merging values when two keys collide.
///
/// Idempotent: applying it twice yields the same map. Values are never
/// modified.
pub fn lowercase_keys(raw: RawHeaders) -> RawHeaders {
    let mut out = RawHeaders::new();
    for (key, values) in raw {
        out.entry(key.to_ascii_lowercase())
            .or_default()
            .extend(values);
    }
    out
}

/// Convert a raw multimap into an [`HeaderMap`], lowercasing keys.
///
/// Entries with names or values that are not valid HTTP headers are
/// dropped.
pub fn raw_to_header_map(raw: RawHeaders) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (key, values) in lowercase_keys(raw) {
        let Ok(name) = HeaderName::from_bytes(key.as_bytes()) else {
            continue;
        };
        for value in values {
            if let Ok(value) = HeaderValue::from_str(&value) {
                map.append(name.clone(), value);
            }
        }
    }
    map
}

/// Parse a gRPC-Web trailer block: CRLF-delimited `name: value` lines.
///
/// Keys are lowercased; malformed lines are skipped.
pub fn trailers_from_block(block: &[u8]) -> HeaderMap {
    let text = String::from_utf8_lossy(block);
    let mut raw = RawHeaders::new();
    for line in text.split("\r\n") {
        let line = line.trim_end_matches('\n');
        if line.is_empty() {
            continue;
        }
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        raw.entry(name.trim().to_string())
            .or_default()
            .push(value.trim().to_string());
    }
    raw_to_header_map(raw)
}
