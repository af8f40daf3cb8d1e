//! RPC error types.
//!
//! [`ConnectError`] is the error surfaced to callers for every failed RPC,
//! regardless of which protocol produced it. This module also houses the
//! shared gRPC status parsing used by both the gRPC and gRPC-Web protocols
//! and the envelope-level error enum.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE_NO_PAD};
use bytes::Bytes;
use http::HeaderMap;
use prost::Message;
use serde::de::{self, Deserializer, MapAccess, Visitor};
use serde::ser::{SerializeStruct, Serializer};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::Code;

/// Prefix stripped from protobuf type URLs when rendering error details.
const TYPE_URL_PREFIX: &str = "type.googleapis.com/";

/// Trailer carrying the gRPC status code.
const GRPC_STATUS: &str = "grpc-status";
/// Trailer carrying the percent-encoded gRPC status message.
const GRPC_MESSAGE: &str = "grpc-message";
/// Trailer carrying a base64-encoded `google.rpc.Status` with details.
const GRPC_STATUS_DETAILS: &str = "grpc-status-details-bin";

/// Error returned for any failed RPC.
///
/// Carries the RPC status code, an optional human-readable message, typed
/// error details, and any metadata (headers/trailers) associated with the
/// failure. Local failures additionally carry the underlying `source` error.
#[derive(Debug, Clone)]
pub struct ConnectError {
    pub code: Code,
    pub message: Option<String>,
    pub details: Vec<ErrorDetail>,
    pub metadata: HeaderMap,
    source: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl ConnectError {
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: Some(message.into()),
            details: Vec::new(),
            metadata: HeaderMap::new(),
            source: None,
        }
    }

    pub fn from_code(code: Code) -> Self {
        Self {
            code,
            message: None,
            details: Vec::new(),
            metadata: HeaderMap::new(),
            source: None,
        }
    }

    pub fn canceled() -> Self {
        Self::from_code(Code::Canceled)
    }

    /// Wrap a local failure, attaching the underlying error as the source.
    pub fn wrapping(
        code: Code,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            code,
            message: Some(message.into()),
            details: Vec::new(),
            metadata: HeaderMap::new(),
            source: Some(Arc::new(source)),
        }
    }

    pub fn with_metadata(mut self, metadata: HeaderMap) -> Self {
        self.metadata = metadata;
        self
    }

    /// Parse the Connect unary error body: `{"code", "message", "details"}`.
    ///
    /// `code_hint` (derived from the HTTP status) is used when the body is
    /// missing, malformed, or names no code of its own. `headers` become the
    /// error's metadata.
    pub fn from_response_body(code_hint: Code, headers: &HeaderMap, body: &[u8]) -> Self {
        let parsed: Option<ErrorBody> = serde_json::from_slice(body).ok();
        match parsed {
            Some(body) => {
                let code = body
                    .code
                    .as_deref()
                    .and_then(|name| Code::from_str(name).ok())
                    .unwrap_or(code_hint);
                Self {
                    code,
                    message: body.message,
                    details: body.details.unwrap_or_default(),
                    metadata: headers.clone(),
                    source: None,
                }
            }
            None => Self::from_code(code_hint).with_metadata(headers.clone()),
        }
    }
}

impl fmt::Display for ConnectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(message) => write!(f, "{}: {}", self.code, message),
            None => write!(f, "{}", self.code),
        }
    }
}

impl std::error::Error for ConnectError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|err| err.as_ref() as &(dyn std::error::Error + 'static))
    }
}

/// Wire shape of a Connect error, shared by unary error bodies and the
/// `error` member of streaming end-of-stream JSON.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ErrorBody {
    pub code: Option<String>,
    pub message: Option<String>,
    pub details: Option<Vec<ErrorDetail>>,
}

impl ErrorBody {
    /// Convert into a [`ConnectError`], defaulting the code to `unknown`
    /// when the body names none.
    pub fn into_error(self) -> ConnectError {
        let code = self
            .code
            .as_deref()
            .and_then(|name| Code::from_str(name).ok())
            .unwrap_or(Code::Unknown);
        ConnectError {
            code,
            message: self.message,
            details: self.details.unwrap_or_default(),
            metadata: HeaderMap::new(),
            source: None,
        }
    }
}

/// A typed error detail: a protobuf `Any` rendered for the Connect protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorDetail {
    /// Fully qualified type name, without the `type.googleapis.com/` prefix.
    pub type_name: String,
    /// Serialized protobuf payload.
    pub value: Bytes,
}

impl ErrorDetail {
    pub fn new(type_name: impl Into<String>, value: impl Into<Bytes>) -> Self {
        let mut type_name = type_name.into();
        if let Some(stripped) = type_name.strip_prefix(TYPE_URL_PREFIX) {
            type_name = stripped.to_string();
        }
        Self {
            type_name,
            value: value.into(),
        }
    }

    /// Decode the detail as `M` when the type name matches, `None` otherwise.
    pub fn decode<M>(&self) -> Option<M>
    where
        M: prost::Message + prost::Name + Default,
    {
        if self.type_name != M::full_name() {
            return None;
        }
        M::decode(self.value.as_ref()).ok()
    }
}

impl Serialize for ErrorDetail {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("ErrorDetail", 2)?;
        state.serialize_field("type", &self.type_name)?;
        state.serialize_field("value", &STANDARD_NO_PAD.encode(&self.value))?;
        state.end()
    }
}

impl<'de> Deserialize<'de> for ErrorDetail {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct DetailVisitor;

        impl<'de> Visitor<'de> for DetailVisitor {
            type Value = ErrorDetail;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("an error detail with `type` and `value` fields")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
                let mut type_name: Option<String> = None;
                let mut value: Option<String> = None;
                while let Some(key) = map.next_key::<String>()? {
                    match key.as_str() {
                        "type" => type_name = Some(map.next_value()?),
                        "value" => value = Some(map.next_value()?),
                        _ => {
                            let _: de::IgnoredAny = map.next_value()?;
                        }
                    }
                }
                let type_name = type_name.unwrap_or_default();
                let bytes = match value {
                    Some(encoded) => decode_base64_lenient(&encoded)
                        .ok_or_else(|| de::Error::custom("invalid base64 in detail value"))?,
                    None => Vec::new(),
                };
                Ok(ErrorDetail::new(type_name, bytes))
            }
        }

        deserializer.deserialize_map(DetailVisitor)
    }
}

/// Decode base64 accepting both padded and unpadded input, standard or
/// URL-safe alphabets.
pub fn decode_base64_lenient(input: &str) -> Option<Vec<u8>> {
    STANDARD_NO_PAD
        .decode(input)
        .or_else(|_| STANDARD.decode(input))
        .or_else(|_| URL_SAFE_NO_PAD.decode(input))
        .ok()
}

/// `google.rpc.Status` as carried by `grpc-status-details-bin`.
#[derive(Clone, PartialEq, prost::Message)]
struct GrpcStatusProto {
    #[prost(int32, tag = "1")]
    code: i32,
    #[prost(string, tag = "2")]
    message: String,
    #[prost(message, repeated, tag = "3")]
    details: Vec<prost_types::Any>,
}

/// Outcome of parsing gRPC response metadata for a status.
#[derive(Debug, Clone)]
pub struct GrpcStatus {
    pub code: Code,
    pub error: Option<ConnectError>,
}

/// Derive the RPC status from gRPC headers and trailers.
///
/// The `grpc-status` trailer wins; headers act as a fallback for
/// trailers-only and headers-only responses. When neither carries a status
/// the response is treated as a unary response with no message, which the
/// protocol defines as `unimplemented`.
pub fn parse_grpc_status(headers: &HeaderMap, trailers: &HeaderMap) -> GrpcStatus {
    let (status, source) = match header_i32(trailers, GRPC_STATUS) {
        Some(status) => (status, trailers),
        None => match header_i32(headers, GRPC_STATUS) {
            Some(status) => (status, headers),
            None => {
                return GrpcStatus {
                    code: Code::Unimplemented,
                    error: Some(ConnectError::new(
                        Code::Unimplemented,
                        "unary response has no message",
                    )),
                };
            }
        },
    };

    let code = Code::from_i32(status);
    if code == Code::Ok {
        return GrpcStatus { code, error: None };
    }

    let message = source
        .get(GRPC_MESSAGE)
        .and_then(|value| value.to_str().ok())
        .map(grpc_percent_decode);
    let details = source
        .get(GRPC_STATUS_DETAILS)
        .and_then(|value| value.to_str().ok())
        .and_then(decode_base64_lenient)
        .and_then(|bytes| GrpcStatusProto::decode(bytes.as_slice()).ok())
        .map(|status| {
            status
                .details
                .into_iter()
                .map(|any| ErrorDetail::new(any.type_url, any.value))
                .collect()
        })
        .unwrap_or_default();

    let mut metadata = headers.clone();
    for (name, value) in trailers {
        metadata.append(name.clone(), value.clone());
    }

    GrpcStatus {
        code,
        error: Some(ConnectError {
            code,
            message,
            details,
            metadata,
            source: None,
        }),
    }
}

fn header_i32(map: &HeaderMap, name: &str) -> Option<i32> {
    map.get(name)?.to_str().ok()?.trim().parse().ok()
}

/// Decode the percent-encoding gRPC applies to `grpc-message`.
///
/// Invalid escape sequences are preserved verbatim; gRPC requires
/// implementations to tolerate them.
pub fn grpc_percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let Ok(hex) = std::str::from_utf8(&bytes[i + 1..i + 3]) {
                if let Ok(byte) = u8::from_str_radix(hex, 16) {
                    out.push(byte);
                    i += 3;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Errors arising from envelope framing.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    /// A frame arrived with the compressed bit set but no codec is
    /// configured that could decompress it.
    #[error("compressed envelope received but no matching compression codec is configured")]
    MissingExpectedCompressionPool,

    #[error("failed to decompress envelope payload: {0}")]
    Decompress(String),

    #[error("failed to compress envelope payload: {0}")]
    Compress(String),

    /// A frame shorter than the 5-byte envelope header.
    #[error("envelope frame is shorter than its header")]
    TruncatedFrame,
}

impl From<EnvelopeError> for ConnectError {
    fn from(err: EnvelopeError) -> Self {
        ConnectError::wrapping(Code::Internal, err.to_string(), err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    #[test]
    fn test_error_body_full() {
        let body = br#"{
            "code": "resource_exhausted",
            "message": "quota exceeded",
            "details": [{"type": "google.rpc.RetryInfo", "value": "CgIIZA"}]
        }"#;
        let err = ConnectError::from_response_body(Code::Unavailable, &HeaderMap::new(), body);
        assert_eq!(err.code, Code::ResourceExhausted);
        assert_eq!(err.message.as_deref(), Some("quota exceeded"));
        assert_eq!(err.details.len(), 1);
        assert_eq!(err.details[0].type_name, "google.rpc.RetryInfo");
        assert!(!err.details[0].value.is_empty());
    }

    #[test]
    fn test_error_body_padded_detail_value() {
        let unpadded: ErrorDetail =
            serde_json::from_str(r#"{"type": "t.T", "value": "aGVsbG8"}"#).unwrap();
        let padded: ErrorDetail =
            serde_json::from_str(r#"{"type": "t.T", "value": "aGVsbG8="}"#).unwrap();
        assert_eq!(unpadded.value, padded.value);
        assert_eq!(unpadded.value.as_ref(), b"hello");
    }

    #[test]
    fn test_error_body_malformed_falls_back_to_hint() {
        let err =
            ConnectError::from_response_body(Code::Unavailable, &HeaderMap::new(), b"not json");
        assert_eq!(err.code, Code::Unavailable);
        assert!(err.message.is_none());
    }

    #[test]
    fn test_detail_type_prefix_stripped() {
        let detail = ErrorDetail::new("type.googleapis.com/google.rpc.RetryInfo", Bytes::new());
        assert_eq!(detail.type_name, "google.rpc.RetryInfo");

        let json = serde_json::to_string(&ErrorDetail::new("t.T", &b"hi"[..])).unwrap();
        assert_eq!(json, r#"{"type":"t.T","value":"aGk"}"#);
    }

    #[test]
    fn test_grpc_status_from_trailers() {
        let headers = HeaderMap::new();
        let mut trailers = HeaderMap::new();
        trailers.insert(GRPC_STATUS, HeaderValue::from_static("7"));
        trailers.insert(
            GRPC_MESSAGE,
            HeaderValue::from_static("access%20denied%3A%20nope"),
        );
        let status = parse_grpc_status(&headers, &trailers);
        assert_eq!(status.code, Code::PermissionDenied);
        let err = status.error.unwrap();
        assert_eq!(err.message.as_deref(), Some("access denied: nope"));
    }

    #[test]
    fn test_grpc_status_headers_fallback() {
        let mut headers = HeaderMap::new();
        headers.insert(GRPC_STATUS, HeaderValue::from_static("0"));
        let status = parse_grpc_status(&headers, &HeaderMap::new());
        assert_eq!(status.code, Code::Ok);
        assert!(status.error.is_none());
    }

    #[test]
    fn test_grpc_status_missing_is_unimplemented() {
        let status = parse_grpc_status(&HeaderMap::new(), &HeaderMap::new());
        assert_eq!(status.code, Code::Unimplemented);
        assert_eq!(
            status.error.unwrap().message.as_deref(),
            Some("unary response has no message")
        );
    }

    #[test]
    fn test_grpc_status_details_bin() {
        let proto = GrpcStatusProto {
            code: 3,
            message: "bad field".into(),
            details: vec![prost_types::Any {
                type_url: "type.googleapis.com/google.rpc.BadRequest".into(),
                value: vec![1, 2, 3],
            }],
        };
        let encoded = STANDARD_NO_PAD.encode(prost::Message::encode_to_vec(&proto));
        let mut trailers = HeaderMap::new();
        trailers.insert(GRPC_STATUS, HeaderValue::from_static("3"));
        trailers.insert(GRPC_STATUS_DETAILS, HeaderValue::from_str(&encoded).unwrap());

        let status = parse_grpc_status(&HeaderMap::new(), &trailers);
        let err = status.error.unwrap();
        assert_eq!(err.details.len(), 1);
        assert_eq!(err.details[0].type_name, "google.rpc.BadRequest");
        assert_eq!(err.details[0].value.as_ref(), &[1, 2, 3]);
    }

    #[test]
    fn test_percent_decode_invalid_sequence_preserved() {
        assert_eq!(grpc_percent_decode("50%25 %zz"), "50% %zz");
    }

    #[test]
    fn test_envelope_error_maps_to_internal() {
        let err: ConnectError = EnvelopeError::MissingExpectedCompressionPool.into();
        assert_eq!(err.code, Code::Internal);
        assert!(std::error::Error::source(&err).is_some());
    }
}
