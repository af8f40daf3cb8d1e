//! Inbound response model.

use bytes::Bytes;
use http::HeaderMap;

use connectrpc_client_core::{Code, ConnectError};

/// Transport-level tracing details attached to a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TracingInfo {
    pub http_status: u16,
}

/// Metrics observed for a completed request, surfaced to interceptors.
#[derive(Debug, Clone, Default)]
pub struct HttpMetrics {
    pub tracing_info: Option<TracingInfo>,
}

/// A unary HTTP response as it moves through the interceptor pipeline.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    /// RPC code. Derived from the HTTP status until a protocol interceptor
    /// refines it from the response's own status fields.
    pub code: Code,
    pub headers: HeaderMap,
    pub message: Option<Bytes>,
    pub trailers: HeaderMap,
    /// Error surfaced by the transport or synthesized by an interceptor.
    /// When set, it wins over any body content.
    pub error: Option<ConnectError>,
    pub tracing_info: Option<TracingInfo>,
}

impl HttpResponse {
    /// A response representing a failure that happened before or instead of
    /// an actual HTTP exchange.
    pub fn from_error(error: ConnectError) -> Self {
        Self {
            code: error.code,
            headers: error.metadata.clone(),
            message: None,
            trailers: HeaderMap::new(),
            error: Some(error),
            tracing_info: None,
        }
    }
}

/// The outcome of a unary RPC.
///
/// Failures are carried in `result`; callers never see a bare error outside
/// this type.
#[derive(Debug, Clone)]
pub struct ResponseMessage<T> {
    pub code: Code,
    pub headers: HeaderMap,
    pub result: Result<T, ConnectError>,
    pub trailers: HeaderMap,
}

impl<T> ResponseMessage<T> {
    pub fn success(message: T, headers: HeaderMap, trailers: HeaderMap) -> Self {
        Self {
            code: Code::Ok,
            headers,
            result: Ok(message),
            trailers,
        }
    }

    pub fn failure(error: ConnectError, headers: HeaderMap, trailers: HeaderMap) -> Self {
        Self {
            code: error.code,
            headers,
            result: Err(error),
            trailers,
        }
    }

    /// Build a failed response from an error alone, exposing its metadata
    /// as headers.
    pub fn from_error(error: ConnectError) -> Self {
        let headers = error.metadata.clone();
        Self::failure(error, headers, HeaderMap::new())
    }

    pub fn message(&self) -> Option<&T> {
        self.result.as_ref().ok()
    }

    pub fn error(&self) -> Option<&ConnectError> {
        self.result.as_ref().err()
    }

    /// Replace the message, keeping code, headers, and trailers.
    pub fn map_message<U>(self, f: impl FnOnce(T) -> Result<U, ConnectError>) -> ResponseMessage<U> {
        ResponseMessage {
            code: self.code,
            headers: self.headers,
            result: self.result.and_then(f),
            trailers: self.trailers,
        }
    }
}
