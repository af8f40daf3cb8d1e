//! Outbound request model.

use http::{HeaderMap, Uri};

/// HTTP method used for an RPC.
///
/// Every RPC is a POST unless the Connect GET transform rewrites it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Post,
    Get,
}

/// Idempotency of an RPC method, as declared in its schema.
///
/// Gates the Connect GET transform: only side-effect-free methods may be
/// sent as cacheable GET requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IdempotencyLevel {
    #[default]
    Unknown,
    /// Safe to call repeatedly and cacheable.
    NoSideEffects,
    /// Repeatable, but not cacheable.
    Idempotent,
}

/// An outbound request as it moves through the interceptor pipeline.
///
/// `B` is the body representation for the current pipeline phase: a typed
/// message before serialization, `Option<Bytes>` after, `()` for stream
/// establishment.
#[derive(Debug, Clone)]
pub struct HttpRequest<B> {
    pub http_method: HttpMethod,
    pub url: Uri,
    pub headers: HeaderMap,
    pub message: B,
    /// Trailers are unused by the supported protocols but carried for
    /// transports that can send them.
    pub trailers: Option<HeaderMap>,
    pub idempotency_level: IdempotencyLevel,
}
