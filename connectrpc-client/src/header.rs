//! Header names used by the supported protocols.

/// Standard content type header.
pub const CONTENT_TYPE: &str = "content-type";
/// Standard content encoding header (whole-body compression).
pub const CONTENT_ENCODING: &str = "content-encoding";
/// Standard accept encoding header.
pub const ACCEPT_ENCODING: &str = "accept-encoding";

/// Connect protocol version header.
pub const CONNECT_PROTOCOL_VERSION: &str = "connect-protocol-version";
/// Connect protocol version carried by this client.
pub const CONNECT_PROTOCOL_VERSION_VALUE: &str = "1";
/// Connect per-message compression encoding (streams).
pub const CONNECT_CONTENT_ENCODING: &str = "connect-content-encoding";
/// Connect accepted per-message compression encodings (streams).
pub const CONNECT_ACCEPT_ENCODING: &str = "connect-accept-encoding";
/// Connect timeout, in milliseconds.
pub const CONNECT_TIMEOUT_MS: &str = "connect-timeout-ms";

/// gRPC / gRPC-Web per-message compression encoding.
pub const GRPC_ENCODING: &str = "grpc-encoding";
/// gRPC / gRPC-Web accepted per-message compression encodings.
pub const GRPC_ACCEPT_ENCODING: &str = "grpc-accept-encoding";
/// gRPC status code trailer.
pub const GRPC_STATUS: &str = "grpc-status";
/// gRPC status message trailer (percent-encoded).
pub const GRPC_MESSAGE: &str = "grpc-message";
/// gRPC status details trailer (base64 `google.rpc.Status`).
pub const GRPC_STATUS_DETAILS: &str = "grpc-status-details-bin";
/// gRPC timeout header.
pub const GRPC_TIMEOUT: &str = "grpc-timeout";
/// TE header required by gRPC over HTTP/2.
pub const TE: &str = "te";

/// Prefix marking unary Connect response headers that are really trailers.
pub const CONNECT_UNARY_TRAILER_PREFIX: &str = "trailer-";
