//! Client configuration.

use std::sync::Arc;
use std::time::Duration;

use http::Uri;

use connectrpc_client_core::{
    BoxedCodec, Code, ConnectError, Encoding, RequestCompression,
};

use crate::chain::InterceptorChain;
use crate::interceptor::{InterceptorFactory, StreamInterceptor, UnaryInterceptor};
use crate::protocol::{self, NetworkProtocol};

/// When to send eligible unary calls as HTTP GET (Connect protocol only).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnaryGet {
    #[default]
    Disabled,
    /// Use GET when the serialized payload is at most this many bytes.
    WithinLimit(usize),
    Always,
}

/// What to do when a stream's response can no longer be decoded
/// (malformed end-of-stream JSON, broken frame) while the transport stream
/// is still open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamFailurePolicy {
    /// Emit a terminal result with code `unknown` and leave the transport
    /// stream to close on its own.
    #[default]
    CompleteWithUnknown,
    /// Emit the terminal result and also cancel the transport stream.
    CancelStream,
}

/// Configuration shared by every call a client makes.
#[derive(Clone)]
pub struct ProtocolClientConfig {
    pub host: String,
    pub protocol: NetworkProtocol,
    pub encoding: Encoding,
    /// Outbound compression. `None` sends everything uncompressed.
    pub request_compression: Option<RequestCompression>,
    /// Codecs accepted for inbound payloads. The first is the preferred
    /// encoding advertised to the server; lookup is by codec name.
    pub response_compression_pools: Vec<BoxedCodec>,
    /// Deadline communicated to the server via the protocol's timeout
    /// header. Enforcement is the transport's job.
    pub default_timeout: Option<Duration>,
    pub unary_get: UnaryGet,
    pub stream_failure: StreamFailurePolicy,
    interceptors: Vec<Arc<dyn InterceptorFactory>>,
}

impl ProtocolClientConfig {
    pub fn builder(host: impl Into<String>) -> ProtocolClientConfigBuilder {
        ProtocolClientConfigBuilder {
            host: host.into(),
            protocol: NetworkProtocol::Connect,
            encoding: Encoding::Proto,
            request_compression: None,
            response_compression_pools: Vec::new(),
            default_timeout: None,
            unary_get: UnaryGet::Disabled,
            stream_failure: StreamFailurePolicy::CompleteWithUnknown,
            interceptors: Vec::new(),
        }
    }

    /// Instantiate the unary interceptor chain for one call.
    pub fn create_unary_chain(&self) -> InterceptorChain<dyn UnaryInterceptor> {
        InterceptorChain::new(
            self.interceptors
                .iter()
                .filter_map(|factory| factory.create_unary(self))
                .collect(),
        )
    }

    /// Instantiate the stream interceptor chain for one stream.
    pub fn create_stream_chain(&self) -> InterceptorChain<dyn StreamInterceptor> {
        InterceptorChain::new(
            self.interceptors
                .iter()
                .filter_map(|factory| factory.create_stream(self))
                .collect(),
        )
    }

    /// Join the configured host with an RPC path
    /// (`package.Service/Method`).
    pub fn url_for_path(&self, path: &str) -> Result<Uri, ConnectError> {
        let joined = format!(
            "{}/{}",
            self.host.trim_end_matches('/'),
            path.trim_start_matches('/')
        );
        joined
            .parse()
            .map_err(|err: http::uri::InvalidUri| {
                ConnectError::wrapping(Code::Unknown, format!("invalid RPC URL {joined}"), err)
            })
    }

    /// Look up an inbound codec by its wire name.
    pub fn response_pool(&self, name: &str) -> Option<&BoxedCodec> {
        self.response_compression_pools
            .iter()
            .find(|pool| pool.name() == name)
    }

    /// Comma-separated names of the accepted inbound encodings.
    pub fn acceptable_compression(&self) -> Option<String> {
        if self.response_compression_pools.is_empty() {
            return None;
        }
        Some(
            self.response_compression_pools
                .iter()
                .map(BoxedCodec::name)
                .collect::<Vec<_>>()
                .join(","),
        )
    }

    /// The configured timeout in whole milliseconds.
    pub fn timeout_ms(&self) -> Option<u64> {
        self.default_timeout.map(|timeout| timeout.as_millis() as u64)
    }
}

/// Builder for [`ProtocolClientConfig`].
pub struct ProtocolClientConfigBuilder {
    host: String,
    protocol: NetworkProtocol,
    encoding: Encoding,
    request_compression: Option<RequestCompression>,
    response_compression_pools: Vec<BoxedCodec>,
    default_timeout: Option<Duration>,
    unary_get: UnaryGet,
    stream_failure: StreamFailurePolicy,
    interceptors: Vec<Arc<dyn InterceptorFactory>>,
}

impl ProtocolClientConfigBuilder {
    pub fn protocol(mut self, protocol: NetworkProtocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn encoding(mut self, encoding: Encoding) -> Self {
        self.encoding = encoding;
        self
    }

    pub fn request_compression(mut self, compression: RequestCompression) -> Self {
        self.request_compression = Some(compression);
        self
    }

    pub fn response_compression_pool(mut self, pool: BoxedCodec) -> Self {
        self.response_compression_pools.push(pool);
        self
    }

    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }

    pub fn unary_get(mut self, unary_get: UnaryGet) -> Self {
        self.unary_get = unary_get;
        self
    }

    pub fn stream_failure(mut self, policy: StreamFailurePolicy) -> Self {
        self.stream_failure = policy;
        self
    }

    /// Register an interceptor. Interceptors run in registration order on
    /// the way out and in reverse on the way back.
    pub fn interceptor(mut self, factory: Arc<dyn InterceptorFactory>) -> Self {
        self.interceptors.push(factory);
        self
    }

    pub fn build(self) -> ProtocolClientConfig {
        let mut interceptors = self.interceptors;
        // The protocol's own interceptor goes last so it sits closest to
        // the wire: final outbound hook, first inbound hook.
        interceptors.push(protocol::factory(self.protocol));
        ProtocolClientConfig {
            host: self.host,
            protocol: self.protocol,
            encoding: self.encoding,
            request_compression: self.request_compression,
            response_compression_pools: self.response_compression_pools,
            default_timeout: self.default_timeout,
            unary_get: self.unary_get,
            stream_failure: self.stream_failure,
            interceptors,
        }
    }
}

impl std::fmt::Debug for ProtocolClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolClientConfig")
            .field("host", &self.host)
            .field("protocol", &self.protocol)
            .field("encoding", &self.encoding)
            .field("interceptors", &self.interceptors.len())
            .finish_non_exhaustive()
    }
}
