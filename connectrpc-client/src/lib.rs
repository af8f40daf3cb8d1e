//! Transport-agnostic RPC client runtime for Connect, gRPC, and gRPC-Web.
//!
//! This crate contains the protocol logic of an RPC client: interceptor
//! chains, message envelopes, per-protocol header and trailer handling, and
//! stream lifecycle management. It deliberately does not contain an HTTP
//! implementation. Callers plug one in through
//! [`HttpClientInterface`](transport::HttpClientInterface), and everything
//! above that seam is protocol work done here.
//!
//! ## Protocols
//!
//! The wire protocol is chosen per client and implemented as an ordinary
//! interceptor that runs closest to the transport:
//!
//! - **Connect**: unary calls as plain HTTP with JSON error bodies, streams
//!   as enveloped frames with a JSON end-of-stream message. Side-effect-free
//!   unary calls can optionally be sent as cacheable GETs.
//! - **gRPC**: enveloped frames in both directions, status carried in HTTP/2
//!   trailers.
//! - **gRPC-Web**: like gRPC, but trailers travel as a flagged frame at the
//!   end of the response body, so it works over HTTP/1.1.
//!
//! ## Example
//!
//! ```ignore
//! use connectrpc_client::{
//!     NetworkProtocol, ProtocolClient, ProtocolClientConfig,
//! };
//! use connectrpc_client_core::Encoding;
//!
//! let config = ProtocolClientConfig::builder("https://api.example.com")
//!     .protocol(NetworkProtocol::Connect)
//!     .encoding(Encoding::Proto)
//!     .build();
//! let client = ProtocolClient::new(transport, config);
//!
//! let response = client
//!     .unary::<EchoRequest, EchoResponse>(
//!         "buf.demo.EchoService/Echo",
//!         IdempotencyLevel::NoSideEffects,
//!         request,
//!         headers,
//!     )
//!     .await;
//! match response.result {
//!     Ok(message) => println!("{message:?}"),
//!     Err(error) => eprintln!("{error}"),
//! }
//! ```
//!
//! ## Streaming
//!
//! Streams hand back a sender and a receiver; the runtime owns the stream
//! state in a background task:
//!
//! ```ignore
//! let (sender, mut results) = client
//!     .bidirectional_stream::<EchoRequest, EchoResponse>(
//!         "buf.demo.EchoService/EchoBidi",
//!         headers,
//!     );
//! sender.send(request)?;
//! sender.close();
//!
//! while let Some(result) = results.recv().await {
//!     match result {
//!         StreamResult::Headers(headers) => { /* response headers */ }
//!         StreamResult::Message(message) => { /* one response */ }
//!         StreamResult::Complete { code, error, trailers } => break,
//!     }
//! }
//! ```
//!
//! A well-formed stream yields at most one `Headers`, any number of
//! `Message`s, and exactly one `Complete`; the runtime enforces this shape
//! regardless of what the transport delivers. Client-only streams
//! additionally validate that the server produced exactly one message.
//!
//! ## Interceptors
//!
//! Interceptors are registered as factories and instantiated per call, so
//! they can hold per-call state. Outbound hooks run in registration order,
//! inbound hooks in reverse; a failing request hook stops the chain and
//! resolves the call with its error before anything reaches the wire. See
//! [`UnaryInterceptor`](interceptor::UnaryInterceptor) and
//! [`StreamInterceptor`](interceptor::StreamInterceptor).
//!
//! ## Cancellation
//!
//! Unary calls accept a [`Cancelation`](transport::Cancelation) token.
//! Cancelling before dispatch suppresses the request entirely; cancelling
//! mid-flight resolves the call with [`Code::Canceled`]. Streams are
//! cancelled through their sender.

pub mod chain;
pub mod config;
pub mod header;
pub mod interceptor;
pub mod protocol;
pub mod request;
pub mod response;
pub mod streaming;
pub mod transport;

mod client;

pub use chain::{InterceptorChain, TraversalOrder};
pub use client::{ProtocolClient, ServerOnlySender, StreamSender};
pub use config::{
    ProtocolClientConfig, ProtocolClientConfigBuilder, StreamFailurePolicy, UnaryGet,
};
pub use interceptor::{
    AnyMessage, HeaderInterceptor, InterceptorFactory, StreamInterceptor, UnaryInterceptor,
};
pub use protocol::NetworkProtocol;
pub use request::{HttpMethod, HttpRequest, IdempotencyLevel};
pub use response::{HttpMetrics, HttpResponse, ResponseMessage, TracingInfo};
pub use streaming::StreamResult;
pub use transport::{
    Cancelation, EstablishedStream, HttpClientInterface, RawStreamEvent, StreamCommand,
};

// Re-export core types that users need
pub use connectrpc_client_core::{
    Code, ConnectError, Encoding, ErrorDetail, RpcMessage,
};
