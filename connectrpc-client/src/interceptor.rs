//! Interceptor traits.
//!
//! Interceptors observe and mutate requests on their way to the transport
//! and responses on their way back. An interceptor is registered as an
//! [`InterceptorFactory`]; the factory is invoked once per call or stream
//! and returns a fresh instance, so per-stream state (such as captured
//! response headers) never leaks across calls.
//!
//! Hooks are async: a hook receives the current value, may await
//! arbitrarily, and returns the (possibly replaced) value. Outbound hooks
//! run in registration order (FIFO), inbound hooks in reverse (LIFO); the
//! protocol's own interceptor always runs closest to the wire.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use http::HeaderMap;

use connectrpc_client_core::ConnectError;

use crate::config::ProtocolClientConfig;
use crate::request::HttpRequest;
use crate::response::{HttpMetrics, HttpResponse, ResponseMessage};
use crate::streaming::StreamResult;

/// A type-erased RPC message, passed through the typed hook phase.
///
/// Interceptors that care about a specific message type can downcast;
/// everything else passes the value along untouched. The client downcasts
/// back to the concrete type after the typed phase and fails the call if an
/// interceptor substituted a different type.
pub struct AnyMessage(Box<dyn Any + Send>);

impl AnyMessage {
    pub fn new<M: Any + Send>(message: M) -> Self {
        Self(Box::new(message))
    }

    pub fn downcast_ref<M: Any>(&self) -> Option<&M> {
        self.0.downcast_ref()
    }

    pub fn downcast_mut<M: Any>(&mut self) -> Option<&mut M> {
        self.0.downcast_mut()
    }

    /// Recover the concrete message, or return `self` unchanged when the
    /// type does not match.
    pub fn take<M: Any>(self) -> Result<M, AnyMessage> {
        match self.0.downcast::<M>() {
            Ok(message) => Ok(*message),
            Err(inner) => Err(AnyMessage(inner)),
        }
    }
}

impl fmt::Debug for AnyMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("AnyMessage").finish()
    }
}

fn passthrough<T: Send + 'static>(value: T) -> BoxFuture<'static, T> {
    Box::pin(std::future::ready(value))
}

/// Hooks applied to unary calls.
///
/// Every hook has a passthrough default; implement only the ones needed.
/// Request hooks may fail, which stops the chain and resolves the call with
/// the error.
pub trait UnaryInterceptor: Send + Sync {
    /// Observe or mutate the typed request before serialization.
    fn handle_unary_request(
        &self,
        request: HttpRequest<AnyMessage>,
    ) -> BoxFuture<'static, Result<HttpRequest<AnyMessage>, ConnectError>> {
        passthrough(Ok(request))
    }

    /// Observe or mutate the serialized request before dispatch.
    fn handle_unary_raw_request(
        &self,
        request: HttpRequest<Option<Bytes>>,
    ) -> BoxFuture<'static, Result<HttpRequest<Option<Bytes>>, ConnectError>> {
        passthrough(Ok(request))
    }

    /// Observe or mutate the raw response before deserialization.
    fn handle_unary_raw_response(&self, response: HttpResponse) -> BoxFuture<'static, HttpResponse> {
        passthrough(response)
    }

    /// Observe or mutate the typed response before it reaches the caller.
    fn handle_unary_response(
        &self,
        response: ResponseMessage<AnyMessage>,
    ) -> BoxFuture<'static, ResponseMessage<AnyMessage>> {
        passthrough(response)
    }

    /// Observe transport metrics for the completed request.
    fn handle_response_metrics(&self, metrics: HttpMetrics) -> BoxFuture<'static, HttpMetrics> {
        passthrough(metrics)
    }
}

/// Hooks applied to streaming calls.
pub trait StreamInterceptor: Send + Sync {
    /// Observe or mutate the stream request before any bytes are sent.
    /// Failing here vetoes the stream entirely.
    fn handle_stream_start(
        &self,
        request: HttpRequest<()>,
    ) -> BoxFuture<'static, Result<HttpRequest<()>, ConnectError>> {
        passthrough(Ok(request))
    }

    /// Observe or mutate a typed outbound message.
    fn handle_stream_input(&self, input: AnyMessage) -> BoxFuture<'static, AnyMessage> {
        passthrough(input)
    }

    /// Observe or mutate a serialized outbound message.
    fn handle_stream_raw_input(&self, input: Bytes) -> BoxFuture<'static, Bytes> {
        passthrough(input)
    }

    /// Observe or mutate a raw inbound result.
    fn handle_stream_raw_result(
        &self,
        result: StreamResult<Bytes>,
    ) -> BoxFuture<'static, StreamResult<Bytes>> {
        passthrough(result)
    }

    /// Observe or mutate a typed inbound result.
    fn handle_stream_result(
        &self,
        result: StreamResult<AnyMessage>,
    ) -> BoxFuture<'static, StreamResult<AnyMessage>> {
        passthrough(result)
    }
}

/// Creates interceptor instances for calls made by a client.
///
/// Either capability may be absent; a factory returning `None` for a shape
/// simply does not participate in calls of that shape.
pub trait InterceptorFactory: Send + Sync {
    fn create_unary(&self, _config: &ProtocolClientConfig) -> Option<Arc<dyn UnaryInterceptor>> {
        None
    }

    fn create_stream(&self, _config: &ProtocolClientConfig) -> Option<Arc<dyn StreamInterceptor>> {
        None
    }
}

/// Adds a fixed set of headers to every outbound request.
pub struct HeaderInterceptor {
    headers: HeaderMap,
}

impl HeaderInterceptor {
    pub fn new(headers: HeaderMap) -> Self {
        Self { headers }
    }
}

fn append_all(target: &mut HeaderMap, headers: &HeaderMap) {
    for (name, value) in headers {
        target.append(name.clone(), value.clone());
    }
}

impl InterceptorFactory for HeaderInterceptor {
    fn create_unary(&self, _config: &ProtocolClientConfig) -> Option<Arc<dyn UnaryInterceptor>> {
        Some(Arc::new(HeaderInterceptorInstance {
            headers: self.headers.clone(),
        }))
    }

    fn create_stream(&self, _config: &ProtocolClientConfig) -> Option<Arc<dyn StreamInterceptor>> {
        Some(Arc::new(HeaderInterceptorInstance {
            headers: self.headers.clone(),
        }))
    }
}

struct HeaderInterceptorInstance {
    headers: HeaderMap,
}

impl UnaryInterceptor for HeaderInterceptorInstance {
    fn handle_unary_request(
        &self,
        mut request: HttpRequest<AnyMessage>,
    ) -> BoxFuture<'static, Result<HttpRequest<AnyMessage>, ConnectError>> {
        append_all(&mut request.headers, &self.headers);
        passthrough(Ok(request))
    }
}

impl StreamInterceptor for HeaderInterceptorInstance {
    fn handle_stream_start(
        &self,
        mut request: HttpRequest<()>,
    ) -> BoxFuture<'static, Result<HttpRequest<()>, ConnectError>> {
        append_all(&mut request.headers, &self.headers);
        passthrough(Ok(request))
    }
}
