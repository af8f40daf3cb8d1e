//! The gRPC protocol.
//!
//! Both unary calls and streams use envelope framing; the terminal status
//! always travels in trailers (`grpc-status` and friends), with response
//! headers as a fallback for trailers-only responses.

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures::future::BoxFuture;
use http::{HeaderMap, HeaderValue};

use connectrpc_client_core::{
    Code, ConnectError, pack, parse_grpc_status, unpack,
};

use crate::config::ProtocolClientConfig;
use crate::header;
use crate::interceptor::{InterceptorFactory, StreamInterceptor, UnaryInterceptor};
use crate::request::HttpRequest;
use crate::response::HttpResponse;
use crate::streaming::{FrameBuffer, StreamResult};

/// Factory for the gRPC protocol interceptor.
pub struct GrpcProtocol;

impl InterceptorFactory for GrpcProtocol {
    fn create_unary(&self, config: &ProtocolClientConfig) -> Option<Arc<dyn UnaryInterceptor>> {
        Some(Arc::new(GrpcUnary {
            config: config.clone(),
        }))
    }

    fn create_stream(&self, config: &ProtocolClientConfig) -> Option<Arc<dyn StreamInterceptor>> {
        Some(Arc::new(GrpcStream {
            config: config.clone(),
            response_headers: Mutex::new(None),
        }))
    }
}

/// Write the request headers shared by gRPC and gRPC-Web.
pub(super) fn prepare_common_headers(
    config: &ProtocolClientConfig,
    headers: &mut HeaderMap,
    content_type_prefix: &str,
) {
    let content_type = format!("{content_type_prefix}+{}", config.encoding.name());
    if let Ok(value) = HeaderValue::from_str(&content_type) {
        headers.insert(header::CONTENT_TYPE, value);
    }
    if let Some(accepted) = config.acceptable_compression() {
        if let Ok(value) = HeaderValue::from_str(&accepted) {
            headers.insert(header::GRPC_ACCEPT_ENCODING, value);
        }
    }
    if let Some(compression) = config.request_compression.as_ref() {
        if let Ok(value) = HeaderValue::from_str(compression.pool.name()) {
            headers.insert(header::GRPC_ENCODING, value);
        }
    }
    if let Some(ms) = config.timeout_ms() {
        if let Ok(value) = HeaderValue::from_str(&format!("{ms}m")) {
            headers.insert(header::GRPC_TIMEOUT, value);
        }
    }
}

/// Resolve the inbound codec from a `grpc-encoding` style header.
pub(super) fn inbound_pool(
    config: &ProtocolClientConfig,
    headers: Option<&HeaderMap>,
) -> Option<connectrpc_client_core::BoxedCodec> {
    let name = headers?
        .get(header::GRPC_ENCODING)?
        .to_str()
        .ok()?
        .to_owned();
    config.response_pool(&name).cloned()
}

/// Unpack the single enveloped message of a unary response body.
///
/// More than one frame is a protocol violation (`unimplemented`); an
/// incomplete or malformed frame is `internal`.
pub(super) fn unpack_unary_frame(
    body: &[u8],
    pool: Option<&connectrpc_client_core::BoxedCodec>,
) -> Result<Option<Bytes>, ConnectError> {
    let mut buffer = FrameBuffer::new();
    buffer.extend(body);
    let Some(frame) = buffer.next_frame() else {
        if buffer.pending() > 0 {
            return Err(ConnectError::new(
                Code::Internal,
                "unary response has an incomplete message frame",
            ));
        }
        return Ok(None);
    };
    if buffer.pending() > 0 {
        return Err(ConnectError::new(
            Code::Unimplemented,
            "unary response has multiple messages",
        ));
    }
    let (_, payload) = unpack(&frame, pool)?;
    Ok(Some(payload))
}

struct GrpcUnary {
    config: ProtocolClientConfig,
}

impl GrpcUnary {
    fn prepare_request(
        &self,
        mut request: HttpRequest<Option<Bytes>>,
    ) -> Result<HttpRequest<Option<Bytes>>, ConnectError> {
        prepare_common_headers(&self.config, &mut request.headers, "application/grpc");
        request
            .headers
            .insert(header::TE, HeaderValue::from_static("trailers"));
        let body = request.message.take().unwrap_or_default();
        request.message = Some(pack(&body, self.config.request_compression.as_ref()));
        Ok(request)
    }

    fn process_response(&self, mut response: HttpResponse) -> HttpResponse {
        if response.error.is_some() {
            return response;
        }

        // A non-200 response never carries a valid gRPC payload.
        if response.code != Code::Ok {
            response.error = Some(
                ConnectError::from_code(response.code).with_metadata(response.headers.clone()),
            );
            return response;
        }

        let content_type_ok = response
            .headers
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.starts_with("application/grpc"));
        if !content_type_ok {
            let error = ConnectError::new(Code::Internal, "unexpected gRPC response content-type");
            response.code = error.code;
            response.error = Some(error);
            return response;
        }

        let status = parse_grpc_status(&response.headers, &response.trailers);
        response.code = status.code;
        if let Some(error) = status.error {
            response.error = Some(error);
            return response;
        }

        let pool = inbound_pool(&self.config, Some(&response.headers));
        let body = response.message.take().unwrap_or_default();
        match unpack_unary_frame(&body, pool.as_ref()) {
            Ok(message) => response.message = message,
            Err(error) => {
                response.code = error.code;
                response.error = Some(error);
            }
        }
        response
    }
}

impl UnaryInterceptor for GrpcUnary {
    fn handle_unary_raw_request(
        &self,
        request: HttpRequest<Option<Bytes>>,
    ) -> BoxFuture<'static, Result<HttpRequest<Option<Bytes>>, ConnectError>> {
        Box::pin(std::future::ready(self.prepare_request(request)))
    }

    fn handle_unary_raw_response(&self, response: HttpResponse) -> BoxFuture<'static, HttpResponse> {
        Box::pin(std::future::ready(self.process_response(response)))
    }
}

struct GrpcStream {
    config: ProtocolClientConfig,
    response_headers: Mutex<Option<HeaderMap>>,
}

impl GrpcStream {
    fn process_result(&self, result: StreamResult<Bytes>) -> StreamResult<Bytes> {
        match result {
            StreamResult::Headers(headers) => {
                if let Ok(mut slot) = self.response_headers.lock() {
                    *slot = Some(headers.clone());
                }
                StreamResult::Headers(headers)
            }
            StreamResult::Message(frame) => {
                let captured = self
                    .response_headers
                    .lock()
                    .ok()
                    .and_then(|slot| slot.clone());
                let pool = inbound_pool(&self.config, captured.as_ref());
                match unpack(&frame, pool.as_ref()) {
                    Ok((_, payload)) => StreamResult::Message(payload),
                    Err(err) => StreamResult::complete_from_error(err.into()),
                }
            }
            StreamResult::Complete {
                code,
                error,
                trailers,
            } => {
                if error.is_some() {
                    return StreamResult::Complete {
                        code,
                        error,
                        trailers,
                    };
                }
                let captured = self
                    .response_headers
                    .lock()
                    .ok()
                    .and_then(|slot| slot.clone())
                    .unwrap_or_default();
                complete_from_grpc_trailers(&captured, code, trailers)
            }
        }
    }
}

/// Derive a stream's terminal result from its trailers, falling back to the
/// captured response headers (trailers-only and headers-only responses).
///
/// An explicit trailer block always resolves through the shared status
/// routine, so a block with no `grpc-status` is a protocol violation
/// (`unimplemented`) rather than a clean close. The transport's close code
/// stands only when no trailers arrived and the headers carry no status
/// either.
pub(super) fn complete_from_grpc_trailers(
    captured_headers: &HeaderMap,
    close_code: Code,
    trailers: Option<HeaderMap>,
) -> StreamResult<Bytes> {
    let Some(trailer_map) = trailers else {
        if !captured_headers.contains_key(header::GRPC_STATUS) {
            return StreamResult::Complete {
                code: close_code,
                error: None,
                trailers: None,
            };
        }
        let status = parse_grpc_status(captured_headers, &HeaderMap::new());
        return StreamResult::Complete {
            code: status.code,
            error: status.error,
            trailers: None,
        };
    };
    let status = parse_grpc_status(captured_headers, &trailer_map);
    StreamResult::Complete {
        code: status.code,
        error: status.error,
        trailers: Some(trailer_map),
    }
}

impl StreamInterceptor for GrpcStream {
    fn handle_stream_start(
        &self,
        mut request: HttpRequest<()>,
    ) -> BoxFuture<'static, Result<HttpRequest<()>, ConnectError>> {
        prepare_common_headers(&self.config, &mut request.headers, "application/grpc");
        request
            .headers
            .insert(header::TE, HeaderValue::from_static("trailers"));
        Box::pin(std::future::ready(Ok(request)))
    }

    fn handle_stream_raw_input(&self, input: Bytes) -> BoxFuture<'static, Bytes> {
        let framed = pack(&input, self.config.request_compression.as_ref());
        Box::pin(std::future::ready(framed))
    }

    fn handle_stream_raw_result(
        &self,
        result: StreamResult<Bytes>,
    ) -> BoxFuture<'static, StreamResult<Bytes>> {
        Box::pin(std::future::ready(self.process_result(result)))
    }
}
