//! The gRPC-Web protocol.
//!
//! Like gRPC, but shaped for transports that cannot surface HTTP trailers:
//! the trailer block travels as a final envelope frame flagged with bit 7
//! (`0x80`), encoded as CRLF-delimited `name: value` text. Responses with
//! no body at all carry their status directly in the headers.

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures::future::BoxFuture;
use http::HeaderMap;

use connectrpc_client_core::{
    Code, ConnectError, envelope_flags, pack, parse_grpc_status, trailers_from_block, unpack,
};

use crate::config::ProtocolClientConfig;
use crate::header;
use crate::interceptor::{InterceptorFactory, StreamInterceptor, UnaryInterceptor};
use crate::protocol::grpc::{complete_from_grpc_trailers, inbound_pool, prepare_common_headers};
use crate::request::HttpRequest;
use crate::response::HttpResponse;
use crate::streaming::{FrameBuffer, StreamResult};

/// Factory for the gRPC-Web protocol interceptor.
pub struct GrpcWebProtocol;

impl InterceptorFactory for GrpcWebProtocol {
    fn create_unary(&self, config: &ProtocolClientConfig) -> Option<Arc<dyn UnaryInterceptor>> {
        Some(Arc::new(GrpcWebUnary {
            config: config.clone(),
        }))
    }

    fn create_stream(&self, config: &ProtocolClientConfig) -> Option<Arc<dyn StreamInterceptor>> {
        Some(Arc::new(GrpcWebStream {
            config: config.clone(),
            response_headers: Mutex::new(None),
        }))
    }
}

struct GrpcWebUnary {
    config: ProtocolClientConfig,
}

impl GrpcWebUnary {
    fn prepare_request(
        &self,
        mut request: HttpRequest<Option<Bytes>>,
    ) -> Result<HttpRequest<Option<Bytes>>, ConnectError> {
        prepare_common_headers(&self.config, &mut request.headers, "application/grpc-web");
        let body = request.message.take().unwrap_or_default();
        request.message = Some(pack(&body, self.config.request_compression.as_ref()));
        Ok(request)
    }

    fn process_response(&self, mut response: HttpResponse) -> HttpResponse {
        if response.error.is_some() {
            return response;
        }
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
            .is_some_and(|value| value.starts_with("application/grpc-web"));
        if !content_type_ok {
            let error =
                ConnectError::new(Code::Internal, "unexpected gRPC-Web response content-type");
            response.code = error.code;
            response.error = Some(error);
            return response;
        }

        let body = response.message.take().unwrap_or_default();
        let pool = inbound_pool(&self.config, Some(&response.headers));
        match self.split_body(&body, pool.as_ref()) {
            Ok((message, trailers)) => {
                // With an empty body the headers double as trailers.
                let trailers = trailers.unwrap_or_else(|| response.headers.clone());
                let status = parse_grpc_status(&response.headers, &trailers);
                response.code = status.code;
                response.error = status.error;
                response.message = message;
                response.trailers = trailers;
            }
            Err(error) => {
                response.code = error.code;
                response.error = Some(error);
            }
        }
        response
    }

    /// Split a gRPC-Web unary body into its message frame and trailer
    /// block.
    fn split_body(
        &self,
        body: &[u8],
        pool: Option<&connectrpc_client_core::BoxedCodec>,
    ) -> Result<(Option<Bytes>, Option<HeaderMap>), ConnectError> {
        let mut buffer = FrameBuffer::new();
        buffer.extend(body);

        let mut message: Option<Bytes> = None;
        let mut trailers: Option<HeaderMap> = None;
        while let Some(frame) = buffer.next_frame() {
            let (flags, payload) = unpack(&frame, pool)?;
            if flags & envelope_flags::TRAILERS != 0 {
                trailers = Some(trailers_from_block(&payload));
            } else if message.is_none() {
                message = Some(payload);
            } else {
                return Err(ConnectError::new(
                    Code::Unimplemented,
                    "unary response has multiple messages",
                ));
            }
        }
        if buffer.pending() > 0 {
            return Err(ConnectError::new(
                Code::Internal,
                "unary response has an incomplete message frame",
            ));
        }
        Ok((message, trailers))
    }
}

impl UnaryInterceptor for GrpcWebUnary {
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

struct GrpcWebStream {
    config: ProtocolClientConfig,
    response_headers: Mutex<Option<HeaderMap>>,
}

impl GrpcWebStream {
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
                    Ok((flags, payload)) => {
                        if flags & envelope_flags::TRAILERS != 0 {
                            let trailers = trailers_from_block(&payload);
                            let captured = captured.unwrap_or_default();
                            complete_from_grpc_trailers(&captured, Code::Ok, Some(trailers))
                        } else {
                            StreamResult::Message(payload)
                        }
                    }
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
                // A close with no prior trailers frame derives completion
                // from the captured headers (headers-only responses).
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

impl StreamInterceptor for GrpcWebStream {
    fn handle_stream_start(
        &self,
        mut request: HttpRequest<()>,
    ) -> BoxFuture<'static, Result<HttpRequest<()>, ConnectError>> {
        prepare_common_headers(&self.config, &mut request.headers, "application/grpc-web");
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
