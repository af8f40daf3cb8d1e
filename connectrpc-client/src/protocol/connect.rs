//! The Connect protocol.
//!
//! Unary calls are plain HTTP with JSON error bodies; streams use envelope
//! framing with a JSON end-of-stream frame carrying the terminal status and
//! metadata. Eligible unary calls can be rewritten as cacheable GET
//! requests.

use std::sync::{Arc, Mutex};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use bytes::Bytes;
use futures::future::BoxFuture;
use http::{HeaderMap, HeaderValue, Uri};
use serde::Deserialize;

use connectrpc_client_core::{
    Code, ConnectError, ErrorBody, RawHeaders, envelope_flags, pack, raw_to_header_map, unpack,
};

use crate::config::{ProtocolClientConfig, UnaryGet};
use crate::header;
use crate::interceptor::{InterceptorFactory, StreamInterceptor, UnaryInterceptor};
use crate::request::{HttpMethod, HttpRequest, IdempotencyLevel};
use crate::response::HttpResponse;
use crate::streaming::StreamResult;

/// Factory for the Connect protocol interceptor.
pub struct ConnectProtocol;

impl InterceptorFactory for ConnectProtocol {
    fn create_unary(&self, config: &ProtocolClientConfig) -> Option<Arc<dyn UnaryInterceptor>> {
        Some(Arc::new(ConnectUnary {
            config: config.clone(),
        }))
    }

    fn create_stream(&self, config: &ProtocolClientConfig) -> Option<Arc<dyn StreamInterceptor>> {
        Some(Arc::new(ConnectStream {
            config: config.clone(),
            response_headers: Mutex::new(None),
        }))
    }
}

struct ConnectUnary {
    config: ProtocolClientConfig,
}

impl ConnectUnary {
    fn prepare_request(
        &self,
        mut request: HttpRequest<Option<Bytes>>,
    ) -> Result<HttpRequest<Option<Bytes>>, ConnectError> {
        request.headers.insert(
            header::CONNECT_PROTOCOL_VERSION,
            HeaderValue::from_static(header::CONNECT_PROTOCOL_VERSION_VALUE),
        );
        if let Some(accepted) = self.config.acceptable_compression() {
            if let Ok(value) = HeaderValue::from_str(&accepted) {
                request.headers.insert(header::ACCEPT_ENCODING, value);
            }
        }
        if let Some(ms) = self.config.timeout_ms() {
            request
                .headers
                .insert(header::CONNECT_TIMEOUT_MS, HeaderValue::from(ms));
        }

        let mut compressed = false;
        if let (Some(compression), Some(body)) =
            (self.config.request_compression.as_ref(), &request.message)
        {
            if compression.should_compress(body) {
                if let Ok(packed) = compression.pool.compress(body) {
                    if let Ok(value) = HeaderValue::from_str(compression.pool.name()) {
                        request.headers.insert(header::CONTENT_ENCODING, value);
                    }
                    request.message = Some(packed);
                    compressed = true;
                }
            }
        }

        if self.should_use_get(&request) {
            request = self.into_get_request(request, compressed)?;
        }
        Ok(request)
    }

    fn should_use_get(&self, request: &HttpRequest<Option<Bytes>>) -> bool {
        if request.idempotency_level != IdempotencyLevel::NoSideEffects {
            return false;
        }
        let payload = request.message.as_ref().map(Bytes::len).unwrap_or(0);
        match self.config.unary_get {
            UnaryGet::Disabled => false,
            UnaryGet::WithinLimit(limit) => payload <= limit,
            UnaryGet::Always => true,
        }
    }

    /// Rewrite the request as a Connect GET: the payload moves into the
    /// query string and the protocol headers move into query parameters.
    fn into_get_request(
        &self,
        mut request: HttpRequest<Option<Bytes>>,
        compressed: bool,
    ) -> Result<HttpRequest<Option<Bytes>>, ConnectError> {
        let payload = request.message.take().unwrap_or_default();
        let mut query = String::from("base64=1");
        if compressed {
            if let Some(compression) = self.config.request_compression.as_ref() {
                query.push_str("&compression=");
                query.push_str(compression.pool.name());
            }
        }
        query.push_str("&connect=v1&encoding=");
        query.push_str(self.config.encoding.name());
        query.push_str("&message=");
        query.push_str(&URL_SAFE_NO_PAD.encode(&payload));

        let mut parts = request.url.clone().into_parts();
        let path = parts
            .path_and_query
            .as_ref()
            .map(|pq| pq.path().to_string())
            .unwrap_or_default();
        let path_and_query = format!("{path}?{query}");
        parts.path_and_query = Some(path_and_query.parse().map_err(
            |err: http::uri::InvalidUri| {
                ConnectError::wrapping(Code::Unknown, "failed to build GET request URL", err)
            },
        )?);
        request.url = Uri::from_parts(parts).map_err(|err| {
            ConnectError::wrapping(Code::Unknown, "failed to build GET request URL", err)
        })?;

        request.http_method = HttpMethod::Get;
        request.headers.remove(header::CONTENT_TYPE);
        request.headers.remove(header::CONTENT_ENCODING);
        request.headers.remove(header::CONNECT_PROTOCOL_VERSION);
        Ok(request)
    }

    fn process_response(&self, mut response: HttpResponse) -> HttpResponse {
        if response.error.is_some() {
            return response;
        }

        if let Some(encoding) = response
            .headers
            .get(header::CONTENT_ENCODING)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned)
        {
            if let (Some(pool), Some(body)) =
                (self.config.response_pool(&encoding), &response.message)
            {
                match pool.decompress(body) {
                    Ok(decompressed) => {
                        response.message = Some(decompressed);
                        response.headers.remove(header::CONTENT_ENCODING);
                    }
                    Err(err) => {
                        let error = ConnectError::wrapping(
                            Code::Internal,
                            "failed to decompress response body",
                            err,
                        );
                        response.code = error.code;
                        response.error = Some(error);
                        return response;
                    }
                }
            }
        }

        // Unary Connect trailers travel as prefixed headers.
        let trailer_names: Vec<_> = response
            .headers
            .keys()
            .filter(|name| name.as_str().starts_with(header::CONNECT_UNARY_TRAILER_PREFIX))
            .cloned()
            .collect();
        for name in trailer_names {
            let stripped = &name.as_str()[header::CONNECT_UNARY_TRAILER_PREFIX.len()..];
            if let Ok(trailer_name) = stripped.parse::<http::header::HeaderName>() {
                for value in response.headers.get_all(&name) {
                    response.trailers.append(trailer_name.clone(), value.clone());
                }
            }
            response.headers.remove(name);
        }
        response
    }
}

impl UnaryInterceptor for ConnectUnary {
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

/// End-of-stream JSON: `{"error": {...}, "metadata": {...}}`.
#[derive(Debug, Default, Deserialize)]
struct EndStreamJson {
    error: Option<ErrorBody>,
    metadata: Option<RawHeaders>,
}

struct ConnectStream {
    config: ProtocolClientConfig,
    response_headers: Mutex<Option<HeaderMap>>,
}

impl ConnectStream {
    fn prepare_start(
        &self,
        mut request: HttpRequest<()>,
    ) -> Result<HttpRequest<()>, ConnectError> {
        request.headers.insert(
            header::CONNECT_PROTOCOL_VERSION,
            HeaderValue::from_static(header::CONNECT_PROTOCOL_VERSION_VALUE),
        );
        if let Some(accepted) = self.config.acceptable_compression() {
            if let Ok(value) = HeaderValue::from_str(&accepted) {
                request
                    .headers
                    .insert(header::CONNECT_ACCEPT_ENCODING, value);
            }
        }
        if let Some(compression) = self.config.request_compression.as_ref() {
            if let Ok(value) = HeaderValue::from_str(compression.pool.name()) {
                request
                    .headers
                    .insert(header::CONNECT_CONTENT_ENCODING, value);
            }
        }
        if let Some(ms) = self.config.timeout_ms() {
            request
                .headers
                .insert(header::CONNECT_TIMEOUT_MS, HeaderValue::from(ms));
        }
        Ok(request)
    }

    fn response_pool_name(&self) -> Option<String> {
        self.response_headers
            .lock()
            .ok()?
            .as_ref()?
            .get(header::CONNECT_CONTENT_ENCODING)?
            .to_str()
            .ok()
            .map(str::to_owned)
    }

    fn process_result(&self, result: StreamResult<Bytes>) -> StreamResult<Bytes> {
        match result {
            StreamResult::Headers(headers) => {
                if let Ok(mut slot) = self.response_headers.lock() {
                    *slot = Some(headers.clone());
                }
                StreamResult::Headers(headers)
            }
            StreamResult::Message(frame) => {
                let pool = self
                    .response_pool_name()
                    .and_then(|name| self.config.response_pool(&name).cloned());
                match unpack(&frame, pool.as_ref()) {
                    Ok((flags, payload)) => {
                        if flags & envelope_flags::END_STREAM != 0 {
                            end_stream_result(&payload)
                        } else {
                            StreamResult::Message(payload)
                        }
                    }
                    Err(err) => StreamResult::complete_from_error(err.into()),
                }
            }
            complete => complete,
        }
    }
}

/// Interpret the end-of-stream JSON frame as the stream's terminal result.
fn end_stream_result(payload: &[u8]) -> StreamResult<Bytes> {
    let parsed: EndStreamJson = match serde_json::from_slice(payload) {
        Ok(parsed) => parsed,
        Err(err) => {
            return StreamResult::complete_from_error(ConnectError::wrapping(
                Code::Unknown,
                "malformed end-of-stream message",
                err,
            ));
        }
    };
    let trailers = parsed.metadata.map(raw_to_header_map).unwrap_or_default();
    match parsed.error {
        Some(body) => {
            let error = body.into_error().with_metadata(trailers.clone());
            StreamResult::Complete {
                code: error.code,
                error: Some(error),
                trailers: Some(trailers),
            }
        }
        None => StreamResult::complete_ok(Some(trailers)),
    }
}

impl StreamInterceptor for ConnectStream {
    fn handle_stream_start(
        &self,
        request: HttpRequest<()>,
    ) -> BoxFuture<'static, Result<HttpRequest<()>, ConnectError>> {
        Box::pin(std::future::ready(self.prepare_start(request)))
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
