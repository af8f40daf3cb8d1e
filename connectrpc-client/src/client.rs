//! The RPC client.
//!
//! [`ProtocolClient`] drives the interceptor pipeline for unary and
//! streaming calls: typed hooks, serialization, raw hooks, the transport
//! exchange, and the inbound mirror of the same pipeline. All per-stream
//! state is owned by a spawned task; callers talk to it through channels.

use std::marker::PhantomData;
use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use http::{HeaderMap, HeaderValue};
use tokio::sync::mpsc;
use tracing::{debug, error};

use connectrpc_client_core::{Code, ConnectError, Encoding, RpcMessage};

use crate::chain::{
    FailableHook, Hook, InterceptorChain, TraversalOrder, execute_interceptors,
    execute_interceptors_and_stop_on_failure, execute_linked_interceptors,
    execute_linked_interceptors_and_stop_on_failure,
};
use crate::config::{ProtocolClientConfig, StreamFailurePolicy};
use crate::header;
use crate::interceptor::{AnyMessage, StreamInterceptor, UnaryInterceptor};
use crate::request::{HttpMethod, HttpRequest, IdempotencyLevel};
use crate::response::{HttpMetrics, HttpResponse, ResponseMessage};
use crate::streaming::{ClientOnlyValidator, FrameBuffer, StreamResult};
use crate::transport::{
    Cancelation, HttpClientInterface, RawStreamEvent, StreamCommand,
};

/// A client for one host speaking one protocol.
///
/// Cheap to clone; clones share the transport and configuration.
#[derive(Clone)]
pub struct ProtocolClient {
    http_client: Arc<dyn HttpClientInterface>,
    config: Arc<ProtocolClientConfig>,
}

/// Caller-side handle for the send half of a stream.
pub struct StreamSender<Req> {
    commands: mpsc::UnboundedSender<ClientCommand>,
    _req: PhantomData<fn(Req)>,
}

impl<Req: RpcMessage> StreamSender<Req> {
    /// Queue a message for sending. Messages sent before the transport
    /// stream is established are flushed once it is.
    pub fn send(&self, message: Req) -> Result<(), ConnectError> {
        self.commands
            .send(ClientCommand::Send(AnyMessage::new(message)))
            .map_err(|_| ConnectError::new(Code::Unknown, "stream is closed"))
    }

    /// Half-close the stream: no further messages will be sent.
    pub fn close(&self) {
        let _ = self.commands.send(ClientCommand::Close);
    }

    /// Abort the stream.
    pub fn cancel(&self) {
        let _ = self.commands.send(ClientCommand::Cancel);
    }
}

/// Send half of a server-only stream: exactly one request message.
pub struct ServerOnlySender<Req> {
    inner: StreamSender<Req>,
}

impl<Req: RpcMessage> ServerOnlySender<Req> {
    /// Send the single request message and half-close.
    pub fn send(&self, message: Req) -> Result<(), ConnectError> {
        self.inner.send(message)?;
        self.inner.close();
        Ok(())
    }

    pub fn cancel(&self) {
        self.inner.cancel();
    }
}

enum ClientCommand {
    Send(AnyMessage),
    Close,
    Cancel,
}

impl ProtocolClient {
    pub fn new(http_client: Arc<dyn HttpClientInterface>, config: ProtocolClientConfig) -> Self {
        Self {
            http_client,
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &ProtocolClientConfig {
        &self.config
    }

    /// Perform a unary call.
    pub async fn unary<Req, Resp>(
        &self,
        path: &str,
        idempotency_level: IdempotencyLevel,
        message: Req,
        headers: HeaderMap,
    ) -> ResponseMessage<Resp>
    where
        Req: RpcMessage,
        Resp: RpcMessage,
    {
        self.unary_with_cancelation(path, idempotency_level, message, headers, Cancelation::new())
            .await
    }

    /// Perform a unary call with an externally held cancellation token.
    pub async fn unary_with_cancelation<Req, Resp>(
        &self,
        path: &str,
        idempotency_level: IdempotencyLevel,
        message: Req,
        headers: HeaderMap,
        cancel: Cancelation,
    ) -> ResponseMessage<Resp>
    where
        Req: RpcMessage,
        Resp: RpcMessage,
    {
        match self
            .perform_unary(path, idempotency_level, message, headers, cancel)
            .await
        {
            Ok(response) => response,
            Err(error) => ResponseMessage::from_error(error),
        }
    }

    async fn perform_unary<Req, Resp>(
        &self,
        path: &str,
        idempotency_level: IdempotencyLevel,
        message: Req,
        mut headers: HeaderMap,
        cancel: Cancelation,
    ) -> Result<ResponseMessage<Resp>, ConnectError>
    where
        Req: RpcMessage,
        Resp: RpcMessage,
    {
        let url = self.config.url_for_path(path)?;
        headers.insert(header::CONTENT_TYPE, unary_content_type(self.config.encoding));

        let request = HttpRequest {
            http_method: HttpMethod::Post,
            url,
            headers,
            message: AnyMessage::new(message),
            trailers: None,
            idempotency_level,
        };

        let chain = self.config.create_unary_chain();
        let encoding = self.config.encoding;

        let typed_hooks: Vec<FailableHook<HttpRequest<AnyMessage>>> =
            chain.failable_hooks(|interceptor| {
                Box::new(move |request| interceptor.handle_unary_request(request))
            });
        let raw_hooks: Vec<FailableHook<HttpRequest<Option<Bytes>>>> =
            chain.failable_hooks(|interceptor| {
                Box::new(move |request| interceptor.handle_unary_raw_request(request))
            });

        let outbound = execute_linked_interceptors_and_stop_on_failure(
            typed_hooks,
            TraversalOrder::FirstInFirstOut,
            request,
            move |request: HttpRequest<AnyMessage>| -> BoxFuture<
                'static,
                Result<HttpRequest<Option<Bytes>>, ConnectError>,
            > {
                Box::pin(std::future::ready(serialize_request::<Req>(
                    encoding, request,
                )))
            },
            raw_hooks,
        )
        .await?;

        // A token cancelled before dispatch suppresses the send entirely.
        if cancel.is_cancelled() {
            return Err(ConnectError::canceled());
        }

        debug!(path = %path, method = ?outbound.http_method, "dispatching unary request");
        let response = tokio::select! {
            response = self.http_client.unary(outbound) => response,
            _ = cancel.cancelled() => HttpResponse::from_error(ConnectError::canceled()),
        };

        let metrics_hooks: Vec<Hook<HttpMetrics>> = chain.hooks(|interceptor| {
            Box::new(move |metrics| interceptor.handle_response_metrics(metrics))
        });
        execute_interceptors(
            metrics_hooks,
            TraversalOrder::LastInFirstOut,
            HttpMetrics {
                tracing_info: response.tracing_info,
            },
        )
        .await;

        let raw_response_hooks: Vec<Hook<HttpResponse>> = chain.hooks(|interceptor| {
            Box::new(move |response| interceptor.handle_unary_raw_response(response))
        });
        let typed_response_hooks: Vec<Hook<ResponseMessage<AnyMessage>>> =
            chain.hooks(|interceptor| {
                Box::new(move |response| interceptor.handle_unary_response(response))
            });

        let response = execute_linked_interceptors(
            raw_response_hooks,
            TraversalOrder::LastInFirstOut,
            response,
            move |response: HttpResponse| -> BoxFuture<'static, ResponseMessage<AnyMessage>> {
                Box::pin(std::future::ready(deserialize_response::<Resp>(
                    encoding, response,
                )))
            },
            typed_response_hooks,
        )
        .await;

        let mut response = response.map_message(|any| {
            any.take::<Resp>().map_err(|_| {
                ConnectError::new(
                    Code::Internal,
                    "interceptor replaced response message with an unexpected type",
                )
            })
        });
        if let Err(err) = &response.result {
            response.code = err.code;
        }
        Ok(response)
    }

    /// Open a bidirectional stream.
    pub fn bidirectional_stream<Req, Resp>(
        &self,
        path: &str,
        headers: HeaderMap,
    ) -> (StreamSender<Req>, mpsc::UnboundedReceiver<StreamResult<Resp>>)
    where
        Req: RpcMessage,
        Resp: RpcMessage,
    {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (result_tx, result_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_stream::<Req, Resp>(
            self.config.clone(),
            self.http_client.clone(),
            path.to_string(),
            headers,
            command_rx,
            result_tx,
        ));
        (
            StreamSender {
                commands: command_tx,
                _req: PhantomData,
            },
            result_rx,
        )
    }

    /// Open a client-only stream: many requests, exactly one logical
    /// response, validated.
    pub fn client_only_stream<Req, Resp>(
        &self,
        path: &str,
        headers: HeaderMap,
    ) -> (StreamSender<Req>, mpsc::UnboundedReceiver<StreamResult<Resp>>)
    where
        Req: RpcMessage,
        Resp: RpcMessage,
    {
        let (sender, mut inner_rx) = self.bidirectional_stream::<Req, Resp>(path, headers);
        let (outer_tx, outer_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut validator = ClientOnlyValidator::new();
            while let Some(result) = inner_rx.recv().await {
                if let Some(validated) = validator.push(result) {
                    for result in validated {
                        let _ = outer_tx.send(result);
                    }
                    break;
                }
            }
        });
        (sender, outer_rx)
    }

    /// Open a server-only stream: one request, many responses.
    pub fn server_only_stream<Req, Resp>(
        &self,
        path: &str,
        headers: HeaderMap,
    ) -> (
        ServerOnlySender<Req>,
        mpsc::UnboundedReceiver<StreamResult<Resp>>,
    )
    where
        Req: RpcMessage,
        Resp: RpcMessage,
    {
        let (sender, receiver) = self.bidirectional_stream::<Req, Resp>(path, headers);
        (ServerOnlySender { inner: sender }, receiver)
    }
}

fn unary_content_type(encoding: Encoding) -> HeaderValue {
    match encoding {
        Encoding::Proto => HeaderValue::from_static("application/proto"),
        Encoding::Json => HeaderValue::from_static("application/json"),
    }
}

fn stream_content_type(encoding: Encoding) -> HeaderValue {
    match encoding {
        Encoding::Proto => HeaderValue::from_static("application/connect+proto"),
        Encoding::Json => HeaderValue::from_static("application/connect+json"),
    }
}

/// The serialize transform between the typed and raw outbound phases.
fn serialize_request<Req: RpcMessage>(
    encoding: Encoding,
    request: HttpRequest<AnyMessage>,
) -> Result<HttpRequest<Option<Bytes>>, ConnectError> {
    let HttpRequest {
        http_method,
        url,
        headers,
        message,
        trailers,
        idempotency_level,
    } = request;
    let message = message.take::<Req>().map_err(|_| {
        ConnectError::new(
            Code::Internal,
            "interceptor replaced request message with an unexpected type",
        )
    })?;
    // Side-effect-free calls may be rewritten as cacheable GET requests, so
    // their payload bytes must be stable across retries of the same message.
    let body = if idempotency_level == IdempotencyLevel::NoSideEffects {
        encoding.deterministically_serialize(&message)?
    } else {
        encoding.serialize(&message)?
    };
    Ok(HttpRequest {
        http_method,
        url,
        headers,
        message: Some(body),
        trailers,
        idempotency_level,
    })
}

/// The deserialize transform between the raw and typed inbound phases.
fn deserialize_response<Resp: RpcMessage>(
    encoding: Encoding,
    response: HttpResponse,
) -> ResponseMessage<AnyMessage> {
    let HttpResponse {
        code,
        headers,
        message,
        trailers,
        error,
        ..
    } = response;

    // Transport and interceptor errors win over body content.
    if let Some(error) = error {
        return ResponseMessage {
            code: error.code,
            headers,
            result: Err(error),
            trailers,
        };
    }
    if code != Code::Ok {
        let body = message.unwrap_or_default();
        let error = ConnectError::from_response_body(code, &headers, &body);
        return ResponseMessage {
            code,
            headers,
            result: Err(error),
            trailers,
        };
    }
    match encoding.deserialize::<Resp>(&message.unwrap_or_default()) {
        Ok(decoded) => ResponseMessage {
            code,
            headers,
            result: Ok(AnyMessage::new(decoded)),
            trailers,
        },
        Err(err) => {
            let error: ConnectError = err.into();
            ResponseMessage {
                code: error.code,
                headers,
                result: Err(error),
                trailers,
            }
        }
    }
}

/// Run the raw result through the inbound chain and convert it to a typed
/// result for the caller.
async fn pump_result<Resp: RpcMessage>(
    chain: &InterceptorChain<dyn StreamInterceptor>,
    encoding: Encoding,
    raw: StreamResult<Bytes>,
) -> StreamResult<Resp> {
    let raw_hooks: Vec<Hook<StreamResult<Bytes>>> = chain.hooks(|interceptor| {
        Box::new(move |result| interceptor.handle_stream_raw_result(result))
    });
    let raw = execute_interceptors(raw_hooks, TraversalOrder::LastInFirstOut, raw).await;

    let typed = raw.map_message(|bytes| {
        encoding
            .deserialize::<Resp>(&bytes)
            .map(AnyMessage::new)
            .map_err(ConnectError::from)
    });

    let typed_hooks: Vec<Hook<StreamResult<AnyMessage>>> = chain.hooks(|interceptor| {
        Box::new(move |result| interceptor.handle_stream_result(result))
    });
    let typed = execute_interceptors(typed_hooks, TraversalOrder::LastInFirstOut, typed).await;

    typed.map_message(|any| {
        any.take::<Resp>().map_err(|_| {
            ConnectError::new(
                Code::Internal,
                "interceptor replaced response message with an unexpected type",
            )
        })
    })
}

async fn run_stream<Req, Resp>(
    config: Arc<ProtocolClientConfig>,
    http_client: Arc<dyn HttpClientInterface>,
    path: String,
    mut headers: HeaderMap,
    mut commands: mpsc::UnboundedReceiver<ClientCommand>,
    results: mpsc::UnboundedSender<StreamResult<Resp>>,
) where
    Req: RpcMessage,
    Resp: RpcMessage,
{
    let encoding = config.encoding;
    let chain = config.create_stream_chain();

    let url = match config.url_for_path(&path) {
        Ok(url) => url,
        Err(error) => {
            let _ = results.send(StreamResult::complete_from_error(error));
            return;
        }
    };
    headers.insert(header::CONTENT_TYPE, stream_content_type(encoding));
    let request = HttpRequest {
        http_method: HttpMethod::Post,
        url,
        headers,
        message: (),
        trailers: None,
        idempotency_level: IdempotencyLevel::Unknown,
    };

    // An interceptor can veto the stream before any bytes are sent.
    let start_hooks: Vec<FailableHook<HttpRequest<()>>> = chain.failable_hooks(|interceptor| {
        Box::new(move |request| interceptor.handle_stream_start(request))
    });
    let request = match execute_interceptors_and_stop_on_failure(
        start_hooks,
        TraversalOrder::FirstInFirstOut,
        request,
    )
    .await
    {
        Ok(request) => request,
        Err(error) => {
            let _ = results.send(StreamResult::complete_from_error(error));
            return;
        }
    };

    debug!(path = %path, "opening stream");
    let mut established = http_client.stream(request);

    let mut buffer = FrameBuffer::new();
    let mut has_completed = false;
    let mut transport_closed = false;
    let mut commands_closed = false;

    loop {
        tokio::select! {
            // Drain queued sends before touching inbound events so messages
            // sent while the stream was being established go out first.
            biased;
            command = commands.recv(), if !commands_closed => match command {
                Some(ClientCommand::Send(any)) => {
                    let input_hooks: Vec<Hook<AnyMessage>> = chain.hooks(|interceptor| {
                        Box::new(move |input| interceptor.handle_stream_input(input))
                    });
                    let any =
                        execute_interceptors(input_hooks, TraversalOrder::FirstInFirstOut, any)
                            .await;
                    let message = match any.take::<Req>() {
                        Ok(message) => message,
                        Err(_) => {
                            error!(path = %path, "interceptor replaced outbound message with an unexpected type; dropping it");
                            continue;
                        }
                    };
                    let body = match encoding.serialize(&message) {
                        Ok(body) => body,
                        Err(err) => {
                            error!(path = %path, error = %err, "failed to serialize outbound stream message; dropping it");
                            continue;
                        }
                    };
                    let raw_hooks: Vec<Hook<Bytes>> = chain.hooks(|interceptor| {
                        Box::new(move |input| interceptor.handle_stream_raw_input(input))
                    });
                    let framed =
                        execute_interceptors(raw_hooks, TraversalOrder::FirstInFirstOut, body)
                            .await;
                    let _ = established.commands.send(StreamCommand::SendData(framed));
                }
                Some(ClientCommand::Close) => {
                    let _ = established.commands.send(StreamCommand::SendClose);
                }
                Some(ClientCommand::Cancel) => {
                    let _ = established.commands.send(StreamCommand::Cancel);
                }
                None => {
                    commands_closed = true;
                }
            },
            event = established.events.recv() => match event {
                Some(RawStreamEvent::Headers(response_headers)) => {
                    let result = pump_result::<Resp>(
                        &chain,
                        encoding,
                        StreamResult::Headers(response_headers),
                    )
                    .await;
                    deliver(
                        result,
                        &results,
                        &established.commands,
                        config.stream_failure,
                        &mut has_completed,
                        transport_closed,
                    );
                }
                Some(RawStreamEvent::Data(chunk)) => {
                    buffer.extend(&chunk);
                    while let Some(frame) = buffer.next_frame() {
                        if has_completed {
                            break;
                        }
                        let result = pump_result::<Resp>(
                            &chain,
                            encoding,
                            StreamResult::Message(frame),
                        )
                        .await;
                        deliver(
                            result,
                            &results,
                            &established.commands,
                            config.stream_failure,
                            &mut has_completed,
                            transport_closed,
                        );
                    }
                }
                Some(RawStreamEvent::Metrics(_)) => {
                    debug!(path = %path, "received stream metrics");
                }
                Some(RawStreamEvent::Close { code, trailers, error }) => {
                    transport_closed = true;
                    if !has_completed {
                        let result = pump_result::<Resp>(
                            &chain,
                            encoding,
                            StreamResult::Complete { code, error, trailers },
                        )
                        .await;
                        deliver(
                            result,
                            &results,
                            &established.commands,
                            config.stream_failure,
                            &mut has_completed,
                            transport_closed,
                        );
                    }
                    break;
                }
                None => {
                    if !has_completed {
                        let _ = results.send(StreamResult::complete_from_error(
                            ConnectError::new(Code::Unknown, "transport closed unexpectedly"),
                        ));
                    }
                    break;
                }
            },
        }
    }
}

/// Forward a pipeline result to the caller, enforcing the single-terminal
/// invariant and the configured early-termination policy.
fn deliver<Resp>(
    result: StreamResult<Resp>,
    results: &mpsc::UnboundedSender<StreamResult<Resp>>,
    transport: &mpsc::UnboundedSender<StreamCommand>,
    policy: StreamFailurePolicy,
    has_completed: &mut bool,
    transport_closed: bool,
) {
    if *has_completed {
        return;
    }
    let terminal_error = matches!(
        &result,
        StreamResult::Complete { error: Some(_), .. }
    );
    if result.is_complete() {
        *has_completed = true;
    }
    let _ = results.send(result);
    if terminal_error && !transport_closed && policy == StreamFailurePolicy::CancelStream {
        let _ = transport.send(StreamCommand::Cancel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interceptor::HeaderInterceptor;
    use crate::protocol::NetworkProtocol;
    use connectrpc_client_core::{envelope_flags, pack_raw};
    use serde::{Deserialize, Serialize};
    use std::sync::Mutex;

    #[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
    struct Echo {
        #[prost(string, tag = "1")]
        #[serde(default)]
        text: String,
    }

    fn echo(text: &str) -> Echo {
        Echo {
            text: text.to_string(),
        }
    }

    /// Transport double that answers unary calls with a canned response and
    /// records the request it saw.
    struct MockUnaryTransport {
        response: Mutex<Option<HttpResponse>>,
        seen: Arc<Mutex<Option<HttpRequest<Option<Bytes>>>>>,
    }

    impl MockUnaryTransport {
        fn new(response: HttpResponse) -> (Arc<Self>, Arc<Mutex<Option<HttpRequest<Option<Bytes>>>>>) {
            let seen = Arc::new(Mutex::new(None));
            (
                Arc::new(Self {
                    response: Mutex::new(Some(response)),
                    seen: seen.clone(),
                }),
                seen,
            )
        }
    }

    impl HttpClientInterface for MockUnaryTransport {
        fn unary(&self, request: HttpRequest<Option<Bytes>>) -> BoxFuture<'static, HttpResponse> {
            *self.seen.lock().unwrap() = Some(request);
            let response = self
                .response
                .lock()
                .unwrap()
                .take()
                .expect("unary called more than once");
            Box::pin(std::future::ready(response))
        }

        fn stream(&self, _request: HttpRequest<()>) -> crate::transport::EstablishedStream {
            panic!("unary transport cannot stream");
        }
    }

    /// Transport double that plays back a scripted sequence of stream
    /// events and records the commands it receives.
    struct ScriptedStreamTransport {
        events: Mutex<Option<Vec<RawStreamEvent>>>,
        sent: Arc<Mutex<Vec<StreamCommand>>>,
    }

    impl ScriptedStreamTransport {
        fn new(events: Vec<RawStreamEvent>) -> (Arc<Self>, Arc<Mutex<Vec<StreamCommand>>>) {
            let sent = Arc::new(Mutex::new(Vec::new()));
            (
                Arc::new(Self {
                    events: Mutex::new(Some(events)),
                    sent: sent.clone(),
                }),
                sent,
            )
        }
    }

    impl HttpClientInterface for ScriptedStreamTransport {
        fn unary(&self, _request: HttpRequest<Option<Bytes>>) -> BoxFuture<'static, HttpResponse> {
            panic!("stream transport cannot unary");
        }

        fn stream(&self, _request: HttpRequest<()>) -> crate::transport::EstablishedStream {
            let (command_tx, mut command_rx) = mpsc::unbounded_channel();
            let (event_tx, event_rx) = mpsc::unbounded_channel();
            for event in self.events.lock().unwrap().take().unwrap_or_default() {
                let _ = event_tx.send(event);
            }
            let sent = self.sent.clone();
            tokio::spawn(async move {
                while let Some(command) = command_rx.recv().await {
                    sent.lock().unwrap().push(command);
                }
            });
            crate::transport::EstablishedStream {
                commands: command_tx,
                events: event_rx,
            }
        }
    }

    fn connect_config() -> ProtocolClientConfig {
        ProtocolClientConfig::builder("https://api.example.com")
            .protocol(NetworkProtocol::Connect)
            .encoding(Encoding::Proto)
            .build()
    }

    fn ok_http_response(body: Bytes) -> HttpResponse {
        HttpResponse {
            code: Code::Ok,
            headers: HeaderMap::new(),
            message: Some(body),
            trailers: HeaderMap::new(),
            error: None,
            tracing_info: Some(crate::response::TracingInfo { http_status: 200 }),
        }
    }

    #[tokio::test]
    async fn test_unary_success() {
        let reply = echo("pong");
        let body = Bytes::from(prost::Message::encode_to_vec(&reply));
        let (transport, seen) = MockUnaryTransport::new(ok_http_response(body));
        let client = ProtocolClient::new(transport, connect_config());

        let response: ResponseMessage<Echo> = client
            .unary(
                "test.Service/Echo",
                IdempotencyLevel::Unknown,
                echo("ping"),
                HeaderMap::new(),
            )
            .await;

        assert_eq!(response.code, Code::Ok);
        assert_eq!(response.message().unwrap(), &reply);

        let request = seen.lock().unwrap().take().unwrap();
        assert_eq!(
            request.headers.get(header::CONNECT_PROTOCOL_VERSION).unwrap(),
            "1"
        );
        assert_eq!(
            request.headers.get(header::CONTENT_TYPE).unwrap(),
            "application/proto"
        );
        let sent = request.message.unwrap();
        let decoded: Echo = prost::Message::decode(sent.as_ref()).unwrap();
        assert_eq!(decoded, echo("ping"));
    }

    #[tokio::test]
    async fn test_unary_no_side_effects_uses_stable_payload() {
        let reply = echo("pong");
        let body = Bytes::from(prost::Message::encode_to_vec(&reply));
        let (transport, seen) = MockUnaryTransport::new(ok_http_response(body));
        let client = ProtocolClient::new(transport, connect_config());

        let _: ResponseMessage<Echo> = client
            .unary(
                "test.Service/Echo",
                IdempotencyLevel::NoSideEffects,
                echo("ping"),
                HeaderMap::new(),
            )
            .await;

        let request = seen.lock().unwrap().take().unwrap();
        let expected = Encoding::Proto
            .deterministically_serialize(&echo("ping"))
            .unwrap();
        assert_eq!(request.message.unwrap(), expected);
    }

    #[tokio::test]
    async fn test_unary_error_body() {
        let mut response = ok_http_response(Bytes::from_static(
            br#"{"code": "out_of_range", "message": "too far"}"#,
        ));
        response.code = Code::Internal; // HTTP 400
        let (transport, _) = MockUnaryTransport::new(response);
        let client = ProtocolClient::new(transport, connect_config());

        let response: ResponseMessage<Echo> = client
            .unary(
                "test.Service/Echo",
                IdempotencyLevel::Unknown,
                echo("ping"),
                HeaderMap::new(),
            )
            .await;

        let error = response.error().unwrap();
        assert_eq!(error.code, Code::OutOfRange);
        assert_eq!(error.message.as_deref(), Some("too far"));
        assert_eq!(response.code, Code::OutOfRange);
    }

    #[tokio::test]
    async fn test_unary_cancelled_before_dispatch_suppresses_send() {
        // The transport would panic if its unary were reached twice, and
        // `seen` stays empty if it is never reached at all.
        let (transport, seen) = MockUnaryTransport::new(ok_http_response(Bytes::new()));
        let client = ProtocolClient::new(transport, connect_config());

        let cancel = Cancelation::new();
        cancel.cancel();
        let response: ResponseMessage<Echo> = client
            .unary_with_cancelation(
                "test.Service/Echo",
                IdempotencyLevel::Unknown,
                echo("ping"),
                HeaderMap::new(),
                cancel,
            )
            .await;

        assert_eq!(response.code, Code::Canceled);
        assert!(seen.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unary_cancelled_mid_flight_resolves_canceled() {
        // Transport double whose unary exchange never completes.
        struct HangingTransport;
        impl HttpClientInterface for HangingTransport {
            fn unary(
                &self,
                _request: HttpRequest<Option<Bytes>>,
            ) -> BoxFuture<'static, HttpResponse> {
                Box::pin(std::future::pending())
            }
            fn stream(&self, _request: HttpRequest<()>) -> crate::transport::EstablishedStream {
                panic!("no streams expected");
            }
        }

        let client = ProtocolClient::new(Arc::new(HangingTransport), connect_config());
        let cancel = Cancelation::new();
        let call = {
            let client = client.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                client
                    .unary_with_cancelation::<Echo, Echo>(
                        "test.Service/Echo",
                        IdempotencyLevel::Unknown,
                        echo("ping"),
                        HeaderMap::new(),
                        cancel,
                    )
                    .await
            })
        };

        tokio::task::yield_now().await;
        cancel.cancel();
        let response = call.await.unwrap();
        assert_eq!(response.code, Code::Canceled);
        assert!(response.error().is_some());
    }

    #[tokio::test]
    async fn test_unary_user_interceptor_headers_reach_transport() {
        let mut extra = HeaderMap::new();
        extra.insert("x-team", HeaderValue::from_static("platform"));
        let config = ProtocolClientConfig::builder("https://api.example.com")
            .interceptor(Arc::new(HeaderInterceptor::new(extra)))
            .build();

        let reply = echo("pong");
        let body = Bytes::from(prost::Message::encode_to_vec(&reply));
        let (transport, seen) = MockUnaryTransport::new(ok_http_response(body));
        let client = ProtocolClient::new(transport, config);

        let _: ResponseMessage<Echo> = client
            .unary(
                "test.Service/Echo",
                IdempotencyLevel::Unknown,
                echo("ping"),
                HeaderMap::new(),
            )
            .await;

        let request = seen.lock().unwrap().take().unwrap();
        assert_eq!(request.headers.get("x-team").unwrap(), "platform");
    }

    #[tokio::test]
    async fn test_server_stream_lifecycle() {
        let reply = echo("one");
        let frame = {
            let encoded = prost::Message::encode_to_vec(&reply);
            pack_raw(envelope_flags::MESSAGE, &encoded)
        };
        let end_stream = pack_raw(envelope_flags::END_STREAM, b"{}");
        let mut response_headers = HeaderMap::new();
        response_headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/connect+proto"));

        let (transport, sent) = ScriptedStreamTransport::new(vec![
            RawStreamEvent::Headers(response_headers),
            RawStreamEvent::Data(frame),
            RawStreamEvent::Data(end_stream),
            RawStreamEvent::Close {
                code: Code::Ok,
                trailers: None,
                error: None,
            },
        ]);
        let client = ProtocolClient::new(transport, connect_config());

        let (sender, mut results) =
            client.server_only_stream::<Echo, Echo>("test.Service/Stream", HeaderMap::new());
        sender.send(echo("request")).unwrap();

        let mut received = Vec::new();
        while let Some(result) = results.recv().await {
            received.push(result);
        }

        assert_eq!(received.len(), 3);
        assert!(matches!(received[0], StreamResult::Headers(_)));
        match &received[1] {
            StreamResult::Message(message) => assert_eq!(message, &reply),
            other => panic!("expected message, got {other:?}"),
        }
        match &received[2] {
            StreamResult::Complete { code, error, .. } => {
                assert_eq!(*code, Code::Ok);
                assert!(error.is_none());
            }
            other => panic!("expected complete, got {other:?}"),
        }

        // The recording task drains the command channel asynchronously.
        for _ in 0..100 {
            if sent.lock().unwrap().len() >= 2 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        }

        // The request message was enveloped and the stream half-closed.
        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), 2);
        match &sent[0] {
            StreamCommand::SendData(data) => {
                assert_eq!(data[0], envelope_flags::MESSAGE);
                let decoded: Echo = prost::Message::decode(&data[5..]).unwrap();
                assert_eq!(decoded, echo("request"));
            }
            other => panic!("expected data, got {other:?}"),
        }
        assert!(matches!(sent[1], StreamCommand::SendClose));
    }

    #[tokio::test]
    async fn test_client_only_stream_zero_messages_fails_validation() {
        let end_stream = pack_raw(envelope_flags::END_STREAM, b"{}");
        let (transport, _) = ScriptedStreamTransport::new(vec![
            RawStreamEvent::Headers(HeaderMap::new()),
            RawStreamEvent::Data(end_stream),
            RawStreamEvent::Close {
                code: Code::Ok,
                trailers: None,
                error: None,
            },
        ]);
        let client = ProtocolClient::new(transport, connect_config());

        let (_sender, mut results) =
            client.client_only_stream::<Echo, Echo>("test.Service/Collect", HeaderMap::new());

        let result = results.recv().await.unwrap();
        match result {
            StreamResult::Complete { code, error, .. } => {
                assert_eq!(code, Code::Unimplemented);
                assert_eq!(
                    error.unwrap().message.as_deref(),
                    Some("stream has no messages")
                );
            }
            other => panic!("expected complete, got {other:?}"),
        }
        assert!(results.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_stream_start_failure_emits_single_terminal() {
        struct Veto;
        struct VetoInstance;
        impl crate::interceptor::InterceptorFactory for Veto {
            fn create_stream(
                &self,
                _config: &ProtocolClientConfig,
            ) -> Option<Arc<dyn StreamInterceptor>> {
                Some(Arc::new(VetoInstance))
            }
        }
        impl StreamInterceptor for VetoInstance {
            fn handle_stream_start(
                &self,
                _request: HttpRequest<()>,
            ) -> BoxFuture<'static, Result<HttpRequest<()>, ConnectError>> {
                Box::pin(std::future::ready(Err(ConnectError::new(
                    Code::PermissionDenied,
                    "not allowed",
                ))))
            }
        }

        // The transport double panics if its stream() is ever reached.
        struct NoStream;
        impl HttpClientInterface for NoStream {
            fn unary(
                &self,
                _request: HttpRequest<Option<Bytes>>,
            ) -> BoxFuture<'static, HttpResponse> {
                panic!("no calls expected");
            }
            fn stream(&self, _request: HttpRequest<()>) -> crate::transport::EstablishedStream {
                panic!("stream must not be opened after a veto");
            }
        }

        let config = ProtocolClientConfig::builder("https://api.example.com")
            .interceptor(Arc::new(Veto))
            .build();
        let client = ProtocolClient::new(Arc::new(NoStream), config);

        let (_sender, mut results) =
            client.bidirectional_stream::<Echo, Echo>("test.Service/Stream", HeaderMap::new());
        match results.recv().await.unwrap() {
            StreamResult::Complete { code, .. } => assert_eq!(code, Code::PermissionDenied),
            other => panic!("expected complete, got {other:?}"),
        }
        assert!(results.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_stream_close_without_end_frame_passes_close_code() {
        let (transport, _) = ScriptedStreamTransport::new(vec![RawStreamEvent::Close {
            code: Code::Unavailable,
            trailers: None,
            error: Some(ConnectError::new(Code::Unavailable, "connection reset")),
        }]);
        let client = ProtocolClient::new(transport, connect_config());

        let (_sender, mut results) =
            client.bidirectional_stream::<Echo, Echo>("test.Service/Stream", HeaderMap::new());
        match results.recv().await.unwrap() {
            StreamResult::Complete { code, error, .. } => {
                assert_eq!(code, Code::Unavailable);
                assert_eq!(error.unwrap().message.as_deref(), Some("connection reset"));
            }
            other => panic!("expected complete, got {other:?}"),
        }
    }
}
