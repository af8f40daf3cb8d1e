//! The transport seam.
//!
//! The client runtime does not implement HTTP. It consumes a transport
//! through [`HttpClientInterface`] and does all framing, compression, and
//! protocol work itself. The transport's only obligations: perform the
//! unary exchange, and for streams, accept commands and deliver raw
//! (possibly partial) response chunks plus exactly one close event.

use bytes::Bytes;
use futures::future::BoxFuture;
use http::HeaderMap;
use tokio::sync::{Notify, mpsc};

use connectrpc_client_core::{Code, ConnectError};

use crate::request::HttpRequest;
use crate::response::{HttpMetrics, HttpResponse};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Commands sent from the runtime to an open transport stream.
#[derive(Debug)]
pub enum StreamCommand {
    /// Send framed bytes over the stream.
    SendData(Bytes),
    /// Half-close: no further data will be sent.
    SendClose,
    /// Abort the stream. The transport must eventually deliver a
    /// [`RawStreamEvent::Close`] with code `canceled`.
    Cancel,
}

/// Events delivered from an open transport stream to the runtime.
#[derive(Debug)]
pub enum RawStreamEvent {
    /// Response headers, delivered at most once, before any data.
    Headers(HeaderMap),
    /// A raw chunk of the response body. May hold a partial frame, one
    /// frame, or several.
    Data(Bytes),
    /// Transport-level metrics.
    Metrics(HttpMetrics),
    /// Terminal event. Delivered exactly once.
    Close {
        code: Code,
        trailers: Option<HeaderMap>,
        error: Option<ConnectError>,
    },
}

/// An open transport stream: a command channel in, an event channel out.
pub struct EstablishedStream {
    pub commands: mpsc::UnboundedSender<StreamCommand>,
    pub events: mpsc::UnboundedReceiver<RawStreamEvent>,
}

/// The HTTP transport consumed by [`ProtocolClient`](crate::ProtocolClient).
pub trait HttpClientInterface: Send + Sync + 'static {
    /// Perform a unary HTTP exchange.
    fn unary(&self, request: HttpRequest<Option<Bytes>>) -> BoxFuture<'static, HttpResponse>;

    /// Open a bidirectional stream.
    fn stream(&self, request: HttpRequest<()>) -> EstablishedStream;
}

/// A cancellation token passed explicitly through a call.
///
/// Cancelling before the request is dispatched suppresses the send
/// entirely; cancelling mid-flight resolves the call with code `canceled`.
/// Cloning yields a handle to the same token.
#[derive(Debug, Clone, Default)]
pub struct Cancelation {
    inner: Arc<CancelationInner>,
}

#[derive(Debug, Default)]
struct CancelationInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl Cancelation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once the token is cancelled; pends forever otherwise.
    pub async fn cancelled(&self) {
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        // Register before re-checking the flag so a concurrent cancel()
        // cannot slip between the check and the await.
        notified.as_mut().enable();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cancelation_observed_after_cancel() {
        let token = Cancelation::new();
        assert!(!token.is_cancelled());
        let waiter = token.clone();
        let handle = tokio::spawn(async move {
            waiter.cancelled().await;
        });
        token.cancel();
        assert!(token.is_cancelled());
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_resolves_immediately_when_already_cancelled() {
        let token = Cancelation::new();
        token.cancel();
        token.cancelled().await;
    }
}
