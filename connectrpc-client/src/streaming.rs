//! Stream results, frame buffering, and client-only-stream validation.

use bytes::{Bytes, BytesMut};
use http::HeaderMap;

use connectrpc_client_core::{
    Code, ConnectError, ENVELOPE_HEADER_SIZE, message_length,
};

/// One event in the life of a stream.
///
/// A well-formed stream delivers at most one `Headers` (always first), any
/// number of `Message`s, and exactly one `Complete` (always last).
#[derive(Debug, Clone)]
pub enum StreamResult<T> {
    Headers(HeaderMap),
    Message(T),
    Complete {
        code: Code,
        error: Option<ConnectError>,
        trailers: Option<HeaderMap>,
    },
}

impl<T> StreamResult<T> {
    /// A terminal result built from an error, exposing the error's metadata
    /// as trailers.
    pub fn complete_from_error(error: ConnectError) -> Self {
        let trailers = if error.metadata.is_empty() {
            None
        } else {
            Some(error.metadata.clone())
        };
        StreamResult::Complete {
            code: error.code,
            error: Some(error),
            trailers,
        }
    }

    /// A successful terminal result.
    pub fn complete_ok(trailers: Option<HeaderMap>) -> Self {
        StreamResult::Complete {
            code: Code::Ok,
            error: None,
            trailers,
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, StreamResult::Complete { .. })
    }

    /// Convert the message payload, leaving the other variants untouched.
    ///
    /// A conversion failure becomes a terminal result with code `unknown`,
    /// so a broken frame always surfaces as exactly one completion rather
    /// than disappearing.
    pub fn map_message<U>(
        self,
        f: impl FnOnce(T) -> Result<U, ConnectError>,
    ) -> StreamResult<U> {
        match self {
            StreamResult::Headers(headers) => StreamResult::Headers(headers),
            StreamResult::Message(message) => match f(message) {
                Ok(converted) => StreamResult::Message(converted),
                Err(error) => StreamResult::complete_from_error(error),
            },
            StreamResult::Complete {
                code,
                error,
                trailers,
            } => StreamResult::Complete {
                code,
                error,
                trailers,
            },
        }
    }
}

/// Accumulates raw transport chunks and yields complete envelope frames.
///
/// A chunk may contain a partial frame, one frame, or several; any trailing
/// partial frame stays buffered until the next chunk arrives.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buffer: BytesMut,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Pop the next complete frame, header included.
    pub fn next_frame(&mut self) -> Option<Bytes> {
        let length = message_length(&self.buffer)?;
        let total = ENVELOPE_HEADER_SIZE + length;
        if self.buffer.len() < total {
            return None;
        }
        Some(self.buffer.split_to(total).freeze())
    }

    /// Bytes buffered but not yet framed.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

/// Enforces the one-logical-response contract of client-only streams.
///
/// Results are buffered until the terminal event. A non-ok completion
/// passes everything through unchanged; an ok completion is only valid when
/// exactly one message arrived.
#[derive(Debug)]
pub struct ClientOnlyValidator<T> {
    buffered: Vec<StreamResult<T>>,
}

impl<T> Default for ClientOnlyValidator<T> {
    fn default() -> Self {
        Self {
            buffered: Vec::new(),
        }
    }
}

impl<T> ClientOnlyValidator<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one result. Returns the validated batch once the stream
    /// completes, `None` while still buffering.
    pub fn push(&mut self, result: StreamResult<T>) -> Option<Vec<StreamResult<T>>> {
        let terminal = result.is_complete();
        self.buffered.push(result);
        if !terminal {
            return None;
        }

        let results = std::mem::take(&mut self.buffered);
        let ok_terminal = matches!(
            results.last(),
            Some(StreamResult::Complete { code: Code::Ok, .. })
        );
        if !ok_terminal {
            return Some(results);
        }

        let messages = results
            .iter()
            .filter(|result| matches!(result, StreamResult::Message(_)))
            .count();
        match messages {
            1 => Some(results),
            0 => Some(vec![StreamResult::complete_from_error(ConnectError::new(
                Code::Unimplemented,
                "stream has no messages",
            ))]),
            _ => Some(vec![StreamResult::complete_from_error(ConnectError::new(
                Code::Unimplemented,
                "stream has multiple messages",
            ))]),
        }
    }
}
