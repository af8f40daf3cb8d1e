//! Envelope framing for streaming RPC payloads.
//!
//! Every streaming message is wrapped in a 5-byte envelope header:
//!
//! ```text
//! [ flags (1 byte) ][ length (4 bytes, big-endian) ][ payload ]
//! ```
//!
//! Flag bits:
//! - `0x01`: payload is compressed
//! - `0x02`: Connect end-of-stream JSON
//! - `0x80`: gRPC-Web trailers block

use bytes::{BufMut, Bytes, BytesMut};

use crate::{BoxedCodec, EnvelopeError, RequestCompression};

/// Envelope flag bits.
pub mod envelope_flags {
    /// Plain message frame.
    pub const MESSAGE: u8 = 0x00;
    /// Payload is compressed.
    pub const COMPRESSED: u8 = 0x01;
    /// Connect protocol end-of-stream frame.
    pub const END_STREAM: u8 = 0x02;
    /// gRPC-Web trailers frame.
    pub const TRAILERS: u8 = 0x80;
}

/// Size of the envelope header: 1 flag byte + 4 length bytes.
pub const ENVELOPE_HEADER_SIZE: usize = 5;

/// Wrap a serialized message in an envelope.
///
/// The compressed bit is set only when a codec is configured, the payload
/// meets the configured minimum size, and compression actually succeeds.
/// A codec failure falls back to sending the payload uncompressed.
pub fn pack(message: &[u8], compression: Option<&RequestCompression>) -> Bytes {
    let (payload, compressed) = match compression {
        Some(config) if config.should_compress(message) => {
            match config.pool.compress(message) {
                Ok(compressed) => (compressed, true),
                Err(_) => (Bytes::copy_from_slice(message), false),
            }
        }
        _ => (Bytes::copy_from_slice(message), false),
    };

    let flags = if compressed {
        envelope_flags::COMPRESSED
    } else {
        envelope_flags::MESSAGE
    };
    let mut framed = BytesMut::with_capacity(ENVELOPE_HEADER_SIZE + payload.len());
    framed.put_u8(flags);
    framed.put_u32(payload.len() as u32);
    framed.put_slice(&payload);
    framed.freeze()
}

/// Wrap an already-encoded payload with explicit flags, without compressing.
pub fn pack_raw(flags: u8, payload: &[u8]) -> Bytes {
    let mut framed = BytesMut::with_capacity(ENVELOPE_HEADER_SIZE + payload.len());
    framed.put_u8(flags);
    framed.put_u32(payload.len() as u32);
    framed.put_slice(payload);
    framed.freeze()
}

/// Read the payload length from a buffered envelope header.
///
/// Returns `None` when fewer than [`ENVELOPE_HEADER_SIZE`] bytes are
/// buffered. The length is reported regardless of whether the payload
/// itself has fully arrived.
pub fn message_length(buffer: &[u8]) -> Option<usize> {
    if buffer.len() < ENVELOPE_HEADER_SIZE {
        return None;
    }
    let length = u32::from_be_bytes([buffer[1], buffer[2], buffer[3], buffer[4]]);
    Some(length as usize)
}

/// Unpack a complete envelope frame (header included).
///
/// Returns the flags byte untouched, so callers can inspect the
/// end-of-stream and trailers bits, along with the payload, decompressed
/// when the compressed bit is set. A frame shorter than its header fails
/// with [`EnvelopeError::TruncatedFrame`], and a compressed frame with no
/// configured codec with [`EnvelopeError::MissingExpectedCompressionPool`].
pub fn unpack(frame: &Bytes, pool: Option<&BoxedCodec>) -> Result<(u8, Bytes), EnvelopeError> {
    if frame.len() < ENVELOPE_HEADER_SIZE {
        return Err(EnvelopeError::TruncatedFrame);
    }
    let flags = frame[0];
    let payload = frame.slice(ENVELOPE_HEADER_SIZE..);
    if flags & envelope_flags::COMPRESSED == 0 {
        return Ok((flags, payload));
    }
    let pool = pool.ok_or(EnvelopeError::MissingExpectedCompressionPool)?;
    let decompressed = pool
        .decompress(&payload)
        .map_err(|err| EnvelopeError::Decompress(err.to_string()))?;
    Ok((flags & !envelope_flags::COMPRESSED, decompressed))
}
