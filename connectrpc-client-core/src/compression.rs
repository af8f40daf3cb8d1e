//! Compression codecs and request compression configuration.
//!
//! Streaming protocols compress each enveloped message individually; unary
//! Connect requests compress the whole body. Both paths share the [`Codec`]
//! trait here.

use bytes::Bytes;
use std::io;
use std::sync::Arc;

#[cfg(feature = "compression-gzip")]
use std::io::{Read, Write};

#[cfg(feature = "compression-gzip")]
use flate2::Compression as GzipLevel;
#[cfg(feature = "compression-gzip")]
use flate2::read::GzDecoder;
#[cfg(feature = "compression-gzip")]
use flate2::write::GzEncoder;

/// Codec trait for message compression.
///
/// Implementations are looked up by [`Codec::name`], which is the value
/// carried in `content-encoding` / `connect-content-encoding` /
/// `grpc-encoding` headers.
pub trait Codec: Send + Sync + 'static {
    /// The encoding name for HTTP headers (e.g., "gzip").
    fn name(&self) -> &'static str;

    /// Compress data.
    fn compress(&self, data: &[u8]) -> io::Result<Bytes>;

    /// Decompress data.
    fn decompress(&self, data: &[u8]) -> io::Result<Bytes>;
}

/// A boxed codec for type-erased storage.
#[derive(Clone)]
pub struct BoxedCodec(Arc<dyn Codec>);

impl BoxedCodec {
    /// Create a new boxed codec.
    pub fn new<C: Codec>(codec: C) -> Self {
        BoxedCodec(Arc::new(codec))
    }

    /// Get the codec name for HTTP headers.
    pub fn name(&self) -> &'static str {
        self.0.name()
    }

    /// Compress data.
    pub fn compress(&self, data: &[u8]) -> io::Result<Bytes> {
        self.0.compress(data)
    }

    /// Decompress data.
    pub fn decompress(&self, data: &[u8]) -> io::Result<Bytes> {
        self.0.decompress(data)
    }
}

impl std::fmt::Debug for BoxedCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("BoxedCodec").field(&self.name()).finish()
    }
}

/// Gzip codec using flate2.
///
/// Requires the `compression-gzip` feature (on by default).
#[cfg(feature = "compression-gzip")]
#[derive(Debug, Clone, Copy)]
pub struct GzipCodec {
    /// Compression level (0-9). Default is 6.
    pub level: u32,
}

#[cfg(feature = "compression-gzip")]
impl Default for GzipCodec {
    fn default() -> Self {
        Self { level: 6 }
    }
}

#[cfg(feature = "compression-gzip")]
impl GzipCodec {
    /// Create a new GzipCodec with the specified compression level.
    ///
    /// Level ranges from 0 (no compression) to 9 (best compression).
    pub fn with_level(level: u32) -> Self {
        Self {
            level: level.min(9),
        }
    }
}

#[cfg(feature = "compression-gzip")]
impl Codec for GzipCodec {
    fn name(&self) -> &'static str {
        "gzip"
    }

    fn compress(&self, data: &[u8]) -> io::Result<Bytes> {
        let mut encoder = GzEncoder::new(Vec::new(), GzipLevel::new(self.level));
        encoder.write_all(data)?;
        Ok(Bytes::from(encoder.finish()?))
    }

    fn decompress(&self, data: &[u8]) -> io::Result<Bytes> {
        let mut decoder = GzDecoder::new(data);
        let mut decompressed = Vec::new();
        decoder.read_to_end(&mut decompressed)?;
        Ok(Bytes::from(decompressed))
    }
}

/// Identity codec (no compression).
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityCodec;

impl Codec for IdentityCodec {
    fn name(&self) -> &'static str {
        "identity"
    }

    fn compress(&self, data: &[u8]) -> io::Result<Bytes> {
        Ok(Bytes::copy_from_slice(data))
    }

    fn decompress(&self, data: &[u8]) -> io::Result<Bytes> {
        Ok(Bytes::copy_from_slice(data))
    }
}

/// Outbound compression configuration.
///
/// Payloads smaller than `min_bytes` are sent uncompressed; compressing
/// tiny payloads costs more than it saves.
#[derive(Debug, Clone)]
pub struct RequestCompression {
    /// Minimum payload size, in bytes, required before compression kicks in.
    pub min_bytes: usize,
    /// The codec used for outbound payloads.
    pub pool: BoxedCodec,
}

impl RequestCompression {
    pub fn new(min_bytes: usize, pool: BoxedCodec) -> Self {
        Self { min_bytes, pool }
    }

    /// Whether an outbound payload of this size should be compressed.
    pub fn should_compress(&self, payload: &[u8]) -> bool {
        payload.len() >= self.min_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_round_trip() {
        let codec = IdentityCodec;
        assert_eq!(codec.compress(b"abc").unwrap().as_ref(), b"abc");
        assert_eq!(codec.decompress(b"abc").unwrap().as_ref(), b"abc");
    }

    #[test]
    fn test_should_compress_threshold() {
        let config = RequestCompression::new(10, BoxedCodec::new(IdentityCodec));
        assert!(!config.should_compress(b"short"));
        assert!(config.should_compress(b"long enough payload"));
    }

    #[cfg(feature = "compression-gzip")]
    #[test]
    fn test_gzip_round_trip() {
        let codec = GzipCodec::default();
        let input = b"the quick brown fox jumps over the lazy dog";
        let compressed = codec.compress(input).unwrap();
        assert_ne!(compressed.as_ref(), &input[..]);
        let decompressed = codec.decompress(&compressed).unwrap();
        assert_eq!(decompressed.as_ref(), &input[..]);
    }
}
