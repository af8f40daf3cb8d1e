//! Core protocol types for the ConnectRPC client runtime.
//!
//! This crate provides the protocol-independent building blocks shared by
//! every protocol the client speaks (Connect, gRPC, gRPC-Web).
//!
//! ## Modules
//!
//! - [`code`]: RPC status codes and their HTTP mappings
//! - [`error`]: Rich RPC errors, error details, gRPC status parsing
//! - [`envelope`]: 5-byte envelope framing for streaming payloads
//! - [`compression`]: Compression codec trait and implementations
//! - [`message`]: Message serialization (binary protobuf and JSON)
//! - [`headers`]: Raw header multimaps, lowercasing, trailer blocks

mod code;
mod compression;
mod envelope;
mod error;
mod headers;
mod message;

pub use code::*;
pub use compression::*;
pub use envelope::*;
pub use error::*;
pub use headers::*;
pub use message::*;
