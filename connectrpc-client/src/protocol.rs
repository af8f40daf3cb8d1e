//! Protocol interceptors.
//!
//! Each supported protocol is implemented as an interceptor registered at
//! the end of the chain, closest to the wire. Everything upstream of it
//! (user interceptors, serialization, orchestration) is protocol-agnostic.

mod connect;
mod grpc;
mod grpc_web;

use std::sync::Arc;

use crate::interceptor::InterceptorFactory;

pub use connect::ConnectProtocol;
pub use grpc::GrpcProtocol;
pub use grpc_web::GrpcWebProtocol;

/// The application-layer protocol a client speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NetworkProtocol {
    #[default]
    Connect,
    Grpc,
    GrpcWeb,
}

impl NetworkProtocol {
    pub fn name(&self) -> &'static str {
        match self {
            NetworkProtocol::Connect => "connect",
            NetworkProtocol::Grpc => "grpc",
            NetworkProtocol::GrpcWeb => "grpc-web",
        }
    }
}

/// The interceptor factory implementing the given protocol.
pub(crate) fn factory(protocol: NetworkProtocol) -> Arc<dyn InterceptorFactory> {
    match protocol {
        NetworkProtocol::Connect => Arc::new(ConnectProtocol),
        NetworkProtocol::Grpc => Arc::new(GrpcProtocol),
        NetworkProtocol::GrpcWeb => Arc::new(GrpcWebProtocol),
    }
}
