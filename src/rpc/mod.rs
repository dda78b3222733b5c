//! Unary RPC plumbing on top of tonic.
//!
//! # Data Flow
//! ```text
//! ClientConn::unary(ctx, "/pkg.Service/Method", payload)
//!     → tonic Channel over a dialed pipe (metadata, grpc-timeout)
//!     → RpcServer dispatch (method table lookup)
//!     → tonic::server::Grpc framing
//!     → UnaryInterceptor (optional, wraps every call)
//!     → registered handler
//!     → response message or tonic::Status
//! ```
//!
//! # Design Decisions
//! - Messages are JSON; the wire codec passes bytes through and typed
//!   encode/decode lives in `codec.rs`
//! - The method table can grow while the server is serving, so dispatch is
//!   a lookup per call rather than a fixed tonic router
//! - Status, codes and metadata are tonic's own types

pub mod client;
pub mod codec;
pub mod interceptor;
pub mod metadata;
pub mod server;

pub use client::{ClientConn, ClientOptions, DialError, Dialer};
pub use codec::RawCodec;
pub use interceptor::{unary_handler, CallInfo, Next, UnaryHandler, UnaryInterceptor, UnaryResult};
pub use metadata::{IncomingMetadata, MetadataMap, OutgoingMetadata};
pub use server::{OptionsError, RegisterError, RpcServer, ServerOptions};
pub use tonic::{Code, Status};

use crate::context::Done;
use crate::net::TransportError;

impl From<Done> for Status {
    fn from(done: Done) -> Self {
        match done {
            Done::Cancelled => Status::cancelled("context canceled"),
            Done::DeadlineExceeded => Status::deadline_exceeded("context deadline exceeded"),
        }
    }
}

impl From<TransportError> for Status {
    fn from(err: TransportError) -> Self {
        Status::unavailable(err.to_string())
    }
}
