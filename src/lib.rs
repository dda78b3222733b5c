//! HTTP/JSON gateway and RPC server sharing one process over in-memory pipes.

pub mod config;
pub mod context;
pub mod correlation;
pub mod echo;
pub mod gateway;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod rpc;
pub mod server;

pub use config::schema::PipeConfig;
pub use context::{CancelPropagation, Context};
pub use correlation::{InboundRequest, RequestResolver, CORRELATION_HEADER};
pub use gateway::{GatewayMux, MuxOptions, METADATA_HEADER_PREFIX};
pub use lifecycle::Shutdown;
pub use rpc::OptionsError;
pub use server::{GatewayOptions, GatewayServer, ServerError, ServerState};
