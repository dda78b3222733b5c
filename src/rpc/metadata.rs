//! Call metadata carried in contexts.
//!
//! The server places the metadata a call arrived with in the handler's
//! context as [`IncomingMetadata`]; calls made through a
//! [`ClientConn`](crate::rpc::ClientConn) send the context's
//! [`OutgoingMetadata`].

use axum::http::HeaderMap;
pub use tonic::metadata::MetadataMap;

use crate::context::Context;

/// Headers that belong to HTTP/2 or gRPC itself and never cross as metadata.
const RESERVED: &[&str] = &[
    "connection",
    "content-length",
    "content-type",
    "host",
    "keep-alive",
    "proxy-connection",
    "te",
    "transfer-encoding",
    "upgrade",
    "user-agent",
];

/// Whether `key` may not be sent as metadata.
pub fn is_reserved(key: &str) -> bool {
    key.starts_with("grpc-") || RESERVED.contains(&key)
}

/// Metadata received with the call being handled.
#[derive(Debug, Clone, Default)]
pub struct IncomingMetadata(pub MetadataMap);

/// Metadata to send with calls made under a context.
#[derive(Debug, Clone, Default)]
pub struct OutgoingMetadata(pub MetadataMap);

/// Metadata the current call arrived with.
pub fn incoming(ctx: &Context) -> Option<&MetadataMap> {
    ctx.value::<IncomingMetadata>().map(|md| &md.0)
}

/// Metadata that outgoing calls under `ctx` will carry.
pub fn outgoing(ctx: &Context) -> Option<&MetadataMap> {
    ctx.value::<OutgoingMetadata>().map(|md| &md.0)
}

/// A context whose outgoing metadata is the existing one plus `md`.
///
/// Reserved keys in `md` are dropped.
pub fn with_outgoing(ctx: &Context, md: &MetadataMap) -> Context {
    let mut headers = outgoing(ctx)
        .cloned()
        .map(MetadataMap::into_headers)
        .unwrap_or_default();
    append_unreserved(&mut headers, md.clone().into_headers());
    ctx.with_value(OutgoingMetadata(MetadataMap::from_headers(headers)))
}

fn append_unreserved(into: &mut HeaderMap, from: HeaderMap) {
    for (name, value) in &from {
        if !is_reserved(name.as_str()) {
            into.append(name.clone(), value.clone());
        }
    }
}
