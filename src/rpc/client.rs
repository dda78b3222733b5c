//! RPC client connection.
//!
//! A [`ClientConn`] is a tonic [`Channel`] whose connector dials through a
//! [`Dialer`] instead of opening a socket. Calls are multiplexed over it;
//! clones share the channel. When the connection drops, the channel dials
//! again on the next call.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use axum::http::uri::PathAndQuery;
use bytes::Bytes;
use hyper_util::rt::TokioIo;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tonic::client::Grpc;
use tonic::transport::{Channel, Endpoint, Uri};
use tonic::Status;

use crate::context::Context;
use crate::net::{PipeAddr, PipeDialer, PipeStream, TransportError};
use crate::rpc::codec::RawCodec;
use crate::rpc::metadata;

/// Opens the byte stream a [`ClientConn`] runs over.
pub trait Dialer: Clone + Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    fn dial(
        &self,
        target: &str,
        timeout: Duration,
    ) -> impl Future<Output = Result<Self::Stream, TransportError>> + Send;
}

impl Dialer for PipeDialer {
    type Stream = PipeStream;

    async fn dial(&self, target: &str, timeout: Duration) -> Result<PipeStream, TransportError> {
        PipeDialer::dial(self, target, timeout).await
    }
}

/// Error type for establishing a client connection.
#[derive(Debug, Error)]
pub enum DialError {
    #[error("invalid target {0:?}")]
    InvalidTarget(String),

    #[error("dial failed: {0}")]
    Transport(#[from] TransportError),

    #[error("connect failed: {0}")]
    Connect(#[from] tonic::transport::Error),
}

/// Client connection options.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Dial timeout.
    pub dial_timeout: Duration,
    /// Largest message accepted or sent, in bytes.
    pub max_message_bytes: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        let transport = crate::config::TransportConfig::default();
        let rpc = crate::config::RpcConfig::default();
        Self {
            dial_timeout: Duration::from_millis(transport.dial_timeout_ms),
            max_message_bytes: rpc.max_message_bytes,
        }
    }
}

/// A multiplexed connection to an RPC server.
#[derive(Clone)]
pub struct ClientConn {
    grpc: Grpc<Channel>,
    target: String,
}

impl ClientConn {
    /// Dial `target` and establish the HTTP/2 connection.
    ///
    /// An empty `target` addresses the listener behind `dialer` by its
    /// network name.
    pub async fn connect<D: Dialer>(target: &str, dialer: &D, options: ClientOptions) -> Result<Self, DialError> {
        let target = if target.is_empty() {
            PipeAddr::NETWORK.to_string()
        } else {
            target.to_string()
        };
        let endpoint = Endpoint::from_shared(format!("http://{target}"))
            .map_err(|_| DialError::InvalidTarget(target.clone()))?;

        // The first stream is dialed here so a dead listener fails the
        // connect itself; reconnects dial again through the connector.
        let timeout = options.dial_timeout;
        let first = Arc::new(Mutex::new(Some(dialer.dial(&target, timeout).await?)));
        let connector = {
            let dialer = dialer.clone();
            let target = target.clone();
            tower::service_fn(move |_: Uri| {
                let dialer = dialer.clone();
                let target = target.clone();
                let first = first.lock().unwrap_or_else(PoisonError::into_inner).take();
                async move {
                    let stream = match first {
                        Some(stream) => stream,
                        None => dialer.dial(&target, timeout).await?,
                    };
                    Ok::<_, TransportError>(TokioIo::new(stream))
                }
            })
        };

        let channel = endpoint.connect_with_connector(connector).await?;
        let grpc = Grpc::new(channel)
            .max_decoding_message_size(options.max_message_bytes)
            .max_encoding_message_size(options.max_message_bytes);

        tracing::debug!(target = %target, "Client connection established");
        Ok(Self { grpc, target })
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Invoke a unary method with an encoded payload.
    ///
    /// Outgoing metadata and the deadline are taken from `ctx`; the call is
    /// abandoned with `Cancelled`/`DeadlineExceeded` when `ctx` finishes first.
    pub async fn unary(&self, ctx: &Context, method: &str, payload: Bytes) -> Result<Bytes, Status> {
        if let Some(done) = ctx.done() {
            return Err(done.into());
        }

        let path = PathAndQuery::try_from(method)
            .map_err(|e| Status::internal(format!("invalid method path {method}: {e}")))?;
        let mut request = tonic::Request::new(payload);
        if let Some(md) = metadata::outgoing(ctx) {
            *request.metadata_mut() = md.clone();
        }
        if let Some(remaining) = ctx.remaining() {
            request.set_timeout(remaining);
        }

        let mut grpc = self.grpc.clone();
        let call = async move {
            grpc.ready()
                .await
                .map_err(|e| Status::unavailable(format!("connection unavailable: {e}")))?;
            grpc.unary(request, path, RawCodec)
                .await
                .map(tonic::Response::into_inner)
        };

        tokio::select! {
            result = call => result,
            done = ctx.cancelled() => Err(done.into()),
        }
    }
}

impl std::fmt::Debug for ClientConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConn")
            .field("target", &self.target)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tonic::Code;

    use crate::config::TransportConfig;
    use crate::net::listen;
    use crate::rpc::interceptor::{unary_handler, CallInfo, Next};
    use crate::rpc::metadata::MetadataMap;
    use crate::rpc::server::{RpcServer, ServerOptions};

    async fn start(server: &RpcServer) -> ClientConn {
        let listener = listen(&TransportConfig::default());
        let dialer = listener.dialer();
        tokio::spawn({
            let server = server.clone();
            async move { server.serve(listener).await }
        });
        ClientConn::connect("", &dialer, ClientOptions::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn unary_call_round_trip() {
        let server = RpcServer::new(ServerOptions::default());
        server
            .register_unary(
                "/test.Upper/Call",
                unary_handler(|_ctx, payload: Bytes| async move {
                    Ok(Bytes::from(payload.to_ascii_uppercase()))
                }),
            )
            .unwrap();
        let conn = start(&server).await;
        assert_eq!(conn.target(), "rpc-pipe");

        let out = conn
            .unary(&Context::background(), "/test.Upper/Call", Bytes::from_static(b"abc"))
            .await
            .unwrap();
        assert_eq!(&out[..], b"ABC");
        server.stop();
    }

    #[tokio::test]
    async fn metadata_reaches_handler() {
        let server = RpcServer::new(ServerOptions::default());
        server
            .register_unary(
                "/test.Meta/Get",
                unary_handler(|ctx: Context, _payload| async move {
                    let user = metadata::incoming(&ctx)
                        .and_then(|md| md.get("x-user"))
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("anonymous")
                        .to_string();
                    Ok(Bytes::from(user))
                }),
            )
            .unwrap();
        let conn = start(&server).await;

        let mut md = MetadataMap::new();
        md.insert("x-user", "alice".parse().unwrap());
        let ctx = metadata::with_outgoing(&Context::background(), &md);

        let out = conn.unary(&ctx, "/test.Meta/Get", Bytes::new()).await.unwrap();
        assert_eq!(&out[..], b"alice");
        server.stop();
    }

    #[tokio::test]
    async fn unknown_method_is_unimplemented() {
        let server = RpcServer::new(ServerOptions::default());
        let conn = start(&server).await;

        let err = conn
            .unary(&Context::background(), "/test.Missing/Call", Bytes::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::Unimplemented);
        server.stop();
    }

    #[tokio::test]
    async fn handler_status_passes_through() {
        let server = RpcServer::new(ServerOptions::default());
        server
            .register_unary(
                "/test.Fail/Call",
                unary_handler(|_ctx, _payload| async move {
                    Err::<Bytes, _>(Status::failed_precondition("not ready"))
                }),
            )
            .unwrap();
        let conn = start(&server).await;

        let err = conn
            .unary(&Context::background(), "/test.Fail/Call", Bytes::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::FailedPrecondition);
        assert_eq!(err.message(), "not ready");
        server.stop();
    }

    #[tokio::test]
    async fn deadline_propagates_to_server() {
        let seen = Arc::new(std::sync::Mutex::new(None));
        let server = RpcServer::new(ServerOptions::default());
        server
            .register_unary(
                "/test.Slow/Call",
                unary_handler({
                    let seen = Arc::clone(&seen);
                    move |ctx: Context, _payload| {
                        *seen.lock().unwrap() = ctx.deadline();
                        async move {
                            tokio::time::sleep(Duration::from_secs(5)).await;
                            Ok(Bytes::new())
                        }
                    }
                }),
            )
            .unwrap();
        let conn = start(&server).await;

        let ctx = Context::background().with_timeout(Duration::from_millis(200));
        let err = conn.unary(&ctx, "/test.Slow/Call", Bytes::new()).await.unwrap_err();
        assert_eq!(err.code(), Code::DeadlineExceeded);
        assert!(seen.lock().unwrap().is_some(), "handler should see the caller's deadline");
        server.stop();
    }

    #[tokio::test]
    async fn panicking_handler_is_internal() {
        let server = RpcServer::new(ServerOptions::default());
        server
            .register_unary(
                "/test.Boom/Call",
                unary_handler(|_ctx, payload: Bytes| async move {
                    if payload.as_ref() == b"boom" {
                        panic!("handler blew up");
                    }
                    Ok(payload)
                }),
            )
            .unwrap();
        let conn = start(&server).await;

        let err = conn
            .unary(&Context::background(), "/test.Boom/Call", Bytes::from_static(b"boom"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::Internal);

        let out = conn
            .unary(&Context::background(), "/test.Boom/Call", Bytes::from_static(b"ok"))
            .await
            .unwrap();
        assert_eq!(&out[..], b"ok");
        server.stop();
    }

    #[tokio::test]
    async fn interceptor_sees_every_call() {
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let interceptor = {
            let seen = Arc::clone(&seen);
            move |ctx: Context, payload: Bytes, info: CallInfo, next: Next| {
                seen.lock().unwrap().push(info.method.clone());
                next.run(ctx, payload)
            }
        };

        let server = RpcServer::new(ServerOptions::default().interceptor(interceptor).unwrap());
        server
            .register_unary("/test.Echo/Call", unary_handler(|_ctx, p| async move { Ok(p) }))
            .unwrap();
        let conn = start(&server).await;

        for _ in 0..3 {
            conn.unary(&Context::background(), "/test.Echo/Call", Bytes::from_static(b"x"))
                .await
                .unwrap();
        }
        assert_eq!(seen.lock().unwrap().len(), 3);
        server.stop();
    }

    #[tokio::test]
    async fn connect_fails_when_listener_closed() {
        let listener = listen(&TransportConfig::default());
        listener.close();
        let err = ClientConn::connect("", &listener.dialer(), ClientOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, DialError::Transport(TransportError::Closed)), "{err}");
    }
}
