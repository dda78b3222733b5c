//! RPC server: method table, serve loop and per-connection HTTP/2 handling.
//!
//! # Responsibilities
//! - Register unary handlers by full method path
//! - Accept connections from a [`PipeListener`] until stopped
//! - Serve each connection over HTTP/2, frame calls with
//!   [`tonic::server::Grpc`] and run them through the interceptor
//! - Stop promptly: close the listener and drop every connection

use std::collections::HashMap;
use std::convert::Infallible;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Instant;

use axum::http::{header, HeaderValue, Request, Response};
use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use hyper::body::Incoming;
use hyper::server::conn::http2;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use thiserror::Error;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tonic::body::BoxBody;
use tonic::metadata::GRPC_CONTENT_TYPE;
use tonic::server::{Grpc, UnaryService};
use tonic::{Code, Status};

use crate::context::Context;
use crate::net::{ConnectionId, ConnectionTracker, PipeListener, PipeStream};
use crate::observability::metrics;
use crate::rpc::codec::RawCodec;
use crate::rpc::interceptor::{CallInfo, Next, UnaryHandler, UnaryInterceptor};
use crate::rpc::metadata::IncomingMetadata;

/// Request header carrying the caller's remaining deadline.
const TIMEOUT_HEADER: &str = "grpc-timeout";

/// Error type for method registration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegisterError {
    #[error("method {0} is already registered")]
    DuplicateMethod(String),

    #[error("invalid method path {0:?}: expected /package.Service/Method")]
    InvalidPath(String),
}

/// Error type for option builder steps.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OptionsError {
    #[error("the unary server interceptor has already been set")]
    InterceptorAlreadySet,
}

/// Server construction options.
#[derive(Clone)]
pub struct ServerOptions {
    interceptor: Option<Arc<dyn UnaryInterceptor>>,
    max_message_bytes: usize,
    max_concurrent_streams: u32,
}

impl ServerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Largest message accepted or sent, in bytes.
    pub fn max_message_bytes(mut self, bytes: usize) -> Self {
        self.max_message_bytes = bytes;
        self
    }

    /// Concurrent calls allowed per connection.
    pub fn max_concurrent_streams(mut self, streams: u32) -> Self {
        self.max_concurrent_streams = streams;
        self
    }

    /// Install the interceptor invoked around every handler call.
    ///
    /// There is one interceptor slot. Filling it twice is an error; compose
    /// interceptors inside a single implementation instead.
    pub fn interceptor<I: UnaryInterceptor>(self, interceptor: I) -> Result<Self, OptionsError> {
        self.install_interceptor(Arc::new(interceptor))
    }

    pub fn has_interceptor(&self) -> bool {
        self.interceptor.is_some()
    }

    pub(crate) fn install_interceptor(mut self, interceptor: Arc<dyn UnaryInterceptor>) -> Result<Self, OptionsError> {
        if self.interceptor.is_some() {
            return Err(OptionsError::InterceptorAlreadySet);
        }
        self.interceptor = Some(interceptor);
        Ok(self)
    }

    pub(crate) fn take_interceptor(&mut self) -> Option<Arc<dyn UnaryInterceptor>> {
        self.interceptor.take()
    }
}

impl Default for ServerOptions {
    fn default() -> Self {
        let rpc = crate::config::RpcConfig::default();
        Self {
            interceptor: None,
            max_message_bytes: rpc.max_message_bytes,
            max_concurrent_streams: rpc.max_concurrent_streams,
        }
    }
}

impl std::fmt::Debug for ServerOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerOptions")
            .field("interceptor", &self.interceptor.is_some())
            .field("max_message_bytes", &self.max_message_bytes)
            .field("max_concurrent_streams", &self.max_concurrent_streams)
            .finish()
    }
}

struct ServerInner {
    handlers: RwLock<HashMap<String, UnaryHandler>>,
    options: ServerOptions,
    listener: Mutex<Option<PipeListener>>,
    stop: CancellationToken,
    tracker: ConnectionTracker,
}

/// A unary RPC server. Cloning yields another handle to the same server.
#[derive(Clone)]
pub struct RpcServer {
    inner: Arc<ServerInner>,
}

impl RpcServer {
    pub fn new(options: ServerOptions) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                handlers: RwLock::new(HashMap::new()),
                options,
                listener: Mutex::new(None),
                stop: CancellationToken::new(),
                tracker: ConnectionTracker::new(),
            }),
        }
    }

    /// Register a handler for a full method path such as `/echo.EchoService/Echo`.
    ///
    /// Registration may happen before or while serving.
    pub fn register_unary(&self, method: &str, handler: UnaryHandler) -> Result<(), RegisterError> {
        let valid = method
            .strip_prefix('/')
            .and_then(|rest| rest.split_once('/'))
            .is_some_and(|(service, name)| !service.is_empty() && !name.is_empty() && !name.contains('/'));
        if !valid {
            return Err(RegisterError::InvalidPath(method.to_string()));
        }

        let mut handlers = self
            .inner
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if handlers.contains_key(method) {
            return Err(RegisterError::DuplicateMethod(method.to_string()));
        }
        handlers.insert(method.to_string(), handler);

        tracing::debug!(rpc.method = method, "Method registered");
        Ok(())
    }

    /// Registered method paths, sorted.
    pub fn methods(&self) -> Vec<String> {
        let handlers = self
            .inner
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let mut methods: Vec<_> = handlers.keys().cloned().collect();
        methods.sort();
        methods
    }

    /// Accept and serve connections until [`stop`](Self::stop) is called or
    /// the listener closes. The listener is closed on return.
    pub async fn serve(&self, listener: PipeListener) {
        *self
            .inner
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(listener.clone());

        // stop() may have run before the listener was recorded.
        if self.inner.stop.is_cancelled() {
            listener.close();
            return;
        }

        tracing::info!(address = %listener.local_addr(), "RPC server serving");

        loop {
            tokio::select! {
                biased;
                _ = self.inner.stop.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(stream) => self.spawn_connection(stream),
                    Err(err) => {
                        tracing::debug!(error = %err, "Accept loop ending");
                        break;
                    }
                },
            }
        }

        listener.close();
        tracing::info!("RPC server stopped serving");
    }

    /// Stop serving: close the listener and drop all connections.
    ///
    /// In-flight calls are abandoned. Idempotent.
    pub fn stop(&self) {
        self.inner.stop.cancel();
        if let Some(listener) = self
            .inner
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            listener.close();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stop.is_cancelled()
    }

    /// Number of connections currently being served.
    pub fn active_connections(&self) -> u64 {
        self.inner.tracker.active_count()
    }

    /// Wait until every connection task has finished.
    pub async fn wait_idle(&self) {
        self.inner.tracker.wait_idle().await
    }

    fn spawn_connection(&self, stream: PipeStream) {
        let connection_id = stream.id();
        let guard = self.inner.tracker.track(connection_id);
        let server = self.clone();
        let stop = self.inner.stop.clone();
        let max_streams = self.inner.options.max_concurrent_streams;

        tokio::spawn(async move {
            let _guard = guard;

            let service = service_fn(move |request: Request<Incoming>| {
                let server = server.clone();
                async move { Ok::<_, Infallible>(server.dispatch(connection_id, request).await) }
            });

            let mut builder = http2::Builder::new(TokioExecutor::new());
            builder.max_concurrent_streams(max_streams);
            let connection = builder.serve_connection(TokioIo::new(stream), service);

            tokio::select! {
                result = connection => {
                    if let Err(e) = result {
                        tracing::debug!(connection_id = %connection_id, error = %e, "Connection ended with error");
                    }
                }
                _ = stop.cancelled() => {
                    tracing::debug!(connection_id = %connection_id, "Connection dropped on stop");
                }
            }
        });
    }

    async fn dispatch(&self, connection_id: ConnectionId, request: Request<Incoming>) -> Response<BoxBody> {
        let method = request.uri().path().to_string();
        let handler = self
            .inner
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&method)
            .cloned();

        let Some(handler) = handler else {
            tracing::debug!(connection_id = %connection_id, rpc.method = %method, "Unknown method");
            metrics::record_rpc_call(&method, Code::Unimplemented, Instant::now());
            return unimplemented_response();
        };

        let call = UnaryCall {
            handler,
            interceptor: self.inner.options.interceptor.clone(),
            info: CallInfo { method, connection_id },
        };
        let max = self.inner.options.max_message_bytes;
        let mut grpc = Grpc::new(RawCodec)
            .max_decoding_message_size(max)
            .max_encoding_message_size(max);
        grpc.unary(call, request).await
    }
}

impl std::fmt::Debug for RpcServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcServer")
            .field("methods", &self.methods())
            .field("stopped", &self.is_stopped())
            .field("active_connections", &self.active_connections())
            .finish()
    }
}

/// One call to a registered method.
struct UnaryCall {
    handler: UnaryHandler,
    interceptor: Option<Arc<dyn UnaryInterceptor>>,
    info: CallInfo,
}

impl UnaryService<Bytes> for UnaryCall {
    type Response = Bytes;
    type Future = BoxFuture<'static, Result<tonic::Response<Bytes>, Status>>;

    fn call(&mut self, request: tonic::Request<Bytes>) -> Self::Future {
        let handler = Arc::clone(&self.handler);
        let interceptor = self.interceptor.clone();
        let info = self.info.clone();

        async move {
            let start = Instant::now();
            let method = info.method.clone();
            let connection_id = info.connection_id;

            // Cancelled when hyper drops this future, e.g. on client reset.
            let token = CancellationToken::new();
            let _cancel_on_drop = token.clone().drop_guard();

            let (metadata, _extensions, payload) = request.into_parts();
            let mut ctx = Context::with_token(token);
            if let Some(timeout) = metadata
                .get(TIMEOUT_HEADER)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_timeout)
            {
                ctx = ctx.with_timeout(timeout);
            }
            let ctx = ctx.with_value(IncomingMetadata(metadata));

            let next = Next::new(handler);
            let call = {
                let ctx = ctx.clone();
                async move {
                    match &interceptor {
                        Some(interceptor) => interceptor.intercept(ctx, payload, info, next).await,
                        None => next.run(ctx, payload).await,
                    }
                }
            };
            let call = AssertUnwindSafe(call).catch_unwind().map(|outcome| match outcome {
                Ok(result) => result,
                Err(_) => {
                    tracing::error!(rpc.method = %method, "Handler panicked");
                    Err(Status::internal("handler panicked"))
                }
            });

            let result = tokio::select! {
                result = call => result,
                done = ctx.cancelled() => Err(Status::from(done)),
            };

            let code = match &result {
                Ok(_) => Code::Ok,
                Err(status) => status.code(),
            };
            metrics::record_rpc_call(&method, code, start);
            tracing::debug!(
                connection_id = %connection_id,
                rpc.method = %method,
                code = ?code,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "RPC call finished"
            );

            result.map(tonic::Response::new)
        }
        .boxed()
    }
}

/// Parse a `grpc-timeout` value: up to eight digits and a unit.
fn parse_timeout(value: &str) -> Option<Duration> {
    if !value.is_ascii() || value.len() < 2 || value.len() > 9 {
        return None;
    }
    let (digits, unit) = value.split_at(value.len() - 1);
    let amount: u64 = digits.parse().ok()?;
    let timeout = match unit {
        "H" => Duration::from_secs(amount.checked_mul(3600)?),
        "M" => Duration::from_secs(amount.checked_mul(60)?),
        "S" => Duration::from_secs(amount),
        "m" => Duration::from_millis(amount),
        "u" => Duration::from_micros(amount),
        "n" => Duration::from_nanos(amount),
        _ => return None,
    };
    Some(timeout)
}

/// Trailers-only response for a method nobody registered.
fn unimplemented_response() -> Response<BoxBody> {
    let mut response = Response::new(tonic::body::empty_body());
    let headers = response.headers_mut();
    headers.insert("grpc-status", HeaderValue::from(Code::Unimplemented as i32));
    headers.insert(header::CONTENT_TYPE, GRPC_CONTENT_TYPE);
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::interceptor::unary_handler;

    fn noop() -> UnaryHandler {
        unary_handler(|_ctx, payload| async move { Ok(payload) })
    }

    #[test]
    fn rejects_malformed_method_paths() {
        let server = RpcServer::new(ServerOptions::default());
        for path in ["", "Echo", "/Echo", "/svc/", "//Echo", "/a/b/c"] {
            assert_eq!(
                server.register_unary(path, noop()),
                Err(RegisterError::InvalidPath(path.to_string())),
                "{path}"
            );
        }
    }

    #[test]
    fn rejects_duplicate_methods() {
        let server = RpcServer::new(ServerOptions::default());
        server.register_unary("/svc.A/Call", noop()).unwrap();
        assert_eq!(
            server.register_unary("/svc.A/Call", noop()),
            Err(RegisterError::DuplicateMethod("/svc.A/Call".into()))
        );
        assert_eq!(server.methods(), vec!["/svc.A/Call".to_string()]);
    }

    #[test]
    fn interceptor_slot_fills_once() {
        let passthrough = |ctx: Context, payload: Bytes, _info: CallInfo, next: Next| next.run(ctx, payload);

        let options = ServerOptions::new().interceptor(passthrough).unwrap();
        assert!(options.has_interceptor());
        assert_eq!(
            options.interceptor(passthrough).unwrap_err(),
            OptionsError::InterceptorAlreadySet
        );
    }

    #[test]
    fn unknown_method_response_is_trailers_only() {
        let response = unimplemented_response();
        assert_eq!(response.headers()["grpc-status"], "12");
        assert_eq!(response.headers()[header::CONTENT_TYPE], "application/grpc");
    }

    #[test]
    fn timeout_header_units() {
        assert_eq!(parse_timeout("250m"), Some(Duration::from_millis(250)));
        assert_eq!(parse_timeout("3S"), Some(Duration::from_secs(3)));
        assert_eq!(parse_timeout("2M"), Some(Duration::from_secs(120)));
        assert_eq!(parse_timeout("1500u"), Some(Duration::from_micros(1500)));
        assert_eq!(parse_timeout("m"), None);
        assert_eq!(parse_timeout("10x"), None);
        assert_eq!(parse_timeout("123456789m"), None);
    }

    #[tokio::test]
    async fn stop_before_serve_closes_listener() {
        let server = RpcServer::new(ServerOptions::default());
        let listener = crate::net::listen(&crate::config::TransportConfig::default());
        server.stop();
        server.serve(listener.clone()).await;
        assert!(listener.is_closed());
    }
}
