//! Gateway server: an RPC server and its HTTP gateway in one process.
//!
//! # Responsibilities
//! - Own the in-process transport, the RPC server, the client connection
//!   and the gateway mux
//! - File every HTTP request in the correlation store while it is handled
//! - Give handlers a merged context: call values first, then process values
//! - Stop everything when the root context is cancelled
//!
//! # Lifecycle
//! ```text
//! Constructing ──new()──▶ Running ──ctx cancelled / shutdown()──▶ ShuttingDown ──▶ Stopped
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::{HeaderName, HeaderValue, Request, Response};
use axum::Router;
use bytes::Bytes;
use futures_util::future::BoxFuture;
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::config::{PipeConfig, TransportConfig};
use crate::context::{self, CancelPropagation, Context};
use crate::correlation::{CorrelationStore, InboundRequest, RequestResolver, CORRELATION_HEADER};
use crate::gateway::{GatewayError, GatewayMux, MuxOptions};
use crate::net::{listen, PipeListener};
use crate::observability::metrics;
use crate::rpc::{
    CallInfo, ClientConn, ClientOptions, DialError, Next, OptionsError, RegisterError, RpcServer,
    ServerOptions, UnaryInterceptor, UnaryResult,
};

/// Where a [`GatewayServer`] is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Constructing,
    Running,
    ShuttingDown,
    Stopped,
}

/// Error type for building and wiring a [`GatewayServer`].
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to connect the gateway to the RPC server: {0}")]
    Dial(#[from] DialError),

    #[error("service registration failed: {0}")]
    Register(#[from] RegisterError),

    #[error("gateway wire-up failed: {0}")]
    Gateway(#[from] GatewayError),

    #[error("invalid server options: {0}")]
    Options(#[from] OptionsError),
}

/// Options for [`GatewayServer::new`].
#[derive(Clone)]
pub struct GatewayOptions {
    server: ServerOptions,
    mux: MuxOptions,
    transport: TransportConfig,
    client: ClientOptions,
    interceptor: Option<Arc<dyn UnaryInterceptor>>,
    cancel_propagation: CancelPropagation,
    request_timeout: Duration,
}

impl GatewayOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &PipeConfig) -> Self {
        let request_timeout = Duration::from_secs(config.gateway.request_timeout_secs);
        Self {
            server: ServerOptions::new()
                .max_message_bytes(config.rpc.max_message_bytes)
                .max_concurrent_streams(config.rpc.max_concurrent_streams),
            mux: MuxOptions::new()
                .request_timeout(request_timeout)
                .max_body_bytes(config.gateway.max_body_bytes),
            transport: config.transport.clone(),
            client: ClientOptions {
                dial_timeout: Duration::from_millis(config.transport.dial_timeout_ms),
                max_message_bytes: config.rpc.max_message_bytes,
            },
            interceptor: None,
            cancel_propagation: config.gateway.cancel_propagation,
            request_timeout,
        }
    }

    /// Extra RPC server options.
    ///
    /// An interceptor carried by `options` becomes the outer interceptor,
    /// so it counts against the single interceptor slot.
    pub fn server_options(mut self, mut options: ServerOptions) -> Result<Self, OptionsError> {
        if let Some(interceptor) = options.take_interceptor() {
            self = self.install_interceptor(interceptor)?;
        }
        self.server = options;
        Ok(self)
    }

    /// Extra gateway mux options.
    pub fn mux_options(mut self, options: MuxOptions) -> Self {
        self.mux = options;
        self
    }

    pub fn transport(mut self, transport: TransportConfig) -> Self {
        self.client.dial_timeout = Duration::from_millis(transport.dial_timeout_ms);
        self.transport = transport;
        self
    }

    /// Interceptor run around every handler, inside the context injection.
    ///
    /// Only one may be set.
    pub fn unary_interceptor<I: UnaryInterceptor>(self, interceptor: I) -> Result<Self, OptionsError> {
        self.install_interceptor(Arc::new(interceptor))
    }

    pub fn cancel_propagation(mut self, mode: CancelPropagation) -> Self {
        self.cancel_propagation = mode;
        self
    }

    /// Per-request timeout applied by [`GatewayServer::router`].
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    fn install_interceptor(mut self, interceptor: Arc<dyn UnaryInterceptor>) -> Result<Self, OptionsError> {
        if self.interceptor.is_some() {
            return Err(OptionsError::InterceptorAlreadySet);
        }
        self.interceptor = Some(interceptor);
        Ok(self)
    }
}

impl Default for GatewayOptions {
    fn default() -> Self {
        Self::from_config(&PipeConfig::default())
    }
}

impl std::fmt::Debug for GatewayOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayOptions")
            .field("server", &self.server)
            .field("mux", &self.mux)
            .field("transport", &self.transport)
            .field("interceptor", &self.interceptor.is_some())
            .field("cancel_propagation", &self.cancel_propagation)
            .finish()
    }
}

/// Merges the call context with the root context and makes the original
/// HTTP request resolvable before the outer interceptor or handler runs.
struct ContextInjector {
    root: Context,
    resolver: RequestResolver,
    mode: CancelPropagation,
    outer: Option<Arc<dyn UnaryInterceptor>>,
}

impl UnaryInterceptor for ContextInjector {
    fn intercept(&self, ctx: Context, payload: Bytes, info: CallInfo, next: Next) -> BoxFuture<'static, UnaryResult> {
        let ctx = context::merge(&ctx, &self.root, self.mode).with_value(self.resolver.clone());
        match &self.outer {
            Some(outer) => outer.intercept(ctx, payload, info, next),
            None => next.run(ctx, payload),
        }
    }
}

/// An RPC server reachable through its own HTTP/JSON gateway.
pub struct GatewayServer {
    ctx: Context,
    rpc: RpcServer,
    conn: ClientConn,
    mux: GatewayMux,
    store: Arc<CorrelationStore>,
    listener: PipeListener,
    state: Arc<watch::Sender<ServerState>>,
    stop: CancellationToken,
    request_timeout: Duration,
    max_body_bytes: usize,
}

impl GatewayServer {
    /// Build and start a server that lives until `ctx` is cancelled.
    pub async fn new(ctx: &Context, options: GatewayOptions) -> Result<Self, ServerError> {
        let (state, _) = watch::channel(ServerState::Constructing);
        let state = Arc::new(state);

        let store = Arc::new(CorrelationStore::new());
        let injector = ContextInjector {
            root: ctx.clone(),
            resolver: RequestResolver::new(Arc::clone(&store)),
            mode: options.cancel_propagation,
            outer: options.interceptor,
        };
        let rpc = RpcServer::new(options.server.install_interceptor(Arc::new(injector))?);

        let listener = listen(&options.transport);
        let serving = tokio::spawn({
            let rpc = rpc.clone();
            let listener = listener.clone();
            async move { rpc.serve(listener).await }
        });

        let conn = match ClientConn::connect("", &listener.dialer(), options.client).await {
            Ok(conn) => conn,
            Err(e) => {
                tracing::error!(error = %e, "Gateway could not reach the RPC server");
                rpc.stop();
                let _ = serving.await;
                return Err(e.into());
            }
        };

        let max_body_bytes = options.mux.body_limit();
        let mux = GatewayMux::new(options.mux);
        let stop = CancellationToken::new();

        state.send_replace(ServerState::Running);
        tracing::info!(
            address = %listener.local_addr(),
            cancel_propagation = ?options.cancel_propagation,
            "Gateway server running"
        );

        tokio::spawn({
            let ctx = ctx.clone();
            let stop = stop.clone();
            let rpc = rpc.clone();
            let state = Arc::clone(&state);
            async move {
                tokio::select! {
                    _ = ctx.cancelled() => {}
                    _ = stop.cancelled() => {}
                }
                state.send_replace(ServerState::ShuttingDown);
                tracing::info!("Gateway server shutting down");

                rpc.stop();
                let _ = serving.await;

                state.send_replace(ServerState::Stopped);
                tracing::info!("Gateway server stopped");
            }
        });

        Ok(Self {
            ctx: ctx.clone(),
            rpc,
            conn,
            mux,
            store,
            listener,
            state,
            stop,
            request_timeout: options.request_timeout,
            max_body_bytes,
        })
    }

    /// Handle one HTTP request through the gateway.
    ///
    /// Every original header is also sent as `rpc-metadata-<name>`, and the
    /// correlation key as `rpc-metadata-x-rpc-pipe-gateway-request-id`. The
    /// correlation entry lives exactly as long as this call.
    pub async fn serve_http(&self, request: Request<Body>) -> Response<Body> {
        let start = Instant::now();
        let guard = self.store.track(InboundRequest::from_request(&request));
        let key = guard.key();

        let (mut parts, body) = request.into_parts();
        inject_metadata_headers(&mut parts.headers, self.mux.options().header_prefix(), &key.to_string());

        tracing::debug!(
            request_key = %key,
            method = %parts.method,
            path = %parts.uri.path(),
            "Gateway request"
        );

        let response = self.mux.serve(Request::from_parts(parts, body)).await;
        drop(guard);

        metrics::record_gateway_request(response.status().as_u16(), start);
        tracing::debug!(
            request_key = %key,
            status = response.status().as_u16(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Gateway request finished"
        );
        response
    }

    /// The HTTP request behind the call `ctx` belongs to.
    pub fn request(&self, ctx: &Context) -> Option<Arc<InboundRequest>> {
        self.store.resolve(ctx)
    }

    /// Register a service on the RPC server and wire its routes into the
    /// gateway.
    pub fn register_service<S, R, H>(&self, register_server: R, service: S, register_handler: H) -> Result<(), ServerError>
    where
        R: FnOnce(&RpcServer, S) -> Result<(), RegisterError>,
        H: FnOnce(&Context, &GatewayMux, ClientConn) -> Result<(), GatewayError>,
    {
        register_server(&self.rpc, service)?;
        register_handler(&self.ctx, &self.mux, self.conn.clone())?;
        Ok(())
    }

    /// An axum router that serves every path through [`serve_http`](Self::serve_http).
    #[allow(deprecated)]
    pub fn router(self: Arc<Self>) -> Router {
        let timeout = self.request_timeout;
        let max_body_bytes = self.max_body_bytes;
        let server = self;

        Router::new()
            .fallback(move |request: Request<Body>| {
                let server = Arc::clone(&server);
                async move { server.serve_http(request).await }
            })
            .layer(RequestBodyLimitLayer::new(max_body_bytes))
            .layer(TimeoutLayer::new(timeout))
            .layer(PropagateRequestIdLayer::x_request_id())
            .layer(TraceLayer::new_for_http())
            .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
    }

    /// Begin shutdown without cancelling the root context.
    pub fn shutdown(&self) {
        self.stop.cancel();
    }

    /// Wait until the server reaches [`ServerState::Stopped`].
    pub async fn wait_stopped(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|state| *state == ServerState::Stopped).await;
    }

    pub fn state(&self) -> ServerState {
        *self.state.borrow()
    }

    pub fn rpc_server(&self) -> &RpcServer {
        &self.rpc
    }

    pub fn client_conn(&self) -> &ClientConn {
        &self.conn
    }

    pub fn mux(&self) -> &GatewayMux {
        &self.mux
    }

    pub fn listener(&self) -> &PipeListener {
        &self.listener
    }

    /// Requests currently holding a correlation entry.
    pub fn inflight(&self) -> usize {
        self.store.len()
    }
}

impl Drop for GatewayServer {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

impl std::fmt::Debug for GatewayServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayServer")
            .field("state", &self.state())
            .field("rpc", &self.rpc)
            .field("mux", &self.mux)
            .field("inflight", &self.inflight())
            .finish()
    }
}

/// Copy each original header to `<prefix><name>` and set the correlation key.
///
/// Headers already under the prefix are left alone; a client-supplied
/// correlation header is replaced.
fn inject_metadata_headers(headers: &mut axum::http::HeaderMap, prefix: &str, key: &str) {
    let mut forwarded = Vec::new();
    for (name, value) in headers.iter() {
        if name.as_str().starts_with(prefix) {
            continue;
        }
        match HeaderName::from_bytes(format!("{prefix}{name}").as_bytes()) {
            Ok(prefixed) => forwarded.push((prefixed, value.clone())),
            Err(_) => tracing::trace!(header = %name, "Header name too unusual to forward"),
        }
    }
    for (name, value) in forwarded {
        headers.append(name, value);
    }

    let correlation = format!("{prefix}{CORRELATION_HEADER}");
    match (HeaderName::from_bytes(correlation.as_bytes()), HeaderValue::from_str(key)) {
        (Ok(name), Ok(value)) => {
            headers.insert(name, value);
        }
        _ => tracing::warn!(prefix, "Correlation header could not be built"),
    }
}
