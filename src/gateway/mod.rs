//! HTTP/JSON to RPC gateway.
//!
//! # Data Flow
//! ```text
//! HTTP request (JSON body)
//!     → GatewayMux::serve (route table lookup)
//!     → prefixed headers become outgoing call metadata
//!     → decode JSON into the request message, encode for the wire
//!     → ClientConn::unary
//!     → response message as JSON, or status mapped to an HTTP error
//! ```
//!
//! # Design Decisions
//! - Routes are registered at wire-up time; a duplicate `(method, path)` is
//!   an error instead of a silent override
//! - Only headers under the metadata prefix cross into the RPC call
//! - Error bodies are `{"code": <rpc code>, "message": "..."}`

use std::collections::HashSet;
use std::mem;
use std::sync::{Mutex, PoisonError, RwLock};
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method, Request, Response, StatusCode};
use axum::routing::{on, MethodFilter};
use axum::Router;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tower::ServiceExt;

use crate::context::Context;
use crate::rpc::codec;
use crate::rpc::metadata::{self, MetadataMap};
use crate::rpc::{ClientConn, Code, Status};

/// Prefix marking HTTP headers that are forwarded as call metadata.
pub const METADATA_HEADER_PREFIX: &str = "rpc-metadata-";

/// Error type for route registration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    #[error("route {method} {path} is already registered")]
    DuplicateRoute { method: Method, path: String },

    #[error("HTTP method {0} cannot be routed")]
    UnsupportedMethod(Method),

    #[error("invalid route path {0:?}")]
    InvalidPath(String),
}

/// Mux construction options.
#[derive(Debug, Clone)]
pub struct MuxOptions {
    metadata_prefix: String,
    request_timeout: Option<Duration>,
    max_body_bytes: usize,
}

impl MuxOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Header prefix that selects forwarded metadata. Lowercased.
    pub fn metadata_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.metadata_prefix = prefix.into().to_ascii_lowercase();
        self
    }

    /// Deadline applied to each translated call.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn max_body_bytes(mut self, bytes: usize) -> Self {
        self.max_body_bytes = bytes;
        self
    }

    pub fn header_prefix(&self) -> &str {
        &self.metadata_prefix
    }

    pub fn body_limit(&self) -> usize {
        self.max_body_bytes
    }
}

impl Default for MuxOptions {
    fn default() -> Self {
        let gateway = crate::config::GatewayConfig::default();
        Self {
            metadata_prefix: METADATA_HEADER_PREFIX.to_string(),
            request_timeout: None,
            max_body_bytes: gateway.max_body_bytes,
        }
    }
}

/// Routes HTTP requests to RPC calls.
pub struct GatewayMux {
    router: RwLock<Router>,
    routes: Mutex<HashSet<(Method, String)>>,
    options: MuxOptions,
}

impl GatewayMux {
    pub fn new(options: MuxOptions) -> Self {
        Self {
            router: RwLock::new(Router::new().fallback(not_found)),
            routes: Mutex::new(HashSet::new()),
            options,
        }
    }

    pub fn options(&self) -> &MuxOptions {
        &self.options
    }

    /// Registered routes as `(method, path)`, sorted by path.
    pub fn routes(&self) -> Vec<(Method, String)> {
        let routes = self.routes.lock().unwrap_or_else(PoisonError::into_inner);
        let mut list: Vec<_> = routes.iter().cloned().collect();
        list.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.as_str().cmp(b.0.as_str())));
        list
    }

    /// Route `method path` to the unary RPC `rpc_method` on `conn`.
    ///
    /// Each request runs under a child of `ctx`, so cancelling `ctx` aborts
    /// every call made through this route.
    pub fn handle_unary<Req, Resp>(
        &self,
        ctx: &Context,
        method: Method,
        path: &str,
        rpc_method: &str,
        conn: ClientConn,
    ) -> Result<(), GatewayError>
    where
        Req: DeserializeOwned + Serialize + Send + 'static,
        Resp: DeserializeOwned + Serialize + Send + 'static,
    {
        validate_path(path)?;
        let filter = MethodFilter::try_from(method.clone())
            .map_err(|_| GatewayError::UnsupportedMethod(method.clone()))?;

        {
            let mut routes = self.routes.lock().unwrap_or_else(PoisonError::into_inner);
            if !routes.insert((method.clone(), path.to_string())) {
                return Err(GatewayError::DuplicateRoute {
                    method,
                    path: path.to_string(),
                });
            }
        }

        let route = UnaryRoute {
            ctx: ctx.clone(),
            rpc_method: rpc_method.to_string(),
            conn,
            prefix: self.options.metadata_prefix.clone(),
            timeout: self.options.request_timeout,
            max_body_bytes: self.options.max_body_bytes,
        };
        let handler = move |request: Request<Body>| {
            let route = route.clone();
            async move { route.handle::<Req, Resp>(request).await }
        };

        let mut router = self.router.write().unwrap_or_else(PoisonError::into_inner);
        *router = mem::take(&mut *router).route(path, on(filter, handler));

        tracing::debug!(http.method = %method, path, rpc.method = rpc_method, "Gateway route registered");
        Ok(())
    }

    /// Serve one HTTP request.
    pub async fn serve(&self, request: Request<Body>) -> Response<Body> {
        let router = self
            .router
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match router.oneshot(request).await {
            Ok(response) => response,
            Err(infallible) => match infallible {},
        }
    }
}

impl Default for GatewayMux {
    fn default() -> Self {
        Self::new(MuxOptions::default())
    }
}

impl std::fmt::Debug for GatewayMux {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayMux")
            .field("routes", &self.routes())
            .field("options", &self.options)
            .finish()
    }
}

#[derive(Clone)]
struct UnaryRoute {
    ctx: Context,
    rpc_method: String,
    conn: ClientConn,
    prefix: String,
    timeout: Option<Duration>,
    max_body_bytes: usize,
}

impl UnaryRoute {
    async fn handle<Req, Resp>(&self, request: Request<Body>) -> Response<Body>
    where
        Req: DeserializeOwned + Serialize,
        Resp: DeserializeOwned + Serialize,
    {
        match self.call::<Req, Resp>(request).await {
            Ok(body) => json_response(StatusCode::OK, body),
            Err(status) => {
                tracing::warn!(rpc.method = %self.rpc_method, status = %status, "Gateway call failed");
                error_response(&status)
            }
        }
    }

    async fn call<Req, Resp>(&self, request: Request<Body>) -> Result<Bytes, Status>
    where
        Req: DeserializeOwned + Serialize,
        Resp: DeserializeOwned + Serialize,
    {
        let (parts, body) = request.into_parts();
        let md = forwarded_metadata(&parts.headers, &self.prefix);

        let body = axum::body::to_bytes(body, self.max_body_bytes)
            .await
            .map_err(|e| Status::invalid_argument(format!("failed to read request body: {e}")))?;
        let body = if body.iter().all(u8::is_ascii_whitespace) {
            Bytes::from_static(b"{}")
        } else {
            body
        };
        let message: Req = codec::decode(&body)?;

        let mut ctx = self.ctx.child();
        if let Some(timeout) = self.timeout {
            ctx = ctx.with_timeout(timeout);
        }
        let ctx = metadata::with_outgoing(&ctx, &md);

        let reply = self.conn.unary(&ctx, &self.rpc_method, codec::encode(&message)?).await?;
        let reply: Resp = codec::decode(&reply).map_err(|s| Status::internal(s.message().to_string()))?;
        serde_json::to_vec(&reply)
            .map(Bytes::from)
            .map_err(|e| Status::internal(format!("failed to encode response: {e}")))
    }
}

/// Metadata from headers under `prefix`, with the prefix stripped.
///
/// Reserved names are dropped.
fn forwarded_metadata(headers: &HeaderMap, prefix: &str) -> MetadataMap {
    let mut forwarded = HeaderMap::new();
    for (name, value) in headers {
        let Some(key) = name.as_str().strip_prefix(prefix) else {
            continue;
        };
        if key.is_empty() || metadata::is_reserved(key) {
            tracing::trace!(header = %name, "Header not forwarded");
            continue;
        }
        match HeaderName::try_from(key) {
            Ok(key) => {
                forwarded.append(key, value.clone());
            }
            Err(e) => tracing::trace!(header = %name, error = %e, "Header not forwarded"),
        }
    }
    MetadataMap::from_headers(forwarded)
}

fn validate_path(path: &str) -> Result<(), GatewayError> {
    let valid = path.starts_with('/')
        && path
            .split('/')
            .skip(1)
            .all(|segment| !segment.starts_with(':') && !segment.starts_with('*'));
    if valid {
        Ok(())
    } else {
        Err(GatewayError::InvalidPath(path.to_string()))
    }
}

fn json_response(status: StatusCode, body: Bytes) -> Response<Body> {
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

/// HTTP status a failed call is reported with.
pub fn http_status(code: Code) -> StatusCode {
    match code {
        Code::Ok => StatusCode::OK,
        Code::Cancelled => StatusCode::from_u16(499).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
        Code::InvalidArgument | Code::FailedPrecondition | Code::OutOfRange => StatusCode::BAD_REQUEST,
        Code::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
        Code::NotFound => StatusCode::NOT_FOUND,
        Code::AlreadyExists | Code::Aborted => StatusCode::CONFLICT,
        Code::PermissionDenied => StatusCode::FORBIDDEN,
        Code::Unauthenticated => StatusCode::UNAUTHORIZED,
        Code::ResourceExhausted => StatusCode::TOO_MANY_REQUESTS,
        Code::Unimplemented => StatusCode::NOT_IMPLEMENTED,
        Code::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        Code::Unknown | Code::Internal | Code::DataLoss => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// HTTP error response for an RPC status.
pub fn error_response(status: &Status) -> Response<Body> {
    let body = serde_json::json!({
        "code": status.code() as i32,
        "message": status.message(),
    });
    json_response(http_status(status.code()), Bytes::from(body.to_string()))
}

async fn not_found() -> Response<Body> {
    error_response(&Status::new(Code::NotFound, "Not Found"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    use crate::config::TransportConfig;
    use crate::net::listen;
    use crate::rpc::{unary_handler, ClientOptions, RpcServer, ServerOptions};

    #[derive(Debug, Default, Serialize, Deserialize, PartialEq)]
    struct Greeting {
        #[serde(default)]
        name: String,
    }

    async fn greeter() -> (RpcServer, ClientConn) {
        let server = RpcServer::new(ServerOptions::default());
        server
            .register_unary(
                "/test.Greeter/Greet",
                unary_handler(|ctx: Context, payload: Bytes| async move {
                    let mut req: Greeting = codec::decode(&payload)?;
                    if req.name.is_empty() {
                        return Err(Status::invalid_argument("name is required"));
                    }
                    let lang = metadata::incoming(&ctx)
                        .and_then(|md| md.get("lang"))
                        .and_then(|v| v.to_str().ok());
                    if let Some(lang) = lang {
                        req.name = format!("{} ({lang})", req.name);
                    }
                    codec::encode(&Greeting {
                        name: format!("hello {}", req.name),
                    })
                }),
            )
            .unwrap();

        let listener = listen(&TransportConfig::default());
        let dialer = listener.dialer();
        tokio::spawn({
            let server = server.clone();
            async move { server.serve(listener).await }
        });
        let conn = ClientConn::connect("", &dialer, ClientOptions::default())
            .await
            .unwrap();
        (server, conn)
    }

    fn post(path: &str, body: &'static str) -> Request<Body> {
        Request::builder()
            .method(Method::POST)
            .uri(path)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body))
            .unwrap()
    }

    async fn body_json(response: Response<Body>) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn translates_json_to_rpc_and_back() {
        let (server, conn) = greeter().await;
        let mux = GatewayMux::default();
        mux.handle_unary::<Greeting, Greeting>(
            &Context::background(),
            Method::POST,
            "/greet",
            "/test.Greeter/Greet",
            conn,
        )
        .unwrap();

        let response = mux.serve(post("/greet", r#"{"name":"bob"}"#)).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "application/json");
        assert_eq!(body_json(response).await, serde_json::json!({"name": "hello bob"}));
        server.stop();
    }

    #[tokio::test]
    async fn prefixed_headers_become_metadata() {
        let (server, conn) = greeter().await;
        let mux = GatewayMux::default();
        mux.handle_unary::<Greeting, Greeting>(
            &Context::background(),
            Method::POST,
            "/greet",
            "/test.Greeter/Greet",
            conn,
        )
        .unwrap();

        let mut request = post("/greet", r#"{"name":"bob"}"#);
        request
            .headers_mut()
            .insert("rpc-metadata-lang", HeaderValue::from_static("en"));
        request.headers_mut().insert("lang", HeaderValue::from_static("fr"));

        let response = mux.serve(request).await;
        assert_eq!(body_json(response).await["name"], "hello bob (en)");
        server.stop();
    }

    #[tokio::test]
    async fn status_maps_to_http_error() {
        let (server, conn) = greeter().await;
        let mux = GatewayMux::default();
        mux.handle_unary::<Greeting, Greeting>(
            &Context::background(),
            Method::POST,
            "/greet",
            "/test.Greeter/Greet",
            conn,
        )
        .unwrap();

        let response = mux.serve(post("/greet", "")).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            body_json(response).await,
            serde_json::json!({"code": 3, "message": "name is required"})
        );

        let response = mux.serve(post("/greet", "{not json")).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        server.stop();
    }

    #[tokio::test]
    async fn unknown_route_is_json_not_found() {
        let mux = GatewayMux::default();
        let response = mux.serve(post("/nowhere", "{}")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(response).await["code"], 5);
    }

    #[tokio::test]
    async fn duplicate_and_invalid_routes_are_rejected() {
        let (server, conn) = greeter().await;
        let mux = GatewayMux::default();
        let ctx = Context::background();
        mux.handle_unary::<Greeting, Greeting>(&ctx, Method::POST, "/greet", "/test.Greeter/Greet", conn.clone())
            .unwrap();

        let err = mux
            .handle_unary::<Greeting, Greeting>(&ctx, Method::POST, "/greet", "/test.Greeter/Greet", conn.clone())
            .unwrap_err();
        assert_eq!(
            err,
            GatewayError::DuplicateRoute {
                method: Method::POST,
                path: "/greet".into()
            }
        );

        // Same path, different method is fine.
        mux.handle_unary::<Greeting, Greeting>(&ctx, Method::PUT, "/greet", "/test.Greeter/Greet", conn.clone())
            .unwrap();

        let err = mux
            .handle_unary::<Greeting, Greeting>(&ctx, Method::POST, "greet", "/test.Greeter/Greet", conn)
            .unwrap_err();
        assert_eq!(err, GatewayError::InvalidPath("greet".into()));
        assert_eq!(mux.routes().len(), 2);
        server.stop();
    }

    #[test]
    fn forwarded_metadata_strips_prefix() {
        let mut headers = HeaderMap::new();
        headers.insert("rpc-metadata-x-user", HeaderValue::from_static("alice"));
        headers.insert("x-other", HeaderValue::from_static("ignored"));
        headers.insert("rpc-metadata-content-type", HeaderValue::from_static("text/plain"));

        let md = forwarded_metadata(&headers, METADATA_HEADER_PREFIX);
        assert_eq!(md.len(), 1);
        assert_eq!(md.get("x-user").unwrap(), "alice");
    }

    #[test]
    fn codes_map_to_http_statuses() {
        assert_eq!(http_status(Code::Cancelled).as_u16(), 499);
        assert_eq!(http_status(Code::InvalidArgument), StatusCode::BAD_REQUEST);
        assert_eq!(http_status(Code::DeadlineExceeded), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(http_status(Code::PermissionDenied), StatusCode::FORBIDDEN);
        assert_eq!(http_status(Code::Unimplemented), StatusCode::NOT_IMPLEMENTED);
        assert_eq!(http_status(Code::Internal), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
