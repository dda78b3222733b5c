//! Shared utilities for integration tests.

use axum::body::Body;
use axum::http::{header, Method, Request, Response};
use rpc_pipe::echo::{register_echo_service_handler, register_echo_service_server, Echo, EchoService};
use rpc_pipe::{Context, GatewayOptions, GatewayServer};

/// Start a gateway server with the echo service under `ctx`.
pub async fn echo_server(ctx: &Context) -> GatewayServer {
    echo_server_with(ctx, GatewayOptions::default(), Echo).await
}

/// Start a gateway server with a custom echo implementation.
pub async fn echo_server_with<S: EchoService>(ctx: &Context, options: GatewayOptions, service: S) -> GatewayServer {
    let server = GatewayServer::new(ctx, options).await.unwrap();
    server
        .register_service(register_echo_service_server, service, register_echo_service_handler)
        .unwrap();
    server
}

/// A JSON POST to `path`.
pub fn post_json(path: &str, body: impl Into<String>) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri(path)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.into()))
        .unwrap()
}

pub async fn body_string(response: Response<Body>) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

