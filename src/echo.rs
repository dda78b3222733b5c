//! Echo sample service.
//!
//! Shows the registration shape a service plugs into [`GatewayServer`]:
//! a server-side registration function, a gateway wire-up function and a
//! typed client.
//!
//! [`GatewayServer`]: crate::server::GatewayServer

use std::future::Future;
use std::sync::Arc;

use axum::http::Method;
use serde::{Deserialize, Serialize};

use crate::context::Context;
use crate::correlation;
use crate::gateway::{GatewayError, GatewayMux};
use crate::rpc::{codec, unary_handler, ClientConn, RegisterError, RpcServer, Status};

/// Full method path of `EchoService.Echo`.
pub const ECHO_METHOD: &str = "/echo.EchoService/Echo";

/// HTTP route the gateway exposes for `Echo`.
pub const ECHO_ROUTE: &str = "/echo";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    #[serde(default)]
    pub value: String,
}

pub trait EchoService: Send + Sync + 'static {
    fn echo(&self, ctx: Context, msg: Message) -> impl Future<Output = Result<Message, Status>> + Send;
}

/// Register `service` on `server` under [`ECHO_METHOD`].
pub fn register_echo_service_server<S: EchoService>(server: &RpcServer, service: S) -> Result<(), RegisterError> {
    let service = Arc::new(service);
    server.register_unary(
        ECHO_METHOD,
        unary_handler(move |ctx, payload| {
            let service = Arc::clone(&service);
            async move {
                let msg: Message = codec::decode(&payload)?;
                let reply = service.echo(ctx, msg).await?;
                codec::encode(&reply)
            }
        }),
    )
}

/// Route `POST /echo` on `mux` to `Echo` over `conn`.
pub fn register_echo_service_handler(ctx: &Context, mux: &GatewayMux, conn: ClientConn) -> Result<(), GatewayError> {
    mux.handle_unary::<Message, Message>(ctx, Method::POST, ECHO_ROUTE, ECHO_METHOD, conn)
}

/// Typed client for `EchoService`.
#[derive(Debug, Clone)]
pub struct EchoServiceClient {
    conn: ClientConn,
}

impl EchoServiceClient {
    pub fn new(conn: ClientConn) -> Self {
        Self { conn }
    }

    pub async fn echo(&self, ctx: &Context, msg: &Message) -> Result<Message, Status> {
        let reply = self.conn.unary(ctx, ECHO_METHOD, codec::encode(msg)?).await?;
        codec::decode(&reply)
    }
}

/// Returns every message unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct Echo;

impl EchoService for Echo {
    async fn echo(&self, ctx: Context, msg: Message) -> Result<Message, Status> {
        if let Some(request) = correlation::original_request(&ctx) {
            tracing::debug!(
                http.method = %request.method,
                uri = %request.uri,
                "Echo for gateway request"
            );
        }
        Ok(msg)
    }
}
