//! rpc-pipe
//!
//! Serves an RPC service and its HTTP/JSON gateway from one process; the
//! gateway reaches the RPC server through in-memory pipes, never a socket.
//!
//! # Architecture Overview
//!
//! ```text
//!     HTTP client
//!         │
//!         ▼
//!   ┌──────────────┐   serve_http    ┌──────────────┐  ClientConn::unary
//!   │ axum router  │────────────────▶│ GatewayMux   │──────────┐
//!   │ (tower-http) │                 │ (JSON ⇄ RPC) │          │
//!   └──────────────┘                 └──────────────┘          ▼
//!         ▲                                            ┌──────────────┐
//!         │        correlation key as metadata         │ PipeListener │
//!         │                                            │ (in-memory)  │
//!   ┌──────────────┐  request(ctx)   ┌──────────────┐  └──────┬───────┘
//!   │ Correlation  │◀────────────────│  RpcServer   │◀────────┘
//!   │    store     │                 │  + handlers  │
//!   └──────────────┘                 └──────────────┘
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;

use rpc_pipe::config::{load_config, PipeConfig};
use rpc_pipe::echo::{register_echo_service_handler, register_echo_service_server, Echo};
use rpc_pipe::observability::{logging, metrics};
use rpc_pipe::{GatewayOptions, GatewayServer, Shutdown};

#[derive(Parser)]
#[command(name = "rpc-pipe")]
#[command(about = "RPC server with an in-process HTTP/JSON gateway", long_about = None)]
struct Args {
    /// Path to a TOML config file; defaults apply when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => load_config(path)?,
        None => PipeConfig::default(),
    };

    logging::init_logging(&config.observability.log_level)?;
    tracing::info!("rpc-pipe v{} starting", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        bind_address = %config.listener.bind_address,
        backlog = config.transport.backlog,
        request_timeout_secs = config.gateway.request_timeout_secs,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        if let Ok(addr) = config.observability.metrics_address.parse() {
            metrics::init_metrics(addr);
        } else {
            tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            );
        }
    }

    let shutdown = Shutdown::new();
    let server = GatewayServer::new(&shutdown.context(), GatewayOptions::from_config(&config)).await?;
    server.register_service(register_echo_service_server, Echo, register_echo_service_handler)?;
    let server = Arc::new(server);

    let listener = TcpListener::bind(&config.listener.bind_address).await?;
    tracing::info!(address = %listener.local_addr()?, "Listening for connections");

    let app = Arc::clone(&server).router();
    axum::serve(listener, app)
        .with_graceful_shutdown({
            let shutdown = shutdown.clone();
            async move {
                if let Err(e) = shutdown.wait_for_signal().await {
                    tracing::error!(error = %e, "Failed to listen for Ctrl-C; shutting down");
                    shutdown.trigger();
                }
            }
        })
        .await?;

    server.wait_stopped().await;
    tracing::info!("Shutdown complete");
    Ok(())
}
