//! Metrics collection and exposition.
//!
//! # Metrics
//! - `pipe_dials_total` (counter): dial attempts by `result` (ok, closed, timeout)
//! - `pipe_connections_active` (gauge): pipe connections being served
//! - `rpc_calls_total` (counter): RPC calls by `method` and `code`
//! - `rpc_call_duration_seconds` (histogram): handler latency by `method`
//! - `gateway_requests_total` (counter): HTTP requests by `status`
//! - `gateway_request_duration_seconds` (histogram): end-to-end HTTP latency
//! - `gateway_inflight_requests` (gauge): HTTP requests holding a correlation entry
//!
//! Without an installed recorder every call here is a no-op.

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use tonic::Code;

/// Install the Prometheus recorder and its HTTP scrape listener.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_dial(result: &'static str) {
    counter!("pipe_dials_total", "result" => result).increment(1);
}

pub fn record_connection_opened() {
    gauge!("pipe_connections_active").increment(1.0);
}

pub fn record_connection_closed() {
    gauge!("pipe_connections_active").decrement(1.0);
}

pub fn record_rpc_call(method: &str, code: Code, start: Instant) {
    let method = method.to_string();
    counter!("rpc_calls_total", "method" => method.clone(), "code" => format!("{code:?}")).increment(1);
    histogram!("rpc_call_duration_seconds", "method" => method).record(start.elapsed().as_secs_f64());
}

pub fn record_gateway_request(status: u16, start: Instant) {
    counter!("gateway_requests_total", "status" => status.to_string()).increment(1);
    histogram!("gateway_request_duration_seconds").record(start.elapsed().as_secs_f64());
}

pub fn record_inflight_started() {
    gauge!("gateway_inflight_requests").increment(1.0);
}

pub fn record_inflight_finished() {
    gauge!("gateway_inflight_requests").decrement(1.0);
}
