//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! transport, RPC server, gateway produce:
//!     → logging.rs (structured tracing events)
//!     → metrics.rs (counters, gauges, histograms)
//!
//! Consumers:
//!     → stdout (fmt layer)
//!     → Prometheus scrape endpoint (optional)
//! ```
//!
//! # Design Decisions
//! - Every HTTP request carries a correlation key through the RPC hop; log
//!   events on both sides record it as `request_key`
//! - Metric updates are cheap and safe to call before an exporter exists

pub mod logging;
pub mod metrics;
