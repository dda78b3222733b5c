//! Lifecycle management.
//!
//! # Data Flow
//! ```text
//! Shutdown (shutdown.rs):
//!     Ctrl-C or trigger() → root context cancelled
//!         → GatewayServer watcher stops the RPC server (closes the transport)
//!         → HTTP listener drains and exits
//! ```
//!
//! # Design Decisions
//! - The root context is the single shutdown signal; everything long-lived
//!   derives from it
//! - Triggering is idempotent

pub mod shutdown;

pub use shutdown::Shutdown;
