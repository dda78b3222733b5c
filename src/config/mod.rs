//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → PipeConfig (validated, immutable)
//!     → sections handed to transport, RPC server and gateway at startup
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; the gateway is built once per process
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, ConfigError};
pub use schema::PipeConfig;
pub use schema::{GatewayConfig, ListenerConfig, ObservabilityConfig, RpcConfig, TransportConfig};
