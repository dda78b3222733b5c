//! Configuration schema definitions.
//!
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};

use crate::context::CancelPropagation;

/// Root configuration for the in-process gateway.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct PipeConfig {
    /// External HTTP listener used by the `rpc-pipe` binary.
    pub listener: ListenerConfig,

    /// In-process transport between gateway and RPC server.
    pub transport: TransportConfig,

    /// RPC server and client limits.
    pub rpc: RpcConfig,

    /// HTTP-facing gateway settings.
    pub gateway: GatewayConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// External HTTP listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "127.0.0.1:8080").
    pub bind_address: String,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:8080".to_string(),
        }
    }
}

/// In-process transport configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Maximum number of dialed connections waiting for `accept()`.
    pub backlog: usize,

    /// Bytes buffered per direction in each pipe.
    pub buffer_size: usize,

    /// Timeout for dialing the RPC server, in milliseconds.
    pub dial_timeout_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            backlog: 128,
            buffer_size: 64 * 1024,
            dial_timeout_ms: 5_000,
        }
    }
}

/// RPC server and client configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RpcConfig {
    /// Largest accepted request or response message, in bytes.
    pub max_message_bytes: usize,

    /// Concurrent calls allowed per connection.
    pub max_concurrent_streams: u32,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            max_message_bytes: 4 * 1024 * 1024, // 4MB
            max_concurrent_streams: 256,
        }
    }
}

/// HTTP-facing gateway configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Per-request timeout in seconds, applied to the translated RPC call.
    pub request_timeout_secs: u64,

    /// Maximum HTTP request body size in bytes.
    pub max_body_bytes: usize,

    /// Whether the process-wide context's cancellation reaches handlers.
    pub cancel_propagation: CancelPropagation,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 30,
            max_body_bytes: 2 * 1024 * 1024, // 2MB
            cancel_propagation: CancelPropagation::Primary,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config: PipeConfig = toml::from_str("").unwrap();
        assert_eq!(config.transport.backlog, 128);
        assert_eq!(config.gateway.cancel_propagation, CancelPropagation::Primary);
        assert!(!config.observability.metrics_enabled);
    }

    #[test]
    fn partial_sections_merge_with_defaults() {
        let config: PipeConfig = toml::from_str(
            r#"
            [transport]
            backlog = 4

            [gateway]
            cancel_propagation = "either"
            "#,
        )
        .unwrap();

        assert_eq!(config.transport.backlog, 4);
        assert_eq!(config.transport.buffer_size, 64 * 1024);
        assert_eq!(config.gateway.cancel_propagation, CancelPropagation::Either);
        assert_eq!(config.gateway.request_timeout_secs, 30);
    }
}
