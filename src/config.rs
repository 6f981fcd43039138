use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default UDP port of the discovery responder.
pub const DEFAULT_DISCOVERY_PORT: u16 = 35999;

/// Configuration for a [`Context`](crate::context::Context).
///
/// Encapsulates all tunables in one place. `Default` gives a context that
/// listens on an ephemeral TCP port, participates in the `"default"`
/// workgroup and runs the discovery responder on the well-known port.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Unique name of this context on the network.
    pub name: String,
    /// Workgroup used to scope discovery and accepted handshakes.
    pub workgroup: String,
    /// Local address to bind the TCP server and UDP responder to.
    pub bind_host: String,
    /// Host advertised in discovery responses.
    pub advertise_host: String,
    /// TCP server port; 0 selects an ephemeral port.
    pub tcp_port: u16,
    /// UDP discovery responder port.
    pub discovery_port: u16,
    /// Whether to run the UDP discovery responder.
    pub enable_discovery: bool,
    /// Timeout for establishing the TCP connection to a peer.
    pub connect_timeout: Duration,
    /// Window for the bidirectional handshake on a new peer connection.
    pub handshake_timeout: Duration,
    /// Window during which discovery responses are collected.
    pub discovery_window: Duration,
    /// Default timeout for internal runtime calls (signal subscription,
    /// context introspection). Proxy calls made by the application default
    /// to unbounded.
    pub internal_call_timeout: Duration,
    /// Capacity of a signal receiver buffer; beyond it the oldest queued
    /// signal is dropped with a warning.
    pub signal_high_water_mark: usize,
}

impl ContextConfig {
    pub fn new(name: &str) -> ContextConfig {
        ContextConfig {
            name: name.to_string(),
            ..ContextConfig::default()
        }
    }

    pub fn with_workgroup(mut self, workgroup: &str) -> ContextConfig {
        self.workgroup = workgroup.to_string();
        self
    }

    pub fn with_tcp_port(mut self, port: u16) -> ContextConfig {
        self.tcp_port = port;
        self
    }

    pub fn with_discovery_port(mut self, port: u16) -> ContextConfig {
        self.discovery_port = port;
        self
    }

    pub fn without_discovery(mut self) -> ContextConfig {
        self.enable_discovery = false;
        self
    }
}

impl Default for ContextConfig {
    fn default() -> ContextConfig {
        ContextConfig {
            name: "context".to_string(),
            workgroup: "default".to_string(),
            bind_host: "0.0.0.0".to_string(),
            advertise_host: "127.0.0.1".to_string(),
            tcp_port: 0,
            discovery_port: DEFAULT_DISCOVERY_PORT,
            enable_discovery: true,
            connect_timeout: Duration::from_secs(2),
            handshake_timeout: Duration::from_secs(5),
            discovery_window: Duration::from_millis(500),
            internal_call_timeout: Duration::from_secs(5),
            signal_high_water_mark: 10_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_overrides_defaults() {
        let config = ContextConfig::new("ctx1")
            .with_workgroup("lab")
            .with_tcp_port(40001)
            .without_discovery();
        assert_eq!(config.name, "ctx1");
        assert_eq!(config.workgroup, "lab");
        assert_eq!(config.tcp_port, 40001);
        assert!(!config.enable_discovery);
        assert_eq!(config.discovery_port, DEFAULT_DISCOVERY_PORT);
    }
}
