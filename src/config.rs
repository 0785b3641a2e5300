use std::sync::Arc;

use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;

/// Gateway configuration. Immutable once handed to a `Gateway`.
pub struct Settings {
    /// Address of the NATS server to bridge to, as `host:port`.
    pub nats_addr: String,
    /// Upgrade the NATS connection to TLS after the INFO greeting.
    pub enable_tls: bool,
    /// TLS parameters for the upgrade. `None` accepts any server certificate.
    pub tls_config: Option<Arc<rustls::ClientConfig>>,
    /// Websocket upgrade parameters. `None` means `default_ws_config()`.
    pub ws_config: Option<WebSocketConfig>,
    /// Echo every relayed unit to the debug log.
    pub trace: bool,
}

impl Settings {
    pub fn new(nats_addr: impl Into<String>) -> Self {
        Self {
            nats_addr: nats_addr.into(),
            enable_tls: false,
            tls_config: None,
            ws_config: None,
            trace: false,
        }
    }
}

/// Built on demand so callers never share a mutable default.
pub fn default_ws_config() -> WebSocketConfig {
    let mut config = WebSocketConfig::default();
    config.read_buffer_size = 1024;
    config.write_buffer_size = 1024;
    config
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_ws_config_buffer_sizes() {
        let config = default_ws_config();
        assert_eq!(config.read_buffer_size, 1024);
        assert_eq!(config.write_buffer_size, 1024);
    }
}
