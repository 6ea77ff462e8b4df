//! Server configuration.

use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokenrelay_protocol::ConfigError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,
    /// `0` binds an ephemeral port.
    pub port: u16,
    /// Longest a `GET /poll/chat/:id` request is held open.
    #[serde(with = "humantime_serde")]
    pub poll_timeout: Duration,
    /// Polling sessions not polled for this long are closed.
    #[serde(with = "humantime_serde")]
    pub poll_idle_timeout: Duration,
    /// Concurrent WebSocket and polling connections.
    pub max_connections: usize,
    /// Model used when a request leaves `model` empty.
    pub default_model: String,
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1".to_string(),
            port: 8080,
            poll_timeout: Duration::from_secs(20),
            poll_idle_timeout: Duration::from_secs(60),
            max_connections: 1024,
            default_model: "echo".to_string(),
            heartbeat_interval: Duration::from_secs(25),
        }
    }
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.bind_address, self.port)
            .parse()
            .map_err(|e: std::net::AddrParseError| {
                ConfigError::invalid("server.bind_address", e.to_string())
            })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bind_address.trim().is_empty() {
            return Err(ConfigError::MissingRequired {
                key: "server.bind_address".to_string(),
            });
        }
        self.socket_addr()?;

        for (key, value) in [
            ("server.poll_timeout", self.poll_timeout),
            ("server.poll_idle_timeout", self.poll_idle_timeout),
            ("server.heartbeat_interval", self.heartbeat_interval),
        ] {
            if value.is_zero() {
                return Err(ConfigError::invalid(key, "must be greater than zero"));
            }
        }
        if self.poll_idle_timeout <= self.poll_timeout {
            return Err(ConfigError::invalid(
                "server.poll_idle_timeout",
                "must be longer than poll_timeout",
            ));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::invalid(
                "server.max_connections",
                "must be at least 1",
            ));
        }
        if self.default_model.trim().is_empty() {
            return Err(ConfigError::MissingRequired {
                key: "server.default_model".to_string(),
            });
        }
        Ok(())
    }
}
