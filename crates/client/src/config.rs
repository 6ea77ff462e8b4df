//! Client configuration.
//!
//! Every timeout and limit here is tunable policy. Durations are written in
//! humantime form (`"30s"`, `"2m"`) when loaded from TOML.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokenrelay_protocol::ConfigError;

/// Top-level configuration for a [`ChatClient`](crate::ChatClient).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// WebSocket endpoint, e.g. `ws://127.0.0.1:8080/ws/chat`.
    pub server_url: String,
    /// Long-polling base URL. Derived from `server_url` when unset.
    pub poll_url: Option<String>,
    pub lifecycle: LifecycleConfig,
    pub reconciler: ReconcilerConfig,
    pub transport: TransportConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            poll_url: None,
            lifecycle: LifecycleConfig::default(),
            reconciler: ReconcilerConfig::default(),
            transport: TransportConfig::default(),
        }
    }
}

fn default_server_url() -> String {
    "ws://127.0.0.1:8080/ws/chat".to_string()
}

impl ClientConfig {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            ..Self::default()
        }
    }

    /// Resolve the long-polling base URL: `ws(s)://host/...` becomes
    /// `http(s)://host/poll/chat`.
    pub fn resolved_poll_url(&self) -> Result<String, ConfigError> {
        if let Some(url) = &self.poll_url {
            return Ok(url.clone());
        }

        let mut url = url::Url::parse(&self.server_url)
            .map_err(|e| ConfigError::invalid("server_url", e.to_string()))?;
        let scheme = match url.scheme() {
            "ws" | "http" => "http",
            "wss" | "https" => "https",
            other => {
                return Err(ConfigError::invalid(
                    "server_url",
                    format!("unsupported scheme '{}'", other),
                ))
            }
        };
        url.set_scheme(scheme)
            .map_err(|_| ConfigError::invalid("server_url", "cannot rewrite scheme"))?;
        url.set_path("/poll/chat");
        url.set_query(None);
        Ok(url.to_string())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server_url.trim().is_empty() {
            return Err(ConfigError::MissingRequired {
                key: "client.server_url".to_string(),
            });
        }
        url::Url::parse(&self.server_url)
            .map_err(|e| ConfigError::invalid("client.server_url", e.to_string()))?;

        self.lifecycle.validate()?;
        self.reconciler.validate()?;
        self.transport.validate()
    }
}

/// Lifecycle registry timers and limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Longest a message may take to reach a terminal state.
    #[serde(with = "humantime_serde")]
    pub watchdog_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
    /// Inactivity after which the sweep force-errors a message.
    #[serde(with = "humantime_serde")]
    pub stale_threshold: Duration,
    /// Delay between a terminal state and removal from the stores.
    #[serde(with = "humantime_serde")]
    pub cleanup_grace: Duration,
    pub max_active_messages: usize,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            watchdog_timeout: Duration::from_secs(120),
            sweep_interval: Duration::from_secs(30),
            stale_threshold: Duration::from_secs(300),
            cleanup_grace: Duration::from_secs(5),
            max_active_messages: 1000,
        }
    }
}

impl LifecycleConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        non_zero("lifecycle.watchdog_timeout", self.watchdog_timeout)?;
        non_zero("lifecycle.sweep_interval", self.sweep_interval)?;
        non_zero("lifecycle.stale_threshold", self.stale_threshold)?;
        if self.max_active_messages == 0 {
            return Err(ConfigError::invalid(
                "lifecycle.max_active_messages",
                "must be at least 1",
            ));
        }
        if self.watchdog_timeout > self.stale_threshold {
            tracing::warn!(
                watchdog = ?self.watchdog_timeout,
                stale = ?self.stale_threshold,
                "watchdog timeout exceeds stale threshold; the sweep will fire first for idle messages"
            );
        }
        Ok(())
    }
}

/// Early-event buffering and retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    #[serde(with = "humantime_serde")]
    pub initial_retry_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub max_retry_delay: Duration,
    pub max_retry_attempts: u32,
    pub max_queue_per_message: usize,
    /// Queued events older than this are purged regardless of attempts.
    #[serde(with = "humantime_serde")]
    pub max_event_age: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            initial_retry_delay: Duration::from_secs(1),
            max_retry_delay: Duration::from_secs(30),
            max_retry_attempts: 5,
            max_queue_per_message: 64,
            max_event_age: Duration::from_secs(60),
        }
    }
}

impl ReconcilerConfig {
    /// Delay before retry number `attempt` (zero based): doubles from
    /// `initial_retry_delay`, capped at `max_retry_delay`.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.initial_retry_delay
            .checked_mul(factor)
            .unwrap_or(self.max_retry_delay)
            .min(self.max_retry_delay)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        non_zero("reconciler.initial_retry_delay", self.initial_retry_delay)?;
        if self.max_retry_delay < self.initial_retry_delay {
            return Err(ConfigError::invalid(
                "reconciler.max_retry_delay",
                "must not be shorter than initial_retry_delay",
            ));
        }
        if self.max_queue_per_message == 0 {
            return Err(ConfigError::invalid(
                "reconciler.max_queue_per_message",
                "must be at least 1",
            ));
        }
        non_zero("reconciler.max_event_age", self.max_event_age)
    }
}

/// Connection, reconnection and heartbeat policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub max_reconnect_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub initial_reconnect_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub max_reconnect_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// How long `send_message` waits for `chat:ack` on a live connection.
    #[serde(with = "humantime_serde")]
    pub ack_timeout: Duration,
    /// Frames buffered while disconnected; the oldest is dropped on overflow.
    pub outbound_queue_capacity: usize,
    /// Try HTTP long-polling when the WebSocket cannot be established.
    pub enable_polling_fallback: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: 10,
            initial_reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(25),
            connect_timeout: Duration::from_secs(10),
            ack_timeout: Duration::from_secs(10),
            outbound_queue_capacity: 256,
            enable_polling_fallback: true,
        }
    }
}

impl TransportConfig {
    /// Delay after failed attempt number `attempt` (zero based).
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.initial_reconnect_delay
            .checked_mul(factor)
            .unwrap_or(self.max_reconnect_delay)
            .min(self.max_reconnect_delay)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_reconnect_attempts == 0 {
            return Err(ConfigError::invalid(
                "transport.max_reconnect_attempts",
                "must be at least 1",
            ));
        }
        non_zero("transport.initial_reconnect_delay", self.initial_reconnect_delay)?;
        if self.max_reconnect_delay < self.initial_reconnect_delay {
            return Err(ConfigError::invalid(
                "transport.max_reconnect_delay",
                "must not be shorter than initial_reconnect_delay",
            ));
        }
        non_zero("transport.heartbeat_interval", self.heartbeat_interval)?;
        non_zero("transport.connect_timeout", self.connect_timeout)?;
        if self.outbound_queue_capacity == 0 {
            return Err(ConfigError::invalid(
                "transport.outbound_queue_capacity",
                "must be at least 1",
            ));
        }
        Ok(())
    }
}

fn non_zero(key: &str, value: Duration) -> Result<(), ConfigError> {
    if value.is_zero() {
        Err(ConfigError::invalid(key, "must be greater than zero"))
    } else {
        Ok(())
    }
}
