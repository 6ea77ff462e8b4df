//! Configuration file for the `tokenrelay` binary.
//!
//! One TOML file with `[client]`, `[server]` and `[logging]` tables, each
//! optional. Environment variables override the file.

use std::env;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tokenrelay_client::ClientConfig;
use tokenrelay_protocol::ConfigError;
use tokenrelay_server::ServerConfig;

use crate::logging::LoggingConfig;

pub const ENV_SERVER_URL: &str = "TOKENRELAY_SERVER_URL";
pub const ENV_BIND: &str = "TOKENRELAY_BIND";
pub const ENV_LOG: &str = "TOKENRELAY_LOG";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub client: ClientConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
}

impl AppConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::IoError {
            message: e.to_string(),
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })
    }

    /// File (if given) plus environment overrides, validated.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// `TOKENRELAY_BIND` takes `host` or `host:port`.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(url) = env::var(ENV_SERVER_URL) {
            self.client.server_url = url;
        }

        if let Ok(bind) = env::var(ENV_BIND) {
            match bind.rsplit_once(':') {
                Some((host, port)) => {
                    self.server.bind_address = host.to_string();
                    self.server.port = port.parse().map_err(|_| {
                        ConfigError::invalid(ENV_BIND, format!("invalid port '{}'", port))
                    })?;
                }
                None => self.server.bind_address = bind,
            }
        }

        if let Ok(level) = env::var(ENV_LOG) {
            self.logging.level = level;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.logging.validate()?;
        self.client.validate()?;
        self.server.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::LogFormat;
    use serial_test::serial;
    use std::io::Write;
    use std::time::Duration;

    fn clear_env() {
        env::remove_var(ENV_SERVER_URL);
        env::remove_var(ENV_BIND);
        env::remove_var(ENV_LOG);
    }

    #[test]
    fn defaults_validate() {
        AppConfig::default().validate().unwrap();
    }

    #[test]
    #[serial]
    fn loads_file_with_partial_tables() {
        clear_env();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[client]
server_url = "ws://chat.internal:9000/ws/chat"

[client.lifecycle]
watchdog_timeout = "90s"

[server]
port = 9000

[logging]
level = "debug"
format = "compact"
"#
        )
        .unwrap();

        let config = AppConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.client.server_url, "ws://chat.internal:9000/ws/chat");
        assert_eq!(
            config.client.lifecycle.watchdog_timeout,
            Duration::from_secs(90)
        );
        assert_eq!(config.client.lifecycle.cleanup_grace, Duration::from_secs(5));
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.format, LogFormat::Compact);
    }

    #[test]
    #[serial]
    fn env_overrides_file() {
        clear_env();
        env::set_var(ENV_SERVER_URL, "ws://override:1234/ws/chat");
        env::set_var(ENV_BIND, "0.0.0.0:7000");
        env::set_var(ENV_LOG, "warn");

        let config = AppConfig::load(None).unwrap();
        assert_eq!(config.client.server_url, "ws://override:1234/ws/chat");
        assert_eq!(config.server.bind_address, "0.0.0.0");
        assert_eq!(config.server.port, 7000);
        assert_eq!(config.logging.level, "warn");

        clear_env();
    }

    #[test]
    #[serial]
    fn bad_bind_port_is_reported() {
        clear_env();
        env::set_var(ENV_BIND, "0.0.0.0:http");
        let err = AppConfig::load(None).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
        clear_env();
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = AppConfig::from_file("/nonexistent/tokenrelay.toml").unwrap_err();
        assert!(matches!(err, ConfigError::IoError { .. }));
    }

    #[test]
    fn malformed_file_is_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server\nport = ").unwrap();
        let err = AppConfig::from_file(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { .. }));
    }
}
