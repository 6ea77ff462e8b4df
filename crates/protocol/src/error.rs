use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame decode error: {0}")]
    Decode(String),

    #[error("frame encode error: {0}")]
    Encode(String),

    #[error("malformed message id: {0:?}")]
    MalformedId(String),

    #[error("invalid state transition for {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: crate::state::LifecycleState,
        to: crate::state::LifecycleState,
    },
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        ProtocolError::Decode(err.to_string())
    }
}

/// Configuration errors shared by every tokenrelay component.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required configuration: {key}")]
    MissingRequired { key: String },

    #[error("invalid configuration value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },

    #[error("IO error reading config file: {message}")]
    IoError { message: String },

    #[error("configuration parsing error: {message}")]
    ParseError { message: String },
}

impl ConfigError {
    pub fn invalid(key: impl Into<String>, reason: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            key: key.into(),
            reason: reason.into(),
        }
    }
}
