use std::time::Duration;

use thiserror::Error;
use tokenrelay_protocol::{ConfigError, MessageId, ProtocolError};

/// Local failures of the lifecycle coordinator.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("message {0} is already registered")]
    DuplicateMessage(MessageId),

    #[error("malformed message id: {0:?}")]
    MalformedId(MessageId),

    #[error("coordinator is shutting down")]
    ShuttingDown,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("reconnection failed after {attempts} attempts")]
    ReconnectFailed { attempts: u32 },

    #[error("no acknowledgement for {message_id} within {timeout:?}")]
    AckTimeout {
        message_id: MessageId,
        timeout: Duration,
    },

    #[error("transport closed")]
    Closed,

    #[error("frame encoding failed: {0}")]
    Encode(#[from] ProtocolError),
}

/// Errors surfaced by [`ChatClient`](crate::ChatClient).
#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}
