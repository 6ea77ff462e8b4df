use std::time::Duration;

use thiserror::Error;
use tokenrelay_protocol::{ConfigError, ConversationId};

/// Failures of an [`InferenceProvider`](crate::InferenceProvider).
#[derive(Debug, Clone, Error)]
pub enum InferenceError {
    #[error("provider error: {0}")]
    Provider(String),

    #[error("model not available: {0}")]
    ModelUnavailable(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("timeout after {0:?}")]
    Timeout(Duration),
}

/// Failures of a [`MessageStore`](crate::MessageStore).
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("conversation not found: {0}")]
    ConversationNotFound(ConversationId),

    #[error("store backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {message}")]
    Bind { addr: String, message: String },

    #[error("server error: {0}")]
    Serve(String),

    #[error(transparent)]
    Config(#[from] ConfigError),
}
