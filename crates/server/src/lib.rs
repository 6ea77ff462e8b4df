//! Server side of tokenrelay streaming chat.
//!
//! An axum application exposing `GET /ws/chat` (WebSocket), the `/poll/chat`
//! long-polling fallback and `GET /health`. Every connection gets its own
//! [`ServerEventEmitter`]; generation is delegated to an
//! [`InferenceProvider`] and finished messages go to a [`MessageStore`].

pub mod config;
pub mod emitter;
pub mod error;
pub mod inference;
pub mod polling;
pub mod server;
pub mod state;
pub mod store;
pub mod ws_handler;

pub use config::ServerConfig;
pub use emitter::{ChatContext, ServerEventEmitter};
pub use error::{InferenceError, ServerError, StoreError};
pub use inference::{EchoProvider, GenerationChunk, GenerationRequest, InferenceProvider, TokenStream};
pub use server::{BoundServer, ChatServer, HealthResponse};
pub use state::ChatState;
pub use store::{InMemoryMessageStore, MessageStore, Role, StoredMessage};

pub use tokenrelay_protocol as protocol;
