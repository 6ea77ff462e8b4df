//! Client side of tokenrelay streaming chat.
//!
//! A [`ChatClient`] ties together:
//!
//! - [`LifecycleCoordinator`]: the authoritative per-message state machine
//!   plus the [`HandlerBridge`] of UI callbacks
//! - [`EventReconciler`]: buffering and retry for events that arrive before
//!   their message is registered
//! - [`TransportSession`]: connection, heartbeat, reconnection and outbound
//!   buffering over WebSocket or long-polling
//!
//! ```no_run
//! use std::sync::Arc;
//! use tokenrelay_client::{ChatClient, ChatRequest, ClientConfig, HandlerSet};
//!
//! # async fn run() -> Result<(), tokenrelay_client::ClientError> {
//! let client = ChatClient::new(ClientConfig::new("ws://127.0.0.1:8080/ws/chat"))?;
//! client.connect().await?;
//!
//! let handler = HandlerSet::new().with_token(|_, token| print!("{}", token));
//! client
//!     .send_message(ChatRequest::new("hello", "echo"), Arc::new(handler))
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod bridge;
pub mod client;
pub mod config;
pub mod error;
pub mod health;
pub mod lifecycle;
pub mod reconciler;
pub mod timers;
pub mod transport;

pub use bridge::{ChannelHandler, Dispatch, HandlerBridge, HandlerSet, MessageHandler, MessageUpdate};
pub use client::{ChatClient, ChatRequest};
pub use config::{ClientConfig, LifecycleConfig, ReconcilerConfig, TransportConfig};
pub use error::{ClientError, CoordinatorError, TransportError};
pub use health::{ComponentHealth, HealthStatus};
pub use lifecycle::{
    CoordinatorStats, LifecycleCoordinator, MessageLifecycle, MessageMetadata, TransitionOutcome,
    TransitionPayload,
};
pub use reconciler::{EventReconciler, QueuedEvent, Resolution};
pub use timers::{TimerKind, TimerWheel};
pub use transport::{ConnectionState, Connector, SendReceipt, TransportKind, TransportSession};

pub use tokenrelay_protocol as protocol;
