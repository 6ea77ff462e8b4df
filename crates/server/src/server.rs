//! HTTP server assembly.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::response::Json;
use axum::routing::{get, post};
use axum::{extract::State, Router};
use serde::Serialize;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::config::ServerConfig;
use crate::emitter::ChatContext;
use crate::error::ServerError;
use crate::inference::{EchoProvider, InferenceProvider};
use crate::polling::{close_session, open_session, poll_frames, upload_frames};
use crate::state::ChatState;
use crate::store::{InMemoryMessageStore, MessageStore};
use crate::ws_handler::ws_chat_handler;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub provider: String,
    pub uptime_seconds: u64,
    pub active_connections: usize,
    pub polling_sessions: usize,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

pub struct ChatServer {
    state: Arc<ChatState>,
}

impl ChatServer {
    pub fn new(
        config: ServerConfig,
        provider: Arc<dyn InferenceProvider>,
        store: Arc<dyn MessageStore>,
    ) -> Result<Self, ServerError> {
        config.validate()?;
        let context = ChatContext {
            provider,
            store,
            default_model: config.default_model.clone(),
        };
        Ok(Self {
            state: Arc::new(ChatState::new(config, context)),
        })
    }

    /// Echo provider and in-memory store.
    pub fn with_defaults(config: ServerConfig) -> Result<Self, ServerError> {
        Self::new(
            config,
            Arc::new(EchoProvider::new()),
            Arc::new(InMemoryMessageStore::new()),
        )
    }

    pub fn state(&self) -> &Arc<ChatState> {
        &self.state
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/health", get(health_check))
            .route("/ws/chat", get(ws_chat_handler))
            .route("/poll/chat", post(open_session))
            .route(
                "/poll/chat/:session_id",
                post(upload_frames).get(poll_frames).delete(close_session),
            )
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Bind the configured address without serving yet.
    pub async fn bind(self) -> Result<BoundServer, ServerError> {
        let addr = self.state.config.socket_addr()?;
        let listener = TcpListener::bind(addr).await.map_err(|e| ServerError::Bind {
            addr: addr.to_string(),
            message: e.to_string(),
        })?;
        let local_addr = listener.local_addr().map_err(|e| ServerError::Bind {
            addr: addr.to_string(),
            message: e.to_string(),
        })?;

        Ok(BoundServer {
            router: self.router(),
            state: self.state,
            listener,
            local_addr,
        })
    }

    pub async fn serve(self) -> Result<(), ServerError> {
        self.bind().await?.run().await
    }
}

/// A server with its listener bound.
pub struct BoundServer {
    router: Router,
    state: Arc<ChatState>,
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl BoundServer {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn state(&self) -> &Arc<ChatState> {
        &self.state
    }

    pub async fn run(self) -> Result<(), ServerError> {
        self.run_until(std::future::pending()).await
    }

    /// Serve until `shutdown` resolves.
    pub async fn run_until<F>(self, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        tracing::info!(addr = %self.local_addr, "chat server listening");
        let reaper = tokio::spawn(reap_polling_sessions(self.state.clone()));

        let result = axum::serve(self.listener, self.router)
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| ServerError::Serve(e.to_string()));

        reaper.abort();
        tracing::info!("chat server stopped");
        result
    }
}

async fn reap_polling_sessions(state: Arc<ChatState>) {
    let idle = state.config.poll_idle_timeout;
    let mut interval = tokio::time::interval(idle / 2);
    loop {
        interval.tick().await;
        let closed = state.polling.reap_idle(idle);
        if closed > 0 {
            tracing::debug!(closed, "reaped idle polling sessions");
        }
    }
}

async fn health_check(State(state): State<Arc<ChatState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        provider: state.context.provider.provider_name().to_string(),
        uptime_seconds: state.uptime_seconds(),
        active_connections: state.active_connections(),
        polling_sessions: state.polling_sessions(),
        timestamp: chrono::Utc::now(),
    })
}
