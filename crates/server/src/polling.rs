//! HTTP long-polling sessions.
//!
//! Fallback for clients that cannot hold a WebSocket open. A session owns
//! one [`ServerEventEmitter`]; uploaded frames are fed to it and the frames
//! it emits are queued until the next `GET`.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Json;
use dashmap::DashMap;
use serde::Serialize;
use tokenrelay_protocol::ServerEvent;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::emitter::ServerEventEmitter;
use crate::state::{ChatState, ConnectionGuard};

const SESSION_QUEUE_CAPACITY: usize = 1024;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenSessionResponse {
    pub session_id: String,
}

pub(crate) struct PollSession {
    emitter: ServerEventEmitter,
    events: tokio::sync::Mutex<mpsc::Receiver<ServerEvent>>,
    last_seen: parking_lot::Mutex<Instant>,
    _slot: ConnectionGuard,
}

impl PollSession {
    fn touch(&self) {
        *self.last_seen.lock() = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_seen.lock().elapsed()
    }
}

pub(crate) struct PollingSessions {
    sessions: DashMap<String, Arc<PollSession>>,
}

impl PollingSessions {
    pub(crate) fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.sessions.len()
    }

    fn get(&self, id: &str) -> Option<Arc<PollSession>> {
        self.sessions.get(id).map(|entry| entry.value().clone())
    }

    fn remove(&self, id: &str) -> Option<Arc<PollSession>> {
        let (_, session) = self.sessions.remove(id)?;
        session.emitter.close();
        Some(session)
    }

    /// Close sessions that have not been polled within `idle`.
    pub(crate) fn reap_idle(&self, idle: Duration) -> usize {
        let stale: Vec<String> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().idle_for() >= idle)
            .map(|entry| entry.key().clone())
            .collect();

        for id in &stale {
            if self.remove(id).is_some() {
                tracing::info!(session = %id, "closing idle long-polling session");
            }
        }
        stale.len()
    }
}

/// `POST /poll/chat`
pub(crate) async fn open_session(
    State(state): State<Arc<ChatState>>,
) -> Result<Json<OpenSessionResponse>, StatusCode> {
    let slot = state.try_acquire().ok_or_else(|| {
        tracing::warn!("connection limit reached; refusing polling session");
        StatusCode::SERVICE_UNAVAILABLE
    })?;

    let (tx, rx) = mpsc::channel(SESSION_QUEUE_CAPACITY);
    let session_id = uuid::Uuid::new_v4().to_string();
    let session = PollSession {
        emitter: ServerEventEmitter::new(state.context.clone(), tx),
        events: tokio::sync::Mutex::new(rx),
        last_seen: parking_lot::Mutex::new(Instant::now()),
        _slot: slot,
    };
    state
        .polling
        .sessions
        .insert(session_id.clone(), Arc::new(session));

    tracing::info!(session = %session_id, "long-polling session opened");
    Ok(Json(OpenSessionResponse { session_id }))
}

/// `POST /poll/chat/:session_id`
pub(crate) async fn upload_frames(
    State(state): State<Arc<ChatState>>,
    Path(session_id): Path<String>,
    Json(frames): Json<Vec<serde_json::Value>>,
) -> StatusCode {
    let Some(session) = state.polling.get(&session_id) else {
        return StatusCode::NOT_FOUND;
    };
    session.touch();

    for frame in frames {
        session.emitter.handle_frame(&frame.to_string()).await;
    }
    StatusCode::NO_CONTENT
}

/// `GET /poll/chat/:session_id`: waits up to `poll_timeout` for the first
/// frame, then returns everything queued.
pub(crate) async fn poll_frames(
    State(state): State<Arc<ChatState>>,
    Path(session_id): Path<String>,
) -> Result<Json<Vec<ServerEvent>>, StatusCode> {
    let session = state
        .polling
        .get(&session_id)
        .ok_or(StatusCode::NOT_FOUND)?;
    session.touch();

    let mut batch = Vec::new();
    {
        let mut events = session.events.lock().await;
        match tokio::time::timeout(state.config.poll_timeout, events.recv()).await {
            Ok(Some(event)) => batch.push(event),
            Ok(None) => return Err(StatusCode::GONE),
            Err(_) => {}
        }
        while let Ok(event) = events.try_recv() {
            batch.push(event);
        }
    }

    session.touch();
    Ok(Json(batch))
}

/// `DELETE /poll/chat/:session_id`
pub(crate) async fn close_session(
    State(state): State<Arc<ChatState>>,
    Path(session_id): Path<String>,
) -> StatusCode {
    match state.polling.remove(&session_id) {
        Some(_) => {
            tracing::info!(session = %session_id, "long-polling session closed");
            StatusCode::NO_CONTENT
        }
        None => StatusCode::NOT_FOUND,
    }
}
