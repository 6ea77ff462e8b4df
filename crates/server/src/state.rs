use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::config::ServerConfig;
use crate::emitter::ChatContext;
use crate::polling::PollingSessions;

/// State shared by every route.
pub struct ChatState {
    pub config: ServerConfig,
    pub context: Arc<ChatContext>,
    pub(crate) polling: PollingSessions,
    connections: Arc<AtomicUsize>,
    started_at: Instant,
}

impl ChatState {
    pub fn new(config: ServerConfig, context: ChatContext) -> Self {
        Self {
            config,
            context: Arc::new(context),
            polling: PollingSessions::new(),
            connections: Arc::new(AtomicUsize::new(0)),
            started_at: Instant::now(),
        }
    }

    /// Open WebSocket connections plus live polling sessions.
    pub fn active_connections(&self) -> usize {
        self.connections.load(Ordering::Acquire)
    }

    pub fn polling_sessions(&self) -> usize {
        self.polling.len()
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    /// Reserve a connection slot, or `None` at `max_connections`.
    pub(crate) fn try_acquire(&self) -> Option<ConnectionGuard> {
        let max = self.config.max_connections;
        self.connections
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < max).then_some(n + 1)
            })
            .ok()
            .map(|_| ConnectionGuard {
                connections: self.connections.clone(),
            })
    }
}

/// Releases its connection slot on drop.
pub(crate) struct ConnectionGuard {
    connections: Arc<AtomicUsize>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.connections.fetch_sub(1, Ordering::AcqRel);
    }
}
