use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokenrelay_protocol::{decode_server, encode_client, ClientEvent, MessageId, ServerEvent};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::link::{Connector, Link, TransportKind};
use crate::config::TransportConfig;
use crate::error::TransportError;
use crate::reconciler::EventReconciler;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected { transport: TransportKind },
    Reconnecting { attempt: u32 },
    Failed { attempts: u32 },
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected { .. })
    }
}

/// What happened to a frame handed to [`TransportSession::send`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendReceipt {
    /// Written to the live link and acknowledged by the server.
    Acked,
    /// Written to the live link; no acknowledgement was requested.
    Sent,
    /// Queued until the next successful connection.
    Buffered,
}

#[derive(Debug, Clone, Serialize)]
pub struct TransportDiagnostics {
    pub state: ConnectionState,
    pub transport: Option<TransportKind>,
    pub connect_count: u64,
    pub reconnect_attempts: u64,
    pub last_heartbeat_age_ms: Option<u64>,
    pub outbound_queued: usize,
    pub pending_acks: usize,
    pub active_messages: usize,
    pub queued_events: usize,
}

#[derive(Default)]
struct Outbox {
    /// Set only while connected and the queue has been drained.
    writer: Option<mpsc::Sender<String>>,
    queue: VecDeque<String>,
}

struct Driver {
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

/// Connection lifecycle for one client.
///
/// Owns reconnection, heartbeats, the outbound buffer and acknowledgement
/// tracking. Inbound lifecycle frames are handed to the [`EventReconciler`];
/// after every successful (re)connection the outbound buffer is flushed and
/// [`EventReconciler::replay_all`] runs.
pub struct TransportSession {
    config: TransportConfig,
    connectors: Vec<Arc<dyn Connector>>,
    reconciler: Arc<EventReconciler>,
    state_tx: watch::Sender<ConnectionState>,
    outbox: Mutex<Outbox>,
    pending_acks: DashMap<MessageId, oneshot::Sender<()>>,
    driver: Mutex<Option<Driver>>,
    connect_lock: tokio::sync::Mutex<()>,
    connect_count: AtomicU64,
    reconnect_attempts: AtomicU64,
    last_heartbeat: Mutex<Option<Instant>>,
    active_transport: Mutex<Option<TransportKind>>,
    self_ref: Weak<TransportSession>,
}

impl TransportSession {
    /// `connectors` are tried in order on every connection attempt.
    pub fn new(
        config: TransportConfig,
        connectors: Vec<Arc<dyn Connector>>,
        reconciler: Arc<EventReconciler>,
    ) -> Arc<Self> {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Arc::new_cyclic(|self_ref| Self {
            config,
            connectors,
            reconciler,
            state_tx,
            outbox: Mutex::new(Outbox::default()),
            pending_acks: DashMap::new(),
            driver: Mutex::new(None),
            connect_lock: tokio::sync::Mutex::new(()),
            connect_count: AtomicU64::new(0),
            reconnect_attempts: AtomicU64::new(0),
            last_heartbeat: Mutex::new(None),
            active_transport: Mutex::new(None),
            self_ref: self_ref.clone(),
        })
    }

    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn current_state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    fn publish(&self, state: ConnectionState) {
        self.state_tx.send_replace(state);
    }

    /// Connect, retrying with backoff. Returns once the first link is up or
    /// every attempt failed. No-op while a connection is already driven.
    pub async fn connect(&self) -> Result<(), TransportError> {
        let _guard = self.connect_lock.lock().await;

        let token = {
            let mut driver = self.driver.lock();
            if let Some(Driver {
                handle: Some(handle),
                ..
            }) = driver.as_ref()
            {
                if !handle.is_finished() {
                    return Ok(());
                }
            }
            let token = CancellationToken::new();
            *driver = Some(Driver {
                token: token.clone(),
                handle: None,
            });
            token
        };

        let (link, kind) = match self.establish(&token, false).await {
            Ok(established) => established,
            Err(e) => {
                self.driver.lock().take();
                return Err(e);
            }
        };
        if token.is_cancelled() {
            return Err(TransportError::Closed);
        }

        let session = self.self_ref.upgrade().ok_or(TransportError::Closed)?;
        self.on_connected(link.outbound.clone(), kind).await;

        let handle = tokio::spawn(session.drive(link, token.clone()));
        let mut driver = self.driver.lock();
        match driver.as_mut() {
            Some(active) if !active.token.is_cancelled() => active.handle = Some(handle),
            _ => handle.abort(),
        }
        Ok(())
    }

    /// Stop the connection without reconnecting. Lifecycle state, handlers
    /// and queued events are left untouched.
    pub async fn disconnect(&self) {
        let driver = self.driver.lock().take();
        if let Some(driver) = driver {
            driver.token.cancel();
            if let Some(handle) = driver.handle {
                let _ = handle.await;
            }
        }

        self.outbox.lock().writer = None;
        *self.active_transport.lock() = None;
        self.pending_acks.clear();
        self.publish(ConnectionState::Disconnected);
        tracing::info!("transport disconnected");
    }

    async fn establish(
        &self,
        token: &CancellationToken,
        reconnecting: bool,
    ) -> Result<(Link, TransportKind), TransportError> {
        let max_attempts = self.config.max_reconnect_attempts;

        for attempt in 0..max_attempts {
            if token.is_cancelled() {
                return Err(TransportError::Closed);
            }

            if reconnecting || attempt > 0 {
                self.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
                self.publish(ConnectionState::Reconnecting {
                    attempt: attempt + 1,
                });
            } else {
                self.publish(ConnectionState::Connecting);
            }

            for connector in &self.connectors {
                let result = tokio::select! {
                    result = connector.connect() => result,
                    _ = token.cancelled() => return Err(TransportError::Closed),
                };
                match result {
                    Ok(link) => {
                        tracing::info!(transport = %connector.kind(), attempt = attempt + 1, "transport connected");
                        return Ok((link, connector.kind()));
                    }
                    Err(e) => {
                        tracing::debug!(transport = %connector.kind(), "connect attempt failed: {}", e);
                    }
                }
            }

            if attempt + 1 < max_attempts {
                let delay = self.config.reconnect_delay(attempt);
                tracing::debug!(attempt = attempt + 1, delay = ?delay, "retrying connection");
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = token.cancelled() => return Err(TransportError::Closed),
                }
            }
        }

        tracing::error!(attempts = max_attempts, "giving up on transport connection");
        self.publish(ConnectionState::Failed {
            attempts: max_attempts,
        });
        Err(TransportError::ReconnectFailed {
            attempts: max_attempts,
        })
    }

    async fn on_connected(&self, writer: mpsc::Sender<String>, kind: TransportKind) {
        *self.active_transport.lock() = Some(kind);
        self.connect_count.fetch_add(1, Ordering::Relaxed);

        if !self.flush_outbox(writer).await {
            tracing::warn!("link closed while flushing outbound queue");
        }
        self.publish(ConnectionState::Connected { transport: kind });
        self.reconciler.replay_all();
    }

    /// Drain the outbound queue into `writer`, then make it the live writer.
    async fn flush_outbox(&self, writer: mpsc::Sender<String>) -> bool {
        loop {
            let batch: Vec<String> = {
                let mut outbox = self.outbox.lock();
                if outbox.queue.is_empty() {
                    outbox.writer = Some(writer);
                    return true;
                }
                outbox.queue.drain(..).collect()
            };

            tracing::debug!(frames = batch.len(), "flushing outbound queue");
            let mut frames = batch.into_iter();
            while let Some(frame) = frames.next() {
                if let Err(mpsc::error::SendError(frame)) = writer.send(frame).await {
                    let unsent: Vec<String> = std::iter::once(frame).chain(frames).collect();
                    let mut outbox = self.outbox.lock();
                    for frame in unsent.into_iter().rev() {
                        outbox.queue.push_front(frame);
                    }
                    return false;
                }
            }
        }
    }

    async fn drive(self: Arc<Self>, mut link: Link, token: CancellationToken) {
        loop {
            self.run_link(&mut link, &token).await;
            self.outbox.lock().writer = None;
            *self.active_transport.lock() = None;

            if token.is_cancelled() {
                break;
            }

            tracing::warn!("transport link lost; reconnecting");
            match self.establish(&token, true).await {
                Ok((next, kind)) => {
                    let writer = next.outbound.clone();
                    link = next;
                    self.on_connected(writer, kind).await;
                }
                Err(_) => break,
            }
        }
    }

    async fn run_link(&self, link: &mut Link, token: &CancellationToken) {
        let period = self.config.heartbeat_interval;
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                frame = link.inbound.recv() => match frame {
                    Some(text) => self.handle_frame(&text, &link.outbound).await,
                    None => break,
                },
                _ = heartbeat.tick() => {
                    if let Ok(ping) = encode_client(&ClientEvent::Ping) {
                        if link.outbound.send(ping).await.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    }

    async fn handle_frame(&self, text: &str, outbound: &mpsc::Sender<String>) {
        let event = match decode_server(text) {
            Ok(event) => event,
            Err(e) => {
                tracing::debug!("dropping undecodable server frame: {}", e);
                return;
            }
        };

        match event {
            ServerEvent::Ack(ack) => {
                if let Some((_, waiter)) = self.pending_acks.remove(&ack.message_id) {
                    let _ = waiter.send(());
                }
            }
            ServerEvent::Ping => {
                self.record_heartbeat();
                if let Ok(pong) = encode_client(&ClientEvent::Pong) {
                    let _ = outbound.send(pong).await;
                }
            }
            ServerEvent::Pong => self.record_heartbeat(),
            ServerEvent::ConversationCreated(created) => {
                self.reconciler
                    .coordinator()
                    .apply_conversation_created(&created.conversation_id);
            }
            lifecycle => {
                if let Ok((id, event)) = lifecycle.into_message_event() {
                    self.reconciler.deliver(id, event);
                }
            }
        }
    }

    fn record_heartbeat(&self) {
        *self.last_heartbeat.lock() = Some(Instant::now());
    }

    /// Send a frame. While connected the frame is written immediately and,
    /// with `ack_timeout` set on a message-scoped frame, the call waits for
    /// `chat:ack`. While disconnected the frame is buffered and flushed in
    /// order after the next successful connection.
    pub async fn send(
        &self,
        event: &ClientEvent,
        ack_timeout: Option<Duration>,
    ) -> Result<SendReceipt, TransportError> {
        let text = encode_client(event)?;

        let writer = {
            let outbox = self.outbox.lock();
            if outbox.queue.is_empty() {
                outbox.writer.clone()
            } else {
                None
            }
        };

        let ack = match (ack_timeout, event.message_id(), writer.is_some()) {
            (Some(timeout), Some(id), true) => {
                let (tx, rx) = oneshot::channel();
                self.pending_acks.insert(id.clone(), tx);
                Some((id.clone(), timeout, rx))
            }
            _ => None,
        };

        let unsent = match writer {
            Some(writer) => writer.send(text).await.err().map(|e| e.0),
            None => Some(text),
        };

        if let Some(text) = unsent {
            if let Some((id, _, _)) = &ack {
                self.pending_acks.remove(id);
            }
            self.buffer(text);
            return Ok(SendReceipt::Buffered);
        }

        let Some((id, timeout, rx)) = ack else {
            return Ok(SendReceipt::Sent);
        };
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(())) => Ok(SendReceipt::Acked),
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => {
                self.pending_acks.remove(&id);
                Err(TransportError::AckTimeout {
                    message_id: id,
                    timeout,
                })
            }
        }
    }

    fn buffer(&self, text: String) {
        let mut outbox = self.outbox.lock();
        if outbox.queue.len() >= self.config.outbound_queue_capacity {
            outbox.queue.pop_front();
            tracing::warn!("outbound queue full; dropped oldest frame");
        }
        outbox.queue.push_back(text);
    }

    pub fn outbound_len(&self) -> usize {
        self.outbox.lock().queue.len()
    }

    pub fn diagnostics(&self) -> TransportDiagnostics {
        let coordinator = self.reconciler.coordinator();
        TransportDiagnostics {
            state: self.current_state(),
            transport: *self.active_transport.lock(),
            connect_count: self.connect_count.load(Ordering::Relaxed),
            reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
            last_heartbeat_age_ms: self
                .last_heartbeat
                .lock()
                .map(|at| at.elapsed().as_millis() as u64),
            outbound_queued: self.outbound_len(),
            pending_acks: self.pending_acks.len(),
            active_messages: coordinator.active_count(),
            queued_events: self.reconciler.queued_len(),
        }
    }
}
