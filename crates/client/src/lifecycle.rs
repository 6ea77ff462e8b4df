//! Message lifecycle coordinator.
//!
//! Owns the authoritative per-message registry and the [`HandlerBridge`].
//! Every state change goes through [`LifecycleCoordinator::update_state`], is
//! validated against the shared [`MessageStateMachine`] and is applied under
//! the entry's map lock.
//! Callbacks always run after that lock is released, so a callback may call
//! back into the coordinator.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokenrelay_protocol::{
    ConversationId, GenerationMetadata, LifecycleState, MessageEvent, MessageId,
    MessageStateMachine,
};
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::bridge::{Dispatch, HandlerBridge, MessageHandler, Notification};
use crate::config::LifecycleConfig;
use crate::error::CoordinatorError;
use crate::health::ComponentHealth;
use crate::timers::{TimerKind, TimerWheel};

/// Immutable request context captured at send time.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MessageMetadata {
    pub model: String,
    pub has_images: bool,
    pub vision_model: Option<String>,
    pub content: String,
    /// Conversation supplied with the request, if any.
    pub conversation_id: Option<ConversationId>,
}

/// Registry entry for one in-flight message.
#[derive(Debug, Clone, Serialize)]
pub struct MessageLifecycle {
    pub id: MessageId,
    pub state: LifecycleState,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub token_count: u64,
    pub conversation_id: Option<ConversationId>,
    pub metadata: MessageMetadata,
    pub generation: Option<GenerationMetadata>,
    pub error: Option<String>,
    #[serde(skip)]
    last_activity_at: Instant,
    #[serde(skip)]
    created_seq: u64,
}

impl MessageLifecycle {
    fn new(id: MessageId, metadata: MessageMetadata, created_seq: u64) -> Self {
        let now = Utc::now();
        Self {
            id,
            state: LifecycleState::Pending,
            created_at: now,
            last_activity: now,
            token_count: 0,
            conversation_id: metadata.conversation_id.clone(),
            metadata,
            generation: None,
            error: None,
            last_activity_at: Instant::now(),
            created_seq,
        }
    }

    fn touch(&mut self) {
        self.last_activity = Utc::now();
        self.last_activity_at = Instant::now();
    }

    /// Time since the last accepted transition.
    pub fn idle_for(&self) -> std::time::Duration {
        self.last_activity_at.elapsed()
    }
}

/// Data accompanying a state change.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum TransitionPayload {
    #[default]
    None,
    Token(String),
    Complete {
        conversation_id: Option<ConversationId>,
        metadata: GenerationMetadata,
    },
    Error(String),
}

impl TransitionPayload {
    /// Split a wire event into its target state and payload.
    pub fn from_event(event: &MessageEvent) -> (LifecycleState, Self) {
        let payload = match event {
            MessageEvent::Thinking | MessageEvent::Generating => TransitionPayload::None,
            MessageEvent::Token { token } => TransitionPayload::Token(token.clone()),
            MessageEvent::Complete {
                conversation_id,
                metadata,
            } => TransitionPayload::Complete {
                conversation_id: conversation_id.clone(),
                metadata: metadata.clone(),
            },
            MessageEvent::Error { error } => TransitionPayload::Error(error.clone()),
        };
        (event.target_state(), payload)
    }
}

/// Result of one attempted transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    Applied,
    /// The id is known but the transition is not in the table.
    Rejected,
    Unknown,
}

impl TransitionOutcome {
    pub fn is_applied(self) -> bool {
        self == TransitionOutcome::Applied
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorStats {
    pub active_messages: usize,
    pub by_state: HashMap<LifecycleState, usize>,
    pub bound_handlers: usize,
    pub pending_timers: usize,
}

/// One coordinator per client session.
pub struct LifecycleCoordinator {
    config: LifecycleConfig,
    state_machine: MessageStateMachine,
    registry: DashMap<MessageId, MessageLifecycle>,
    bridge: HandlerBridge,
    timers: TimerWheel,
    shutdown_notify: Arc<Notify>,
    is_running: AtomicBool,
    next_seq: AtomicU64,
    self_ref: Weak<LifecycleCoordinator>,
}

impl LifecycleCoordinator {
    /// Create a coordinator and start its stale-message sweep. Must be called
    /// from within a tokio runtime.
    pub fn new(config: LifecycleConfig) -> Arc<Self> {
        let coordinator = Arc::new_cyclic(|self_ref| Self {
            config,
            state_machine: MessageStateMachine::new(),
            registry: DashMap::new(),
            bridge: HandlerBridge::new(),
            timers: TimerWheel::new(),
            shutdown_notify: Arc::new(Notify::new()),
            is_running: AtomicBool::new(true),
            next_seq: AtomicU64::new(0),
            self_ref: self_ref.clone(),
        });
        coordinator.start_sweep();
        coordinator
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    fn start_sweep(&self) {
        let weak = self.self_ref.clone();
        let shutdown_notify = self.shutdown_notify.clone();
        let period = self.config.sweep_interval;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let Some(coordinator) = weak.upgrade() else { break };
                        if !coordinator.is_running() {
                            break;
                        }
                        coordinator.sweep_stale();
                    }
                    _ = shutdown_notify.notified() => break,
                }
            }
        });
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Acquire)
    }

    /// Insert a new message in `pending` and arm its watchdog.
    pub fn create(&self, id: MessageId, metadata: MessageMetadata) -> Result<(), CoordinatorError> {
        self.insert(id, metadata, None)
    }

    /// [`create`](Self::create) with `handler` bound before the registry entry
    /// becomes visible, so no transition can run between the two.
    pub fn create_with_handler(
        &self,
        id: MessageId,
        metadata: MessageMetadata,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), CoordinatorError> {
        self.insert(id, metadata, Some(handler))
    }

    fn insert(
        &self,
        id: MessageId,
        metadata: MessageMetadata,
        handler: Option<Arc<dyn MessageHandler>>,
    ) -> Result<(), CoordinatorError> {
        if !self.is_running() {
            return Err(CoordinatorError::ShuttingDown);
        }
        if !id.is_well_formed() {
            return Err(CoordinatorError::MalformedId(id));
        }
        if self.registry.contains_key(&id) {
            return Err(CoordinatorError::DuplicateMessage(id));
        }

        while self.registry.len() >= self.config.max_active_messages {
            if !self.evict_one() {
                break;
            }
        }

        match self.registry.entry(id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(CoordinatorError::DuplicateMessage(id))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                // Transitions for this id wait on the shard lock held by `slot`.
                if let Some(handler) = handler {
                    self.bridge.register(id.clone(), handler);
                }
                let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
                slot.insert(MessageLifecycle::new(id.clone(), metadata, seq));
            }
        }

        self.arm_watchdog(&id);
        tracing::info!(message_id = %id, "message registered");
        Ok(())
    }

    /// Bind UI callbacks to `id`.
    pub fn register_handler(&self, id: MessageId, handler: Arc<dyn MessageHandler>) {
        self.bridge.register(id, handler);
    }

    pub fn unregister_handler(&self, id: &MessageId) -> bool {
        self.bridge.unregister(id)
    }

    pub fn has_handler(&self, id: &MessageId) -> bool {
        self.bridge.contains(id)
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.registry.contains_key(id)
    }

    /// Whether either lookup path recognises `id`.
    pub fn is_known(&self, id: &MessageId) -> bool {
        self.has_handler(id) || self.contains(id)
    }

    pub fn state(&self, id: &MessageId) -> Option<LifecycleState> {
        self.registry.get(id).map(|entry| entry.state)
    }

    /// Read-only copy of a registry entry.
    pub fn snapshot(&self, id: &MessageId) -> Option<MessageLifecycle> {
        self.registry.get(id).map(|entry| entry.clone())
    }

    pub fn active_ids(&self) -> Vec<MessageId> {
        self.registry.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn active_count(&self) -> usize {
        self.registry.len()
    }

    /// Apply a validated transition and notify the bound handler. Returns
    /// `false` for unknown ids and transitions outside the table.
    pub fn update_state(
        &self,
        id: &MessageId,
        new_state: LifecycleState,
        payload: TransitionPayload,
    ) -> bool {
        self.transition(id, new_state, payload).is_applied()
    }

    /// [`update_state`](Self::update_state) driven by a wire event.
    pub fn apply_event(&self, id: &MessageId, event: &MessageEvent) -> TransitionOutcome {
        let (state, payload) = TransitionPayload::from_event(event);
        self.transition(id, state, payload)
    }

    /// Bookkeeping for an event the bridge delivered to a handler that has no
    /// registry entry. A terminal one still removes the binding after the
    /// grace period.
    pub(crate) fn record_unregistered(&self, id: &MessageId, event: &MessageEvent) {
        if event.is_terminal() {
            self.schedule_cleanup(id);
        }
    }

    /// Deliver an event straight to the bound handler.
    pub(crate) fn dispatch_to_handler(&self, id: &MessageId, event: &MessageEvent) -> Dispatch {
        self.bridge.dispatch(id, event)
    }

    fn transition(
        &self,
        id: &MessageId,
        to: LifecycleState,
        payload: TransitionPayload,
    ) -> TransitionOutcome {
        let conversation_id = {
            let Some(mut entry) = self.registry.get_mut(id) else {
                tracing::debug!(message_id = %id, state = %to, "update for unknown message dropped");
                return TransitionOutcome::Unknown;
            };

            let from = entry.state;
            if !self.state_machine.is_valid_transition(from, to) {
                tracing::debug!(
                    message_id = %id,
                    from = %from,
                    to = %to,
                    "invalid transition rejected"
                );
                return TransitionOutcome::Rejected;
            }

            entry.state = to;
            entry.touch();
            match &payload {
                TransitionPayload::Token(_) if to == LifecycleState::Streaming => {
                    entry.token_count += 1;
                }
                TransitionPayload::Complete {
                    conversation_id,
                    metadata,
                } => {
                    if conversation_id.is_some() {
                        entry.conversation_id = conversation_id.clone();
                    }
                    entry.generation = Some(metadata.clone());
                }
                TransitionPayload::Error(error) => {
                    entry.error = Some(error.clone());
                }
                _ => {}
            }
            entry.conversation_id.clone()
        };

        tracing::debug!(message_id = %id, state = %to, "transition applied");

        if to.is_terminal() {
            self.timers.cancel(id, TimerKind::Watchdog);
            self.schedule_cleanup(id);
            tracing::info!(message_id = %id, state = %to, "message finished");
        }

        self.notify_transition(id, to, payload, conversation_id);
        TransitionOutcome::Applied
    }

    fn notify_transition(
        &self,
        id: &MessageId,
        to: LifecycleState,
        payload: TransitionPayload,
        conversation_id: Option<ConversationId>,
    ) {
        let event = match (to, payload) {
            (LifecycleState::Thinking, _) => MessageEvent::Thinking,
            (LifecycleState::Generating, _) => MessageEvent::Generating,
            (LifecycleState::Streaming, TransitionPayload::Token(token)) => {
                MessageEvent::Token { token }
            }
            (LifecycleState::Streaming, _) => MessageEvent::Token {
                token: String::new(),
            },
            (LifecycleState::Complete, TransitionPayload::Complete { metadata, .. }) => {
                MessageEvent::Complete {
                    conversation_id,
                    metadata,
                }
            }
            (LifecycleState::Complete, _) => MessageEvent::Complete {
                conversation_id,
                metadata: GenerationMetadata::default(),
            },
            (LifecycleState::Error, TransitionPayload::Error(error)) => MessageEvent::Error { error },
            (LifecycleState::Error, _) => MessageEvent::Error {
                error: "unknown error".to_string(),
            },
            (LifecycleState::Cancelled, _) => {
                self.bridge.notify(id, Notification::Cancelled);
                return;
            }
            (LifecycleState::Pending, _) => return,
        };
        self.bridge.dispatch(id, &event);
    }

    /// Cancel a non-terminal message. Handlers receive `on_cancelled` and the
    /// normal cleanup path runs.
    pub fn cancel(&self, id: &MessageId) -> bool {
        let cancelled = self.update_state(id, LifecycleState::Cancelled, TransitionPayload::None);
        if cancelled {
            tracing::info!(message_id = %id, "message cancelled");
        }
        cancelled
    }

    /// Attach a freshly created conversation to every in-flight message that
    /// has none yet. Returns the number of messages updated.
    pub fn apply_conversation_created(&self, conversation_id: &ConversationId) -> usize {
        let mut updated = Vec::new();
        for mut entry in self.registry.iter_mut() {
            if !entry.state.is_terminal() && entry.conversation_id.is_none() {
                entry.conversation_id = Some(conversation_id.clone());
                updated.push(entry.key().clone());
            }
        }

        for id in &updated {
            self.bridge.notify_conversation_created(id, conversation_id);
        }
        tracing::debug!(
            conversation_id = %conversation_id,
            messages = updated.len(),
            "conversation attached"
        );
        updated.len()
    }

    fn arm_watchdog(&self, id: &MessageId) {
        let weak = self.self_ref.clone();
        let timeout = self.config.watchdog_timeout;
        let timer_id = id.clone();
        self.timers
            .schedule(id, TimerKind::Watchdog, timeout, move || async move {
                let Some(coordinator) = weak.upgrade() else { return };
                let error = format!(
                    "message timed out after {}s without reaching a terminal state",
                    timeout.as_secs()
                );
                if coordinator.update_state(
                    &timer_id,
                    LifecycleState::Error,
                    TransitionPayload::Error(error),
                ) {
                    tracing::warn!(message_id = %timer_id, "watchdog forced message into error");
                }
            });
    }

    fn schedule_cleanup(&self, id: &MessageId) {
        let weak = self.self_ref.clone();
        let timer_id = id.clone();
        self.timers.schedule(
            id,
            TimerKind::Cleanup,
            self.config.cleanup_grace,
            move || async move {
                if let Some(coordinator) = weak.upgrade() {
                    coordinator.remove(&timer_id);
                }
            },
        );
    }

    /// Drop every trace of `id` immediately.
    pub fn remove(&self, id: &MessageId) -> Option<MessageLifecycle> {
        self.timers.cancel_all(id);
        self.bridge.unregister(id);
        let removed = self.registry.remove(id).map(|(_, entry)| entry);
        if let Some(entry) = &removed {
            if !entry.state.is_terminal() {
                tracing::debug!(message_id = %id, state = %entry.state, "removed non-terminal message");
            }
        }
        removed
    }

    /// Force-error every non-terminal message idle longer than the stale
    /// threshold. Returns the ids that were expired.
    pub fn sweep_stale(&self) -> Vec<MessageId> {
        let threshold = self.config.stale_threshold;
        let stale: Vec<(MessageId, u64)> = self
            .registry
            .iter()
            .filter(|entry| !entry.state.is_terminal() && entry.idle_for() > threshold)
            .map(|entry| (entry.key().clone(), entry.idle_for().as_secs()))
            .collect();

        let mut expired = Vec::new();
        for (id, idle) in stale {
            let error = format!("message stale: no activity for {}s", idle);
            if self.update_state(&id, LifecycleState::Error, TransitionPayload::Error(error)) {
                tracing::warn!(message_id = %id, idle_secs = idle, "stale message expired");
                expired.push(id);
            }
        }
        expired
    }

    /// Make room for one message. Terminal entries go first; otherwise the
    /// oldest in-flight entry is errored and removed.
    fn evict_one(&self) -> bool {
        let oldest = |terminal: bool| {
            self.registry
                .iter()
                .filter(|entry| entry.state.is_terminal() == terminal)
                .min_by_key(|entry| entry.created_seq)
                .map(|entry| entry.key().clone())
        };

        if let Some(id) = oldest(true) {
            tracing::debug!(message_id = %id, "evicting finished message at capacity");
            self.remove(&id);
            return true;
        }

        if let Some(id) = oldest(false) {
            tracing::warn!(message_id = %id, "evicting in-flight message at capacity");
            self.update_state(
                &id,
                LifecycleState::Error,
                TransitionPayload::Error("evicted: registry capacity reached".to_string()),
            );
            self.remove(&id);
            return true;
        }
        false
    }

    pub fn stats(&self) -> CoordinatorStats {
        let mut by_state = HashMap::new();
        for entry in self.registry.iter() {
            *by_state.entry(entry.state).or_insert(0) += 1;
        }
        CoordinatorStats {
            active_messages: self.registry.len(),
            by_state,
            bound_handlers: self.bridge.len(),
            pending_timers: self.timers.len(),
        }
    }

    pub fn check_health(&self) -> ComponentHealth {
        if !self.is_running() {
            return ComponentHealth::unhealthy("lifecycle coordinator is shut down".to_string());
        }

        let stats = self.stats();
        let stuck = self
            .registry
            .iter()
            .filter(|entry| {
                !entry.state.is_terminal() && entry.idle_for() > self.config.stale_threshold / 2
            })
            .count();
        let capacity_usage = stats.active_messages as f64 / self.config.max_active_messages as f64;

        let status = if stuck > 0 {
            ComponentHealth::degraded(format!("{} messages idle for a long time", stuck))
        } else if capacity_usage > 0.9 {
            ComponentHealth::degraded(format!(
                "near capacity: {}/{} message slots used",
                stats.active_messages, self.config.max_active_messages
            ))
        } else {
            ComponentHealth::healthy(Some(format!(
                "tracking {} messages",
                stats.active_messages
            )))
        };

        let mut health = status
            .with_metric("active_messages", stats.active_messages)
            .with_metric("bound_handlers", stats.bound_handlers)
            .with_metric("pending_timers", stats.pending_timers)
            .with_metric("idle_messages", stuck)
            .with_metric("capacity_usage", format!("{:.2}", capacity_usage));
        for (state, count) in stats.by_state {
            health = health.with_metric(format!("state_{}", state), count);
        }
        health
    }

    /// Cancel every in-flight message, stop all timers and clear both stores.
    pub fn shutdown(&self) {
        if !self.is_running.swap(false, Ordering::AcqRel) {
            return;
        }
        tracing::info!("shutting down lifecycle coordinator");
        self.shutdown_notify.notify_waiters();

        for id in self.active_ids() {
            let in_flight = self
                .state(&id)
                .map(|state| !state.is_terminal())
                .unwrap_or(false);
            if in_flight {
                self.update_state(&id, LifecycleState::Cancelled, TransitionPayload::None);
            }
        }

        self.timers.shutdown();
        self.registry.clear();
        self.bridge.clear();
    }
}

impl Drop for LifecycleCoordinator {
    fn drop(&mut self) {
        self.shutdown_notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::HandlerSet;
    use parking_lot::Mutex;
    use std::time::Duration;

    fn config() -> LifecycleConfig {
        LifecycleConfig::default()
    }

    fn metadata() -> MessageMetadata {
        MessageMetadata {
            model: "llama3".to_string(),
            content: "hi".to_string(),
            ..MessageMetadata::default()
        }
    }

    fn recorder() -> (Arc<HandlerSet>, Arc<Mutex<Vec<String>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (a, b, c, d) = (log.clone(), log.clone(), log.clone(), log.clone());
        let (e, f, g) = (log.clone(), log.clone(), log.clone());
        let handler = HandlerSet::new()
            .with_thinking(move |_| a.lock().push("thinking".into()))
            .with_generating(move |_| b.lock().push("generating".into()))
            .with_token(move |_, t| c.lock().push(format!("token:{}", t)))
            .with_complete(move |_, conv, _| {
                d.lock()
                    .push(format!("complete:{}", conv.map(|c| c.as_str()).unwrap_or("-")))
            })
            .with_error(move |_, err| e.lock().push(format!("error:{}", err)))
            .with_cancelled(move |_| f.lock().push("cancelled".into()))
            .with_conversation_created(move |_, conv| g.lock().push(format!("conversation:{}", conv)));
        (Arc::new(handler), log)
    }

    #[tokio::test(start_paused = true)]
    async fn full_lifecycle_notifies_in_order() {
        let coordinator = LifecycleCoordinator::new(config());
        let id = MessageId::from("m1");
        let (handler, log) = recorder();
        coordinator.create(id.clone(), metadata()).unwrap();
        coordinator.register_handler(id.clone(), handler);

        for event in [
            MessageEvent::Thinking,
            MessageEvent::Generating,
            MessageEvent::Token { token: "Hel".into() },
            MessageEvent::Token { token: "lo".into() },
            MessageEvent::Complete {
                conversation_id: Some("conv1".into()),
                metadata: GenerationMetadata::default(),
            },
        ] {
            assert_eq!(coordinator.apply_event(&id, &event), TransitionOutcome::Applied);
        }

        let snapshot = coordinator.snapshot(&id).unwrap();
        assert_eq!(snapshot.state, LifecycleState::Complete);
        assert_eq!(snapshot.token_count, 2);
        assert_eq!(snapshot.conversation_id.unwrap().as_str(), "conv1");
        assert_eq!(
            *log.lock(),
            vec!["thinking", "generating", "token:Hel", "token:lo", "complete:conv1"]
        );

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(!coordinator.contains(&id));
        assert!(!coordinator.has_handler(&id));
    }

    #[tokio::test(start_paused = true)]
    async fn rejects_transitions_outside_the_table() {
        let coordinator = LifecycleCoordinator::new(config());
        let id = MessageId::from("m1");
        coordinator.create(id.clone(), metadata()).unwrap();

        assert!(!coordinator.update_state(&id, LifecycleState::Streaming, TransitionPayload::None));
        assert!(!coordinator.update_state(&id, LifecycleState::Complete, TransitionPayload::None));
        assert_eq!(coordinator.state(&id), Some(LifecycleState::Pending));

        assert!(coordinator.update_state(&id, LifecycleState::Error, TransitionPayload::Error("x".into())));
        assert!(!coordinator.update_state(&id, LifecycleState::Thinking, TransitionPayload::None));
        assert_eq!(
            coordinator.apply_event(&"nope".into(), &MessageEvent::Thinking),
            TransitionOutcome::Unknown
        );
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_and_malformed_ids_are_refused() {
        let coordinator = LifecycleCoordinator::new(config());
        coordinator.create("m1".into(), metadata()).unwrap();
        assert!(matches!(
            coordinator.create("m1".into(), metadata()),
            Err(CoordinatorError::DuplicateMessage(_))
        ));
        assert!(matches!(
            coordinator.create("bad id".into(), metadata()),
            Err(CoordinatorError::MalformedId(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn watchdog_forces_error() {
        let mut cfg = config();
        cfg.watchdog_timeout = Duration::from_secs(120);
        let coordinator = LifecycleCoordinator::new(cfg);
        let id = MessageId::from("m1");
        let (handler, log) = recorder();
        coordinator.create(id.clone(), metadata()).unwrap();
        coordinator.register_handler(id.clone(), handler);
        coordinator.update_state(&id, LifecycleState::Thinking, TransitionPayload::None);

        tokio::time::sleep(Duration::from_secs(121)).await;
        let snapshot = coordinator.snapshot(&id).unwrap();
        assert_eq!(snapshot.state, LifecycleState::Error);
        assert_eq!(
            snapshot.error.as_deref(),
            Some("message timed out after 120s without reaching a terminal state")
        );
        assert_eq!(log.lock().last().unwrap(), &format!("error:{}", snapshot.error.unwrap()));
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_expires_idle_messages() {
        let cfg = LifecycleConfig {
            watchdog_timeout: Duration::from_secs(3600),
            sweep_interval: Duration::from_secs(30),
            stale_threshold: Duration::from_secs(300),
            ..config()
        };
        let coordinator = LifecycleCoordinator::new(cfg);
        let id = MessageId::from("m1");
        coordinator.create(id.clone(), metadata()).unwrap();

        tokio::time::sleep(Duration::from_secs(290)).await;
        assert_eq!(coordinator.state(&id), Some(LifecycleState::Pending));

        tokio::time::sleep(Duration::from_secs(50)).await;
        assert_eq!(coordinator.state(&id), Some(LifecycleState::Error));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_seals_handler_against_late_tokens() {
        let coordinator = LifecycleCoordinator::new(config());
        let id = MessageId::from("m1");
        let (handler, log) = recorder();
        coordinator.create(id.clone(), metadata()).unwrap();
        coordinator.register_handler(id.clone(), handler);

        coordinator.apply_event(&id, &MessageEvent::Thinking);
        assert!(coordinator.cancel(&id));
        assert!(!coordinator.cancel(&id));
        assert_eq!(
            coordinator.apply_event(&id, &MessageEvent::Generating),
            TransitionOutcome::Rejected
        );
        assert_eq!(*log.lock(), vec!["thinking", "cancelled"]);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(!coordinator.contains(&id));
    }

    #[tokio::test(start_paused = true)]
    async fn conversation_created_fills_only_missing_ids() {
        let coordinator = LifecycleCoordinator::new(config());
        let (handler, log) = recorder();
        coordinator.create("a".into(), metadata()).unwrap();
        coordinator.create("b".into(), metadata()).unwrap();
        coordinator.create("done".into(), metadata()).unwrap();
        coordinator.register_handler("a".into(), handler);

        coordinator.update_state(
            &"b".into(),
            LifecycleState::Thinking,
            TransitionPayload::None,
        );
        coordinator.apply_event(
            &"b".into(),
            &MessageEvent::Generating,
        );
        coordinator.apply_event(
            &"b".into(),
            &MessageEvent::Complete {
                conversation_id: Some("existing".into()),
                metadata: GenerationMetadata::default(),
            },
        );
        coordinator.cancel(&"done".into());

        assert_eq!(coordinator.apply_conversation_created(&"conv9".into()), 1);
        assert_eq!(
            coordinator.snapshot(&"a".into()).unwrap().conversation_id,
            Some("conv9".into())
        );
        assert_eq!(
            coordinator.snapshot(&"b".into()).unwrap().conversation_id,
            Some("existing".into())
        );
        assert_eq!(*log.lock(), vec!["conversation:conv9"]);
    }

    #[tokio::test(start_paused = true)]
    async fn capacity_evicts_terminal_entries_first() {
        let cfg = LifecycleConfig {
            max_active_messages: 2,
            ..config()
        };
        let coordinator = LifecycleCoordinator::new(cfg);
        coordinator.create("old".into(), metadata()).unwrap();
        coordinator.create("finished".into(), metadata()).unwrap();
        coordinator.cancel(&"finished".into());

        coordinator.create("new".into(), metadata()).unwrap();
        assert!(coordinator.contains(&"old".into()));
        assert!(!coordinator.contains(&"finished".into()));

        let (handler, log) = recorder();
        coordinator.register_handler("old".into(), handler);
        coordinator.create("newer".into(), metadata()).unwrap();
        assert!(!coordinator.contains(&"old".into()));
        assert_eq!(coordinator.active_count(), 2);
        assert_eq!(
            *log.lock(),
            vec!["error:evicted: registry capacity reached"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn create_with_handler_binds_both_paths() {
        let coordinator = LifecycleCoordinator::new(config());
        let id = MessageId::from("m1");
        let (handler, log) = recorder();
        coordinator
            .create_with_handler(id.clone(), metadata(), handler)
            .unwrap();
        assert!(coordinator.contains(&id));
        assert!(coordinator.has_handler(&id));

        coordinator.apply_event(&id, &MessageEvent::Thinking);
        assert_eq!(*log.lock(), vec!["thinking"]);

        // A refused duplicate leaves the existing binding alone.
        let (other, other_log) = recorder();
        assert!(matches!(
            coordinator.create_with_handler(id.clone(), metadata(), other),
            Err(CoordinatorError::DuplicateMessage(_))
        ));
        coordinator.apply_event(&id, &MessageEvent::Generating);
        assert_eq!(*log.lock(), vec!["thinking", "generating"]);
        assert!(other_log.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn callbacks_may_reenter_the_coordinator() {
        let coordinator = LifecycleCoordinator::new(config());
        let id = MessageId::from("m1");
        coordinator.create(id.clone(), metadata()).unwrap();

        let weak = Arc::downgrade(&coordinator);
        let handler = HandlerSet::new().with_thinking(move |id| {
            if let Some(c) = weak.upgrade() {
                c.cancel(id);
            }
        });
        coordinator.register_handler(id.clone(), Arc::new(handler));

        coordinator.apply_event(&id, &MessageEvent::Thinking);
        assert_eq!(coordinator.state(&id), Some(LifecycleState::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cancels_and_clears() {
        let coordinator = LifecycleCoordinator::new(config());
        let (handler, log) = recorder();
        coordinator.create("m1".into(), metadata()).unwrap();
        coordinator.register_handler("m1".into(), handler);

        coordinator.shutdown();
        assert_eq!(*log.lock(), vec!["cancelled"]);
        assert_eq!(coordinator.active_count(), 0);
        assert_eq!(coordinator.stats().pending_timers, 0);
        assert!(matches!(
            coordinator.create("m2".into(), metadata()),
            Err(CoordinatorError::ShuttingDown)
        ));
        assert!(!coordinator.check_health().is_healthy());
    }
}
