//! Delivery reconciliation for events that race their registration.
//!
//! An incoming event is resolved against the lifecycle registry first and the
//! handler bridge second. Events for ids neither path knows yet are
//! queued per id and retried with exponential backoff until the id shows up,
//! the retry budget runs out, or the event ages out.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use tokenrelay_protocol::{MessageEvent, MessageId};
use tokio::time::Instant;

use crate::bridge::Dispatch;
use crate::config::ReconcilerConfig;
use crate::lifecycle::{LifecycleCoordinator, TransitionOutcome};
use crate::timers::{TimerKind, TimerWheel};

/// An event waiting for its message to become known.
#[derive(Debug, Clone)]
pub struct QueuedEvent {
    pub event: MessageEvent,
    pub received_at: Instant,
    pub retry_count: u32,
}

/// How one event was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Handed to the bound handler (or absorbed by a sealed one).
    Handler,
    /// Applied to, or rejected by, the registry entry.
    Registry,
    /// Neither lookup path knows the id.
    Queued,
}

pub struct EventReconciler {
    config: ReconcilerConfig,
    coordinator: Arc<LifecycleCoordinator>,
    queues: DashMap<MessageId, VecDeque<QueuedEvent>>,
    timers: TimerWheel,
    self_ref: Weak<EventReconciler>,
}

impl EventReconciler {
    pub fn new(config: ReconcilerConfig, coordinator: Arc<LifecycleCoordinator>) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            config,
            coordinator,
            queues: DashMap::new(),
            timers: TimerWheel::new(),
            self_ref: self_ref.clone(),
        })
    }

    pub fn coordinator(&self) -> &Arc<LifecycleCoordinator> {
        &self.coordinator
    }

    /// Entry point for every lifecycle event received from the server.
    pub fn deliver(&self, id: MessageId, event: MessageEvent) -> Resolution {
        // Keep per-id order: once something is queued, later events wait
        // behind it.
        if self.queues.contains_key(&id) {
            self.enqueue(&id, event);
            if self.coordinator.is_known(&id) {
                self.flush(&id);
            }
            return Resolution::Queued;
        }

        match self.resolve(&id, event) {
            Ok(resolution) => resolution,
            Err(event) => {
                tracing::debug!(message_id = %id, kind = %event.kind(), "event for unknown message queued");
                self.enqueue(&id, event);
                self.ensure_retry(&id);
                // Registration may have landed between the lookup and the
                // enqueue.
                if self.coordinator.is_known(&id) {
                    self.flush(&id);
                }
                Resolution::Queued
            }
        }
    }

    /// Steps 1 and 2 of delivery. Hands the event back when the id is unknown.
    ///
    /// A registry entry, when present, validates the transition before any
    /// callback runs. The bridge alone is used only for ids the registry does
    /// not hold.
    fn resolve(&self, id: &MessageId, event: MessageEvent) -> Result<Resolution, MessageEvent> {
        match self.coordinator.apply_event(id, &event) {
            TransitionOutcome::Applied | TransitionOutcome::Rejected => {
                if self.coordinator.has_handler(id) {
                    Ok(Resolution::Handler)
                } else {
                    Ok(Resolution::Registry)
                }
            }
            // Registration landed after the registry lookup.
            TransitionOutcome::Unknown if self.coordinator.contains(id) => self.resolve(id, event),
            TransitionOutcome::Unknown => match self.coordinator.dispatch_to_handler(id, &event) {
                Dispatch::Delivered | Dispatch::Sealed => {
                    self.coordinator.record_unregistered(id, &event);
                    Ok(Resolution::Handler)
                }
                Dispatch::Unbound => Err(event),
            },
        }
    }

    fn enqueue(&self, id: &MessageId, event: MessageEvent) {
        let mut queue = self.queues.entry(id.clone()).or_default();
        if queue.len() >= self.config.max_queue_per_message {
            if let Some(dropped) = queue.pop_front() {
                tracing::warn!(
                    message_id = %id,
                    kind = %dropped.event.kind(),
                    "early-event queue full; dropped oldest event"
                );
            }
        }
        queue.push_back(QueuedEvent {
            event,
            received_at: Instant::now(),
            retry_count: 0,
        });
    }

    /// Replay the queue for one id immediately, without consuming a retry.
    /// Called when a message is registered.
    pub fn flush(&self, id: &MessageId) {
        self.replay(id, false);
    }

    /// Replay every queued event of every id, in original per-id order. Ids
    /// still unknown stay queued without consuming a retry.
    pub fn replay_all(&self) {
        let ids: Vec<MessageId> = self.queues.iter().map(|q| q.key().clone()).collect();
        if !ids.is_empty() {
            tracing::debug!(ids = ids.len(), "replaying queued events");
        }
        for id in ids {
            self.replay(&id, false);
        }
    }

    fn replay(&self, id: &MessageId, consume_retry: bool) {
        let Some((_, mut queue)) = self.queues.remove(id) else {
            return;
        };

        let max_age = self.config.max_event_age;
        let mut requeue: VecDeque<QueuedEvent> = VecDeque::new();
        let mut finished = false;

        while let Some(mut queued) = queue.pop_front() {
            if queued.received_at.elapsed() > max_age {
                tracing::warn!(
                    message_id = %id,
                    kind = %queued.event.kind(),
                    "queued event expired"
                );
                continue;
            }

            if !requeue.is_empty() {
                requeue.push_back(queued);
                continue;
            }

            let terminal = queued.event.is_terminal();
            match self.resolve(id, queued.event) {
                Ok(_) => {
                    if terminal {
                        finished = true;
                        break;
                    }
                }
                Err(event) => {
                    queued.event = event;
                    requeue.push_back(queued);
                }
            }
        }

        if finished {
            // A terminal event closes the stream for this id.
            self.queues.remove(id);
            self.timers.cancel(id, TimerKind::Retry);
            return;
        }

        if consume_retry {
            let max_attempts = self.config.max_retry_attempts;
            requeue.retain_mut(|queued| {
                queued.retry_count += 1;
                if queued.retry_count >= max_attempts {
                    tracing::warn!(
                        message_id = %id,
                        kind = %queued.event.kind(),
                        attempts = queued.retry_count,
                        "dropping stale event for unknown message"
                    );
                    false
                } else {
                    true
                }
            });
        }

        if requeue.is_empty() {
            if !self.queues.contains_key(id) {
                self.timers.cancel(id, TimerKind::Retry);
            }
            return;
        }

        // Events that arrived while this replay ran go behind the older ones.
        {
            let mut queue = self.queues.entry(id.clone()).or_default();
            while let Some(queued) = requeue.pop_back() {
                queue.push_front(queued);
            }
        }

        if consume_retry || !self.timers.is_scheduled(id, TimerKind::Retry) {
            self.schedule_retry(id);
        }
    }

    fn ensure_retry(&self, id: &MessageId) {
        if !self.timers.is_scheduled(id, TimerKind::Retry) {
            self.schedule_retry(id);
        }
    }

    fn schedule_retry(&self, id: &MessageId) {
        let attempt = self
            .queues
            .get(id)
            .and_then(|queue| queue.front().map(|q| q.retry_count))
            .unwrap_or(0);
        let delay = self.config.retry_delay(attempt);
        let weak = self.self_ref.clone();
        let timer_id = id.clone();

        self.timers
            .schedule(id, TimerKind::Retry, delay, move || async move {
                if let Some(reconciler) = weak.upgrade() {
                    reconciler.replay(&timer_id, true);
                }
            });
    }

    /// Number of events currently queued across all ids.
    pub fn queued_len(&self) -> usize {
        self.queues.iter().map(|queue| queue.len()).sum()
    }

    pub fn queued_ids(&self) -> Vec<MessageId> {
        self.queues.iter().map(|queue| queue.key().clone()).collect()
    }

    pub fn queued_for(&self, id: &MessageId) -> Vec<QueuedEvent> {
        self.queues
            .get(id)
            .map(|queue| queue.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Drop every queued event and pending retry.
    pub fn shutdown(&self) {
        self.timers.shutdown();
        self.queues.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::HandlerSet;
    use crate::config::LifecycleConfig;
    use crate::lifecycle::MessageMetadata;
    use parking_lot::Mutex;
    use std::time::Duration;
    use tokenrelay_protocol::{GenerationMetadata, LifecycleState};

    fn setup() -> (Arc<LifecycleCoordinator>, Arc<EventReconciler>) {
        let coordinator = LifecycleCoordinator::new(LifecycleConfig::default());
        let reconciler = EventReconciler::new(ReconcilerConfig::default(), coordinator.clone());
        (coordinator, reconciler)
    }

    fn token(t: &str) -> MessageEvent {
        MessageEvent::Token { token: t.into() }
    }

    fn tokens_handler() -> (Arc<HandlerSet>, Arc<Mutex<Vec<String>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (a, b, c) = (log.clone(), log.clone(), log.clone());
        let handler = HandlerSet::new()
            .with_thinking(move |_| a.lock().push("thinking".to_string()))
            .with_token(move |_, t| b.lock().push(t.to_string()))
            .with_complete(move |_, _, _| c.lock().push("complete".to_string()));
        (Arc::new(handler), log)
    }

    #[tokio::test(start_paused = true)]
    async fn known_ids_resolve_without_queueing() {
        let (coordinator, reconciler) = setup();
        let id = MessageId::from("m1");
        coordinator.create(id.clone(), MessageMetadata::default()).unwrap();

        assert_eq!(reconciler.deliver(id.clone(), MessageEvent::Thinking), Resolution::Registry);
        assert_eq!(coordinator.state(&id), Some(LifecycleState::Thinking));

        let (handler, log) = tokens_handler();
        coordinator.register_handler(id.clone(), handler);
        assert_eq!(reconciler.deliver(id.clone(), MessageEvent::Generating), Resolution::Handler);
        assert_eq!(coordinator.state(&id), Some(LifecycleState::Generating));
        assert!(log.lock().is_empty());
        assert_eq!(reconciler.queued_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn handler_path_delivers_once_and_records_silently() {
        let (coordinator, reconciler) = setup();
        let id = MessageId::from("m1");
        let (handler, log) = tokens_handler();
        coordinator.create(id.clone(), MessageMetadata::default()).unwrap();
        coordinator.register_handler(id.clone(), handler);

        reconciler.deliver(id.clone(), MessageEvent::Thinking);
        reconciler.deliver(id.clone(), MessageEvent::Generating);
        reconciler.deliver(id.clone(), token("a"));
        let complete = MessageEvent::Complete {
            conversation_id: None,
            metadata: GenerationMetadata::default(),
        };
        reconciler.deliver(id.clone(), complete.clone());
        reconciler.deliver(id.clone(), complete);
        reconciler.deliver(id.clone(), MessageEvent::Error { error: "dup".into() });

        assert_eq!(*log.lock(), vec!["thinking", "a", "complete"]);
        let snapshot = coordinator.snapshot(&id).unwrap();
        assert_eq!(snapshot.state, LifecycleState::Complete);
        assert_eq!(snapshot.token_count, 1);
    }

    fn bound_message() -> (
        Arc<LifecycleCoordinator>,
        Arc<EventReconciler>,
        MessageId,
        Arc<Mutex<Vec<String>>>,
    ) {
        let (coordinator, reconciler) = setup();
        let id = MessageId::from("m1");
        let (handler, log) = tokens_handler();
        coordinator
            .create_with_handler(id.clone(), MessageMetadata::default(), handler)
            .unwrap();
        (coordinator, reconciler, id, log)
    }

    #[tokio::test(start_paused = true)]
    async fn token_while_pending_never_reaches_the_handler() {
        let (coordinator, reconciler, id, log) = bound_message();

        assert_eq!(reconciler.deliver(id.clone(), token("early")), Resolution::Handler);
        assert!(log.lock().is_empty());
        let snapshot = coordinator.snapshot(&id).unwrap();
        assert_eq!(snapshot.state, LifecycleState::Pending);
        assert_eq!(snapshot.token_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_thinking_after_streaming_is_suppressed() {
        let (coordinator, reconciler, id, log) = bound_message();

        reconciler.deliver(id.clone(), token("early"));
        reconciler.deliver(id.clone(), MessageEvent::Thinking);
        reconciler.deliver(id.clone(), MessageEvent::Generating);
        reconciler.deliver(id.clone(), token("a"));
        reconciler.deliver(id.clone(), MessageEvent::Thinking);

        assert_eq!(*log.lock(), vec!["thinking", "a"]);
        let snapshot = coordinator.snapshot(&id).unwrap();
        assert_eq!(snapshot.state, LifecycleState::Streaming);
        assert_eq!(snapshot.token_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn complete_straight_from_thinking_is_withheld() {
        let (coordinator, reconciler, id, log) = bound_message();
        let complete = MessageEvent::Complete {
            conversation_id: None,
            metadata: GenerationMetadata::default(),
        };

        reconciler.deliver(id.clone(), MessageEvent::Thinking);
        reconciler.deliver(id.clone(), complete.clone());
        assert_eq!(*log.lock(), vec!["thinking"]);
        assert_eq!(coordinator.state(&id), Some(LifecycleState::Thinking));

        // The rejected terminal did not seal the handler.
        reconciler.deliver(id.clone(), MessageEvent::Generating);
        reconciler.deliver(id.clone(), complete);
        assert_eq!(*log.lock(), vec!["thinking", "complete"]);
        assert_eq!(coordinator.state(&id), Some(LifecycleState::Complete));
    }

    #[tokio::test(start_paused = true)]
    async fn handler_without_registry_entry_still_receives_events() {
        let (coordinator, reconciler) = setup();
        let id = MessageId::from("m1");
        let (handler, log) = tokens_handler();
        coordinator.register_handler(id.clone(), handler);

        assert_eq!(reconciler.deliver(id.clone(), token("a")), Resolution::Handler);
        let complete = MessageEvent::Complete {
            conversation_id: None,
            metadata: GenerationMetadata::default(),
        };
        assert_eq!(reconciler.deliver(id.clone(), complete), Resolution::Handler);
        assert_eq!(*log.lock(), vec!["a", "complete"]);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(!coordinator.has_handler(&id));
    }

    #[tokio::test(start_paused = true)]
    async fn early_events_flush_on_registration_in_order() {
        let (coordinator, reconciler) = setup();
        let id = MessageId::from("m1");

        reconciler.deliver(id.clone(), MessageEvent::Thinking);
        reconciler.deliver(id.clone(), MessageEvent::Generating);
        reconciler.deliver(id.clone(), token("Hel"));
        assert_eq!(reconciler.queued_for(&id).len(), 3);

        let (handler, log) = tokens_handler();
        coordinator.create(id.clone(), MessageMetadata::default()).unwrap();
        coordinator.register_handler(id.clone(), handler);
        reconciler.flush(&id);

        assert_eq!(reconciler.queued_len(), 0);
        assert_eq!(*log.lock(), vec!["thinking", "Hel"]);
        assert_eq!(coordinator.state(&id), Some(LifecycleState::Streaming));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_picks_up_late_registration() {
        let (coordinator, reconciler) = setup();
        let id = MessageId::from("m1");
        reconciler.deliver(id.clone(), MessageEvent::Thinking);

        tokio::time::sleep(Duration::from_millis(2500)).await;
        coordinator.create(id.clone(), MessageMetadata::default()).unwrap();
        assert_eq!(coordinator.state(&id), Some(LifecycleState::Pending));

        // Next retry fires at 1s + 2s.
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(coordinator.state(&id), Some(LifecycleState::Thinking));
        assert_eq!(reconciler.queued_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_ids_are_dropped_after_retry_budget() {
        let (_coordinator, reconciler) = setup();
        let id = MessageId::from("m_unknown");
        reconciler.deliver(id.clone(), token("x"));

        // Retries at 1, 3, 7 and 15 seconds keep it queued.
        tokio::time::sleep(Duration::from_secs(16)).await;
        let queued = reconciler.queued_for(&id);
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].retry_count, 4);

        // Fifth retry at 31 seconds exhausts it.
        tokio::time::sleep(Duration::from_secs(16)).await;
        assert_eq!(reconciler.queued_len(), 0);
        assert!(reconciler.queued_ids().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn replay_all_does_not_consume_retries() {
        let (coordinator, reconciler) = setup();
        reconciler.deliver("a".into(), MessageEvent::Thinking);
        reconciler.deliver("b".into(), MessageEvent::Thinking);

        coordinator.create("a".into(), MessageMetadata::default()).unwrap();
        reconciler.replay_all();

        assert_eq!(coordinator.state(&"a".into()), Some(LifecycleState::Thinking));
        let pending = reconciler.queued_for(&"b".into());
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].retry_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn queue_is_capped_per_message() {
        let coordinator = LifecycleCoordinator::new(LifecycleConfig::default());
        let config = ReconcilerConfig {
            max_queue_per_message: 3,
            ..ReconcilerConfig::default()
        };
        let reconciler = EventReconciler::new(config, coordinator);
        let id = MessageId::from("m1");
        for t in ["1", "2", "3", "4", "5"] {
            reconciler.deliver(id.clone(), token(t));
        }

        let kept: Vec<String> = reconciler
            .queued_for(&id)
            .into_iter()
            .map(|q| match q.event {
                MessageEvent::Token { token } => token,
                other => panic!("unexpected {:?}", other),
            })
            .collect();
        assert_eq!(kept, vec!["3", "4", "5"]);
    }

    #[tokio::test(start_paused = true)]
    async fn aged_events_are_purged() {
        let coordinator = LifecycleCoordinator::new(LifecycleConfig::default());
        let config = ReconcilerConfig {
            max_event_age: Duration::from_secs(2),
            ..ReconcilerConfig::default()
        };
        let reconciler = EventReconciler::new(config, coordinator.clone());
        let id = MessageId::from("m1");
        reconciler.deliver(id.clone(), MessageEvent::Thinking);

        tokio::time::sleep(Duration::from_millis(2500)).await;
        coordinator.create(id.clone(), MessageMetadata::default()).unwrap();
        reconciler.flush(&id);

        assert_eq!(reconciler.queued_len(), 0);
        assert_eq!(coordinator.state(&id), Some(LifecycleState::Pending));
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_event_clears_the_queue() {
        let (coordinator, reconciler) = setup();
        let id = MessageId::from("m1");
        reconciler.deliver(id.clone(), MessageEvent::Error { error: "boom".into() });
        reconciler.deliver(id.clone(), token("late"));

        coordinator.create(id.clone(), MessageMetadata::default()).unwrap();
        reconciler.flush(&id);

        assert_eq!(reconciler.queued_len(), 0);
        let snapshot = coordinator.snapshot(&id).unwrap();
        assert_eq!(snapshot.state, LifecycleState::Error);
        assert_eq!(snapshot.token_count, 0);
    }
}
