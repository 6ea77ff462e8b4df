//! Per-message timers with replace-on-reschedule semantics.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokenrelay_protocol::MessageId;
use tokio::task::AbortHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Forces a message into `error` if it never reaches a terminal state.
    Watchdog,
    /// Removes a terminal message after the grace period.
    Cleanup,
    /// Re-runs queued early events.
    Retry,
}

type TimerKey = (MessageId, TimerKind);

struct Slot {
    generation: u64,
    handle: AbortHandle,
}

/// At most one pending timer per `(MessageId, TimerKind)`.
///
/// Scheduling a kind that is already pending aborts the previous timer. A
/// timer removes its own slot just before its task runs, so the task may
/// freely reschedule or cancel timers for the same id.
pub struct TimerWheel {
    slots: Arc<DashMap<TimerKey, Slot>>,
    next_generation: AtomicU64,
    closed: AtomicBool,
}

impl Default for TimerWheel {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerWheel {
    pub fn new() -> Self {
        Self {
            slots: Arc::new(DashMap::new()),
            next_generation: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Run `task` after `delay`. Returns `false` once the wheel is shut down.
    pub fn schedule<F, Fut>(&self, id: &MessageId, kind: TimerKind, delay: Duration, task: F) -> bool
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let key: TimerKey = (id.clone(), kind);
        let slots = Arc::downgrade(&self.slots);
        let task_key = key.clone();

        let join = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(slots) = slots.upgrade() {
                slots.remove_if(&task_key, |_, slot| slot.generation == generation);
            }
            task().await;
        });

        let slot = Slot {
            generation,
            handle: join.abort_handle(),
        };
        if let Some(previous) = self.slots.insert(key.clone(), slot) {
            previous.handle.abort();
        }
        if join.is_finished() {
            self.slots
                .remove_if(&key, |_, slot| slot.generation == generation);
        }
        true
    }

    pub fn cancel(&self, id: &MessageId, kind: TimerKind) -> bool {
        match self.slots.remove(&(id.clone(), kind)) {
            Some((_, slot)) => {
                slot.handle.abort();
                true
            }
            None => false,
        }
    }

    /// Cancel every timer belonging to `id`.
    pub fn cancel_all(&self, id: &MessageId) -> usize {
        [TimerKind::Watchdog, TimerKind::Cleanup, TimerKind::Retry]
            .into_iter()
            .filter(|kind| self.cancel(id, *kind))
            .count()
    }

    pub fn is_scheduled(&self, id: &MessageId, kind: TimerKind) -> bool {
        self.slots.contains_key(&(id.clone(), kind))
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Abort every pending timer and refuse new ones.
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        self.slots.retain(|_, slot| {
            slot.handle.abort();
            false
        });
    }
}

impl Drop for TimerWheel {
    fn drop(&mut self) {
        for slot in self.slots.iter() {
            slot.handle.abort();
        }
    }
}
