//! Binding of UI callbacks to message ids.
//!
//! The bridge is a second, independent lookup path next to the lifecycle
//! registry: an incoming event can be delivered to its handler even when the
//! registry entry is missing or lagging behind.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokenrelay_protocol::{ConversationId, GenerationMetadata, MessageEvent, MessageId};
use tokio::sync::mpsc;

/// Callbacks for one message's event stream. Every method defaults to a
/// no-op. Callbacks run synchronously on the delivering task and must not
/// block.
pub trait MessageHandler: Send + Sync {
    fn on_thinking(&self, _id: &MessageId) {}

    fn on_generating(&self, _id: &MessageId) {}

    fn on_token(&self, _id: &MessageId, _token: &str) {}

    fn on_complete(
        &self,
        _id: &MessageId,
        _conversation_id: Option<&ConversationId>,
        _metadata: &GenerationMetadata,
    ) {
    }

    fn on_error(&self, _id: &MessageId, _error: &str) {}

    fn on_conversation_created(&self, _id: &MessageId, _conversation_id: &ConversationId) {}

    fn on_cancelled(&self, _id: &MessageId) {}
}

type IdFn = Box<dyn Fn(&MessageId) + Send + Sync>;
type TextFn = Box<dyn Fn(&MessageId, &str) + Send + Sync>;
type CompleteFn = Box<dyn Fn(&MessageId, Option<&ConversationId>, &GenerationMetadata) + Send + Sync>;
type ConversationFn = Box<dyn Fn(&MessageId, &ConversationId) + Send + Sync>;

/// Closure-based [`MessageHandler`].
///
/// ```
/// use tokenrelay_client::HandlerSet;
///
/// let handler = HandlerSet::new()
///     .with_token(|_, token| print!("{}", token))
///     .with_error(|id, error| eprintln!("{} failed: {}", id, error));
/// # drop(handler);
/// ```
#[derive(Default)]
pub struct HandlerSet {
    thinking: Option<IdFn>,
    generating: Option<IdFn>,
    token: Option<TextFn>,
    complete: Option<CompleteFn>,
    error: Option<TextFn>,
    conversation_created: Option<ConversationFn>,
    cancelled: Option<IdFn>,
}

impl HandlerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_thinking(mut self, f: impl Fn(&MessageId) + Send + Sync + 'static) -> Self {
        self.thinking = Some(Box::new(f));
        self
    }

    pub fn with_generating(mut self, f: impl Fn(&MessageId) + Send + Sync + 'static) -> Self {
        self.generating = Some(Box::new(f));
        self
    }

    pub fn with_token(mut self, f: impl Fn(&MessageId, &str) + Send + Sync + 'static) -> Self {
        self.token = Some(Box::new(f));
        self
    }

    pub fn with_complete(
        mut self,
        f: impl Fn(&MessageId, Option<&ConversationId>, &GenerationMetadata) + Send + Sync + 'static,
    ) -> Self {
        self.complete = Some(Box::new(f));
        self
    }

    pub fn with_error(mut self, f: impl Fn(&MessageId, &str) + Send + Sync + 'static) -> Self {
        self.error = Some(Box::new(f));
        self
    }

    pub fn with_conversation_created(
        mut self,
        f: impl Fn(&MessageId, &ConversationId) + Send + Sync + 'static,
    ) -> Self {
        self.conversation_created = Some(Box::new(f));
        self
    }

    pub fn with_cancelled(mut self, f: impl Fn(&MessageId) + Send + Sync + 'static) -> Self {
        self.cancelled = Some(Box::new(f));
        self
    }
}

impl MessageHandler for HandlerSet {
    fn on_thinking(&self, id: &MessageId) {
        if let Some(f) = &self.thinking {
            f(id);
        }
    }

    fn on_generating(&self, id: &MessageId) {
        if let Some(f) = &self.generating {
            f(id);
        }
    }

    fn on_token(&self, id: &MessageId, token: &str) {
        if let Some(f) = &self.token {
            f(id, token);
        }
    }

    fn on_complete(
        &self,
        id: &MessageId,
        conversation_id: Option<&ConversationId>,
        metadata: &GenerationMetadata,
    ) {
        if let Some(f) = &self.complete {
            f(id, conversation_id, metadata);
        }
    }

    fn on_error(&self, id: &MessageId, error: &str) {
        if let Some(f) = &self.error {
            f(id, error);
        }
    }

    fn on_conversation_created(&self, id: &MessageId, conversation_id: &ConversationId) {
        if let Some(f) = &self.conversation_created {
            f(id, conversation_id);
        }
    }

    fn on_cancelled(&self, id: &MessageId) {
        if let Some(f) = &self.cancelled {
            f(id);
        }
    }
}

/// One callback, as seen by an async consumer of [`ChannelHandler`].
#[derive(Debug, Clone, PartialEq)]
pub enum MessageUpdate {
    Thinking,
    Generating,
    Token(String),
    Complete {
        conversation_id: Option<ConversationId>,
        metadata: GenerationMetadata,
    },
    Error(String),
    ConversationCreated(ConversationId),
    Cancelled,
}

impl MessageUpdate {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MessageUpdate::Complete { .. } | MessageUpdate::Error(_) | MessageUpdate::Cancelled
        )
    }
}

/// Forwards every callback into an unbounded channel.
pub struct ChannelHandler {
    tx: mpsc::UnboundedSender<MessageUpdate>,
}

impl ChannelHandler {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MessageUpdate>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn forward(&self, update: MessageUpdate) {
        // Receiver gone means the caller stopped listening.
        let _ = self.tx.send(update);
    }
}

impl MessageHandler for ChannelHandler {
    fn on_thinking(&self, _id: &MessageId) {
        self.forward(MessageUpdate::Thinking);
    }

    fn on_generating(&self, _id: &MessageId) {
        self.forward(MessageUpdate::Generating);
    }

    fn on_token(&self, _id: &MessageId, token: &str) {
        self.forward(MessageUpdate::Token(token.to_string()));
    }

    fn on_complete(
        &self,
        _id: &MessageId,
        conversation_id: Option<&ConversationId>,
        metadata: &GenerationMetadata,
    ) {
        self.forward(MessageUpdate::Complete {
            conversation_id: conversation_id.cloned(),
            metadata: metadata.clone(),
        });
    }

    fn on_error(&self, _id: &MessageId, error: &str) {
        self.forward(MessageUpdate::Error(error.to_string()));
    }

    fn on_conversation_created(&self, _id: &MessageId, conversation_id: &ConversationId) {
        self.forward(MessageUpdate::ConversationCreated(conversation_id.clone()));
    }

    fn on_cancelled(&self, _id: &MessageId) {
        self.forward(MessageUpdate::Cancelled);
    }
}

/// Outcome of routing one notification through the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// No handler is bound to the id.
    Unbound,
    /// The matching callback ran.
    Delivered,
    /// A terminal callback already ran; nothing was invoked.
    Sealed,
}

/// What to tell a handler.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Notification<'a> {
    Event(&'a MessageEvent),
    Cancelled,
}

impl Notification<'_> {
    fn is_terminal(&self) -> bool {
        match self {
            Notification::Event(event) => event.is_terminal(),
            Notification::Cancelled => true,
        }
    }
}

struct BridgeEntry {
    handler: Arc<dyn MessageHandler>,
    sealed: AtomicBool,
}

/// Handler map keyed by [`MessageId`].
///
/// Entries are never mutated by the delivery path beyond sealing. Callbacks
/// are invoked after the map shard lock is released.
#[derive(Default)]
pub struct HandlerBridge {
    entries: DashMap<MessageId, Arc<BridgeEntry>>,
}

impl HandlerBridge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `handler` to `id`, replacing any previous binding.
    pub fn register(&self, id: MessageId, handler: Arc<dyn MessageHandler>) {
        let entry = Arc::new(BridgeEntry {
            handler,
            sealed: AtomicBool::new(false),
        });
        if self.entries.insert(id.clone(), entry).is_some() {
            tracing::debug!(message_id = %id, "replaced existing handler binding");
        }
    }

    pub fn get(&self, id: &MessageId) -> Option<Arc<dyn MessageHandler>> {
        self.entries.get(id).map(|entry| entry.handler.clone())
    }

    pub fn unregister(&self, id: &MessageId) -> bool {
        self.entries.remove(id).is_some()
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn is_sealed(&self, id: &MessageId) -> bool {
        self.entries
            .get(id)
            .map(|entry| entry.sealed.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Route a lifecycle event to its handler.
    pub fn dispatch(&self, id: &MessageId, event: &MessageEvent) -> Dispatch {
        self.notify(id, Notification::Event(event))
    }

    pub(crate) fn notify(&self, id: &MessageId, notification: Notification<'_>) -> Dispatch {
        let Some(entry) = self.entries.get(id).map(|e| e.value().clone()) else {
            return Dispatch::Unbound;
        };

        if notification.is_terminal() {
            if entry.sealed.swap(true, Ordering::AcqRel) {
                return Dispatch::Sealed;
            }
        } else if entry.sealed.load(Ordering::Acquire) {
            return Dispatch::Sealed;
        }

        let handler = entry.handler.as_ref();
        match notification {
            Notification::Event(MessageEvent::Thinking) => handler.on_thinking(id),
            Notification::Event(MessageEvent::Generating) => handler.on_generating(id),
            Notification::Event(MessageEvent::Token { token }) => handler.on_token(id, token),
            Notification::Event(MessageEvent::Complete {
                conversation_id,
                metadata,
            }) => handler.on_complete(id, conversation_id.as_ref(), metadata),
            Notification::Event(MessageEvent::Error { error }) => handler.on_error(id, error),
            Notification::Cancelled => handler.on_cancelled(id),
        }
        Dispatch::Delivered
    }

    /// Tell the handler its message was attached to a new conversation.
    pub fn notify_conversation_created(
        &self,
        id: &MessageId,
        conversation_id: &ConversationId,
    ) -> Dispatch {
        let Some(entry) = self.entries.get(id).map(|e| e.value().clone()) else {
            return Dispatch::Unbound;
        };
        if entry.sealed.load(Ordering::Acquire) {
            return Dispatch::Sealed;
        }
        entry.handler.on_conversation_created(id, conversation_id);
        Dispatch::Delivered
    }
}
