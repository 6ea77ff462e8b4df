//! Client→server and server→client event frames.
//!
//! Every frame is `{"event": "<name>", "data": {...}}`. Message-scoped
//! payloads carry the client-supplied `messageId`; `conversation:created`
//! and the heartbeat frames are not message-scoped.

use serde::{Deserialize, Serialize};

use crate::id::{ConversationId, MessageId};
use crate::state::LifecycleState;

/// Frames sent by the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientEvent {
    #[serde(rename = "chat:message")]
    ChatMessage(ChatMessagePayload),
    #[serde(rename = "chat:cancel")]
    ChatCancel(CancelPayload),
    #[serde(rename = "ping")]
    Ping,
    #[serde(rename = "pong")]
    Pong,
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::ChatMessage(_) => "chat:message",
            ClientEvent::ChatCancel(_) => "chat:cancel",
            ClientEvent::Ping => "ping",
            ClientEvent::Pong => "pong",
        }
    }

    /// The message this frame is about, if it is message-scoped.
    pub fn message_id(&self) -> Option<&MessageId> {
        match self {
            ClientEvent::ChatMessage(p) => Some(&p.message_id),
            ClientEvent::ChatCancel(p) => Some(&p.message_id),
            ClientEvent::Ping | ClientEvent::Pong => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessagePayload {
    pub message_id: MessageId,
    pub content: String,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vision_model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<ConversationId>,
    /// Attached images as data URLs or opaque references.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelPayload {
    pub message_id: MessageId,
}

/// Frames sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    #[serde(rename = "chat:ack")]
    Ack(AckPayload),
    #[serde(rename = "chat:thinking")]
    Thinking(MessageRef),
    #[serde(rename = "chat:generating")]
    Generating(MessageRef),
    #[serde(rename = "chat:token")]
    Token(TokenPayload),
    #[serde(rename = "chat:complete")]
    Complete(CompletePayload),
    #[serde(rename = "chat:error")]
    Error(ErrorPayload),
    #[serde(rename = "conversation:created")]
    ConversationCreated(ConversationCreatedPayload),
    #[serde(rename = "ping")]
    Ping,
    #[serde(rename = "pong")]
    Pong,
}

impl ServerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::Ack(_) => "chat:ack",
            ServerEvent::Thinking(_) => "chat:thinking",
            ServerEvent::Generating(_) => "chat:generating",
            ServerEvent::Token(_) => "chat:token",
            ServerEvent::Complete(_) => "chat:complete",
            ServerEvent::Error(_) => "chat:error",
            ServerEvent::ConversationCreated(_) => "conversation:created",
            ServerEvent::Ping => "ping",
            ServerEvent::Pong => "pong",
        }
    }

    /// Build the wire frame for a lifecycle event of `message_id`.
    pub fn from_message_event(message_id: MessageId, event: MessageEvent) -> Self {
        match event {
            MessageEvent::Thinking => ServerEvent::Thinking(MessageRef { message_id }),
            MessageEvent::Generating => ServerEvent::Generating(MessageRef { message_id }),
            MessageEvent::Token { token } => ServerEvent::Token(TokenPayload { message_id, token }),
            MessageEvent::Complete {
                conversation_id,
                metadata,
            } => ServerEvent::Complete(CompletePayload {
                message_id,
                conversation_id,
                metadata,
            }),
            MessageEvent::Error { error } => ServerEvent::Error(ErrorPayload { message_id, error }),
        }
    }

    /// Split a lifecycle frame into its id and typed event. Returns `Err(self)`
    /// for frames that are not message lifecycle events.
    pub fn into_message_event(self) -> Result<(MessageId, MessageEvent), ServerEvent> {
        match self {
            ServerEvent::Thinking(p) => Ok((p.message_id, MessageEvent::Thinking)),
            ServerEvent::Generating(p) => Ok((p.message_id, MessageEvent::Generating)),
            ServerEvent::Token(p) => Ok((p.message_id, MessageEvent::Token { token: p.token })),
            ServerEvent::Complete(p) => Ok((
                p.message_id,
                MessageEvent::Complete {
                    conversation_id: p.conversation_id,
                    metadata: p.metadata,
                },
            )),
            ServerEvent::Error(p) => Ok((p.message_id, MessageEvent::Error { error: p.error })),
            other => Err(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AckPayload {
    pub message_id: MessageId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRef {
    pub message_id: MessageId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenPayload {
    pub message_id: MessageId,
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletePayload {
    pub message_id: MessageId,
    #[serde(default)]
    pub conversation_id: Option<ConversationId>,
    #[serde(default)]
    pub metadata: GenerationMetadata,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub message_id: MessageId,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationCreatedPayload {
    pub conversation_id: ConversationId,
}

/// Final generation details attached to `chat:complete`.
///
/// Unknown keys are preserved in `extra` so newer servers can add fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vision_model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// A lifecycle event for one message, stripped of its id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageEvent {
    Thinking,
    Generating,
    Token {
        token: String,
    },
    Complete {
        conversation_id: Option<ConversationId>,
        metadata: GenerationMetadata,
    },
    Error {
        error: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageEventKind {
    Thinking,
    Generating,
    Token,
    Complete,
    Error,
}

impl MessageEvent {
    pub fn kind(&self) -> MessageEventKind {
        match self {
            MessageEvent::Thinking => MessageEventKind::Thinking,
            MessageEvent::Generating => MessageEventKind::Generating,
            MessageEvent::Token { .. } => MessageEventKind::Token,
            MessageEvent::Complete { .. } => MessageEventKind::Complete,
            MessageEvent::Error { .. } => MessageEventKind::Error,
        }
    }

    /// State the lifecycle moves to when this event is accepted.
    pub fn target_state(&self) -> LifecycleState {
        match self {
            MessageEvent::Thinking => LifecycleState::Thinking,
            MessageEvent::Generating => LifecycleState::Generating,
            MessageEvent::Token { .. } => LifecycleState::Streaming,
            MessageEvent::Complete { .. } => LifecycleState::Complete,
            MessageEvent::Error { .. } => LifecycleState::Error,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.target_state().is_terminal()
    }
}

impl std::fmt::Display for MessageEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            MessageEventKind::Thinking => "thinking",
            MessageEventKind::Generating => "generating",
            MessageEventKind::Token => "token",
            MessageEventKind::Complete => "complete",
            MessageEventKind::Error => "error",
        };
        f.write_str(name)
    }
}
