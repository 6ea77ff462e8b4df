//! Persistence of finalized messages.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokenrelay_protocol::{ConversationId, GenerationMetadata, MessageId};

use crate::error::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    /// Client-supplied id of the request this message belongs to.
    pub message_id: MessageId,
    pub conversation_id: ConversationId,
    pub role: Role,
    pub content: String,
    pub model: Option<String>,
    pub metadata: Option<GenerationMetadata>,
    pub created_at: DateTime<Utc>,
}

impl StoredMessage {
    pub fn user(
        message_id: MessageId,
        conversation_id: ConversationId,
        content: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            message_id,
            conversation_id,
            role: Role::User,
            content: content.into(),
            model: Some(model.into()),
            metadata: None,
            created_at: Utc::now(),
        }
    }

    pub fn assistant(
        message_id: MessageId,
        conversation_id: ConversationId,
        content: impl Into<String>,
        metadata: GenerationMetadata,
    ) -> Self {
        Self {
            message_id,
            conversation_id,
            role: Role::Assistant,
            content: content.into(),
            model: metadata.model.clone(),
            metadata: Some(metadata),
            created_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn create_conversation(&self) -> Result<ConversationId, StoreError>;

    /// Append a message. Conversations named by a client but unknown to this
    /// store are created on first save.
    async fn save(&self, message: StoredMessage) -> Result<(), StoreError>;

    /// Messages of a conversation in save order.
    async fn messages(&self, conversation: &ConversationId)
        -> Result<Vec<StoredMessage>, StoreError>;
}

/// Process-local store; contents are lost on restart.
#[derive(Debug, Default)]
pub struct InMemoryMessageStore {
    conversations: DashMap<ConversationId, Vec<StoredMessage>>,
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn conversation_count(&self) -> usize {
        self.conversations.len()
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn create_conversation(&self) -> Result<ConversationId, StoreError> {
        let id = ConversationId::generate();
        self.conversations.insert(id.clone(), Vec::new());
        tracing::debug!(conversation_id = %id, "conversation created");
        Ok(id)
    }

    async fn save(&self, message: StoredMessage) -> Result<(), StoreError> {
        self.conversations
            .entry(message.conversation_id.clone())
            .or_default()
            .push(message);
        Ok(())
    }

    async fn messages(
        &self,
        conversation: &ConversationId,
    ) -> Result<Vec<StoredMessage>, StoreError> {
        self.conversations
            .get(conversation)
            .map(|messages| messages.clone())
            .ok_or_else(|| StoreError::ConversationNotFound(conversation.clone()))
    }
}
