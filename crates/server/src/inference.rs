//! Model inference backends.
//!
//! A provider turns one [`GenerationRequest`] into a [`TokenStream`]. The
//! stream yields [`GenerationChunk::Token`]s and ends with at most one
//! [`GenerationChunk::Done`] carrying the final metadata.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::{stream, Stream, StreamExt};
use tokenrelay_protocol::{ConversationId, GenerationMetadata, MessageId};

use crate::error::InferenceError;
use crate::store::StoredMessage;

#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub message_id: MessageId,
    pub conversation_id: ConversationId,
    pub model: String,
    /// Auxiliary model for attached images.
    pub vision_model: Option<String>,
    pub prompt: String,
    pub images: Vec<String>,
    /// Earlier messages of the conversation, oldest first.
    pub history: Vec<StoredMessage>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum GenerationChunk {
    Token(String),
    Done(GenerationMetadata),
}

pub type TokenStream = Pin<Box<dyn Stream<Item = Result<GenerationChunk, InferenceError>> + Send>>;

#[async_trait]
pub trait InferenceProvider: Send + Sync {
    /// Open a token stream. Errors returned here mean the stream never
    /// opened; errors inside the stream end generation.
    async fn generate(&self, request: GenerationRequest) -> Result<TokenStream, InferenceError>;

    fn provider_name(&self) -> &str;
}

/// Deterministic provider that streams the prompt back word by word.
#[derive(Debug, Clone, Default)]
pub struct EchoProvider {
    token_delay: Duration,
}

impl EchoProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pause before every token, to make streams observable in demos and
    /// cancellable in tests.
    pub fn with_token_delay(token_delay: Duration) -> Self {
        Self { token_delay }
    }

    fn tokenize(prompt: &str) -> Vec<String> {
        prompt.split_inclusive(' ').map(str::to_string).collect()
    }
}

#[async_trait]
impl InferenceProvider for EchoProvider {
    async fn generate(&self, request: GenerationRequest) -> Result<TokenStream, InferenceError> {
        if request.model.trim().is_empty() {
            return Err(InferenceError::InvalidRequest("model is required".to_string()));
        }

        let started = tokio::time::Instant::now();
        let tokens = Self::tokenize(&request.prompt);
        let token_count = tokens.len() as u64;
        let delay = self.token_delay;

        let mut metadata = GenerationMetadata {
            model: Some(request.model.clone()),
            token_count: Some(token_count),
            finish_reason: Some("stop".to_string()),
            ..GenerationMetadata::default()
        };
        if !request.images.is_empty() {
            metadata.vision_model = request.vision_model.clone();
            metadata
                .extra
                .insert("images".to_string(), serde_json::json!(request.images.len()));
        }

        let body = stream::iter(tokens).then(move |token| async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            Ok(GenerationChunk::Token(token))
        });
        let done = stream::once(async move {
            metadata.duration_ms = Some(started.elapsed().as_millis() as u64);
            Ok(GenerationChunk::Done(metadata))
        });

        Ok(Box::pin(body.chain(done)))
    }

    fn provider_name(&self) -> &str {
        "echo"
    }
}
