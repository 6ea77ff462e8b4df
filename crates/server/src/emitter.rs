//! Per-connection event emission.
//!
//! A [`ServerEventEmitter`] serves every `chat:message` on one connection
//! as its own task. Each task emits `chat:thinking`, `chat:generating`, one
//! `chat:token` per chunk and exactly one terminal event, all tagged with
//! the client-supplied id and checked against [`MessageStateMachine`] before
//! they leave the server.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::StreamExt;
use thiserror::Error;
use tokenrelay_protocol::{
    decode_client, AckPayload, ChatMessagePayload, ClientEvent, ConversationCreatedPayload,
    ConversationId, ErrorPayload, GenerationMetadata, LifecycleState, MessageEvent, MessageId,
    MessageStateMachine, ProtocolError, ServerEvent,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{InferenceError, StoreError};
use crate::inference::{GenerationChunk, GenerationRequest, InferenceProvider};
use crate::store::{MessageStore, StoredMessage};

/// Collaborators shared by every connection.
pub struct ChatContext {
    pub provider: Arc<dyn InferenceProvider>,
    pub store: Arc<dyn MessageStore>,
    pub default_model: String,
}

#[derive(Debug, Error)]
enum GenerationFailure {
    #[error("generation cancelled")]
    Cancelled,

    #[error(transparent)]
    Inference(#[from] InferenceError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct ServerEventEmitter {
    connection_id: String,
    context: Arc<ChatContext>,
    outbound: mpsc::Sender<ServerEvent>,
    in_flight: Arc<DashMap<MessageId, CancellationToken>>,
}

impl ServerEventEmitter {
    pub fn new(context: Arc<ChatContext>, outbound: mpsc::Sender<ServerEvent>) -> Self {
        Self {
            connection_id: uuid::Uuid::new_v4().to_string(),
            context,
            outbound,
            in_flight: Arc::new(DashMap::new()),
        }
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Messages currently generating on this connection.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Decode and handle one text frame.
    pub async fn handle_frame(&self, text: &str) {
        match decode_client(text) {
            Ok(event) => self.handle(event).await,
            Err(ProtocolError::MalformedId(raw)) => {
                tracing::warn!(connection = %self.connection_id, id = ?raw, "rejecting malformed message id");
                self.send(ServerEvent::Error(ErrorPayload {
                    message_id: MessageId::new(raw),
                    error: "malformed message id".to_string(),
                }))
                .await;
            }
            Err(e) => {
                tracing::debug!(connection = %self.connection_id, "dropping undecodable client frame: {}", e);
            }
        }
    }

    pub async fn handle(&self, event: ClientEvent) {
        match event {
            ClientEvent::ChatMessage(payload) => self.start(payload).await,
            ClientEvent::ChatCancel(payload) => self.cancel(payload.message_id).await,
            ClientEvent::Ping => self.send(ServerEvent::Pong).await,
            ClientEvent::Pong => {}
        }
    }

    async fn start(&self, payload: ChatMessagePayload) {
        let id = payload.message_id.clone();
        let token = CancellationToken::new();

        let accepted = match self.in_flight.entry(id.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(token.clone());
                true
            }
        };
        if !accepted {
            tracing::warn!(message_id = %id, "duplicate message id rejected");
            self.send(ServerEvent::Error(ErrorPayload {
                message_id: id.clone(),
                error: format!("message {} is already in flight", id),
            }))
            .await;
            return;
        }

        self.send(ServerEvent::Ack(AckPayload {
            message_id: id.clone(),
        }))
        .await;
        tracing::info!(connection = %self.connection_id, message_id = %id, model = %payload.model, "generation started");

        let emission = Emission::new(id.clone(), self.outbound.clone());
        let context = self.context.clone();
        let in_flight = self.in_flight.clone();
        tokio::spawn(async move {
            run_generation(context, emission, payload, token).await;
            in_flight.remove(&id);
        });
    }

    async fn cancel(&self, id: MessageId) {
        self.send(ServerEvent::Ack(AckPayload {
            message_id: id.clone(),
        }))
        .await;

        let token = self.in_flight.get(&id).map(|entry| entry.value().clone());
        match token {
            Some(token) => {
                tracing::info!(message_id = %id, "generation cancel requested");
                token.cancel();
            }
            None => {
                tracing::debug!(message_id = %id, "cancel for unknown or finished message");
            }
        }
    }

    /// Cancel every generation started on this connection.
    pub fn close(&self) {
        for entry in self.in_flight.iter() {
            entry.value().cancel();
        }
    }

    async fn send(&self, event: ServerEvent) {
        if self.outbound.send(event).await.is_err() {
            tracing::debug!(connection = %self.connection_id, "outbound channel closed");
        }
    }
}

impl Drop for ServerEventEmitter {
    fn drop(&mut self) {
        self.close();
    }
}

/// Emitted-state tracker for one message.
struct Emission {
    id: MessageId,
    emitted: LifecycleState,
    machine: MessageStateMachine,
    outbound: mpsc::Sender<ServerEvent>,
}

impl Emission {
    fn new(id: MessageId, outbound: mpsc::Sender<ServerEvent>) -> Self {
        Self {
            id,
            emitted: LifecycleState::Pending,
            machine: MessageStateMachine::new(),
            outbound,
        }
    }

    async fn emit(&mut self, event: MessageEvent) -> bool {
        let to = event.target_state();
        let valid = self.machine.is_valid_transition(self.emitted, to);
        debug_assert!(valid, "out-of-table emission {} -> {}", self.emitted, to);
        if !valid {
            let err = ProtocolError::InvalidTransition {
                id: self.id.to_string(),
                from: self.emitted,
                to,
            };
            tracing::warn!("refusing to emit: {}", err);
            return false;
        }

        self.emitted = to;
        self.outbound
            .send(ServerEvent::from_message_event(self.id.clone(), event))
            .await
            .is_ok()
    }

    /// Frames outside the per-message sequence.
    async fn broadcast(&self, event: ServerEvent) {
        let _ = self.outbound.send(event).await;
    }
}

async fn run_generation(
    context: Arc<ChatContext>,
    mut emission: Emission,
    payload: ChatMessagePayload,
    token: CancellationToken,
) {
    let outcome = tokio::select! {
        biased;
        _ = token.cancelled() => Err(GenerationFailure::Cancelled),
        outcome = generate(&context, &mut emission, payload) => outcome,
    };

    let event = match outcome {
        Ok((conversation_id, metadata)) => {
            tracing::info!(message_id = %emission.id, tokens = ?metadata.token_count, "generation complete");
            MessageEvent::Complete {
                conversation_id: Some(conversation_id),
                metadata,
            }
        }
        Err(failure) => {
            match &failure {
                GenerationFailure::Cancelled => {
                    tracing::info!(message_id = %emission.id, "generation cancelled")
                }
                other => tracing::warn!(message_id = %emission.id, "generation failed: {}", other),
            }
            MessageEvent::Error {
                error: failure.to_string(),
            }
        }
    };
    emission.emit(event).await;
}

async fn generate(
    context: &ChatContext,
    emission: &mut Emission,
    payload: ChatMessagePayload,
) -> Result<(ConversationId, GenerationMetadata), GenerationFailure> {
    let id = payload.message_id;
    let model = if payload.model.trim().is_empty() {
        context.default_model.clone()
    } else {
        payload.model
    };

    let conversation_id = match payload.conversation_id {
        Some(conversation_id) => conversation_id,
        None => {
            let created = context.store.create_conversation().await?;
            emission
                .broadcast(ServerEvent::ConversationCreated(ConversationCreatedPayload {
                    conversation_id: created.clone(),
                }))
                .await;
            created
        }
    };

    let history = match context.store.messages(&conversation_id).await {
        Ok(history) => history,
        Err(e) => {
            tracing::warn!(
                message_id = %id,
                conversation_id = %conversation_id,
                "generating without history: {}",
                e
            );
            Vec::new()
        }
    };
    context
        .store
        .save(StoredMessage::user(
            id.clone(),
            conversation_id.clone(),
            &payload.content,
            &model,
        ))
        .await?;

    emission.emit(MessageEvent::Thinking).await;

    let vision_model = if payload.images.is_empty() {
        None
    } else {
        payload.vision_model
    };
    let request = GenerationRequest {
        message_id: id.clone(),
        conversation_id: conversation_id.clone(),
        model: model.clone(),
        vision_model: vision_model.clone(),
        prompt: payload.content,
        images: payload.images,
        history,
    };
    let mut stream = context.provider.generate(request).await?;
    emission.emit(MessageEvent::Generating).await;

    let mut content = String::new();
    let mut streamed = 0u64;
    let mut done = None;
    while let Some(chunk) = stream.next().await {
        match chunk? {
            GenerationChunk::Token(token) => {
                content.push_str(&token);
                streamed += 1;
                emission.emit(MessageEvent::Token { token }).await;
            }
            GenerationChunk::Done(metadata) => {
                done = Some(metadata);
                break;
            }
        }
    }

    let mut metadata = done.unwrap_or_default();
    if metadata.model.is_none() {
        metadata.model = Some(model);
    }
    if metadata.token_count.is_none() {
        metadata.token_count = Some(streamed);
    }
    if metadata.vision_model.is_none() {
        metadata.vision_model = vision_model;
    }

    context
        .store
        .save(StoredMessage::assistant(
            id,
            conversation_id.clone(),
            content,
            metadata.clone(),
        ))
        .await?;
    Ok((conversation_id, metadata))
}
