//! High-level chat client.

use std::sync::Arc;

use tokenrelay_protocol::{
    CancelPayload, ChatMessagePayload, ClientEvent, ConversationId, IdentityGenerator,
    LifecycleState, MessageId,
};
use tokio::sync::{mpsc, watch};

use crate::bridge::{ChannelHandler, MessageHandler, MessageUpdate};
use crate::config::ClientConfig;
use crate::error::{ClientError, TransportError};
use crate::health::ComponentHealth;
use crate::lifecycle::{LifecycleCoordinator, MessageMetadata, TransitionPayload};
use crate::reconciler::EventReconciler;
use crate::transport::{
    ConnectionState, Connector, LongPollingConnector, TransportDiagnostics, TransportSession,
    WebSocketConnector,
};

/// One chat request.
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub content: String,
    pub model: String,
    pub vision_model: Option<String>,
    pub conversation_id: Option<ConversationId>,
    pub images: Vec<String>,
}

impl ChatRequest {
    pub fn new(content: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            model: model.into(),
            ..Self::default()
        }
    }

    pub fn in_conversation(mut self, conversation_id: ConversationId) -> Self {
        self.conversation_id = Some(conversation_id);
        self
    }

    pub fn with_images(mut self, images: Vec<String>, vision_model: Option<String>) -> Self {
        self.images = images;
        self.vision_model = vision_model;
        self
    }
}

/// Client session: one coordinator, one reconciler and one transport.
pub struct ChatClient {
    config: ClientConfig,
    ids: &'static IdentityGenerator,
    coordinator: Arc<LifecycleCoordinator>,
    reconciler: Arc<EventReconciler>,
    transport: Arc<TransportSession>,
}

impl ChatClient {
    /// Build a client using WebSocket and, if enabled, long-polling.
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        config.validate()?;

        let timeout = config.transport.connect_timeout;
        let mut connectors: Vec<Arc<dyn Connector>> = vec![Arc::new(WebSocketConnector::new(
            config.server_url.clone(),
            timeout,
        ))];
        if config.transport.enable_polling_fallback {
            connectors.push(Arc::new(LongPollingConnector::new(
                config.resolved_poll_url()?,
                timeout,
            )));
        }
        Self::with_connectors(config, connectors)
    }

    /// Build a client over caller-supplied connectors.
    pub fn with_connectors(
        config: ClientConfig,
        connectors: Vec<Arc<dyn Connector>>,
    ) -> Result<Self, ClientError> {
        config.validate()?;

        let coordinator = LifecycleCoordinator::new(config.lifecycle.clone());
        let reconciler = EventReconciler::new(config.reconciler.clone(), coordinator.clone());
        let transport =
            TransportSession::new(config.transport.clone(), connectors, reconciler.clone());

        Ok(Self {
            config,
            ids: IdentityGenerator::global(),
            coordinator,
            reconciler,
            transport,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub async fn connect(&self) -> Result<(), ClientError> {
        self.transport.connect().await?;
        Ok(())
    }

    /// Client-initiated disconnect. In-flight messages stay registered.
    pub async fn disconnect(&self) {
        self.transport.disconnect().await;
    }

    /// Send a message with a freshly generated id.
    pub async fn send_message(
        &self,
        request: ChatRequest,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<MessageId, ClientError> {
        let id = self.ids.generate();
        self.send_message_with_id(id, request, handler).await
    }

    /// Send a message under a caller-chosen id.
    pub async fn send_message_with_id(
        &self,
        id: MessageId,
        request: ChatRequest,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<MessageId, ClientError> {
        let metadata = MessageMetadata {
            model: request.model.clone(),
            has_images: !request.images.is_empty(),
            vision_model: request.vision_model.clone(),
            content: request.content.clone(),
            conversation_id: request.conversation_id.clone(),
        };
        self.coordinator
            .create_with_handler(id.clone(), metadata, handler)?;
        self.reconciler.flush(&id);

        let frame = ClientEvent::ChatMessage(ChatMessagePayload {
            message_id: id.clone(),
            content: request.content,
            model: request.model,
            vision_model: request.vision_model,
            conversation_id: request.conversation_id,
            images: request.images,
        });

        match self
            .transport
            .send(&frame, Some(self.config.transport.ack_timeout))
            .await
        {
            Ok(receipt) => {
                tracing::debug!(message_id = %id, receipt = ?receipt, "chat message sent");
            }
            Err(e @ TransportError::Encode(_)) => {
                self.coordinator.update_state(
                    &id,
                    LifecycleState::Error,
                    TransitionPayload::Error(format!("send failed: {}", e)),
                );
                return Err(e.into());
            }
            Err(e) => {
                // The frame reached the link; the watchdog bounds the wait.
                tracing::warn!(message_id = %id, "chat message not acknowledged: {}", e);
            }
        }
        Ok(id)
    }

    /// Send a message and receive its callbacks as a stream of updates.
    pub async fn stream_message(
        &self,
        request: ChatRequest,
    ) -> Result<(MessageId, mpsc::UnboundedReceiver<MessageUpdate>), ClientError> {
        let (handler, updates) = ChannelHandler::new();
        let id = self.send_message(request, Arc::new(handler)).await?;
        Ok((id, updates))
    }

    /// Cancel locally and ask the server to stop generating. Returns `false`
    /// if the message was unknown or already terminal.
    pub async fn cancel(&self, id: &MessageId) -> Result<bool, ClientError> {
        if !self.coordinator.cancel(id) {
            return Ok(false);
        }
        let frame = ClientEvent::ChatCancel(CancelPayload {
            message_id: id.clone(),
        });
        self.transport.send(&frame, None).await?;
        Ok(true)
    }

    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.transport.state()
    }

    pub fn diagnostics(&self) -> TransportDiagnostics {
        self.transport.diagnostics()
    }

    pub fn check_health(&self) -> ComponentHealth {
        let state = self.transport.current_state();
        let health = self.coordinator.check_health();
        let health = match state {
            ConnectionState::Failed { attempts } if health.is_healthy() => {
                ComponentHealth::degraded(format!("transport failed after {} attempts", attempts))
                    .with_metric("active_messages", self.coordinator.active_count())
            }
            _ => health,
        };
        health
            .with_metric("queued_events", self.reconciler.queued_len())
            .with_metric(
                "connection",
                serde_json::to_string(&state).unwrap_or_default(),
            )
    }

    pub fn coordinator(&self) -> &Arc<LifecycleCoordinator> {
        &self.coordinator
    }

    pub fn reconciler(&self) -> &Arc<EventReconciler> {
        &self.reconciler
    }

    pub fn transport(&self) -> &Arc<TransportSession> {
        &self.transport
    }

    /// Disconnect, cancel every in-flight message and release all timers.
    pub async fn shutdown(&self) {
        self.transport.disconnect().await;
        self.reconciler.shutdown();
        self.coordinator.shutdown();
    }
}
