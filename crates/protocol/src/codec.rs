//! JSON text framing.
//!
//! Decoding rejects message-scoped frames whose id is not well formed so a
//! bad id never reaches a registry or an emitter.

use crate::error::ProtocolError;
use crate::events::{ClientEvent, ServerEvent};
use crate::id::MessageId;

pub fn encode_client(event: &ClientEvent) -> Result<String, ProtocolError> {
    serde_json::to_string(event).map_err(|e| ProtocolError::Encode(e.to_string()))
}

pub fn encode_server(event: &ServerEvent) -> Result<String, ProtocolError> {
    serde_json::to_string(event).map_err(|e| ProtocolError::Encode(e.to_string()))
}

pub fn decode_client(text: &str) -> Result<ClientEvent, ProtocolError> {
    let event: ClientEvent = serde_json::from_str(text)?;
    if let Some(id) = event.message_id() {
        check_id(id)?;
    }
    Ok(event)
}

pub fn decode_server(text: &str) -> Result<ServerEvent, ProtocolError> {
    let event: ServerEvent = serde_json::from_str(text)?;
    if let Some(id) = server_message_id(&event) {
        check_id(id)?;
    }
    Ok(event)
}

fn server_message_id(event: &ServerEvent) -> Option<&MessageId> {
    match event {
        ServerEvent::Ack(p) => Some(&p.message_id),
        ServerEvent::Thinking(p) | ServerEvent::Generating(p) => Some(&p.message_id),
        ServerEvent::Token(p) => Some(&p.message_id),
        ServerEvent::Complete(p) => Some(&p.message_id),
        ServerEvent::Error(p) => Some(&p.message_id),
        ServerEvent::ConversationCreated(_) | ServerEvent::Ping | ServerEvent::Pong => None,
    }
}

fn check_id(id: &MessageId) -> Result<(), ProtocolError> {
    if id.is_well_formed() {
        Ok(())
    } else {
        Err(ProtocolError::MalformedId(id.as_str().to_string()))
    }
}
