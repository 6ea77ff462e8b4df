//! Wire protocol for tokenrelay streaming chat.
//!
//! Shared by the server-side emitter and the client-side consumer:
//!
//! - [`id`]: message and conversation identifiers, plus the client-side
//!   [`IdentityGenerator`]
//! - [`state`]: the per-message lifecycle state machine
//! - [`events`]: typed client→server and server→client frames
//! - [`codec`]: JSON text framing for those events
//!
//! Requests and responses are correlated purely by the [`MessageId`] carried
//! in every message-scoped payload. Ids are minted by the client so the
//! server stays stateless for addressing purposes.

pub mod codec;
pub mod error;
pub mod events;
pub mod id;
pub mod state;

pub use codec::{decode_client, decode_server, encode_client, encode_server};
pub use error::{ConfigError, ProtocolError};
pub use events::{
    AckPayload, CancelPayload, ChatMessagePayload, ClientEvent, CompletePayload,
    ConversationCreatedPayload, ErrorPayload, GenerationMetadata, MessageEvent, MessageEventKind,
    MessageRef, ServerEvent, TokenPayload,
};
pub use id::{ConversationId, IdentityGenerator, MessageId};
pub use state::{LifecycleState, MessageStateMachine};
