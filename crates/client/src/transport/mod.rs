//! Connection management.
//!
//! A [`TransportSession`] drives an ordered list of [`Connector`]s: the
//! WebSocket connector first and, optionally, HTTP long-polling as a
//! fallback. Each connection attempt uses the first connector that succeeds.

pub mod link;
pub mod memory;
pub mod polling;
pub mod session;
pub mod websocket;

pub use link::{Connector, Link, TransportKind};
pub use memory::{MemoryAcceptor, MemoryConnector, MemoryPeer};
pub use polling::LongPollingConnector;
pub use session::{ConnectionState, SendReceipt, TransportDiagnostics, TransportSession};
pub use websocket::WebSocketConnector;
