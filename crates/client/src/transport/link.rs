use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::TransportError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    WebSocket,
    LongPolling,
    Memory,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TransportKind::WebSocket => "websocket",
            TransportKind::LongPolling => "long_polling",
            TransportKind::Memory => "memory",
        };
        f.write_str(name)
    }
}

/// An established connection, reduced to two text-frame channels.
///
/// The link is alive until `inbound` yields `None`. Dropping every clone of
/// `outbound` closes the connection from the client side.
pub struct Link {
    pub outbound: mpsc::Sender<String>,
    pub inbound: mpsc::Receiver<String>,
}

/// Opens [`Link`]s to the server over one kind of transport.
#[async_trait]
pub trait Connector: Send + Sync {
    fn kind(&self) -> TransportKind;

    async fn connect(&self) -> Result<Link, TransportError>;
}
