//! In-process transport. Each `connect` hands the far end of a fresh link to
//! a [`MemoryAcceptor`], which plays the server.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::link::{Connector, Link, TransportKind};
use crate::error::TransportError;

const CHANNEL_CAPACITY: usize = 256;

/// Server side of one in-memory connection.
pub struct MemoryPeer {
    /// Frames the client sent.
    pub incoming: mpsc::Receiver<String>,
    /// Frames to deliver to the client. Dropping it ends the link.
    pub outgoing: mpsc::Sender<String>,
}

pub struct MemoryAcceptor {
    peers: mpsc::UnboundedReceiver<MemoryPeer>,
}

impl MemoryAcceptor {
    /// Wait for the next client connection.
    pub async fn accept(&mut self) -> Option<MemoryPeer> {
        self.peers.recv().await
    }
}

#[derive(Clone)]
pub struct MemoryConnector {
    peers: mpsc::UnboundedSender<MemoryPeer>,
    available: Arc<AtomicBool>,
}

impl MemoryConnector {
    pub fn new() -> (Self, MemoryAcceptor) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                peers: tx,
                available: Arc::new(AtomicBool::new(true)),
            },
            MemoryAcceptor { peers: rx },
        )
    }

    /// Make subsequent connects fail (or succeed again).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    fn kind(&self) -> TransportKind {
        TransportKind::Memory
    }

    async fn connect(&self) -> Result<Link, TransportError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(TransportError::Connect("memory peer unavailable".to_string()));
        }

        let (client_tx, server_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (server_tx, client_rx) = mpsc::channel(CHANNEL_CAPACITY);
        self.peers
            .send(MemoryPeer {
                incoming: server_rx,
                outgoing: server_tx,
            })
            .map_err(|_| TransportError::Connect("memory acceptor dropped".to_string()))?;

        Ok(Link {
            outbound: client_tx,
            inbound: client_rx,
        })
    }
}
