//! In-memory transport for testing

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::{mpsc, Mutex};

use super::DatagramTransport;
use crate::error::TransportError;

/// Client half of an in-memory datagram link
pub struct MockTransport {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    rx: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    /// Every datagram handed to `send`, including dropped ones
    sent: RwLock<Vec<Vec<u8>>>,
    drop_outbound: AtomicBool,
    secure: bool,
}

/// Server half, driven directly by tests
pub struct MockPeer {
    pub tx: mpsc::UnboundedSender<Vec<u8>>,
    pub rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl MockPeer {
    pub fn send(&self, datagram: Vec<u8>) {
        let _ = self.tx.send(datagram);
    }

    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Vec<u8>> {
        self.rx.try_recv().ok()
    }
}

impl MockTransport {
    /// Create a connected transport and its peer
    pub fn pair() -> (MockTransport, MockPeer) {
        let (to_peer, from_client) = mpsc::unbounded_channel();
        let (to_client, from_peer) = mpsc::unbounded_channel();
        let transport = MockTransport {
            tx: to_peer,
            rx: Mutex::new(from_peer),
            sent: RwLock::new(Vec::new()),
            drop_outbound: AtomicBool::new(false),
            secure: false,
        };
        let peer = MockPeer {
            tx: to_client,
            rx: from_client,
        };
        (transport, peer)
    }

    pub fn secure(mut self) -> Self {
        self.secure = true;
        self
    }

    /// Silently discard outbound datagrams (simulates a dead server)
    pub fn set_drop_outbound(&self, drop: bool) {
        self.drop_outbound.store(drop, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.sent.read().clone()
    }
}

#[async_trait]
impl DatagramTransport for MockTransport {
    async fn send(&self, datagram: &[u8]) -> Result<(), TransportError> {
        self.sent.write().push(datagram.to_vec());
        if self.drop_outbound.load(Ordering::SeqCst) {
            tracing::debug!(len = datagram.len(), "Mock transport: dropped datagram");
            return Ok(());
        }
        self.tx
            .send(datagram.to_vec())
            .map_err(|_| TransportError::ConnectionClosed)
    }

    async fn recv(&self) -> Result<Vec<u8>, TransportError> {
        self.rx
            .lock()
            .await
            .recv()
            .await
            .ok_or(TransportError::ConnectionClosed)
    }

    fn peer(&self) -> Option<SocketAddr> {
        None
    }

    fn is_secure(&self) -> bool {
        self.secure
    }
}
