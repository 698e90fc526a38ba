//! Datagram transport trait

use std::net::SocketAddr;

use async_trait::async_trait;

use crate::error::TransportError;

/// One connected datagram association with an LwM2M server
///
/// Implementations are plain UDP, DTLS over UDP, or an in-memory mock.
/// Every call to [`recv`](DatagramTransport::recv) yields exactly one CoAP
/// message worth of plaintext.
#[async_trait]
pub trait DatagramTransport: Send + Sync {
    /// Send one datagram
    async fn send(&self, datagram: &[u8]) -> Result<(), TransportError>;

    /// Wait for the next datagram from the peer
    async fn recv(&self) -> Result<Vec<u8>, TransportError>;

    /// Remote address, if the transport has one
    fn peer(&self) -> Option<SocketAddr>;

    /// Whether datagrams are protected by DTLS
    fn is_secure(&self) -> bool {
        false
    }

    /// Tear down the association, notifying the peer where the protocol can
    async fn close(&self) -> Result<(), TransportError> {
        Ok(())
    }
}
