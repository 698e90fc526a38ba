//! Plain UDP transport

use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::net::{lookup_host, UdpSocket};
use tracing::{debug, trace};

use super::DatagramTransport;
use crate::error::TransportError;

/// Largest datagram accepted from the network
const MAX_DATAGRAM: usize = 2048;

pub struct UdpTransport {
    socket: UdpSocket,
    peer: SocketAddr,
}

impl UdpTransport {
    /// Bind to `bind` and connect to `host:port`
    ///
    /// When the resolved peer and the bind address are of different
    /// families, the unspecified address of the peer's family is used.
    pub async fn connect(host: &str, port: u16, bind: SocketAddr) -> Result<Self, TransportError> {
        let peer = lookup_host((host, port))
            .await
            .map_err(|e| TransportError::ConnectionFailed(format!("resolve {}: {}", host, e)))?
            .next()
            .ok_or_else(|| TransportError::ConnectionFailed(format!("no address for {}", host)))?;

        let bind = match (bind, peer) {
            (SocketAddr::V4(_), SocketAddr::V6(_)) => {
                SocketAddr::new(std::net::Ipv6Addr::UNSPECIFIED.into(), bind.port())
            }
            (SocketAddr::V6(_), SocketAddr::V4(_)) if bind.ip().is_unspecified() => {
                SocketAddr::new(std::net::Ipv4Addr::UNSPECIFIED.into(), bind.port())
            }
            _ => bind,
        };

        let socket = UdpSocket::bind(bind).await?;
        socket.connect(peer).await?;
        debug!(%peer, local = ?socket.local_addr().ok(), "UDP transport connected");
        Ok(Self { socket, peer })
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.local_addr().ok()
    }
}

#[async_trait]
impl DatagramTransport for UdpTransport {
    async fn send(&self, datagram: &[u8]) -> Result<(), TransportError> {
        trace!(len = datagram.len(), peer = %self.peer, "UDP send");
        self.socket
            .send(datagram)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        Ok(())
    }

    async fn recv(&self) -> Result<Vec<u8>, TransportError> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let len = self
            .socket
            .recv(&mut buf)
            .await
            .map_err(|e| TransportError::ReceiveFailed(e.to_string()))?;
        buf.truncate(len);
        trace!(len, peer = %self.peer, "UDP recv");
        Ok(buf)
    }

    fn peer(&self) -> Option<SocketAddr> {
        Some(self.peer)
    }
}
