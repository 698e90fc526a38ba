//! Datagram transports for talking to LwM2M servers
//!
//! - UDP (`coap://`)
//! - DTLS 1.2 with a pre-shared key over UDP (`coaps://`)
//! - Mock pair for testing
//!
//! # Example
//!
//! ```ignore
//! use lwm2m_coap::transport::{create_transport, Security, TransportTarget};
//! use lwm2m_coap::TransmissionParams;
//!
//! let target = TransportTarget {
//!     host: "lwm2m.example.net".into(),
//!     port: 5684,
//!     bind: "0.0.0.0:0".parse()?,
//!     security: Security::Psk { identity: b"dev-1".to_vec(), key: vec![0x01; 16] },
//! };
//! let transport = create_transport(&target, &TransmissionParams::default()).await?;
//! ```

mod adapter;
pub mod mock;
pub mod udp;

pub use adapter::DatagramTransport;

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::dtls::DtlsTransport;
use crate::endpoint::TransmissionParams;
use crate::error::TransportError;

#[derive(Clone, PartialEq, Eq)]
pub enum Security {
    NoSec,
    Psk { identity: Vec<u8>, key: Vec<u8> },
}

impl fmt::Debug for Security {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Security::NoSec => write!(f, "NoSec"),
            Security::Psk { identity, .. } => f
                .debug_struct("Psk")
                .field("identity", &String::from_utf8_lossy(identity))
                .finish_non_exhaustive(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransportTarget {
    pub host: String,
    pub port: u16,
    /// Local address, selects the bearer's interface
    pub bind: SocketAddr,
    pub security: Security,
}

/// Open a transport for `target`, completing the DTLS handshake when the
/// target is secured
pub async fn create_transport(
    target: &TransportTarget,
    params: &TransmissionParams,
) -> Result<Arc<dyn DatagramTransport>, TransportError> {
    let udp = udp::UdpTransport::connect(&target.host, target.port, target.bind).await?;
    match &target.security {
        Security::NoSec => Ok(Arc::new(udp)),
        Security::Psk { identity, key } => {
            if identity.is_empty() || key.is_empty() {
                return Err(TransportError::InvalidConfig(
                    "PSK identity and key must not be empty".into(),
                ));
            }
            let dtls = DtlsTransport::connect(Box::new(udp), identity, key, params).await?;
            Ok(Arc::new(dtls))
        }
    }
}
