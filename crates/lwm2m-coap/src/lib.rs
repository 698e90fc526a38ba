//! CoAP message layer for LwM2M
//!
//! - [`message`]: RFC 7252 message framing and option helpers
//! - [`block`]: RFC 7959 block-wise transfer (Block1 reassembly, Block2 slicing)
//! - [`endpoint`]: sans-IO confirmable retransmission, deduplication and
//!   request/response correlation
//! - [`transport`]: datagram transports (UDP, DTLS-PSK, mock)
//! - [`client`]: block-wise GET client used for CoAP package downloads

pub mod block;
pub mod client;
pub mod dtls;
pub mod endpoint;
pub mod error;
pub mod message;
pub mod transport;

pub use block::{Block1Assembler, BlockError, BlockOption, BlockOutcome};
pub use endpoint::{Endpoint, EndpointEvent, RequestId, TransmissionParams};
pub use error::{MessageError, TransportError};
pub use message::{Code, ContentFormat, Message, MessageType};
pub use transport::{create_transport, DatagramTransport, Security, TransportTarget};
