//! Transport and message errors

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Reset by peer")]
    Reset,

    #[error("Malformed datagram: {0}")]
    Malformed(String),

    #[error("DTLS handshake failed: {0}")]
    Handshake(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        TransportError::ConnectionFailed(e.to_string())
    }
}

impl From<MessageError> for TransportError {
    fn from(e: MessageError) -> Self {
        TransportError::Malformed(e.to_string())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MessageError {
    #[error("Message too short: {0} bytes")]
    TooShort(usize),

    #[error("Unsupported CoAP version {0}")]
    BadVersion(u8),

    #[error("Invalid token length {0}")]
    BadTokenLength(u8),

    #[error("Invalid option: {0}")]
    BadOption(String),

    #[error("Payload marker without payload")]
    EmptyPayload,

    #[error("Invalid block option: {0}")]
    InvalidBlock(String),
}
