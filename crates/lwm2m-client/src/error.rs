//! Client engine and update errors

use lwm2m_coap::TransportError;
use lwm2m_core::ObjectError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ClientError>;

/// Errors surfaced by the client engine
#[derive(Debug, Error)]
pub enum ClientError {
    /// Configuration is unusable
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to parse configuration: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Object error: {0}")]
    Object(#[from] ObjectError),

    #[error("Update error: {0}")]
    Update(#[from] UpdateError),
}

/// Failures of a firmware or software update job
///
/// These never leave the update engine; each one is recorded as the job's
/// update result so the server can read it back.
#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("Invalid URI: {0}")]
    InvalidUri(String),

    #[error("Unsupported protocol: {0}")]
    UnsupportedProtocol(String),

    #[error("Not enough storage: {0}")]
    NotEnoughStorage(String),

    #[error("Out of memory: {0}")]
    OutOfMemory(String),

    #[error("Integrity check failed: {0}")]
    Integrity(String),

    #[error("Unsupported package: {0}")]
    UnsupportedPackage(String),

    /// External updater could not be started or did not succeed
    #[error("Updater failed: {0}")]
    Updater(String),

    #[error("Operation not allowed in state {0}")]
    InvalidState(String),

    #[error("Staging I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Job marker error: {0}")]
    Marker(#[from] serde_json::Error),
}

impl From<UpdateError> for ObjectError {
    fn from(err: UpdateError) -> Self {
        match err {
            UpdateError::InvalidState(msg) => ObjectError::MethodNotAllowed(msg),
            UpdateError::InvalidUri(msg) => ObjectError::BadRequest(msg),
            other => ObjectError::Failed(other.to_string()),
        }
    }
}
