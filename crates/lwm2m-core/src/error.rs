//! Error types for the object model and TLV codec

use thiserror::Error;

/// Result type alias for object model operations
pub type Result<T> = std::result::Result<T, ObjectError>;

/// TLV encode/decode failures
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Truncated TLV: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },

    #[error("Resource {resource} is not defined in object {object}")]
    UnknownResource { object: u16, resource: u16 },

    #[error("Resource {resource}: {len} bytes is not a valid {kind} encoding")]
    InvalidLength {
        resource: u16,
        kind: &'static str,
        len: usize,
    },

    #[error("Resource {resource}: {reason}")]
    InvalidValue { resource: u16, reason: String },

    #[error("Unexpected TLV record: {0}")]
    UnexpectedRecord(String),

    #[error("Value of {0} bytes exceeds the TLV length field")]
    TooLarge(usize),
}

/// Errors returned by registry operations
///
/// Every variant maps onto a CoAP response code, see [`ObjectError::coap_code`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ObjectError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Method not allowed: {0}")]
    MethodNotAllowed(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Invalid value: {0}")]
    Value(String),

    #[error("Format error: {0}")]
    Format(#[from] CodecError),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Content format {0} not acceptable")]
    NotAcceptable(u16),

    #[error("Content format {0} not supported")]
    UnsupportedFormat(u16),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Operation failed: {0}")]
    Failed(String),
}

impl ObjectError {
    /// Raw CoAP code (class << 5 | detail) for this error
    pub fn coap_code(&self) -> u8 {
        match self {
            ObjectError::BadRequest(_) | ObjectError::Value(_) | ObjectError::Format(_) => 0x80,
            ObjectError::Unauthorized(_) => 0x81,
            ObjectError::NotFound(_) => 0x84,
            ObjectError::MethodNotAllowed(_) => 0x85,
            ObjectError::NotAcceptable(_) => 0x86,
            ObjectError::UnsupportedFormat(_) => 0x8F,
            ObjectError::Failed(_) => 0xA0,
            ObjectError::Timeout(_) => 0xA3,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(ObjectError::NotFound("/3/1".into()).coap_code(), 0x84);
        assert_eq!(ObjectError::MethodNotAllowed("x".into()).coap_code(), 0x85);
        assert_eq!(
            ObjectError::from(CodecError::TooLarge(1 << 25)).coap_code(),
            0x80
        );
        assert_eq!(ObjectError::Timeout("rssi".into()).coap_code(), 0xA3);
    }
}
