//! Protocol error types.

use crate::keys::errcode;
use std::fmt;
use thiserror::Error;

/// Protocol-level errors that can occur during framing or message handling.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid length prefix marker: {0:#04x}")]
    InvalidLengthPrefix(u8),

    #[error("zero-length frame")]
    EmptyFrame,

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: u32, max: u32 },

    #[error("malformed header: {0}")]
    MalformedHeader(&'static str),

    #[error("malformed body: {0}")]
    MalformedBody(&'static str),

    #[error("expected string field {0:#04x}")]
    ExpectedString(u64),

    #[error("expected numeric field {0:#04x}")]
    ExpectedNumber(u64),

    #[error("expected boolean field {0:#04x}")]
    ExpectedBool(u64),

    #[error("expected array field {0:#04x}")]
    ExpectedArray(u64),

    #[error("expected map field {0:#04x}")]
    ExpectedMap(u64),

    #[error("expected uuid field {0:#04x}")]
    ExpectedUuid(u64),

    #[error("missing required field: {0:#04x}")]
    MissingField(u64),

    #[error("unknown command code: {0:#x}")]
    UnknownCommand(u32),

    #[error("invalid greeting: {0}")]
    InvalidGreeting(&'static str),

    #[error("msgpack encode error: {0}")]
    Encode(#[from] rmpv::encode::Error),

    #[error("msgpack decode error: {0}")]
    Decode(#[from] rmpv::decode::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Returns true if the peer closed the stream cleanly between frames.
    pub fn is_eof(&self) -> bool {
        matches!(self, ProtocolError::Io(e) if e.kind() == std::io::ErrorKind::UnexpectedEof)
    }
}

/// An error reported by the server in an error-flagged response.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub struct ServerError {
    /// Error code with the error flag stripped.
    pub code: u32,
    /// Human-readable message.
    pub message: String,
}

impl ServerError {
    pub fn new(code: u32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Returns whether retrying the same request later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self.code, errcode::READONLY | errcode::LOADING)
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "server error {}: {}", self.code, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_error_retryable() {
        assert!(ServerError::new(errcode::READONLY, "ro").is_retryable());
        assert!(ServerError::new(errcode::LOADING, "loading").is_retryable());
        assert!(!ServerError::new(errcode::TUPLE_FOUND, "dup").is_retryable());
        assert!(!ServerError::new(errcode::ACCESS_DENIED, "no").is_retryable());
    }

    #[test]
    fn test_protocol_error_display() {
        let err = ProtocolError::InvalidLengthPrefix(0xd0);
        assert!(err.to_string().contains("0xd0"));

        let err = ProtocolError::ExpectedString(0x24);
        assert!(err.to_string().contains("expected string field"));

        let err = ProtocolError::FrameTooLarge { size: 100, max: 50 };
        assert!(err.to_string().contains("100"));

        let err = ServerError::new(3, "Duplicate key exists");
        assert_eq!(err.to_string(), "server error 3: Duplicate key exists");
    }

    #[test]
    fn test_eof_detection() {
        let eof = ProtocolError::Io(std::io::Error::from(std::io::ErrorKind::UnexpectedEof));
        assert!(eof.is_eof());
        assert!(!ProtocolError::EmptyFrame.is_eof());
    }
}
