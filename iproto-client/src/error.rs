//! Client error types.

use iproto_protocol::{ProtocolError, ServerError};
use thiserror::Error;

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("request timeout")]
    Timeout,

    #[error("request {sync} superseded by a newer request with the same sync")]
    Superseded { sync: u32 },

    #[error("authentication failed: {0}")]
    Auth(ServerError),

    #[error("{0}")]
    Server(#[from] ServerError),

    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),
}

impl ClientError {
    /// Returns whether this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Io(_) => true,
            ClientError::Timeout => true,
            ClientError::ConnectionClosed => true,
            ClientError::Superseded { .. } => true,
            ClientError::Server(err) => err.is_retryable(),
            _ => false,
        }
    }

    /// Returns true for errors raised by this library rather than reported
    /// by the server.
    pub fn is_local(&self) -> bool {
        !matches!(self, ClientError::Server(_) | ClientError::Auth(_))
    }

    /// Returns the server error, if the server reported one.
    pub fn server_error(&self) -> Option<&ServerError> {
        match self {
            ClientError::Server(err) | ClientError::Auth(err) => Some(err),
            _ => None,
        }
    }
}
