//! Replication error types.

use crate::session::Phase;
use iproto_client::ClientError;
use iproto_protocol::{ProtocolError, ServerError, Version};
use thiserror::Error;
use uuid::Uuid;

/// Replication errors. Every error except [`ReplicationError::InvalidPhase`]
/// is terminal for the session that raised it.
#[derive(Debug, Error)]
pub enum ReplicationError {
    #[error(transparent)]
    Client(#[from] ClientError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("{0}")]
    Server(ServerError),

    #[error("replica set UUID mismatch: expected {expected}, got {actual}")]
    IdentityMismatch { expected: Uuid, actual: Uuid },

    #[error("out of order row from instance {replica_id}: lsn {lsn} does not advance {current}")]
    OrderingViolation {
        replica_id: u32,
        lsn: u64,
        current: u64,
    },

    #[error("server version {actual} does not support {feature} (requires {required})")]
    UnsupportedVersion {
        feature: &'static str,
        required: Version,
        actual: String,
    },

    #[error("{operation} is not allowed in phase {phase:?}")]
    InvalidPhase {
        operation: &'static str,
        phase: Phase,
    },

    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),

    #[error("session failed: {reason}")]
    Failed { reason: String },
}

impl ReplicationError {
    /// Returns the server error, if the server reported one.
    pub fn server_error(&self) -> Option<&ServerError> {
        match self {
            ReplicationError::Server(err) => Some(err),
            ReplicationError::Client(err) => err.server_error(),
            _ => None,
        }
    }

    /// Returns true for failures of the connection itself, which a caller
    /// may retry with a fresh session.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            ReplicationError::Client(
                ClientError::Io(_) | ClientError::ConnectionClosed | ClientError::Timeout
            )
        )
    }
}
