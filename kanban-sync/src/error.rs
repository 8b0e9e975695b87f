//! Top-level error for command processing.

use crate::model::EntityId;
use crate::protocol::ProtocolError;
use crate::storage::{EntityKind, StoreError};

/// Outcome of a failed command.
///
/// Only store faults end the connection; the other variants abort the one
/// command and leave the read loop running.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SyncError {
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("{kind} not found: {id}")]
    NotFound { kind: EntityKind, id: EntityId },
    #[error("Store error: {0}")]
    Store(StoreError),
}

impl SyncError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, SyncError::Store(_))
    }
}

impl From<StoreError> for SyncError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound { kind, id } => SyncError::NotFound { kind, id },
            other => SyncError::Store(other),
        }
    }
}
