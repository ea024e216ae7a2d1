use thiserror::Error;
use uuid::Uuid;

use crate::resource::ResourceKind;
use crate::status::TransferStatus;

#[derive(Debug, Error)]
pub enum TransferError {
    /// Unsafe or malformed identifier supplied by the caller. Never executed
    /// against a source or target system.
    #[error("{reason} in {kind} name: {input}")]
    Validation {
        kind: &'static str,
        reason: &'static str,
        input: String,
    },

    /// Operation attempted from a status that does not allow it. No state
    /// mutation has occurred.
    #[error("{operation} is not allowed while the transfer is {status}")]
    InvalidState {
        operation: &'static str,
        status: TransferStatus,
    },

    #[error("extraction failed: {0}")]
    Extraction(String),

    #[error("restore failed: {0}")]
    Restore(String),

    /// Creation refused: another transfer for the same source is still in
    /// progress and would corrupt this one's extraction.
    #[error("an active transfer already exists for this source: {0}")]
    DuplicateTransfer(Uuid),

    #[error("transfer {0} not found")]
    TransferNotFound(Uuid),

    #[error("{kind} resource {id} not found")]
    ResourceNotFound { kind: ResourceKind, id: Uuid },

    #[error("target {what} {id} not found")]
    TargetNotFound { what: &'static str, id: Uuid },

    #[error("storage failure: {0}")]
    Storage(String),
}

impl TransferError {
    /// Stable machine-readable tag used in `error_details` and API bodies.
    pub fn kind_str(&self) -> &'static str {
        match self {
            TransferError::Validation { .. } => "validation",
            TransferError::InvalidState { .. } => "invalid_state",
            TransferError::Extraction(_) => "extraction",
            TransferError::Restore(_) => "restore",
            TransferError::DuplicateTransfer(_) => "duplicate_transfer",
            TransferError::TransferNotFound(_) => "transfer_not_found",
            TransferError::ResourceNotFound { .. } => "resource_not_found",
            TransferError::TargetNotFound { .. } => "target_not_found",
            TransferError::Storage(_) => "storage",
        }
    }
}
