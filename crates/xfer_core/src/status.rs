use serde::{Deserialize, Serialize};

/// Lifecycle of a resource transfer. The serialized names are part of the
/// persisted/API contract and must stay exactly as written here.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    Pending,
    Preparing,
    Transferring,
    Restoring,
    Completed,
    Failed,
    Cancelled,
}

impl TransferStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferStatus::Pending => "pending",
            TransferStatus::Preparing => "preparing",
            TransferStatus::Transferring => "transferring",
            TransferStatus::Restoring => "restoring",
            TransferStatus::Completed => "completed",
            TransferStatus::Failed => "failed",
            TransferStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(TransferStatus::Pending),
            "preparing" => Some(TransferStatus::Preparing),
            "transferring" => Some(TransferStatus::Transferring),
            "restoring" => Some(TransferStatus::Restoring),
            "completed" => Some(TransferStatus::Completed),
            "failed" => Some(TransferStatus::Failed),
            "cancelled" => Some(TransferStatus::Cancelled),
            _ => None,
        }
    }

    /// Cancellation is refused once a restore has begun: a partially applied
    /// restore is unsafe to abort.
    pub fn can_be_cancelled(&self) -> bool {
        matches!(
            self,
            TransferStatus::Pending | TransferStatus::Preparing | TransferStatus::Transferring
        )
    }

    pub fn is_in_progress(&self) -> bool {
        matches!(
            self,
            TransferStatus::Pending
                | TransferStatus::Preparing
                | TransferStatus::Transferring
                | TransferStatus::Restoring
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferStatus::Completed | TransferStatus::Failed | TransferStatus::Cancelled
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            TransferStatus::Pending => "Pending",
            TransferStatus::Preparing => "Preparing",
            TransferStatus::Transferring => "Transferring data",
            TransferStatus::Restoring => "Restoring",
            TransferStatus::Completed => "Completed",
            TransferStatus::Failed => "Failed",
            TransferStatus::Cancelled => "Cancelled",
        }
    }
}

impl std::fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
