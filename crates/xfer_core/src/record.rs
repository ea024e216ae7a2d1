use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::options::TransferOptions;
use crate::resource::ResourceKind;
use crate::status::TransferStatus;

/// How much of the source a transfer carries.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransferMode {
    /// Full resource plus data; the engine creates the target.
    Clone,
    /// Data into an existing target resource.
    DataOnly,
    /// Options-driven subset into an existing target resource.
    Partial,
}

impl TransferMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferMode::Clone => "clone",
            TransferMode::DataOnly => "data_only",
            TransferMode::Partial => "partial",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "clone" => Some(TransferMode::Clone),
            "data_only" => Some(TransferMode::DataOnly),
            "partial" => Some(TransferMode::Partial),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            TransferMode::Clone => "Full clone",
            TransferMode::DataOnly => "Data only",
            TransferMode::Partial => "Partial",
        }
    }
}

impl std::fmt::Display for TransferMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which execution path a transfer takes after its status commits to
/// `preparing`. Dispatch is a separate step from the state transition so the
/// transition can commit first and no lock is held across external work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchPlan {
    /// Synchronous configuration-only clone (applications and services).
    CloneAction,
    /// Asynchronous dump/restore job (database sources).
    QueueJob,
}

/// Parameters for creating a transfer. `target_id` must be supplied for
/// `data_only` and `partial` modes and must be absent for `clone`, where the
/// engine creates the target itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTransfer {
    pub team_id: Uuid,
    pub user_id: Uuid,
    pub source_kind: ResourceKind,
    pub source_id: Uuid,
    pub target_id: Option<Uuid>,
    pub target_environment_id: Uuid,
    pub target_server_id: Uuid,
    pub transfer_mode: TransferMode,
    #[serde(default)]
    pub transfer_options: TransferOptions,
    #[serde(default)]
    pub requires_approval: bool,
}

/// The aggregate root of one transfer operation. All mutable state lives
/// here; strategies are stateless per invocation. Rows are mutated only
/// through the store's conditional updates, never rewritten wholesale.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceTransfer {
    pub id: Uuid,
    pub team_id: Uuid,
    pub user_id: Uuid,
    pub approved_by: Option<Uuid>,
    pub approved_at: Option<DateTime<Utc>>,
    pub source_kind: ResourceKind,
    pub source_id: Uuid,
    pub target_id: Option<Uuid>,
    pub target_environment_id: Uuid,
    pub target_server_id: Uuid,
    pub transfer_mode: TransferMode,
    pub transfer_options: TransferOptions,
    pub requires_approval: bool,
    pub status: TransferStatus,
    pub progress: u8,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_details: Option<Value>,
}

impl ResourceTransfer {
    pub fn is_awaiting_approval(&self) -> bool {
        self.requires_approval && self.status == TransferStatus::Pending
    }

    pub fn is_in_progress(&self) -> bool {
        self.status.is_in_progress()
    }

    pub fn can_be_cancelled(&self) -> bool {
        self.status.can_be_cancelled()
    }

    pub fn dispatch_plan(&self) -> DispatchPlan {
        if self.source_kind.is_database() {
            DispatchPlan::QueueJob
        } else {
            DispatchPlan::CloneAction
        }
    }

    pub fn status_label(&self) -> &'static str {
        self.status.label()
    }

    pub fn mode_label(&self) -> &'static str {
        self.transfer_mode.label()
    }

    pub fn formatted_progress(&self) -> String {
        format!("{}%", self.progress.min(100))
    }
}
