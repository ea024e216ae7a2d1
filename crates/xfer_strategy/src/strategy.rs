use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use xfer_core::{
    validate_path, ConnectionDescriptor, PathKind, ResourceKind, TransferError, TransferMode,
    TransferOptions,
};

use crate::mongodb::MongodbTransferStrategy;
use crate::mysql::MysqlTransferStrategy;
use crate::postgres::PostgresqlTransferStrategy;
use crate::runner::{DumpToolRunner, ToolError};

/// The intermediate dump produced by extraction and consumed by restore.
#[derive(Debug, Clone)]
pub struct ArtifactHandle {
    pub path: PathBuf,
    /// Source database name, used to locate the payload inside
    /// directory-shaped dumps.
    pub database: String,
    /// Tables or collections the artifact is scoped to; empty means the
    /// whole database.
    pub scoped_to: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct RestoreSummary {
    /// Number of explicitly scoped objects restored; 0 for a full-database
    /// restore.
    pub objects_restored: usize,
}

/// Type-specific mechanics of moving data from a source into a target.
/// Implementations are stateless per invocation; all mutable transfer state
/// lives on the `ResourceTransfer` record. A failure must leave the target
/// either untouched or reported as failed, never silently partial.
#[async_trait]
pub trait TransferStrategy: Send + Sync {
    fn kind(&self) -> ResourceKind;

    async fn extract(
        &self,
        source: &ConnectionDescriptor,
        options: &TransferOptions,
        mode: TransferMode,
        workdir: &Path,
    ) -> Result<ArtifactHandle, TransferError>;

    async fn restore(
        &self,
        target: &ConnectionDescriptor,
        artifact: &ArtifactHandle,
        options: &TransferOptions,
    ) -> Result<RestoreSummary, TransferError>;
}

/// Maps each database resource kind to its strategy. Built once at startup;
/// selection is a lookup on the kind tag, never string inspection.
pub struct StrategyRegistry {
    by_kind: HashMap<ResourceKind, Arc<dyn TransferStrategy>>,
}

impl StrategyRegistry {
    pub fn with_runner(runner: Arc<dyn DumpToolRunner>) -> Self {
        let strategies: [Arc<dyn TransferStrategy>; 3] = [
            Arc::new(PostgresqlTransferStrategy::new(runner.clone())),
            Arc::new(MysqlTransferStrategy::new(runner.clone())),
            Arc::new(MongodbTransferStrategy::new(runner)),
        ];

        let mut by_kind = HashMap::new();
        for strategy in strategies {
            by_kind.insert(strategy.kind(), strategy);
        }
        Self { by_kind }
    }

    pub fn get(&self, kind: ResourceKind) -> Option<Arc<dyn TransferStrategy>> {
        self.by_kind.get(&kind).cloned()
    }
}

/// Validates each requested name and confirms it exists on the source.
/// A name the source does not have is a hard extraction failure, not a
/// silent skip.
pub(crate) fn scoped_names(
    requested: &[String],
    kind: PathKind,
    source: &ConnectionDescriptor,
) -> Result<Vec<String>, TransferError> {
    let mut names = Vec::with_capacity(requested.len());
    for raw in requested {
        let name = validate_path(raw, kind)?;
        if !source.objects.iter().any(|have| have == &name) {
            return Err(TransferError::Extraction(format!(
                "{} {} does not exist on source database {}",
                kind.as_str(),
                name,
                source.database
            )));
        }
        names.push(name);
    }
    Ok(names)
}

/// A `partial` transfer without an allow-list has nothing to select.
pub(crate) fn require_scope_for_partial(
    mode: TransferMode,
    scoped: &[String],
    what: &'static str,
) -> Result<(), TransferError> {
    if mode == TransferMode::Partial && scoped.is_empty() {
        return Err(TransferError::Extraction(format!(
            "partial transfer requested without a {what} allow-list"
        )));
    }
    Ok(())
}

pub(crate) fn extraction_err(err: ToolError) -> TransferError {
    TransferError::Extraction(err.to_string())
}

pub(crate) fn restore_err(err: ToolError) -> TransferError {
    TransferError::Restore(err.to_string())
}
