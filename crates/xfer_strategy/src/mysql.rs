use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use xfer_core::{
    validate_path, ConnectionDescriptor, PathKind, ResourceKind, TransferError, TransferMode,
    TransferOptions,
};

use crate::runner::{DumpToolRunner, ToolInvocation};
use crate::strategy::{
    extraction_err, require_scope_for_partial, restore_err, scoped_names, ArtifactHandle,
    RestoreSummary, TransferStrategy,
};

/// Dump-and-restore over `mysqldump`/`mysql`. The dump takes a consistent
/// snapshot via `--single-transaction`; the restore replays the SQL file
/// through the client, which applies the dump's own transaction framing.
pub struct MysqlTransferStrategy {
    runner: Arc<dyn DumpToolRunner>,
}

impl MysqlTransferStrategy {
    pub fn new(runner: Arc<dyn DumpToolRunner>) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl TransferStrategy for MysqlTransferStrategy {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Mysql
    }

    async fn extract(
        &self,
        source: &ConnectionDescriptor,
        options: &TransferOptions,
        mode: TransferMode,
        workdir: &Path,
    ) -> Result<ArtifactHandle, TransferError> {
        let tables = scoped_names(&options.tables, PathKind::Table, source)?;
        require_scope_for_partial(mode, &tables, "table")?;

        let file_name = validate_path(&format!("{}.sql", source.database), PathKind::File)?;
        let artifact_path = workdir.join(file_name);

        let mut invocation = ToolInvocation::new("mysqldump")
            .arg("--single-transaction")
            .arg("--host")
            .arg(&source.host)
            .arg("--port")
            .arg(source.port.to_string())
            .arg("--user")
            .arg(&source.username)
            .arg(format!("--result-file={}", artifact_path.to_string_lossy()))
            .arg(&source.database)
            .env("MYSQL_PWD", &source.password);
        for table in &tables {
            invocation = invocation.arg(table);
        }

        self.runner.run(invocation).await.map_err(extraction_err)?;
        info!(database = %source.database, tables = tables.len(), "mysql extraction complete");

        Ok(ArtifactHandle {
            path: artifact_path,
            database: source.database.clone(),
            scoped_to: tables,
        })
    }

    async fn restore(
        &self,
        target: &ConnectionDescriptor,
        artifact: &ArtifactHandle,
        _options: &TransferOptions,
    ) -> Result<RestoreSummary, TransferError> {
        let invocation = ToolInvocation::new("mysql")
            .arg("--host")
            .arg(&target.host)
            .arg("--port")
            .arg(target.port.to_string())
            .arg("--user")
            .arg(&target.username)
            .arg(&target.database)
            .env("MYSQL_PWD", &target.password)
            .stdin_file(&artifact.path);

        self.runner.run(invocation).await.map_err(restore_err)?;
        info!(database = %target.database, "mysql restore complete");

        Ok(RestoreSummary {
            objects_restored: artifact.scoped_to.len(),
        })
    }
}
