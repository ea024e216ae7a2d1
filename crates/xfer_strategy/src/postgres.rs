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

/// Dump-and-restore over `pg_dump`/`pg_restore`. Extraction uses the custom
/// (compressed) archive format; restore runs inside a single transaction so
/// a failed restore rolls back instead of leaving partial data.
pub struct PostgresqlTransferStrategy {
    runner: Arc<dyn DumpToolRunner>,
}

impl PostgresqlTransferStrategy {
    pub fn new(runner: Arc<dyn DumpToolRunner>) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl TransferStrategy for PostgresqlTransferStrategy {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Postgresql
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

        let file_name = validate_path(&format!("{}.dump", source.database), PathKind::File)?;
        let artifact_path = workdir.join(file_name);

        let mut invocation = ToolInvocation::new("pg_dump")
            .arg("--format=custom")
            .arg("--host")
            .arg(&source.host)
            .arg("--port")
            .arg(source.port.to_string())
            .arg("--username")
            .arg(&source.username)
            .arg("--dbname")
            .arg(&source.database)
            .arg("--file")
            .arg(artifact_path.to_string_lossy())
            .env("PGPASSWORD", &source.password);
        for table in &tables {
            invocation = invocation.arg("--table").arg(table);
        }

        self.runner.run(invocation).await.map_err(extraction_err)?;
        info!(database = %source.database, tables = tables.len(), "postgres extraction complete");

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
        let invocation = ToolInvocation::new("pg_restore")
            .arg("--single-transaction")
            .arg("--clean")
            .arg("--if-exists")
            .arg("--no-owner")
            .arg("--host")
            .arg(&target.host)
            .arg("--port")
            .arg(target.port.to_string())
            .arg("--username")
            .arg(&target.username)
            .arg("--dbname")
            .arg(&target.database)
            .arg(artifact.path.to_string_lossy())
            .env("PGPASSWORD", &target.password);

        self.runner.run(invocation).await.map_err(restore_err)?;
        info!(database = %target.database, "postgres restore complete");

        Ok(RestoreSummary {
            objects_restored: artifact.scoped_to.len(),
        })
    }
}
