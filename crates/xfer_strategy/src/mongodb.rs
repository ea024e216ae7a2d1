use std::path::{Path, PathBuf};
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

/// Dump-and-restore over `mongodump`/`mongorestore`. Both tools work one
/// collection at a time: a restore is not atomic across collections, so a
/// mid-restore failure can leave some collections restored and others not.
/// That is a limitation of the toolchain, surfaced as a `failed` transfer
/// rather than hidden.
pub struct MongodbTransferStrategy {
    runner: Arc<dyn DumpToolRunner>,
}

impl MongodbTransferStrategy {
    pub fn new(runner: Arc<dyn DumpToolRunner>) -> Self {
        Self { runner }
    }

    fn base_invocation(
        program: &str,
        descriptor: &ConnectionDescriptor,
        auth_file: &Path,
    ) -> ToolInvocation {
        ToolInvocation::new(program)
            .arg("--host")
            .arg(&descriptor.host)
            .arg("--port")
            .arg(descriptor.port.to_string())
            .arg("--username")
            .arg(&descriptor.username)
            .arg("--config")
            .arg(auth_file.to_string_lossy())
    }

    /// The mongo tools read no password environment variable, so the
    /// password goes through a tools config file instead of argv, keeping it
    /// out of process listings. The file exists only for the duration of
    /// the tool runs.
    async fn stage_password(
        dir: &Path,
        file_name: &str,
        password: &str,
    ) -> Result<PathBuf, std::io::Error> {
        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(file_name);
        tokio::fs::write(&path, format!("password: {password}\n")).await?;
        Ok(path)
    }

    async fn dump(
        &self,
        source: &ConnectionDescriptor,
        collections: &[String],
        artifact_path: &Path,
        auth_file: &Path,
    ) -> Result<(), TransferError> {
        if collections.is_empty() {
            let invocation = Self::base_invocation("mongodump", source, auth_file)
                .arg("--db")
                .arg(&source.database)
                .arg("--out")
                .arg(artifact_path.to_string_lossy());
            self.runner.run(invocation).await.map_err(extraction_err)?;
        } else {
            // mongodump takes a single --collection per run.
            for collection in collections {
                let invocation = Self::base_invocation("mongodump", source, auth_file)
                    .arg("--db")
                    .arg(&source.database)
                    .arg("--collection")
                    .arg(collection)
                    .arg("--out")
                    .arg(artifact_path.to_string_lossy());
                self.runner.run(invocation).await.map_err(extraction_err)?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl TransferStrategy for MongodbTransferStrategy {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Mongodb
    }

    async fn extract(
        &self,
        source: &ConnectionDescriptor,
        options: &TransferOptions,
        mode: TransferMode,
        workdir: &Path,
    ) -> Result<ArtifactHandle, TransferError> {
        let collections = scoped_names(&options.collections, PathKind::Collection, source)?;
        require_scope_for_partial(mode, &collections, "collection")?;

        let dir_name = validate_path(&format!("{}-mongodump", source.database), PathKind::File)?;
        let artifact_path = workdir.join(dir_name);

        let auth_name =
            validate_path(&format!("{}-mongo-auth.yaml", source.database), PathKind::File)?;
        let auth_file = Self::stage_password(workdir, &auth_name, &source.password)
            .await
            .map_err(|e| TransferError::Extraction(format!("cannot stage mongo credentials: {e}")))?;

        let dumped = self.dump(source, &collections, &artifact_path, &auth_file).await;
        let _ = tokio::fs::remove_file(&auth_file).await;
        dumped?;

        info!(database = %source.database, collections = collections.len(), "mongodb extraction complete");

        Ok(ArtifactHandle {
            path: artifact_path,
            database: source.database.clone(),
            scoped_to: collections,
        })
    }

    async fn restore(
        &self,
        target: &ConnectionDescriptor,
        artifact: &ArtifactHandle,
        _options: &TransferOptions,
    ) -> Result<RestoreSummary, TransferError> {
        let workdir = artifact.path.parent().unwrap_or(Path::new("."));
        let auth_name =
            validate_path(&format!("{}-mongo-auth.yaml", target.database), PathKind::File)?;
        let auth_file = Self::stage_password(workdir, &auth_name, &target.password)
            .await
            .map_err(|e| TransferError::Restore(format!("cannot stage mongo credentials: {e}")))?;

        let dump_dir = artifact.path.join(&artifact.database);
        let invocation = Self::base_invocation("mongorestore", target, &auth_file)
            .arg("--db")
            .arg(&target.database)
            .arg("--drop")
            .arg(dump_dir.to_string_lossy());

        let restored = self.runner.run(invocation).await.map_err(restore_err);
        let _ = tokio::fs::remove_file(&auth_file).await;
        restored?;
        info!(database = %target.database, "mongodb restore complete");

        Ok(RestoreSummary {
            objects_restored: artifact.scoped_to.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::InMemoryToolRunner;
    use uuid::Uuid;

    fn workdir() -> PathBuf {
        std::env::temp_dir().join(format!("xfer-mongo-test-{}", Uuid::now_v7()))
    }

    fn descriptor(objects: &[&str]) -> ConnectionDescriptor {
        ConnectionDescriptor {
            host: "mongo.internal".into(),
            port: 27017,
            username: "app".into(),
            password: "hunter2".into(),
            database: "tracker".into(),
            objects: objects.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn one_dump_invocation_per_collection() {
        let runner = Arc::new(InMemoryToolRunner::new());
        let strategy = MongodbTransferStrategy::new(runner.clone());
        let options = TransferOptions {
            collections: vec!["events".into(), "sessions".into()],
            ..TransferOptions::default()
        };

        let dir = workdir();
        let artifact = strategy
            .extract(
                &descriptor(&["events", "sessions"]),
                &options,
                TransferMode::Partial,
                &dir,
            )
            .await
            .expect("extract");

        assert_eq!(artifact.scoped_to.len(), 2);
        let seen = runner.invocations();
        assert_eq!(seen.len(), 2);
        assert!(seen.iter().all(|i| i.program == "mongodump"));
        assert!(seen[0].args.windows(2).any(|w| w == ["--collection", "events"]));
        assert!(seen[1].args.windows(2).any(|w| w == ["--collection", "sessions"]));
    }

    #[tokio::test]
    async fn password_goes_through_staged_config_never_argv() {
        let runner = Arc::new(InMemoryToolRunner::new());
        let strategy = MongodbTransferStrategy::new(runner.clone());
        let dir = workdir();

        strategy
            .extract(
                &descriptor(&[]),
                &TransferOptions::default(),
                TransferMode::Clone,
                &dir,
            )
            .await
            .expect("extract");

        let seen = runner.invocations();
        assert!(!seen[0].args.iter().any(|a| a.contains("hunter2")));
        let config_pos = seen[0].args.iter().position(|a| a == "--config").expect("config flag");
        let config_path = PathBuf::from(&seen[0].args[config_pos + 1]);
        assert!(config_path.starts_with(&dir));
        // The staged credential file is removed once the tools have run.
        assert!(!config_path.exists());
    }

    #[tokio::test]
    async fn missing_collection_fails_extraction() {
        let runner = Arc::new(InMemoryToolRunner::new());
        let strategy = MongodbTransferStrategy::new(runner.clone());
        let options = TransferOptions {
            collections: vec!["orders".into()],
            ..TransferOptions::default()
        };

        let err = strategy
            .extract(&descriptor(&["events"]), &options, TransferMode::DataOnly, &workdir())
            .await
            .expect_err("missing collection");

        assert!(matches!(err, TransferError::Extraction(_)));
        assert!(err.to_string().contains("orders"));
        assert!(runner.invocations().is_empty());
    }

    #[tokio::test]
    async fn restore_points_at_the_source_database_dump() {
        let runner = Arc::new(InMemoryToolRunner::new());
        let strategy = MongodbTransferStrategy::new(runner.clone());
        let artifact = ArtifactHandle {
            path: workdir().join("tracker-mongodump"),
            database: "tracker".into(),
            scoped_to: vec!["events".into()],
        };

        strategy
            .restore(&descriptor(&[]), &artifact, &TransferOptions::default())
            .await
            .expect("restore");

        let seen = runner.invocations();
        assert_eq!(seen[0].program, "mongorestore");
        assert!(seen[0]
            .args
            .iter()
            .any(|a| a.ends_with("tracker-mongodump/tracker")));
        assert!(!seen[0].args.iter().any(|a| a.contains("hunter2")));
        assert!(seen[0].args.iter().any(|a| a == "--config"));
    }
}
