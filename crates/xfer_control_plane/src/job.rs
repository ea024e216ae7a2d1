use serde_json::json;
use tracing::{error, info, warn};
use uuid::Uuid;

use xfer_core::{DispatchPlan, ResourceConfig, ResourceTransfer, TransferError, TransferStatus};
use xfer_strategy::{clone_resource, ArtifactHandle, CloneRequest};

use crate::app::{emit, AppState};

/// Routes an approved (or ungated) transfer to its execution path.
/// Application and service sources clone synchronously; database sources go
/// to a fire-and-forget worker task. Either way the `preparing` transition
/// has already committed, so a crash here leaves an observable row, not a
/// wedged transaction.
pub async fn dispatch(state: &AppState, transfer: &ResourceTransfer) {
    match transfer.dispatch_plan() {
        DispatchPlan::CloneAction => run_clone(state.clone(), transfer.clone()).await,
        DispatchPlan::QueueJob => {
            let state = state.clone();
            let transfer_id = transfer.id;
            tokio::spawn(async move {
                run_transfer_job(state, transfer_id).await;
            });
        }
    }
}

/// Synchronous configuration-only clone. Engine failures never escape: they
/// are recorded on the transfer row as `failed`.
pub async fn run_clone(state: AppState, transfer: ResourceTransfer) {
    if let Err(err) = try_run_clone(&state, &transfer).await {
        record_failure(&state, transfer.id, &err).await;
    }
}

async fn try_run_clone(state: &AppState, transfer: &ResourceTransfer) -> Result<(), TransferError> {
    let id = transfer.id;
    if !state
        .store
        .advance_status(id, TransferStatus::Preparing, TransferStatus::Transferring)
        .await?
    {
        info!(transfer_id = %id, "transfer no longer preparing; skipping clone");
        return Ok(());
    }
    state.store.update_progress(id, 25).await?;
    emit(state, "transfer.progress", json!({ "transfer_id": id, "progress": 25 }));

    let target_id = clone_resource(
        state.catalog.as_ref(),
        CloneRequest {
            kind: transfer.source_kind,
            source_id: transfer.source_id,
            target_environment_id: transfer.target_environment_id,
            target_server_id: transfer.target_server_id,
            options: &transfer.transfer_options,
        },
    )
    .await?;
    state.store.set_target(id, target_id).await?;

    if !state
        .store
        .advance_status(id, TransferStatus::Transferring, TransferStatus::Restoring)
        .await?
    {
        info!(transfer_id = %id, "transfer cancelled mid-clone; target resource kept");
        return Ok(());
    }
    state.store.update_progress(id, 75).await?;
    emit(state, "transfer.progress", json!({ "transfer_id": id, "progress": 75 }));

    if state.store.mark_completed(id).await? {
        emit(
            state,
            "transfer.status.changed",
            json!({ "transfer_id": id, "status": TransferStatus::Completed }),
        );
        info!(transfer_id = %id, target_id = %target_id, "clone transfer completed");
    }
    Ok(())
}

/// Async executor for database transfers. Safe under at-least-once queue
/// delivery: only a row still in `preparing` is picked up, and every phase
/// boundary re-checks via a conditional update, so a cancellation lands
/// before the next phase starts.
pub async fn run_transfer_job(state: AppState, transfer_id: Uuid) {
    if let Err(err) = try_run_transfer(&state, transfer_id).await {
        record_failure(&state, transfer_id, &err).await;
    }
}

async fn try_run_transfer(state: &AppState, transfer_id: Uuid) -> Result<(), TransferError> {
    let Some(transfer) = state.store.get_transfer(transfer_id).await? else {
        warn!(transfer_id = %transfer_id, "transfer vanished before job start");
        return Ok(());
    };
    if transfer.status != TransferStatus::Preparing {
        info!(
            transfer_id = %transfer_id,
            status = %transfer.status,
            "skipping job; transfer is not preparing"
        );
        return Ok(());
    }

    let strategy = state.strategies.get(transfer.source_kind).ok_or_else(|| {
        TransferError::Extraction(format!("no transfer strategy for {}", transfer.source_kind))
    })?;
    let source = state
        .catalog
        .connection(transfer.source_kind, transfer.source_id)
        .await?;

    if !state
        .store
        .advance_status(transfer_id, TransferStatus::Preparing, TransferStatus::Transferring)
        .await?
    {
        info!(transfer_id = %transfer_id, "cancelled before extraction");
        return Ok(());
    }
    state.store.update_progress(transfer_id, 10).await?;
    emit(state, "transfer.progress", json!({ "transfer_id": transfer_id, "progress": 10 }));

    tokio::fs::create_dir_all(&state.workdir)
        .await
        .map_err(|e| TransferError::Storage(format!("cannot create workdir: {e}")))?;

    let artifact = strategy
        .extract(&source, &transfer.transfer_options, transfer.transfer_mode, &state.workdir)
        .await?;
    state.store.update_progress(transfer_id, 50).await?;
    emit(state, "transfer.progress", json!({ "transfer_id": transfer_id, "progress": 50 }));

    // Cheap pre-check before provisioning a target for a cancelled transfer;
    // the conditional update below remains the authoritative gate.
    let current = state.store.require_transfer(transfer_id).await?;
    if current.status != TransferStatus::Transferring {
        info!(transfer_id = %transfer_id, "cancelled after extraction; discarding artifact");
        discard_artifact(&artifact).await;
        return Ok(());
    }

    let (target_id, target) = match transfer.target_id {
        Some(existing) => {
            let connection = state
                .catalog
                .connection(transfer.source_kind, existing)
                .await?;
            (existing, connection)
        }
        None => {
            // Clone mode: the engine creates the target database now,
            // duplicating the source resource's configuration.
            let source_config = state
                .catalog
                .resource(transfer.source_kind, transfer.source_id)
                .await?;
            let config = ResourceConfig {
                name: format!("{}_clone", source_config.name),
                ..source_config
            };
            let provisioned = state
                .catalog
                .provision_database(
                    transfer.source_kind,
                    config,
                    transfer.target_environment_id,
                    transfer.target_server_id,
                )
                .await?;
            state.store.set_target(transfer_id, provisioned.id).await?;
            (provisioned.id, provisioned.connection)
        }
    };

    if !state
        .store
        .advance_status(transfer_id, TransferStatus::Transferring, TransferStatus::Restoring)
        .await?
    {
        info!(transfer_id = %transfer_id, "cancelled before restore; target resource kept");
        discard_artifact(&artifact).await;
        return Ok(());
    }
    state.store.update_progress(transfer_id, 75).await?;
    emit(state, "transfer.progress", json!({ "transfer_id": transfer_id, "progress": 75 }));

    strategy
        .restore(&target, &artifact, &transfer.transfer_options)
        .await?;

    if state.store.mark_completed(transfer_id).await? {
        emit(
            state,
            "transfer.status.changed",
            json!({ "transfer_id": transfer_id, "status": TransferStatus::Completed }),
        );
        info!(transfer_id = %transfer_id, target_id = %target_id, "database transfer completed");
    }
    discard_artifact(&artifact).await;
    Ok(())
}

/// Records an engine failure on the row. Secrets never reach
/// `error_details`: credentials only travel in tool environment variables
/// and connection descriptors, neither of which is stringified into errors.
async fn record_failure(state: &AppState, transfer_id: Uuid, err: &TransferError) {
    error!(transfer_id = %transfer_id, error = %err, "transfer failed");
    let details = json!({ "error": err.kind_str(), "message": err.to_string() });

    match state.store.mark_failed(transfer_id, &details).await {
        Ok(true) => emit(
            state,
            "transfer.status.changed",
            json!({ "transfer_id": transfer_id, "status": TransferStatus::Failed }),
        ),
        Ok(false) => warn!(transfer_id = %transfer_id, "failure reported on a settled transfer"),
        Err(store_err) => {
            error!(transfer_id = %transfer_id, error = %store_err, "could not record transfer failure");
        }
    }
}

/// Best effort; a leftover artifact is a cleanup concern, not a failure.
async fn discard_artifact(artifact: &ArtifactHandle) {
    if tokio::fs::remove_file(&artifact.path).await.is_err() {
        let _ = tokio::fs::remove_dir_all(&artifact.path).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::AppState;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Arc;
    use xfer_core::{
        ConnectionDescriptor, EnvVar, InMemoryResourceCatalog, NewTransfer, ProvisionedDatabase,
        ResourceCatalog, ResourceKind, TransferMode, TransferOptions,
    };
    use xfer_storage::TransferStore;
    use xfer_strategy::{
        DumpToolRunner, InMemoryToolRunner, StrategyRegistry, ToolError, ToolInvocation,
        ToolOutput,
    };

    struct Fixture {
        state: AppState,
        catalog: Arc<InMemoryResourceCatalog>,
        runner: Arc<InMemoryToolRunner>,
        environment_id: Uuid,
        server_id: Uuid,
    }

    async fn fixture() -> Fixture {
        let store = TransferStore::connect_in_memory().await.expect("store");
        let catalog = Arc::new(InMemoryResourceCatalog::new());
        let runner = Arc::new(InMemoryToolRunner::new());
        let strategies = Arc::new(StrategyRegistry::with_runner(runner.clone()));
        let workdir = std::env::temp_dir().join(format!("xfer-job-test-{}", Uuid::now_v7()));

        let environment_id = Uuid::now_v7();
        let server_id = Uuid::now_v7();
        catalog.insert_environment(environment_id);
        catalog.insert_server(server_id);

        let state = AppState::new(store, catalog.clone(), strategies, workdir, None, false);
        Fixture {
            state,
            catalog,
            runner,
            environment_id,
            server_id,
        }
    }

    fn request(fixture: &Fixture, kind: ResourceKind, source_id: Uuid) -> NewTransfer {
        NewTransfer {
            team_id: Uuid::now_v7(),
            user_id: Uuid::now_v7(),
            source_kind: kind,
            source_id,
            target_id: None,
            target_environment_id: fixture.environment_id,
            target_server_id: fixture.server_id,
            transfer_mode: TransferMode::Clone,
            transfer_options: TransferOptions::default(),
            requires_approval: false,
        }
    }

    fn postgres_source(fixture: &Fixture, objects: &[&str]) -> Uuid {
        let source_id = Uuid::now_v7();
        fixture.catalog.insert_connection(
            ResourceKind::Postgresql,
            source_id,
            ConnectionDescriptor {
                host: "pg.internal".into(),
                port: 5432,
                username: "app".into(),
                password: "hunter2".into(),
                database: "appdb".into(),
                objects: objects.iter().map(|s| s.to_string()).collect(),
            },
        );
        fixture.catalog.insert_resource(
            ResourceKind::Postgresql,
            source_id,
            xfer_core::ResourceConfig {
                name: "appdb".into(),
                env_vars: Vec::new(),
                volumes: Vec::new(),
                settings: json!({}),
            },
        );
        source_id
    }

    #[tokio::test]
    async fn application_clone_completes_synchronously_with_target_set() {
        let fixture = fixture().await;
        let source_id = Uuid::now_v7();
        fixture.catalog.insert_resource(
            ResourceKind::Application,
            source_id,
            xfer_core::ResourceConfig {
                name: "billing-api".into(),
                env_vars: vec![EnvVar {
                    key: "APP_KEY".into(),
                    value: "secret".into(),
                    is_secret: true,
                }],
                volumes: Vec::new(),
                settings: json!({}),
            },
        );

        let created = fixture
            .state
            .store
            .create_transfer(&request(&fixture, ResourceKind::Application, source_id))
            .await
            .expect("create");
        let begun = fixture.state.store.begin(created.id).await.expect("begin");
        let mut events = fixture.state.sse_bus.subscribe();
        dispatch(&fixture.state, &begun).await;

        let done = fixture
            .state
            .store
            .require_transfer(created.id)
            .await
            .expect("reload");
        assert_eq!(done.status, TransferStatus::Completed);
        assert_eq!(done.progress, 100);
        assert!(done.target_id.is_some());
        assert!(done.completed_at.is_some());
        assert_eq!(fixture.catalog.created_resources().len(), 1);
        assert!(fixture.runner.invocations().is_empty(), "clones move no data");

        let mut progress = Vec::new();
        while let Ok(update) = events.try_recv() {
            if update.event_type == "transfer.progress" {
                progress.push(update.data["progress"].as_u64().expect("progress value"));
            }
        }
        assert_eq!(progress, vec![25, 75]);
    }

    #[tokio::test]
    async fn postgres_clone_runs_dump_then_restore_into_provisioned_target() {
        let fixture = fixture().await;
        let source_id = postgres_source(&fixture, &["users", "orders"]);

        let created = fixture
            .state
            .store
            .create_transfer(&request(&fixture, ResourceKind::Postgresql, source_id))
            .await
            .expect("create");
        fixture.state.store.begin(created.id).await.expect("begin");
        run_transfer_job(fixture.state.clone(), created.id).await;

        let done = fixture
            .state
            .store
            .require_transfer(created.id)
            .await
            .expect("reload");
        assert_eq!(done.status, TransferStatus::Completed);
        assert_eq!(done.progress, 100);
        assert!(done.target_id.is_some());

        let programs: Vec<String> = fixture
            .runner
            .invocations()
            .into_iter()
            .map(|i| i.program)
            .collect();
        assert_eq!(programs, vec!["pg_dump", "pg_restore"]);
    }

    #[tokio::test]
    async fn duplicate_queue_delivery_is_a_clean_no_op() {
        let fixture = fixture().await;
        let source_id = postgres_source(&fixture, &[]);

        let created = fixture
            .state
            .store
            .create_transfer(&request(&fixture, ResourceKind::Postgresql, source_id))
            .await
            .expect("create");
        fixture.state.store.begin(created.id).await.expect("begin");

        run_transfer_job(fixture.state.clone(), created.id).await;
        let after_first = fixture.runner.invocations().len();
        run_transfer_job(fixture.state.clone(), created.id).await;

        assert_eq!(fixture.runner.invocations().len(), after_first);
        let done = fixture
            .state
            .store
            .require_transfer(created.id)
            .await
            .expect("reload");
        assert_eq!(done.status, TransferStatus::Completed);
    }

    #[tokio::test]
    async fn injection_payload_fails_validation_before_any_command() {
        let fixture = fixture().await;
        let source_id = postgres_source(&fixture, &["users"]);

        let mut new = request(&fixture, ResourceKind::Postgresql, source_id);
        new.transfer_options.tables = vec!["users; DROP TABLE users--".into()];
        let created = fixture.state.store.create_transfer(&new).await.expect("create");
        fixture.state.store.begin(created.id).await.expect("begin");
        run_transfer_job(fixture.state.clone(), created.id).await;

        let failed = fixture
            .state
            .store
            .require_transfer(created.id)
            .await
            .expect("reload");
        assert_eq!(failed.status, TransferStatus::Failed);
        let details = failed.error_details.expect("details");
        assert_eq!(details["error"], "validation");
        assert!(fixture.runner.invocations().is_empty());
    }

    #[tokio::test]
    async fn missing_mongo_collection_fails_the_transfer() {
        let fixture = fixture().await;
        let source_id = Uuid::now_v7();
        fixture.catalog.insert_connection(
            ResourceKind::Mongodb,
            source_id,
            ConnectionDescriptor {
                host: "mongo.internal".into(),
                port: 27017,
                username: "app".into(),
                password: "hunter2".into(),
                database: "tracker".into(),
                objects: vec!["events".into()],
            },
        );

        let mut new = request(&fixture, ResourceKind::Mongodb, source_id);
        new.transfer_options.collections = vec!["orders".into()];
        let created = fixture.state.store.create_transfer(&new).await.expect("create");
        fixture.state.store.begin(created.id).await.expect("begin");
        run_transfer_job(fixture.state.clone(), created.id).await;

        let failed = fixture
            .state
            .store
            .require_transfer(created.id)
            .await
            .expect("reload");
        assert_eq!(failed.status, TransferStatus::Failed);
        assert!(failed.completed_at.is_some());
        let details = failed.error_details.expect("details");
        assert_eq!(details["error"], "extraction");
        assert!(details["message"].as_str().expect("message").contains("orders"));
        assert!(fixture.runner.invocations().is_empty());
    }

    #[tokio::test]
    async fn failed_restore_is_recorded_without_leaking_credentials() {
        let fixture = fixture().await;
        let source_id = postgres_source(&fixture, &[]);
        fixture.runner.fail_on_program("pg_restore");

        let created = fixture
            .state
            .store
            .create_transfer(&request(&fixture, ResourceKind::Postgresql, source_id))
            .await
            .expect("create");
        fixture.state.store.begin(created.id).await.expect("begin");
        run_transfer_job(fixture.state.clone(), created.id).await;

        let failed = fixture
            .state
            .store
            .require_transfer(created.id)
            .await
            .expect("reload");
        assert_eq!(failed.status, TransferStatus::Failed);
        let details = failed.error_details.expect("details");
        assert_eq!(details["error"], "restore");
        assert!(!details["message"].as_str().expect("message").contains("hunter2"));
    }

    /// Cancels the transfer from inside the extraction call, the way an
    /// operator would while a dump is running.
    struct CancelDuringExtract {
        inner: InMemoryToolRunner,
        store: TransferStore,
        transfer_id: std::sync::Mutex<Option<Uuid>>,
    }

    #[async_trait]
    impl DumpToolRunner for CancelDuringExtract {
        async fn run(&self, invocation: ToolInvocation) -> Result<ToolOutput, ToolError> {
            let pending = self.transfer_id.lock().expect("lock").take();
            if let Some(id) = pending {
                self.store.cancel(id).await.expect("cancel while extracting");
            }
            self.inner.run(invocation).await
        }
    }

    #[tokio::test]
    async fn cancellation_during_extraction_halts_before_restore() {
        let store = TransferStore::connect_in_memory().await.expect("store");
        let catalog = Arc::new(InMemoryResourceCatalog::new());
        let environment_id = Uuid::now_v7();
        let server_id = Uuid::now_v7();
        catalog.insert_environment(environment_id);
        catalog.insert_server(server_id);

        let runner = Arc::new(CancelDuringExtract {
            inner: InMemoryToolRunner::new(),
            store: store.clone(),
            transfer_id: std::sync::Mutex::new(None),
        });
        let strategies = Arc::new(StrategyRegistry::with_runner(runner.clone()));
        let workdir = std::env::temp_dir().join(format!("xfer-job-test-{}", Uuid::now_v7()));
        let state = AppState::new(store, catalog.clone(), strategies, workdir, None, false);

        let source_id = Uuid::now_v7();
        catalog.insert_connection(
            ResourceKind::Postgresql,
            source_id,
            ConnectionDescriptor {
                host: "pg.internal".into(),
                port: 5432,
                username: "app".into(),
                password: "hunter2".into(),
                database: "appdb".into(),
                objects: Vec::new(),
            },
        );

        let created = state
            .store
            .create_transfer(&NewTransfer {
                team_id: Uuid::now_v7(),
                user_id: Uuid::now_v7(),
                source_kind: ResourceKind::Postgresql,
                source_id,
                target_id: None,
                target_environment_id: environment_id,
                target_server_id: server_id,
                transfer_mode: TransferMode::Clone,
                transfer_options: TransferOptions::default(),
                requires_approval: false,
            })
            .await
            .expect("create");
        state.store.begin(created.id).await.expect("begin");
        *runner.transfer_id.lock().expect("lock") = Some(created.id);

        run_transfer_job(state.clone(), created.id).await;

        let halted = state.store.require_transfer(created.id).await.expect("reload");
        assert_eq!(halted.status, TransferStatus::Cancelled);
        assert!(halted.completed_at.is_some());
        // The job observed the cancellation and never provisioned or restored.
        assert!(halted.target_id.is_none());
        assert!(catalog.created_resources().is_empty());
        let programs: Vec<String> = runner
            .inner
            .invocations()
            .into_iter()
            .map(|i| i.program)
            .collect();
        assert_eq!(programs, vec!["pg_dump"]);
    }

    /// Cancels the transfer while the target database is being provisioned,
    /// after extraction has already succeeded.
    struct CancelDuringProvision {
        inner: InMemoryResourceCatalog,
        store: TransferStore,
        transfer_id: std::sync::Mutex<Option<Uuid>>,
    }

    #[async_trait]
    impl ResourceCatalog for CancelDuringProvision {
        async fn connection(
            &self,
            kind: ResourceKind,
            id: Uuid,
        ) -> Result<ConnectionDescriptor, TransferError> {
            self.inner.connection(kind, id).await
        }

        async fn resource(
            &self,
            kind: ResourceKind,
            id: Uuid,
        ) -> Result<ResourceConfig, TransferError> {
            self.inner.resource(kind, id).await
        }

        async fn environment_exists(&self, id: Uuid) -> Result<bool, TransferError> {
            self.inner.environment_exists(id).await
        }

        async fn server_exists(&self, id: Uuid) -> Result<bool, TransferError> {
            self.inner.server_exists(id).await
        }

        async fn create_resource(
            &self,
            kind: ResourceKind,
            config: ResourceConfig,
            environment_id: Uuid,
            server_id: Uuid,
        ) -> Result<Uuid, TransferError> {
            self.inner.create_resource(kind, config, environment_id, server_id).await
        }

        async fn provision_database(
            &self,
            kind: ResourceKind,
            config: ResourceConfig,
            environment_id: Uuid,
            server_id: Uuid,
        ) -> Result<ProvisionedDatabase, TransferError> {
            let pending = self.transfer_id.lock().expect("lock").take();
            if let Some(id) = pending {
                self.store.cancel(id).await.expect("cancel while provisioning");
            }
            self.inner.provision_database(kind, config, environment_id, server_id).await
        }
    }

    #[tokio::test]
    async fn cancellation_during_provisioning_keeps_the_provisioned_target() {
        let store = TransferStore::connect_in_memory().await.expect("store");
        let environment_id = Uuid::now_v7();
        let server_id = Uuid::now_v7();

        let catalog = Arc::new(CancelDuringProvision {
            inner: InMemoryResourceCatalog::new(),
            store: store.clone(),
            transfer_id: std::sync::Mutex::new(None),
        });
        catalog.inner.insert_environment(environment_id);
        catalog.inner.insert_server(server_id);

        let source_id = Uuid::now_v7();
        catalog.inner.insert_connection(
            ResourceKind::Postgresql,
            source_id,
            ConnectionDescriptor {
                host: "pg.internal".into(),
                port: 5432,
                username: "app".into(),
                password: "hunter2".into(),
                database: "appdb".into(),
                objects: Vec::new(),
            },
        );
        catalog.inner.insert_resource(
            ResourceKind::Postgresql,
            source_id,
            ResourceConfig {
                name: "appdb".into(),
                env_vars: Vec::new(),
                volumes: Vec::new(),
                settings: json!({}),
            },
        );

        let runner = Arc::new(InMemoryToolRunner::new());
        let strategies = Arc::new(StrategyRegistry::with_runner(runner.clone()));
        let workdir = std::env::temp_dir().join(format!("xfer-job-test-{}", Uuid::now_v7()));
        let state = AppState::new(store, catalog.clone(), strategies, workdir, None, false);

        let created = state
            .store
            .create_transfer(&NewTransfer {
                team_id: Uuid::now_v7(),
                user_id: Uuid::now_v7(),
                source_kind: ResourceKind::Postgresql,
                source_id,
                target_id: None,
                target_environment_id: environment_id,
                target_server_id: server_id,
                transfer_mode: TransferMode::Clone,
                transfer_options: TransferOptions::default(),
                requires_approval: false,
            })
            .await
            .expect("create");
        state.store.begin(created.id).await.expect("begin");
        *catalog.transfer_id.lock().expect("lock") = Some(created.id);

        run_transfer_job(state.clone(), created.id).await;

        let halted = state.store.require_transfer(created.id).await.expect("reload");
        assert_eq!(halted.status, TransferStatus::Cancelled);
        assert!(halted.completed_at.is_some());
        // Provisioning had already happened, so the target exists and stays
        // recorded on the transfer; only the restore is skipped.
        assert!(halted.target_id.is_some());
        assert_eq!(catalog.inner.created_resources().len(), 1);
        let programs: Vec<String> = runner
            .invocations()
            .into_iter()
            .map(|i| i.program)
            .collect();
        assert_eq!(programs, vec!["pg_dump"]);
    }
}
