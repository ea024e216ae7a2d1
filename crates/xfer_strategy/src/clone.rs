use uuid::Uuid;

use tracing::info;
use xfer_core::{
    ResourceCatalog, ResourceConfig, ResourceKind, TransferError, TransferOptions,
    VolumeDefinition,
};

/// Inputs for a configuration-only clone of an application or service.
#[derive(Debug, Clone)]
pub struct CloneRequest<'a> {
    pub kind: ResourceKind,
    pub source_id: Uuid,
    pub target_environment_id: Uuid,
    pub target_server_id: Uuid,
    pub options: &'a TransferOptions,
}

/// Duplicates a non-database resource's configuration into a new resource
/// under the target environment and server, returning the new resource id.
/// No data moves. Environment variables, including secrets, are copied into
/// the clone as its own values, and volumes get fresh names, so source and
/// target stay independently mutable afterwards.
pub async fn clone_resource(
    catalog: &dyn ResourceCatalog,
    request: CloneRequest<'_>,
) -> Result<Uuid, TransferError> {
    debug_assert!(!request.kind.is_database(), "clone actions are for configuration-only resources");

    if !catalog.environment_exists(request.target_environment_id).await? {
        return Err(TransferError::TargetNotFound {
            what: "environment",
            id: request.target_environment_id,
        });
    }
    if !catalog.server_exists(request.target_server_id).await? {
        return Err(TransferError::TargetNotFound {
            what: "server",
            id: request.target_server_id,
        });
    }

    let source = catalog.resource(request.kind, request.source_id).await?;
    let suffix = clone_suffix();

    let volumes = if request.options.include_volumes {
        source
            .volumes
            .iter()
            .map(|volume| VolumeDefinition {
                name: format!("{}-{suffix}", volume.name),
                mount_path: volume.mount_path.clone(),
                host_path: volume.host_path.clone(),
            })
            .collect()
    } else {
        Vec::new()
    };

    let config = ResourceConfig {
        name: format!("{}-clone-{suffix}", source.name),
        env_vars: source.env_vars.clone(),
        volumes,
        settings: source.settings.clone(),
    };

    let target_id = catalog
        .create_resource(request.kind, config, request.target_environment_id, request.target_server_id)
        .await?;

    info!(kind = %request.kind, source = %request.source_id, target = %target_id, "resource configuration cloned");
    Ok(target_id)
}

fn clone_suffix() -> String {
    let id = Uuid::now_v7().simple().to_string();
    id[..8].to_string()
}
