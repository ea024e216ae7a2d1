use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::TransferError;
use crate::resource::{ConnectionDescriptor, ResourceConfig, ResourceKind};

/// A freshly provisioned database target: its catalog id plus how to
/// reach it for the restore.
#[derive(Debug, Clone)]
pub struct ProvisionedDatabase {
    pub id: Uuid,
    pub connection: ConnectionDescriptor,
}

/// Lookup contract owned by the application/service/database model layer.
/// The engine resolves connection descriptors and resource configuration
/// through this seam and creates clone targets through it; it never talks to
/// the catalog's own storage directly.
#[async_trait]
pub trait ResourceCatalog: Send + Sync {
    async fn connection(
        &self,
        kind: ResourceKind,
        id: Uuid,
    ) -> Result<ConnectionDescriptor, TransferError>;

    async fn resource(&self, kind: ResourceKind, id: Uuid) -> Result<ResourceConfig, TransferError>;

    async fn environment_exists(&self, id: Uuid) -> Result<bool, TransferError>;

    async fn server_exists(&self, id: Uuid) -> Result<bool, TransferError>;

    /// Registers a freshly cloned resource under the target environment and
    /// server, returning its new id.
    async fn create_resource(
        &self,
        kind: ResourceKind,
        config: ResourceConfig,
        environment_id: Uuid,
        server_id: Uuid,
    ) -> Result<Uuid, TransferError>;

    /// Provisions an empty database of the given kind on the target server
    /// and returns its id and connection. Used by database `clone`
    /// transfers, which create their own target before restoring into it.
    async fn provision_database(
        &self,
        kind: ResourceKind,
        config: ResourceConfig,
        environment_id: Uuid,
        server_id: Uuid,
    ) -> Result<ProvisionedDatabase, TransferError>;
}

#[derive(Default)]
struct CatalogState {
    connections: HashMap<(ResourceKind, Uuid), ConnectionDescriptor>,
    resources: HashMap<(ResourceKind, Uuid), ResourceConfig>,
    environments: HashSet<Uuid>,
    servers: HashSet<Uuid>,
    created: Vec<(ResourceKind, Uuid)>,
}

/// In-memory catalog used by tests and local experiments.
#[derive(Default)]
pub struct InMemoryResourceCatalog {
    state: Mutex<CatalogState>,
}

impl InMemoryResourceCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_connection(&self, kind: ResourceKind, id: Uuid, descriptor: ConnectionDescriptor) {
        let mut state = self.state.lock().expect("catalog lock");
        state.connections.insert((kind, id), descriptor);
    }

    pub fn insert_resource(&self, kind: ResourceKind, id: Uuid, config: ResourceConfig) {
        let mut state = self.state.lock().expect("catalog lock");
        state.resources.insert((kind, id), config);
    }

    pub fn insert_environment(&self, id: Uuid) {
        let mut state = self.state.lock().expect("catalog lock");
        state.environments.insert(id);
    }

    pub fn insert_server(&self, id: Uuid) {
        let mut state = self.state.lock().expect("catalog lock");
        state.servers.insert(id);
    }

    /// Ids of resources created through `create_resource`, in order.
    pub fn created_resources(&self) -> Vec<(ResourceKind, Uuid)> {
        self.state.lock().expect("catalog lock").created.clone()
    }
}

#[async_trait]
impl ResourceCatalog for InMemoryResourceCatalog {
    async fn connection(
        &self,
        kind: ResourceKind,
        id: Uuid,
    ) -> Result<ConnectionDescriptor, TransferError> {
        let state = self.state.lock().expect("catalog lock");
        state
            .connections
            .get(&(kind, id))
            .cloned()
            .ok_or(TransferError::ResourceNotFound { kind, id })
    }

    async fn resource(&self, kind: ResourceKind, id: Uuid) -> Result<ResourceConfig, TransferError> {
        let state = self.state.lock().expect("catalog lock");
        state
            .resources
            .get(&(kind, id))
            .cloned()
            .ok_or(TransferError::ResourceNotFound { kind, id })
    }

    async fn environment_exists(&self, id: Uuid) -> Result<bool, TransferError> {
        Ok(self.state.lock().expect("catalog lock").environments.contains(&id))
    }

    async fn server_exists(&self, id: Uuid) -> Result<bool, TransferError> {
        Ok(self.state.lock().expect("catalog lock").servers.contains(&id))
    }

    async fn create_resource(
        &self,
        kind: ResourceKind,
        config: ResourceConfig,
        environment_id: Uuid,
        server_id: Uuid,
    ) -> Result<Uuid, TransferError> {
        let mut state = self.state.lock().expect("catalog lock");
        if !state.environments.contains(&environment_id) {
            return Err(TransferError::TargetNotFound {
                what: "environment",
                id: environment_id,
            });
        }
        if !state.servers.contains(&server_id) {
            return Err(TransferError::TargetNotFound {
                what: "server",
                id: server_id,
            });
        }

        let id = Uuid::now_v7();
        state.resources.insert((kind, id), config);
        state.created.push((kind, id));
        Ok(id)
    }

    async fn provision_database(
        &self,
        kind: ResourceKind,
        config: ResourceConfig,
        environment_id: Uuid,
        server_id: Uuid,
    ) -> Result<ProvisionedDatabase, TransferError> {
        if !kind.is_database() {
            return Err(TransferError::Validation {
                kind: "resource",
                reason: "only database kinds can be provisioned",
                input: kind.as_str().to_string(),
            });
        }

        let database = config.name.clone();
        let id = self
            .create_resource(kind, config, environment_id, server_id)
            .await?;

        let connection = ConnectionDescriptor {
            host: "db.provisioned.internal".to_string(),
            port: default_port(kind),
            username: "xfer".to_string(),
            password: Uuid::now_v7().simple().to_string(),
            database,
            objects: Vec::new(),
        };
        {
            let mut state = self.state.lock().expect("catalog lock");
            state.connections.insert((kind, id), connection.clone());
        }

        Ok(ProvisionedDatabase { id, connection })
    }
}

fn default_port(kind: ResourceKind) -> u16 {
    match kind {
        ResourceKind::Postgresql => 5432,
        ResourceKind::Mysql => 3306,
        ResourceKind::Mongodb => 27017,
        ResourceKind::Application | ResourceKind::Service => 0,
    }
}
