use async_trait::async_trait;
use chrono::Utc;
use sqlx::{FromRow, SqlitePool};
use uuid::Uuid;

use xfer_core::{
    ConnectionDescriptor, ProvisionedDatabase, ResourceCatalog, ResourceConfig, ResourceKind,
    TransferError,
};

/// Catalog of resources, environments and servers backed by the same SQLite
/// database as the transfer store. The transfer engine only reaches it
/// through the `ResourceCatalog` trait; the seeding helpers below exist for
/// the operator surface and tests.
#[derive(Debug, Clone)]
pub struct SqliteResourceCatalog {
    pool: SqlitePool,
}

#[derive(Debug, FromRow)]
struct ConnectionRow {
    host: String,
    port: i64,
    username: String,
    password: String,
    database_name: String,
    objects_json: String,
}

impl SqliteResourceCatalog {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn insert_environment(&self, name: &str) -> Result<Uuid, TransferError> {
        let id = Uuid::now_v7();
        sqlx::query("INSERT INTO environments(id, name, created_at) VALUES (?, ?, ?)")
            .bind(id.to_string())
            .bind(name)
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(id)
    }

    pub async fn insert_server(&self, name: &str) -> Result<Uuid, TransferError> {
        let id = Uuid::now_v7();
        sqlx::query("INSERT INTO servers(id, name, created_at) VALUES (?, ?, ?)")
            .bind(id.to_string())
            .bind(name)
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(id)
    }

    pub async fn insert_resource(
        &self,
        kind: ResourceKind,
        config: &ResourceConfig,
        environment_id: Uuid,
        server_id: Uuid,
    ) -> Result<Uuid, TransferError> {
        let id = Uuid::now_v7();
        self.write_resource(id, kind, config, environment_id, server_id).await?;
        Ok(id)
    }

    pub async fn upsert_connection(
        &self,
        resource_id: Uuid,
        descriptor: &ConnectionDescriptor,
    ) -> Result<(), TransferError> {
        let objects_json = serde_json::to_string(&descriptor.objects)
            .map_err(|e| TransferError::Storage(e.to_string()))?;
        sqlx::query(
            "INSERT INTO resource_connections(resource_id, host, port, username, password, \
             database_name, objects_json) VALUES (?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(resource_id) DO UPDATE SET host = excluded.host, \
             port = excluded.port, username = excluded.username, \
             password = excluded.password, database_name = excluded.database_name, \
             objects_json = excluded.objects_json",
        )
        .bind(resource_id.to_string())
        .bind(&descriptor.host)
        .bind(descriptor.port as i64)
        .bind(&descriptor.username)
        .bind(&descriptor.password)
        .bind(&descriptor.database)
        .bind(&objects_json)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(())
    }

    async fn write_resource(
        &self,
        id: Uuid,
        kind: ResourceKind,
        config: &ResourceConfig,
        environment_id: Uuid,
        server_id: Uuid,
    ) -> Result<(), TransferError> {
        let config_json =
            serde_json::to_string(config).map_err(|e| TransferError::Storage(e.to_string()))?;
        sqlx::query(
            "INSERT INTO resources(id, kind, name, environment_id, server_id, config_json, \
             created_at) VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(id.to_string())
        .bind(kind.as_str())
        .bind(&config.name)
        .bind(environment_id.to_string())
        .bind(server_id.to_string())
        .bind(&config_json)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(())
    }

    async fn id_exists(&self, table: &str, id: Uuid) -> Result<bool, TransferError> {
        let found: Option<String> =
            sqlx::query_scalar(&format!("SELECT id FROM {table} WHERE id = ?"))
                .bind(id.to_string())
                .fetch_optional(&self.pool)
                .await
                .map_err(storage_err)?;
        Ok(found.is_some())
    }
}

#[async_trait]
impl ResourceCatalog for SqliteResourceCatalog {
    async fn connection(
        &self,
        kind: ResourceKind,
        id: Uuid,
    ) -> Result<ConnectionDescriptor, TransferError> {
        let row = sqlx::query_as::<_, ConnectionRow>(
            "SELECT c.host, c.port, c.username, c.password, c.database_name, c.objects_json \
             FROM resource_connections c JOIN resources r ON r.id = c.resource_id \
             WHERE c.resource_id = ? AND r.kind = ?",
        )
        .bind(id.to_string())
        .bind(kind.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?
        .ok_or(TransferError::ResourceNotFound { kind, id })?;

        let objects: Vec<String> = serde_json::from_str(&row.objects_json)
            .map_err(|e| TransferError::Storage(format!("corrupt objects_json: {e}")))?;

        Ok(ConnectionDescriptor {
            host: row.host,
            port: row.port as u16,
            username: row.username,
            password: row.password,
            database: row.database_name,
            objects,
        })
    }

    async fn resource(&self, kind: ResourceKind, id: Uuid) -> Result<ResourceConfig, TransferError> {
        let config_json: Option<String> = sqlx::query_scalar(
            "SELECT config_json FROM resources WHERE id = ? AND kind = ?",
        )
        .bind(id.to_string())
        .bind(kind.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;

        let config_json = config_json.ok_or(TransferError::ResourceNotFound { kind, id })?;
        serde_json::from_str(&config_json)
            .map_err(|e| TransferError::Storage(format!("corrupt resource config: {e}")))
    }

    async fn environment_exists(&self, id: Uuid) -> Result<bool, TransferError> {
        self.id_exists("environments", id).await
    }

    async fn server_exists(&self, id: Uuid) -> Result<bool, TransferError> {
        self.id_exists("servers", id).await
    }

    async fn create_resource(
        &self,
        kind: ResourceKind,
        config: ResourceConfig,
        environment_id: Uuid,
        server_id: Uuid,
    ) -> Result<Uuid, TransferError> {
        if !self.environment_exists(environment_id).await? {
            return Err(TransferError::TargetNotFound {
                what: "environment",
                id: environment_id,
            });
        }
        if !self.server_exists(server_id).await? {
            return Err(TransferError::TargetNotFound {
                what: "server",
                id: server_id,
            });
        }

        let id = Uuid::now_v7();
        self.write_resource(id, kind, &config, environment_id, server_id).await?;
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

        let server_name: Option<String> =
            sqlx::query_scalar("SELECT name FROM servers WHERE id = ?")
                .bind(server_id.to_string())
                .fetch_optional(&self.pool)
                .await
                .map_err(storage_err)?;
        let host = server_name.ok_or(TransferError::TargetNotFound {
            what: "server",
            id: server_id,
        })?;

        let database = config.name.clone();
        let id = self
            .create_resource(kind, config, environment_id, server_id)
            .await?;

        let connection = ConnectionDescriptor {
            host,
            port: default_port(kind),
            username: "xfer".to_string(),
            password: Uuid::now_v7().simple().to_string(),
            database,
            objects: Vec::new(),
        };
        self.upsert_connection(id, &connection).await?;

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

fn storage_err(error: sqlx::Error) -> TransferError {
    TransferError::Storage(error.to_string())
}
