use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{FromRow, SqlitePool};
use std::str::FromStr;
use tracing::info;
use uuid::Uuid;

use xfer_core::{
    NewTransfer, ResourceTransfer, TransferError, TransferMode, TransferOptions, TransferStatus,
};
use xfer_core::resource::ResourceKind;

const SCHEMA_SQL: &str = include_str!("sql/schema.sql");

const ACTIVE_STATUSES: &str = "('pending', 'preparing', 'transferring', 'restoring')";
const CANCELLABLE_STATUSES: &str = "('pending', 'preparing', 'transferring')";
const FAILABLE_STATUSES: &str = "('preparing', 'transferring', 'restoring')";

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub sqlite_path: String,
}

/// The `resource_transfers` row is the single source of truth for transfer
/// coordination: workers share no memory, so every transition here is a
/// conditional update that only fires when the current status still allows
/// it. Zero rows affected means someone else won the race.
#[derive(Debug, Clone)]
pub struct TransferStore {
    pool: SqlitePool,
}

#[derive(Debug, Clone, FromRow)]
struct TransferRow {
    id: String,
    team_id: String,
    user_id: String,
    approved_by: Option<String>,
    approved_at: Option<String>,
    source_kind: String,
    source_id: String,
    target_id: Option<String>,
    target_environment_id: String,
    target_server_id: String,
    transfer_mode: String,
    transfer_options: String,
    requires_approval: i64,
    status: String,
    progress: i64,
    started_at: Option<String>,
    completed_at: Option<String>,
    error_details: Option<String>,
}

const SELECT_COLUMNS: &str = "id, team_id, user_id, approved_by, approved_at, source_kind, \
     source_id, target_id, target_environment_id, target_server_id, transfer_mode, \
     transfer_options, requires_approval, status, progress, started_at, completed_at, \
     error_details";

impl TransferStore {
    pub async fn connect(config: &StorageConfig) -> Result<Self> {
        let uri = normalize_sqlite_uri(&config.sqlite_path);
        let options = SqliteConnectOptions::from_str(&uri)
            .with_context(|| format!("invalid sqlite URI: {uri}"))?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .context("failed to connect sqlite pool")?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Single-connection in-memory database; used by tests. More than one
    /// connection would each see their own empty database.
    pub async fn connect_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .context("failed to open in-memory sqlite")?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA_SQL.split(';') {
            let sql = statement.trim();
            if sql.is_empty() {
                continue;
            }
            sqlx::query(sql)
                .execute(&self.pool)
                .await
                .with_context(|| format!("migration failed for statement: {sql}"))?;
        }
        info!("xfer sqlite schema ready");
        Ok(())
    }

    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .context("sqlite ping")?;
        Ok(())
    }

    /// Creates a transfer in `pending`. Refused when another transfer for
    /// the same source is still in progress; the guard and the insert share
    /// one transaction so two concurrent creates cannot both pass.
    pub async fn create_transfer(
        &self,
        new: &NewTransfer,
    ) -> Result<ResourceTransfer, TransferError> {
        match (new.transfer_mode, new.target_id) {
            (TransferMode::Clone, Some(_)) => {
                return Err(TransferError::Validation {
                    kind: "target_id",
                    reason: "clone transfers create their own target",
                    input: String::new(),
                });
            }
            (TransferMode::DataOnly | TransferMode::Partial, None) => {
                return Err(TransferError::Validation {
                    kind: "target_id",
                    reason: "data_only and partial transfers require an existing target",
                    input: String::new(),
                });
            }
            _ => {}
        }

        let id = Uuid::now_v7();
        let now = Utc::now().to_rfc3339();
        let options_json =
            serde_json::to_string(&new.transfer_options).map_err(|e| TransferError::Storage(e.to_string()))?;

        let mut conn = self.pool.acquire().await.map_err(storage_err)?;

        // Take the write lock up front. A deferred BEGIN would let two
        // concurrent creates pass the guard SELECT on separate read
        // snapshots before either insert lands.
        sqlx::query("BEGIN IMMEDIATE")
            .execute(&mut *conn)
            .await
            .map_err(storage_err)?;

        let guarded = guarded_insert(&mut conn, new, id, &now, &options_json).await;
        if guarded.is_ok() {
            sqlx::query("COMMIT").execute(&mut *conn).await.map_err(storage_err)?;
        } else {
            let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
        }
        drop(conn);
        guarded?;

        self.require_transfer(id).await
    }

    pub async fn get_transfer(
        &self,
        id: Uuid,
    ) -> Result<Option<ResourceTransfer>, TransferError> {
        let row = sqlx::query_as::<_, TransferRow>(&format!(
            "SELECT {SELECT_COLUMNS} FROM resource_transfers WHERE id = ?"
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;

        row.map(ResourceTransfer::try_from).transpose()
    }

    pub async fn require_transfer(&self, id: Uuid) -> Result<ResourceTransfer, TransferError> {
        self.get_transfer(id)
            .await?
            .ok_or(TransferError::TransferNotFound(id))
    }

    pub async fn list_transfers(&self, limit: i64) -> Result<Vec<ResourceTransfer>, TransferError> {
        let rows = sqlx::query_as::<_, TransferRow>(&format!(
            "SELECT {SELECT_COLUMNS} FROM resource_transfers ORDER BY created_at DESC LIMIT ?"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;

        rows.into_iter().map(ResourceTransfer::try_from).collect()
    }

    /// Approval gate: compare-and-swap from `pending` to `preparing`,
    /// recording the approver. When two approvers race, exactly one update
    /// fires; the loser gets `InvalidState` with the status found at commit
    /// time.
    pub async fn approve(
        &self,
        id: Uuid,
        approver: Uuid,
    ) -> Result<ResourceTransfer, TransferError> {
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(
            "UPDATE resource_transfers SET status = 'preparing', approved_by = ?, \
             approved_at = ?, started_at = ?, updated_at = ? WHERE id = ? AND status = 'pending'",
        )
        .bind(approver.to_string())
        .bind(&now)
        .bind(&now)
        .bind(&now)
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        if result.rows_affected() == 0 {
            return Err(self.state_conflict(id, "approve").await?);
        }
        self.require_transfer(id).await
    }

    /// Same transition as `approve` for transfers created without an
    /// approval gate; leaves the approval fields unset.
    pub async fn begin(&self, id: Uuid) -> Result<ResourceTransfer, TransferError> {
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(
            "UPDATE resource_transfers SET status = 'preparing', started_at = ?, \
             updated_at = ? WHERE id = ? AND status = 'pending'",
        )
        .bind(&now)
        .bind(&now)
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        if result.rows_affected() == 0 {
            return Err(self.state_conflict(id, "begin").await?);
        }
        self.require_transfer(id).await
    }

    /// Cooperative cancellation: only flips the row while the status is
    /// still cancellable. Side effects already applied are not reversed.
    pub async fn cancel(&self, id: Uuid) -> Result<ResourceTransfer, TransferError> {
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(&format!(
            "UPDATE resource_transfers SET status = 'cancelled', completed_at = ?, \
             updated_at = ? WHERE id = ? AND status IN {CANCELLABLE_STATUSES}"
        ))
        .bind(&now)
        .bind(&now)
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        if result.rows_affected() == 0 {
            return Err(self.state_conflict(id, "cancel").await?);
        }
        self.require_transfer(id).await
    }

    /// Advances `from` to `to` iff the row is still in `from`. Returns
    /// false when it is not, which the job treats as "cancelled under me,
    /// stop cleanly".
    pub async fn advance_status(
        &self,
        id: Uuid,
        from: TransferStatus,
        to: TransferStatus,
    ) -> Result<bool, TransferError> {
        let result = sqlx::query(
            "UPDATE resource_transfers SET status = ?, updated_at = ? WHERE id = ? AND status = ?",
        )
        .bind(to.as_str())
        .bind(Utc::now().to_rfc3339())
        .bind(id.to_string())
        .bind(from.as_str())
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        Ok(result.rows_affected() > 0)
    }

    /// Monotonic by construction: MAX keeps the stored value when a stale
    /// writer shows up with a smaller one.
    pub async fn update_progress(&self, id: Uuid, progress: u8) -> Result<(), TransferError> {
        sqlx::query(&format!(
            "UPDATE resource_transfers SET progress = MAX(progress, ?), updated_at = ? \
             WHERE id = ? AND status IN {ACTIVE_STATUSES}"
        ))
        .bind(progress.min(100) as i64)
        .bind(Utc::now().to_rfc3339())
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(())
    }

    pub async fn set_target(&self, id: Uuid, target_id: Uuid) -> Result<(), TransferError> {
        sqlx::query("UPDATE resource_transfers SET target_id = ?, updated_at = ? WHERE id = ?")
            .bind(target_id.to_string())
            .bind(Utc::now().to_rfc3339())
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    pub async fn mark_completed(&self, id: Uuid) -> Result<bool, TransferError> {
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(
            "UPDATE resource_transfers SET status = 'completed', progress = 100, \
             completed_at = ?, updated_at = ? WHERE id = ? AND status = 'restoring'",
        )
        .bind(&now)
        .bind(&now)
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn mark_failed(&self, id: Uuid, error_details: &Value) -> Result<bool, TransferError> {
        let now = Utc::now().to_rfc3339();
        let details =
            serde_json::to_string(error_details).map_err(|e| TransferError::Storage(e.to_string()))?;
        let result = sqlx::query(&format!(
            "UPDATE resource_transfers SET status = 'failed', completed_at = ?, \
             updated_at = ?, error_details = ? WHERE id = ? AND status IN {FAILABLE_STATUSES}"
        ))
        .bind(&now)
        .bind(&now)
        .bind(&details)
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        Ok(result.rows_affected() > 0)
    }

    async fn state_conflict(
        &self,
        id: Uuid,
        operation: &'static str,
    ) -> Result<TransferError, TransferError> {
        match self.get_transfer(id).await? {
            None => Ok(TransferError::TransferNotFound(id)),
            Some(transfer) => Ok(TransferError::InvalidState {
                operation,
                status: transfer.status,
            }),
        }
    }
}

/// Guard SELECT and INSERT on one connection, inside the transaction the
/// caller opened.
async fn guarded_insert(
    conn: &mut sqlx::SqliteConnection,
    new: &NewTransfer,
    id: Uuid,
    now: &str,
    options_json: &str,
) -> Result<(), TransferError> {
    let existing: Option<String> = sqlx::query_scalar(&format!(
        "SELECT id FROM resource_transfers WHERE source_kind = ? AND source_id = ? \
         AND status IN {ACTIVE_STATUSES} LIMIT 1"
    ))
    .bind(new.source_kind.as_str())
    .bind(new.source_id.to_string())
    .fetch_optional(&mut *conn)
    .await
    .map_err(storage_err)?;

    if let Some(existing) = existing {
        return Err(TransferError::DuplicateTransfer(parse_uuid(&existing)?));
    }

    sqlx::query(
        "INSERT INTO resource_transfers(id, team_id, user_id, source_kind, source_id, \
         target_id, target_environment_id, target_server_id, transfer_mode, \
         transfer_options, requires_approval, status, progress, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'pending', 0, ?, ?)",
    )
    .bind(id.to_string())
    .bind(new.team_id.to_string())
    .bind(new.user_id.to_string())
    .bind(new.source_kind.as_str())
    .bind(new.source_id.to_string())
    .bind(new.target_id.map(|t| t.to_string()))
    .bind(new.target_environment_id.to_string())
    .bind(new.target_server_id.to_string())
    .bind(new.transfer_mode.as_str())
    .bind(options_json)
    .bind(new.requires_approval as i64)
    .bind(now)
    .bind(now)
    .execute(&mut *conn)
    .await
    .map_err(storage_err)?;

    Ok(())
}

impl TryFrom<TransferRow> for ResourceTransfer {
    type Error = TransferError;

    fn try_from(row: TransferRow) -> Result<Self, TransferError> {
        let transfer_options: TransferOptions = serde_json::from_str(&row.transfer_options)
            .map_err(|e| TransferError::Storage(format!("corrupt transfer_options: {e}")))?;
        let error_details = row
            .error_details
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(|e| TransferError::Storage(format!("corrupt error_details: {e}")))?;

        Ok(ResourceTransfer {
            id: parse_uuid(&row.id)?,
            team_id: parse_uuid(&row.team_id)?,
            user_id: parse_uuid(&row.user_id)?,
            approved_by: row.approved_by.as_deref().map(parse_uuid).transpose()?,
            approved_at: row.approved_at.as_deref().map(parse_timestamp).transpose()?,
            source_kind: parse_kind(&row.source_kind)?,
            source_id: parse_uuid(&row.source_id)?,
            target_id: row.target_id.as_deref().map(parse_uuid).transpose()?,
            target_environment_id: parse_uuid(&row.target_environment_id)?,
            target_server_id: parse_uuid(&row.target_server_id)?,
            transfer_mode: TransferMode::parse(&row.transfer_mode)
                .ok_or_else(|| TransferError::Storage(format!("corrupt transfer_mode: {}", row.transfer_mode)))?,
            transfer_options,
            requires_approval: row.requires_approval != 0,
            status: TransferStatus::parse(&row.status)
                .ok_or_else(|| TransferError::Storage(format!("corrupt status: {}", row.status)))?,
            progress: row.progress.clamp(0, 100) as u8,
            started_at: row.started_at.as_deref().map(parse_timestamp).transpose()?,
            completed_at: row.completed_at.as_deref().map(parse_timestamp).transpose()?,
            error_details,
        })
    }
}

fn parse_uuid(value: &str) -> Result<Uuid, TransferError> {
    Uuid::parse_str(value).map_err(|e| TransferError::Storage(format!("corrupt uuid {value}: {e}")))
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, TransferError> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| TransferError::Storage(format!("corrupt timestamp {value}: {e}")))
}

fn parse_kind(value: &str) -> Result<ResourceKind, TransferError> {
    ResourceKind::parse(value)
        .ok_or_else(|| TransferError::Storage(format!("corrupt source_kind: {value}")))
}

fn storage_err(error: sqlx::Error) -> TransferError {
    TransferError::Storage(error.to_string())
}

fn normalize_sqlite_uri(raw: &str) -> String {
    if raw.starts_with("sqlite:") {
        raw.to_string()
    } else {
        format!("sqlite://{raw}")
    }
}
