//! SQLite-backed [`WorkspaceStore`].
//!
//! Uuids and timestamps are stored as TEXT; timestamps use fixed-precision
//! RFC 3339 so lexicographic comparison matches chronological order.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::error::ErrorKind;
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use tracing::info;
use uuid::Uuid;

use crate::audit::{AuditAction, AuditEvent, AuditQuery};
use crate::container::models::{
    EnvPreferences, PaginatedResult, Pagination, WorkspaceFilter, WorkspaceRecord,
    WorkspaceStatus,
};
use crate::container::resource_limits::{CpuLimits, DiskLimits, MemoryLimits, ResourceLimits};

use super::{StoreError, StoreResult, WorkspaceStore};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS workspaces (
    id               TEXT PRIMARY KEY,
    owner_id         TEXT NOT NULL,
    name             TEXT NOT NULL,
    image            TEXT NOT NULL,
    status           TEXT NOT NULL,
    cpu_cores        REAL NOT NULL,
    cpu_shares       INTEGER,
    memory_mb        INTEGER NOT NULL,
    disk_mb          INTEGER NOT NULL,
    port             INTEGER,
    runtime_handle   TEXT,
    created_at       TEXT NOT NULL,
    started_at       TEXT,
    stopped_at       TEXT,
    last_activity_at TEXT NOT NULL,
    UNIQUE (owner_id, name)
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_workspaces_handle
    ON workspaces (runtime_handle) WHERE runtime_handle IS NOT NULL;

CREATE TABLE IF NOT EXISTS audit_events (
    id           TEXT PRIMARY KEY,
    action       TEXT NOT NULL,
    container_id TEXT NOT NULL,
    owner_id     TEXT NOT NULL,
    actor_id     TEXT NOT NULL,
    detail       TEXT NOT NULL,
    created_at   TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_audit_container ON audit_events (container_id);

CREATE TABLE IF NOT EXISTS owner_preferences (
    owner_id TEXT PRIMARY KEY,
    prefs    TEXT NOT NULL
);
"#;

fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("bad timestamp '{raw}': {e}")))
}

fn parse_uuid(raw: &str) -> StoreResult<Uuid> {
    Uuid::parse_str(raw).map_err(|e| StoreError::Corrupt(format!("bad uuid '{raw}': {e}")))
}

fn record_from_row(row: &SqliteRow) -> StoreResult<WorkspaceRecord> {
    let status_raw: String = row.try_get("status")?;
    let status = WorkspaceStatus::parse(&status_raw)
        .ok_or_else(|| StoreError::Corrupt(format!("unknown status '{status_raw}'")))?;

    let id: String = row.try_get("id")?;
    let started_at: Option<String> = row.try_get("started_at")?;
    let stopped_at: Option<String> = row.try_get("stopped_at")?;
    let created_at: String = row.try_get("created_at")?;
    let last_activity_at: String = row.try_get("last_activity_at")?;
    let port: Option<i64> = row.try_get("port")?;
    let cpu_shares: Option<i64> = row.try_get("cpu_shares")?;

    Ok(WorkspaceRecord {
        id: parse_uuid(&id)?,
        owner_id: row.try_get("owner_id")?,
        name: row.try_get("name")?,
        image: row.try_get("image")?,
        status,
        limits: ResourceLimits {
            cpu: CpuLimits {
                cores: row.try_get("cpu_cores")?,
                shares: cpu_shares.map(|s| s as u64),
            },
            memory: MemoryLimits {
                limit_mb: row.try_get::<i64, _>("memory_mb")? as u64,
            },
            disk: DiskLimits {
                limit_mb: row.try_get::<i64, _>("disk_mb")? as u64,
            },
        },
        port: port.map(|p| p as u16),
        runtime_handle: row.try_get("runtime_handle")?,
        created_at: parse_ts(&created_at)?,
        started_at: started_at.as_deref().map(parse_ts).transpose()?,
        stopped_at: stopped_at.as_deref().map(parse_ts).transpose()?,
        last_activity_at: parse_ts(&last_activity_at)?,
    })
}

fn audit_from_row(row: &SqliteRow) -> StoreResult<AuditEvent> {
    let action_raw: String = row.try_get("action")?;
    let action = AuditAction::parse(&action_raw)
        .ok_or_else(|| StoreError::Corrupt(format!("unknown audit action '{action_raw}'")))?;

    let id: String = row.try_get("id")?;
    let container_id: String = row.try_get("container_id")?;
    let created_at: String = row.try_get("created_at")?;

    Ok(AuditEvent {
        id: parse_uuid(&id)?,
        action,
        container_id: parse_uuid(&container_id)?,
        owner_id: row.try_get("owner_id")?,
        actor_id: row.try_get("actor_id")?,
        detail: row.try_get("detail")?,
        created_at: parse_ts(&created_at)?,
    })
}

fn push_filter(builder: &mut QueryBuilder<'_, Sqlite>, filter: &WorkspaceFilter) {
    builder.push(" WHERE 1 = 1");
    if let Some(owner_id) = &filter.owner_id {
        builder.push(" AND owner_id = ");
        builder.push_bind(owner_id.clone());
    }
    if let Some(statuses) = &filter.statuses {
        if statuses.is_empty() {
            builder.push(" AND 0");
        } else {
            builder.push(" AND status IN (");
            let mut separated = builder.separated(", ");
            for status in statuses {
                separated.push_bind(status.as_str());
            }
            separated.push_unseparated(")");
        }
    }
}

#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Connect and bootstrap the schema. URLs follow sqlx conventions,
    /// e.g. `sqlite:workden.db?mode=rwc`.
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(url)
            .await?;
        let store = Self { pool };
        store.init_schema().await?;
        info!(url, "connected to workspace store");
        Ok(store)
    }

    /// Private in-memory database on a single connection; used by tests.
    pub async fn in_memory() -> StoreResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> StoreResult<()> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl WorkspaceStore for SqliteStore {
    async fn insert_workspace(&self, record: &WorkspaceRecord) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO workspaces (
                id, owner_id, name, image, status,
                cpu_cores, cpu_shares, memory_mb, disk_mb,
                port, runtime_handle,
                created_at, started_at, stopped_at, last_activity_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
            "#,
        )
        .bind(record.id.to_string())
        .bind(&record.owner_id)
        .bind(&record.name)
        .bind(&record.image)
        .bind(record.status.as_str())
        .bind(record.limits.cpu.cores)
        .bind(record.limits.cpu.shares.map(|s| s as i64))
        .bind(record.limits.memory.limit_mb as i64)
        .bind(record.limits.disk.limit_mb as i64)
        .bind(record.port.map(|p| p as i64))
        .bind(&record.runtime_handle)
        .bind(fmt_ts(record.created_at))
        .bind(record.started_at.map(fmt_ts))
        .bind(record.stopped_at.map(fmt_ts))
        .bind(fmt_ts(record.last_activity_at))
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db))
                if matches!(db.kind(), ErrorKind::UniqueViolation) =>
            {
                Err(StoreError::Duplicate)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn workspace_by_id(&self, id: Uuid) -> StoreResult<Option<WorkspaceRecord>> {
        let row = sqlx::query("SELECT * FROM workspaces WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    async fn workspace_by_owner(&self, owner_id: &str) -> StoreResult<Option<WorkspaceRecord>> {
        let row = sqlx::query(
            "SELECT * FROM workspaces WHERE owner_id = ?1 ORDER BY created_at LIMIT 1",
        )
        .bind(owner_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    async fn update_workspace(
        &self,
        record: &WorkspaceRecord,
        expected: WorkspaceStatus,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE workspaces SET
                status = ?1, cpu_cores = ?2, cpu_shares = ?3,
                memory_mb = ?4, disk_mb = ?5, port = ?6, runtime_handle = ?7,
                started_at = ?8, stopped_at = ?9, last_activity_at = ?10
            WHERE id = ?11 AND status = ?12
            "#,
        )
        .bind(record.status.as_str())
        .bind(record.limits.cpu.cores)
        .bind(record.limits.cpu.shares.map(|s| s as i64))
        .bind(record.limits.memory.limit_mb as i64)
        .bind(record.limits.disk.limit_mb as i64)
        .bind(record.port.map(|p| p as i64))
        .bind(&record.runtime_handle)
        .bind(record.started_at.map(fmt_ts))
        .bind(record.stopped_at.map(fmt_ts))
        .bind(fmt_ts(record.last_activity_at))
        .bind(record.id.to_string())
        .bind(expected.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_workspace(&self, id: Uuid) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM workspaces WHERE id = ?1")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_workspaces(
        &self,
        filter: &WorkspaceFilter,
        page: &Pagination,
    ) -> StoreResult<PaginatedResult<WorkspaceRecord>> {
        let offset = (page.page.saturating_sub(1) as i64) * page.page_size as i64;

        let mut builder = QueryBuilder::<Sqlite>::new("SELECT * FROM workspaces");
        push_filter(&mut builder, filter);
        builder.push(" ORDER BY created_at DESC LIMIT ");
        builder.push_bind(page.page_size as i64);
        builder.push(" OFFSET ");
        builder.push_bind(offset);

        let rows = builder.build().fetch_all(&self.pool).await?;
        let items = rows
            .iter()
            .map(record_from_row)
            .collect::<StoreResult<Vec<_>>>()?;

        let mut count_builder =
            QueryBuilder::<Sqlite>::new("SELECT COUNT(*) AS count FROM workspaces");
        push_filter(&mut count_builder, filter);
        let total: i64 = count_builder
            .build()
            .fetch_one(&self.pool)
            .await?
            .get("count");

        Ok(PaginatedResult::new(items, total, page.page, page.page_size))
    }

    async fn filtered_workspaces(
        &self,
        filter: &WorkspaceFilter,
    ) -> StoreResult<Vec<WorkspaceRecord>> {
        let mut builder = QueryBuilder::<Sqlite>::new("SELECT * FROM workspaces");
        push_filter(&mut builder, filter);
        builder.push(" ORDER BY created_at");

        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.iter().map(record_from_row).collect()
    }

    async fn bound_ports(&self) -> StoreResult<Vec<u16>> {
        let rows = sqlx::query("SELECT port FROM workspaces WHERE port IS NOT NULL")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                let port: i64 = row.try_get("port")?;
                Ok(port as u16)
            })
            .collect()
    }

    async fn running_idle_since(
        &self,
        cutoff: DateTime<Utc>,
    ) -> StoreResult<Vec<WorkspaceRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM workspaces WHERE status = ?1 AND last_activity_at < ?2",
        )
        .bind(WorkspaceStatus::Running.as_str())
        .bind(fmt_ts(cutoff))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(record_from_row).collect()
    }

    async fn append_audit(&self, event: &AuditEvent) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO audit_events (id, action, container_id, owner_id, actor_id, detail, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(event.id.to_string())
        .bind(event.action.as_str())
        .bind(event.container_id.to_string())
        .bind(&event.owner_id)
        .bind(&event.actor_id)
        .bind(&event.detail)
        .bind(fmt_ts(event.created_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn audit_events(&self, query: &AuditQuery) -> StoreResult<Vec<AuditEvent>> {
        let mut builder =
            QueryBuilder::<Sqlite>::new("SELECT * FROM audit_events WHERE 1 = 1");
        if let Some(container_id) = query.container_id {
            builder.push(" AND container_id = ");
            builder.push_bind(container_id.to_string());
        }
        if let Some(owner_id) = &query.owner_id {
            builder.push(" AND owner_id = ");
            builder.push_bind(owner_id.clone());
        }
        if let Some(action) = query.action {
            builder.push(" AND action = ");
            builder.push_bind(action.as_str());
        }
        builder.push(" ORDER BY created_at DESC LIMIT ");
        builder.push_bind(query.limit.unwrap_or(100) as i64);

        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.iter().map(audit_from_row).collect()
    }

    async fn env_preferences(&self, owner_id: &str) -> StoreResult<Option<EnvPreferences>> {
        let row = sqlx::query("SELECT prefs FROM owner_preferences WHERE owner_id = ?1")
            .bind(owner_id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            None => Ok(None),
            Some(row) => {
                let raw: String = row.try_get("prefs")?;
                let prefs = serde_json::from_str(&raw)
                    .map_err(|e| StoreError::Corrupt(format!("bad preferences JSON: {e}")))?;
                Ok(Some(prefs))
            }
        }
    }

    async fn put_env_preferences(
        &self,
        owner_id: &str,
        prefs: &EnvPreferences,
    ) -> StoreResult<()> {
        let raw = serde_json::to_string(prefs)
            .map_err(|e| StoreError::Corrupt(format!("unencodable preferences: {e}")))?;
        sqlx::query(
            r#"
            INSERT INTO owner_preferences (owner_id, prefs) VALUES (?1, ?2)
            ON CONFLICT (owner_id) DO UPDATE SET prefs = excluded.prefs
            "#,
        )
        .bind(owner_id)
        .bind(raw)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
