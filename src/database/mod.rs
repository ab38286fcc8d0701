//! Persistent store seam for workspace records, audit events, and owner
//! environment preferences.
//!
//! The lifecycle manager consumes the store exclusively through
//! [`WorkspaceStore`], so tests can inject failures without a database.

pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::audit::{AuditEvent, AuditQuery};
use crate::container::models::{
    EnvPreferences, PaginatedResult, Pagination, WorkspaceFilter, WorkspaceRecord,
    WorkspaceStatus,
};

pub use sqlite::SqliteStore;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("unique constraint violated")]
    Duplicate,

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("corrupt row: {0}")]
    Corrupt(String),
}

#[async_trait]
pub trait WorkspaceStore: Send + Sync {
    /// Insert a fresh record. Fails with [`StoreError::Duplicate`] when the
    /// `(owner_id, name)` pair is already taken.
    async fn insert_workspace(&self, record: &WorkspaceRecord) -> StoreResult<()>;

    async fn workspace_by_id(&self, id: Uuid) -> StoreResult<Option<WorkspaceRecord>>;

    /// The owner's workspace, if any. Owners hold at most one in this
    /// deployment shape.
    async fn workspace_by_owner(&self, owner_id: &str) -> StoreResult<Option<WorkspaceRecord>>;

    /// Conditional full-row update: applies only while the stored status
    /// still equals `expected`. Returns whether a row was updated.
    async fn update_workspace(
        &self,
        record: &WorkspaceRecord,
        expected: WorkspaceStatus,
    ) -> StoreResult<bool>;

    /// Returns whether a row was deleted.
    async fn delete_workspace(&self, id: Uuid) -> StoreResult<bool>;

    async fn list_workspaces(
        &self,
        filter: &WorkspaceFilter,
        page: &Pagination,
    ) -> StoreResult<PaginatedResult<WorkspaceRecord>>;

    /// All records matching `filter`, unpaginated (batch working sets).
    async fn filtered_workspaces(
        &self,
        filter: &WorkspaceFilter,
    ) -> StoreResult<Vec<WorkspaceRecord>>;

    /// Host ports currently bound to any record, for the allocator scan.
    async fn bound_ports(&self) -> StoreResult<Vec<u16>>;

    /// RUNNING records whose last activity predates `cutoff`.
    async fn running_idle_since(
        &self,
        cutoff: DateTime<Utc>,
    ) -> StoreResult<Vec<WorkspaceRecord>>;

    /// Append-only; audit rows are never updated or deleted.
    async fn append_audit(&self, event: &AuditEvent) -> StoreResult<()>;

    /// Newest first, bounded by `query.limit` (default 100).
    async fn audit_events(&self, query: &AuditQuery) -> StoreResult<Vec<AuditEvent>>;

    async fn env_preferences(&self, owner_id: &str) -> StoreResult<Option<EnvPreferences>>;

    async fn put_env_preferences(
        &self,
        owner_id: &str,
        prefs: &EnvPreferences,
    ) -> StoreResult<()>;
}
