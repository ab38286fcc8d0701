//! Workspace lifecycle manager.
//!
//! Owns the per-owner workspace record and its state machine, allocates host
//! ports, reclaims idle workspaces, and writes the audit trail. Every store
//! and runtime call goes through a circuit breaker; the warm pool is
//! consulted opportunistically when starting a pre-warmed image.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::audit::{AuditAction, AuditEvent, AuditQuery};
use crate::config::OrchestratorConfig;
use crate::database::{StoreError, WorkspaceStore};
use crate::error::{Result, WorkdenError};
use crate::recovery::{CircuitBreaker, CircuitBreakerConfig};

use super::models::{
    CleanupError, CleanupReport, PaginatedResult, Pagination, WorkspaceFilter, WorkspaceRecord,
    WorkspaceSpec, WorkspaceStatus,
};
use super::pool::WarmPool;
use super::resource_limits::ResourceLimits;
use super::runtime::{ContainerCreateSpec, ContainerRuntime, RuntimeUsage};

/// Actor id recorded when the idle sweep stops a workspace.
pub const SYSTEM_ACTOR: &str = "system";

fn map_store(e: StoreError) -> WorkdenError {
    WorkdenError::StoreUnavailable(e.to_string())
}

enum InsertOutcome {
    Inserted,
    Duplicate,
}

pub struct WorkspaceManager {
    store: Arc<dyn WorkspaceStore>,
    runtime: Arc<dyn ContainerRuntime>,
    pool: Option<Arc<WarmPool>>,
    store_breaker: CircuitBreaker,
    runtime_breaker: CircuitBreaker,
    config: OrchestratorConfig,
    default_limits: ResourceLimits,
    /// Per-workspace transition locks: at most one start/stop in flight per
    /// id. Guarded map; the inner mutex is held across the transition.
    transition_locks: parking_lot::Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
    sweep_task: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl WorkspaceManager {
    pub fn new(
        store: Arc<dyn WorkspaceStore>,
        runtime: Arc<dyn ContainerRuntime>,
        pool: Option<Arc<WarmPool>>,
        config: OrchestratorConfig,
        default_limits: ResourceLimits,
        breaker_config: CircuitBreakerConfig,
    ) -> Self {
        Self {
            store,
            runtime,
            pool,
            store_breaker: CircuitBreaker::new("store", breaker_config.clone()),
            runtime_breaker: CircuitBreaker::new("runtime", breaker_config),
            config,
            default_limits,
            transition_locks: parking_lot::Mutex::new(HashMap::new()),
            sweep_task: parking_lot::Mutex::new(None),
        }
    }

    /// The owner's workspace record, if one exists.
    pub async fn get_workspace(&self, owner_id: &str) -> Result<Option<WorkspaceRecord>> {
        let store = &self.store;
        self.store_breaker
            .execute(|| async { store.workspace_by_owner(owner_id).await.map_err(map_store) })
            .await
    }

    /// Create a STOPPED record with resource defaults for the owner.
    pub async fn create_workspace(&self, spec: WorkspaceSpec) -> Result<WorkspaceRecord> {
        let record = WorkspaceRecord::new(spec, self.default_limits.clone());

        let store = &self.store;
        let outcome = self
            .store_breaker
            .execute(|| async {
                match store.insert_workspace(&record).await {
                    Ok(()) => Ok(InsertOutcome::Inserted),
                    Err(StoreError::Duplicate) => Ok(InsertOutcome::Duplicate),
                    Err(e) => Err(map_store(e)),
                }
            })
            .await?;

        match outcome {
            InsertOutcome::Duplicate => Err(WorkdenError::DuplicateName {
                owner_id: record.owner_id,
                name: record.name,
            }),
            InsertOutcome::Inserted => {
                info!(id = %record.id, owner = %record.owner_id, image = %record.image,
                    "workspace created");
                self.audit(
                    AuditAction::Create,
                    record.id,
                    &record.owner_id,
                    &record.owner_id,
                    format!("created with image {}", record.image),
                )
                .await;
                Ok(record)
            }
        }
    }

    /// Start a STOPPED or ERROR workspace. Ends in RUNNING with a bound port
    /// and runtime handle, or in ERROR with both cleared; a typed error is
    /// returned in the latter case and no retry is attempted here.
    pub async fn start_workspace(&self, id: Uuid, actor: &str) -> Result<WorkspaceRecord> {
        let lock = self.transition_lock(id);
        let _guard = lock.lock().await;

        let record = self.fetch(id).await?;
        if !record.status.can_start() {
            return Err(WorkdenError::start_failed(format!(
                "workspace {id} cannot start from {}",
                record.status
            )));
        }
        let prior = record.status;

        let mut starting = record;
        starting.status = WorkspaceStatus::Starting;
        starting.touch();
        if !self.persist(&starting, prior).await? {
            return Err(WorkdenError::store_unavailable(
                "workspace record changed during start",
            ));
        }

        let (handle, port) = match self.resolve_container(&starting).await {
            Ok(resolved) => resolved,
            Err(e) => return self.fail_start(starting, None, e, actor).await,
        };

        let runtime = &self.runtime;
        let start_result = self
            .runtime_breaker
            .execute(|| async { runtime.start(&handle).await })
            .await;
        if let Err(e) = start_result {
            let cause = match e {
                WorkdenError::CircuitOpen { .. } => e,
                other => WorkdenError::start_failed(format!("runtime start failed: {other}")),
            };
            return self.fail_start(starting, Some(handle), cause, actor).await;
        }

        starting.status = WorkspaceStatus::Running;
        starting.runtime_handle = Some(handle.clone());
        starting.port = Some(port);
        starting.started_at = Some(Utc::now());
        starting.touch();
        match self.persist(&starting, WorkspaceStatus::Starting).await {
            Ok(true) => {}
            Ok(false) => {
                let cause =
                    WorkdenError::store_unavailable("workspace record changed during start");
                return self.fail_start(starting, Some(handle), cause, actor).await;
            }
            Err(e) => {
                return self.fail_start(starting, Some(handle), e, actor).await;
            }
        }

        info!(%id, owner = %starting.owner_id, port, "workspace running");
        self.audit(
            AuditAction::Start,
            id,
            &starting.owner_id,
            actor,
            format!("started on port {port}"),
        )
        .await;
        Ok(starting)
    }

    /// Stop a workspace. Converges to STOPPED with port and handle cleared
    /// regardless of the runtime outcome; runtime failures are audited but
    /// never leave the record mid-transition. Stopping an already STOPPED
    /// (or ERROR) record is a no-op.
    pub async fn stop_workspace(
        &self,
        id: Uuid,
        actor: &str,
        detail: &str,
    ) -> Result<WorkspaceRecord> {
        let lock = self.transition_lock(id);
        let _guard = lock.lock().await;
        self.stop_locked(id, actor, detail).await
    }

    /// Stop RUNNING workspaces whose last activity predates the threshold.
    /// One workspace's failure never aborts the sweep.
    pub async fn cleanup_idle_workspaces(&self, idle_minutes: i64) -> Result<CleanupReport> {
        let cutoff = Utc::now() - chrono::Duration::minutes(idle_minutes);
        let store = &self.store;
        let idle = self
            .store_breaker
            .execute(|| async { store.running_idle_since(cutoff).await.map_err(map_store) })
            .await?;

        let mut report = CleanupReport::default();
        for record in idle {
            let detail = format!("idle for over {idle_minutes} minutes");
            match self.stop_workspace(record.id, SYSTEM_ACTOR, &detail).await {
                Ok(_) => report.cleaned.push(record.id),
                Err(e) => {
                    warn!(id = %record.id, error = %e, "idle cleanup failed for workspace");
                    self.audit(
                        AuditAction::Error,
                        record.id,
                        &record.owner_id,
                        SYSTEM_ACTOR,
                        format!("idle cleanup failed: {e}"),
                    )
                    .await;
                    report.errors.push(CleanupError {
                        id: record.id,
                        message: e.to_string(),
                    });
                }
            }
        }

        if !report.cleaned.is_empty() || !report.errors.is_empty() {
            info!(
                cleaned = report.cleaned.len(),
                errors = report.errors.len(),
                "idle sweep completed"
            );
        }
        Ok(report)
    }

    /// Admin bulk stop over the filter. Every stop is audited with the admin
    /// as actor and the supplied reason; per-item failures are isolated.
    pub async fn force_cleanup(
        &self,
        filter: &WorkspaceFilter,
        admin_id: &str,
        reason: &str,
    ) -> Result<CleanupReport> {
        let store = &self.store;
        let matched = self
            .store_breaker
            .execute(|| async { store.filtered_workspaces(filter).await.map_err(map_store) })
            .await?;

        let mut report = CleanupReport::default();
        for record in matched {
            if !matches!(
                record.status,
                WorkspaceStatus::Running | WorkspaceStatus::Starting | WorkspaceStatus::Stopping
            ) {
                continue;
            }
            match self.stop_workspace(record.id, admin_id, reason).await {
                Ok(_) => report.cleaned.push(record.id),
                Err(e) => {
                    self.audit(
                        AuditAction::Error,
                        record.id,
                        &record.owner_id,
                        admin_id,
                        format!("force cleanup failed: {e}"),
                    )
                    .await;
                    report.errors.push(CleanupError {
                        id: record.id,
                        message: e.to_string(),
                    });
                }
            }
        }

        info!(
            admin = admin_id,
            cleaned = report.cleaned.len(),
            errors = report.errors.len(),
            "force cleanup completed"
        );
        Ok(report)
    }

    /// Permanently remove a workspace record, stopping it first if needed.
    pub async fn delete_workspace(&self, id: Uuid, admin_id: &str, reason: &str) -> Result<()> {
        let lock = self.transition_lock(id);
        let _guard = lock.lock().await;

        let record = self.fetch(id).await?;
        if matches!(
            record.status,
            WorkspaceStatus::Running | WorkspaceStatus::Starting | WorkspaceStatus::Stopping
        ) {
            self.stop_locked(id, admin_id, reason).await?;
        }

        let store = &self.store;
        let deleted = self
            .store_breaker
            .execute(|| async { store.delete_workspace(id).await.map_err(map_store) })
            .await?;
        if !deleted {
            return Err(WorkdenError::not_found(id));
        }

        info!(%id, admin = admin_id, "workspace deleted");
        self.audit(
            AuditAction::Delete,
            id,
            &record.owner_id,
            admin_id,
            format!("{reason} (record terminated)"),
        )
        .await;

        self.transition_locks.lock().remove(&id);
        Ok(())
    }

    /// Admin list view. Degrades to an empty page on store failure so the
    /// view stays renderable.
    pub async fn list_workspaces(
        &self,
        filter: &WorkspaceFilter,
        page: &Pagination,
    ) -> PaginatedResult<WorkspaceRecord> {
        let store = &self.store;
        let result = self
            .store_breaker
            .execute_with_fallback(
                || async { store.list_workspaces(filter, page).await.map_err(map_store) },
                || async { Ok(PaginatedResult::empty(page.page, page.page_size)) },
            )
            .await;

        match result {
            Ok(listed) => listed,
            Err(e) => {
                warn!(error = %e, "workspace list degraded to empty");
                PaginatedResult::empty(page.page, page.page_size)
            }
        }
    }

    /// Audit trail view. Never fails: on store trouble it logs and returns
    /// an empty list.
    pub async fn audit_log(&self, query: &AuditQuery) -> Vec<AuditEvent> {
        let store = &self.store;
        let result = self
            .store_breaker
            .execute_with_fallback(
                || async { store.audit_events(query).await.map_err(map_store) },
                || async { Ok(Vec::new()) },
            )
            .await;

        match result {
            Ok(events) => events,
            Err(e) => {
                warn!(error = %e, "audit log read degraded to empty");
                Vec::new()
            }
        }
    }

    /// One-shot resource usage for a workspace with a live container.
    pub async fn workspace_stats(&self, id: Uuid) -> Result<RuntimeUsage> {
        let record = self.fetch(id).await?;
        let Some(handle) = record.runtime_handle else {
            return Err(WorkdenError::runtime(format!(
                "workspace {id} has no running container"
            )));
        };

        let runtime = &self.runtime;
        self.runtime_breaker
            .execute(|| async { runtime.stats(&handle).await })
            .await
    }

    /// Liveness probe against the runtime.
    pub async fn runtime_alive(&self) -> bool {
        let runtime = &self.runtime;
        self.runtime_breaker
            .execute(|| async { runtime.list_containers().await })
            .await
            .is_ok()
    }

    pub fn store_breaker(&self) -> &CircuitBreaker {
        &self.store_breaker
    }

    pub fn runtime_breaker(&self) -> &CircuitBreaker {
        &self.runtime_breaker
    }

    /// Spawn the recurring idle sweep using the configured interval and
    /// threshold.
    pub fn start_idle_sweeper(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        let interval = Duration::from_secs(self.config.sweep_interval_secs);
        let idle_minutes = self.config.idle_minutes;

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = manager.cleanup_idle_workspaces(idle_minutes).await {
                    warn!(error = %e, "idle sweep skipped");
                }
            }
        });
        *self.sweep_task.lock() = Some(task);
    }

    /// Stop the idle sweep and shut down the pool, if attached.
    pub async fn shutdown(&self) {
        if let Some(task) = self.sweep_task.lock().take() {
            task.abort();
        }
        if let Some(pool) = &self.pool {
            pool.shutdown().await;
        }
        info!("workspace manager shut down");
    }

    async fn stop_locked(&self, id: Uuid, actor: &str, detail: &str) -> Result<WorkspaceRecord> {
        let record = self.fetch(id).await?;
        match record.status {
            // A second stop (user racing the idle sweep) is a no-op, and
            // nothing but a fresh start exits ERROR.
            WorkspaceStatus::Stopped | WorkspaceStatus::Error | WorkspaceStatus::Terminated => {
                return Ok(record)
            }
            WorkspaceStatus::Running | WorkspaceStatus::Starting | WorkspaceStatus::Stopping => {}
        }
        let prior = record.status;

        let mut stopping = record;
        stopping.status = WorkspaceStatus::Stopping;
        stopping.touch();
        if !self.persist(&stopping, prior).await? {
            let latest = self.fetch(id).await?;
            if latest.status == WorkspaceStatus::Stopped {
                return Ok(latest);
            }
            return Err(WorkdenError::store_unavailable(
                "workspace record changed during stop",
            ));
        }

        // Runtime teardown is fail-open: failures are audited, the record
        // converges to STOPPED regardless.
        if let Some(handle) = stopping.runtime_handle.clone() {
            let pooled = match &self.pool {
                Some(pool) => match pool.release_by_handle(&handle).await {
                    Ok(found) => found,
                    Err(e) => {
                        warn!(%id, error = %e, "pool release failed");
                        self.audit(
                            AuditAction::Error,
                            id,
                            &stopping.owner_id,
                            actor,
                            format!("pool release failed: {e}"),
                        )
                        .await;
                        false
                    }
                },
                None => false,
            };

            if pooled {
                debug!(%id, handle = %handle, "container returned to warm pool");
            } else {
                let runtime = &self.runtime;
                if let Err(e) = self
                    .runtime_breaker
                    .execute(|| async { runtime.stop(&handle).await })
                    .await
                {
                    warn!(%id, error = %e, "runtime stop failed, converging anyway");
                    self.audit(
                        AuditAction::Error,
                        id,
                        &stopping.owner_id,
                        actor,
                        format!("runtime stop failed: {e}"),
                    )
                    .await;
                }
                if let Err(e) = self
                    .runtime_breaker
                    .execute(|| async { runtime.remove(&handle).await })
                    .await
                {
                    warn!(%id, error = %e, "runtime remove failed, converging anyway");
                    self.audit(
                        AuditAction::Error,
                        id,
                        &stopping.owner_id,
                        actor,
                        format!("runtime remove failed: {e}"),
                    )
                    .await;
                }
            }
        }

        stopping.status = WorkspaceStatus::Stopped;
        stopping.port = None;
        stopping.runtime_handle = None;
        stopping.stopped_at = Some(Utc::now());
        stopping.touch();
        match self.persist(&stopping, WorkspaceStatus::Stopping).await {
            Ok(true) => {}
            Ok(false) => warn!(%id, "record changed while stopping, convergence skipped"),
            Err(e) => {
                error!(%id, error = %e, "could not persist STOPPED state");
                return Err(e);
            }
        }

        info!(%id, owner = %stopping.owner_id, actor, "workspace stopped");
        self.audit(AuditAction::Stop, id, &stopping.owner_id, actor, detail)
            .await;
        Ok(stopping)
    }

    /// Resolve the runtime container for a start: reuse an inspectable prior
    /// handle, take a warm pooled container, or create one on demand.
    async fn resolve_container(&self, record: &WorkspaceRecord) -> Result<(String, u16)> {
        let runtime = &self.runtime;

        if let Some(handle) = record.runtime_handle.as_deref() {
            let probe = self
                .runtime_breaker
                .execute(|| async { runtime.inspect(handle).await })
                .await;
            if let Ok(info) = probe {
                debug!(id = %record.id, handle = %info.handle, "reusing existing container");
                let port = match record.port {
                    Some(port) => port,
                    None => self.allocate_port().await?,
                };
                return Ok((info.handle, port));
            }
        }

        if let Some(pool) = &self.pool {
            match pool.acquire(&record.image).await {
                Ok(Some(entry)) => {
                    debug!(id = %record.id, handle = %entry.runtime_handle,
                        "adopting pooled container");
                    return Ok((entry.runtime_handle, entry.port));
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "pool unavailable, creating on demand"),
            }
        }

        let port = self.allocate_port().await?;

        let store = &self.store;
        let owner_id = record.owner_id.clone();
        let prefs = self
            .store_breaker
            .execute(|| async { store.env_preferences(&owner_id).await.map_err(map_store) })
            .await?
            .unwrap_or_default();

        let spec = ContainerCreateSpec {
            name: format!("workden-{}", record.id.simple()),
            image: record.image.clone(),
            env: prefs.to_env(),
            limits: record.limits.clone(),
            host_port: Some(port),
            labels: HashMap::from([
                ("workden.owner_id".to_string(), record.owner_id.clone()),
                ("workden.workspace".to_string(), record.name.clone()),
                ("workden.workspace_id".to_string(), record.id.to_string()),
            ]),
        };
        let handle = self
            .runtime_breaker
            .execute(|| async { runtime.create(&spec).await })
            .await
            .map_err(|e| match e {
                WorkdenError::CircuitOpen { .. } => e,
                other => {
                    WorkdenError::start_failed(format!("container create failed: {other}"))
                }
            })?;
        Ok((handle, port))
    }

    /// First unbound host port, scanning ascending from the configured base.
    /// Deterministic on purpose.
    async fn allocate_port(&self) -> Result<u16> {
        let store = &self.store;
        let bound = self
            .store_breaker
            .execute(|| async { store.bound_ports().await.map_err(map_store) })
            .await?;
        let bound: HashSet<u16> = bound.into_iter().collect();

        let base = self.config.port_base;
        let end = base.saturating_add(self.config.port_span);
        (base..end)
            .find(|port| !bound.contains(port))
            .ok_or(WorkdenError::PortExhausted { base, end })
    }

    /// Converge a failed start to ERROR with port and handle cleared, clean
    /// up whatever container was provisioned, audit, and surface `cause`.
    async fn fail_start(
        &self,
        mut record: WorkspaceRecord,
        handle: Option<String>,
        cause: WorkdenError,
        actor: &str,
    ) -> Result<WorkspaceRecord> {
        error!(id = %record.id, error = %cause, "workspace start failed");

        if let Some(handle) = handle {
            let mut pooled = false;
            if let Some(pool) = &self.pool {
                pooled = pool.discard_by_handle(&handle).await;
            }
            if !pooled {
                let runtime = &self.runtime;
                if let Err(e) = self
                    .runtime_breaker
                    .execute(|| async { runtime.remove(&handle).await })
                    .await
                {
                    warn!(handle = %handle, error = %e,
                        "failed to remove container after aborted start");
                }
            }
        }

        record.status = WorkspaceStatus::Error;
        record.runtime_handle = None;
        record.port = None;
        record.touch();
        match self.persist(&record, WorkspaceStatus::Starting).await {
            Ok(true) => {}
            Ok(false) => warn!(id = %record.id, "could not converge record to ERROR"),
            Err(e) => error!(id = %record.id, error = %e, "failed to persist ERROR state"),
        }

        self.audit(
            AuditAction::Error,
            record.id,
            &record.owner_id,
            actor,
            format!("start failed: {cause}"),
        )
        .await;
        Err(cause)
    }

    async fn fetch(&self, id: Uuid) -> Result<WorkspaceRecord> {
        let store = &self.store;
        self.store_breaker
            .execute(|| async { store.workspace_by_id(id).await.map_err(map_store) })
            .await?
            .ok_or_else(|| WorkdenError::not_found(id))
    }

    async fn persist(&self, record: &WorkspaceRecord, expected: WorkspaceStatus) -> Result<bool> {
        let store = &self.store;
        self.store_breaker
            .execute(|| async { store.update_workspace(record, expected).await.map_err(map_store) })
            .await
    }

    /// Best-effort append; a failed audit write is logged, never surfaced.
    async fn audit(
        &self,
        action: AuditAction,
        container_id: Uuid,
        owner_id: &str,
        actor_id: &str,
        detail: impl Into<String>,
    ) {
        let event = AuditEvent::new(action, container_id, owner_id, actor_id, detail);
        let store = &self.store;
        let result = self
            .store_breaker
            .execute(|| async { store.append_audit(&event).await.map_err(map_store) })
            .await;
        if let Err(e) = result {
            warn!(action = %event.action, container = %container_id, error = %e,
                "audit write failed");
        }
    }

    fn transition_lock(&self, id: Uuid) -> Arc<tokio::sync::Mutex<()>> {
        self.transition_locks
            .lock()
            .entry(id)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}
