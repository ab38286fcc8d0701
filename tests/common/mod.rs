#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use workden::audit::{AuditEvent, AuditQuery};
use workden::config::OrchestratorConfig;
use workden::container::models::{
    EnvPreferences, PaginatedResult, Pagination, WorkspaceFilter, WorkspaceRecord,
    WorkspaceSpec, WorkspaceStatus,
};
use workden::container::pool::PoolConfig;
use workden::container::resource_limits::ResourceLimits;
use workden::container::runtime::{
    ContainerCreateSpec, ContainerRuntime, InspectInfo, RuntimeUsage,
};
use workden::database::{SqliteStore, StoreError, StoreResult, WorkspaceStore};
use workden::error::{Result, WorkdenError};
use workden::recovery::CircuitBreakerConfig;
use workden::{CircuitBreaker, WarmPool, WorkspaceManager};

#[derive(Debug, Clone)]
pub struct FakeContainer {
    pub image: String,
    pub running: bool,
    pub host_port: Option<u16>,
}

/// In-memory stand-in for the container runtime, with injectable failures.
#[derive(Default)]
pub struct FakeRuntime {
    pub containers: Mutex<HashMap<String, FakeContainer>>,
    counter: AtomicUsize,
    pub created_total: AtomicUsize,
    pub execs: Mutex<Vec<(String, Vec<String>)>>,
    pub fail_create: AtomicBool,
    pub fail_start: AtomicBool,
    pub fail_stop: AtomicBool,
    pub fail_remove: AtomicBool,
    pub fail_exec: AtomicBool,
}

impl FakeRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn container_count(&self) -> usize {
        self.containers.lock().len()
    }

    pub fn contains(&self, handle: &str) -> bool {
        self.containers.lock().contains_key(handle)
    }

    pub fn is_running(&self, handle: &str) -> bool {
        self.containers
            .lock()
            .get(handle)
            .is_some_and(|c| c.running)
    }

    pub fn created_total(&self) -> usize {
        self.created_total.load(Ordering::SeqCst)
    }

    pub fn exec_count(&self) -> usize {
        self.execs.lock().len()
    }

    /// Register a container that exists outside the manager's knowledge,
    /// e.g. one surviving from a previous process.
    pub fn seed_container(&self, handle: &str, image: &str, running: bool) {
        self.containers.lock().insert(
            handle.to_string(),
            FakeContainer {
                image: image.to_string(),
                running,
                host_port: None,
            },
        );
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn create(&self, spec: &ContainerCreateSpec) -> Result<String> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(WorkdenError::runtime("injected create failure"));
        }
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let handle = format!("fake-{n}");
        self.containers.lock().insert(
            handle.clone(),
            FakeContainer {
                image: spec.image.clone(),
                running: false,
                host_port: spec.host_port,
            },
        );
        self.created_total.fetch_add(1, Ordering::SeqCst);
        Ok(handle)
    }

    async fn start(&self, handle: &str) -> Result<()> {
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(WorkdenError::runtime("injected start failure"));
        }
        match self.containers.lock().get_mut(handle) {
            Some(container) => {
                container.running = true;
                Ok(())
            }
            None => Err(WorkdenError::runtime(format!("no such container {handle}"))),
        }
    }

    async fn stop(&self, handle: &str) -> Result<()> {
        if self.fail_stop.load(Ordering::SeqCst) {
            return Err(WorkdenError::runtime("injected stop failure"));
        }
        match self.containers.lock().get_mut(handle) {
            Some(container) => {
                container.running = false;
                Ok(())
            }
            None => Err(WorkdenError::runtime(format!("no such container {handle}"))),
        }
    }

    async fn remove(&self, handle: &str) -> Result<()> {
        if self.fail_remove.load(Ordering::SeqCst) {
            return Err(WorkdenError::runtime("injected remove failure"));
        }
        match self.containers.lock().remove(handle) {
            Some(_) => Ok(()),
            None => Err(WorkdenError::runtime(format!("no such container {handle}"))),
        }
    }

    async fn inspect(&self, handle: &str) -> Result<InspectInfo> {
        match self.containers.lock().get(handle) {
            Some(container) => Ok(InspectInfo {
                handle: handle.to_string(),
                running: container.running,
                image: Some(container.image.clone()),
            }),
            None => Err(WorkdenError::runtime(format!("no such container {handle}"))),
        }
    }

    async fn exec(&self, handle: &str, command: &[&str]) -> Result<String> {
        if self.fail_exec.load(Ordering::SeqCst) {
            return Err(WorkdenError::runtime("injected exec failure"));
        }
        if !self.contains(handle) {
            return Err(WorkdenError::runtime(format!("no such container {handle}")));
        }
        self.execs.lock().push((
            handle.to_string(),
            command.iter().map(|s| s.to_string()).collect(),
        ));
        Ok(String::new())
    }

    async fn stats(&self, handle: &str) -> Result<RuntimeUsage> {
        if !self.contains(handle) {
            return Err(WorkdenError::runtime(format!("no such container {handle}")));
        }
        Ok(RuntimeUsage {
            cpu_total_usage: 1_000,
            memory_usage_bytes: 64 * 1024 * 1024,
            memory_limit_bytes: 512 * 1024 * 1024,
            pids: Some(3),
        })
    }

    async fn list_containers(&self) -> Result<Vec<String>> {
        Ok(self.containers.lock().keys().cloned().collect())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

/// Store wrapper whose every call fails while `fail` is set.
pub struct FlakyStore {
    inner: Arc<dyn WorkspaceStore>,
    pub fail: AtomicBool,
}

impl FlakyStore {
    pub fn wrap(inner: Arc<dyn WorkspaceStore>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            fail: AtomicBool::new(false),
        })
    }

    pub fn set_failing(&self, failing: bool) {
        self.fail.store(failing, Ordering::SeqCst);
    }

    fn gate(&self) -> StoreResult<()> {
        if self.fail.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("injected store outage".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl WorkspaceStore for FlakyStore {
    async fn insert_workspace(&self, record: &WorkspaceRecord) -> StoreResult<()> {
        self.gate()?;
        self.inner.insert_workspace(record).await
    }

    async fn workspace_by_id(&self, id: Uuid) -> StoreResult<Option<WorkspaceRecord>> {
        self.gate()?;
        self.inner.workspace_by_id(id).await
    }

    async fn workspace_by_owner(&self, owner_id: &str) -> StoreResult<Option<WorkspaceRecord>> {
        self.gate()?;
        self.inner.workspace_by_owner(owner_id).await
    }

    async fn update_workspace(
        &self,
        record: &WorkspaceRecord,
        expected: WorkspaceStatus,
    ) -> StoreResult<bool> {
        self.gate()?;
        self.inner.update_workspace(record, expected).await
    }

    async fn delete_workspace(&self, id: Uuid) -> StoreResult<bool> {
        self.gate()?;
        self.inner.delete_workspace(id).await
    }

    async fn list_workspaces(
        &self,
        filter: &WorkspaceFilter,
        page: &Pagination,
    ) -> StoreResult<PaginatedResult<WorkspaceRecord>> {
        self.gate()?;
        self.inner.list_workspaces(filter, page).await
    }

    async fn filtered_workspaces(
        &self,
        filter: &WorkspaceFilter,
    ) -> StoreResult<Vec<WorkspaceRecord>> {
        self.gate()?;
        self.inner.filtered_workspaces(filter).await
    }

    async fn bound_ports(&self) -> StoreResult<Vec<u16>> {
        self.gate()?;
        self.inner.bound_ports().await
    }

    async fn running_idle_since(
        &self,
        cutoff: DateTime<Utc>,
    ) -> StoreResult<Vec<WorkspaceRecord>> {
        self.gate()?;
        self.inner.running_idle_since(cutoff).await
    }

    async fn append_audit(&self, event: &AuditEvent) -> StoreResult<()> {
        self.gate()?;
        self.inner.append_audit(event).await
    }

    async fn audit_events(&self, query: &AuditQuery) -> StoreResult<Vec<AuditEvent>> {
        self.gate()?;
        self.inner.audit_events(query).await
    }

    async fn env_preferences(&self, owner_id: &str) -> StoreResult<Option<EnvPreferences>> {
        self.gate()?;
        self.inner.env_preferences(owner_id).await
    }

    async fn put_env_preferences(
        &self,
        owner_id: &str,
        prefs: &EnvPreferences,
    ) -> StoreResult<()> {
        self.gate()?;
        self.inner.put_env_preferences(owner_id, prefs).await
    }
}

pub const TEST_IMAGE: &str = "ubuntu:24.04";

pub fn orchestrator_config() -> OrchestratorConfig {
    OrchestratorConfig {
        port_base: 41000,
        port_span: 16,
        default_image: TEST_IMAGE.to_string(),
        idle_minutes: 30,
        sweep_interval_secs: 300,
    }
}

pub fn breaker_config() -> CircuitBreakerConfig {
    CircuitBreakerConfig {
        recovery_timeout: Duration::from_millis(100),
        monitoring_period: Duration::from_secs(60),
        expected_failure_rate: 0.5,
        minimum_request_threshold: 5,
    }
}

pub fn pool_config(max_idle: Duration) -> PoolConfig {
    PoolConfig {
        images: vec![TEST_IMAGE.to_string()],
        warm_per_image: 1,
        max_per_image: 2,
        max_idle,
        port_base: 42000,
        port_span: 16,
        limits: ResourceLimits::default(),
    }
}

pub fn spec(owner: &str, name: &str) -> WorkspaceSpec {
    WorkspaceSpec {
        owner_id: owner.to_string(),
        name: name.to_string(),
        image: TEST_IMAGE.to_string(),
        limits: None,
    }
}

/// Manager over an in-memory store and a fake runtime, no pool.
pub async fn manager_fixture() -> (Arc<WorkspaceManager>, Arc<FakeRuntime>, SqliteStore) {
    let store = SqliteStore::in_memory().await.unwrap();
    let runtime = FakeRuntime::new();
    let manager = WorkspaceManager::new(
        Arc::new(store.clone()),
        runtime.clone(),
        None,
        orchestrator_config(),
        ResourceLimits::default(),
        breaker_config(),
    );
    (Arc::new(manager), runtime, store)
}

/// Manager wired to a warm pool over the same fake runtime.
pub async fn pooled_manager_fixture(
) -> (Arc<WorkspaceManager>, Arc<WarmPool>, Arc<FakeRuntime>, SqliteStore) {
    let store = SqliteStore::in_memory().await.unwrap();
    let runtime = FakeRuntime::new();
    let pool = Arc::new(WarmPool::new(
        pool_config(Duration::from_secs(300)),
        runtime.clone(),
        CircuitBreaker::new("runtime", breaker_config()),
    ));
    let manager = WorkspaceManager::new(
        Arc::new(store.clone()),
        runtime.clone(),
        Some(pool.clone()),
        orchestrator_config(),
        ResourceLimits::default(),
        breaker_config(),
    );
    (Arc::new(manager), pool, runtime, store)
}

/// Rewrite a record's last-activity timestamp in place, keeping its status.
pub async fn backdate_activity(store: &SqliteStore, record: &WorkspaceRecord, minutes: i64) {
    let mut updated = record.clone();
    updated.last_activity_at = Utc::now() - chrono::Duration::minutes(minutes);
    assert!(store
        .update_workspace(&updated, record.status)
        .await
        .unwrap());
}
