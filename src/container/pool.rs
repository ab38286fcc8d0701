//! Pre-warmed container pool.
//!
//! Keeps started containers on hand per image so a workspace start can skip
//! the create+start round trip. Entries are time-multiplexed across owners:
//! a released container is wiped in place before it becomes available again,
//! and one that cannot be wiped is destroyed.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Result, WorkdenError};
use crate::recovery::CircuitBreaker;

use super::resource_limits::ResourceLimits;
use super::runtime::{ContainerCreateSpec, ContainerRuntime};

/// Command run inside a released container to clear the previous occupant's
/// residue: scratch space, workspace contents, shell history.
const RESET_COMMAND: &[&str] = &[
    "sh",
    "-c",
    "rm -rf /tmp/* /tmp/.[!.]* /workspace/* /workspace/.[!.]* /root/.*history /home/*/.*history",
];

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Images pre-warmed at startup.
    pub images: Vec<String>,
    /// Containers created per image at startup.
    pub warm_per_image: usize,
    /// Hard cap per image; beyond it `acquire` returns None.
    pub max_per_image: usize,
    /// Unreserved entries idle longer than this are evicted.
    pub max_idle: Duration,
    /// Host port range for pooled containers. Must not overlap the
    /// lifecycle manager's allocation range.
    pub port_base: u16,
    pub port_span: u16,
    pub limits: ResourceLimits,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            images: Vec::new(),
            warm_per_image: 2,
            max_per_image: 8,
            max_idle: Duration::from_secs(300),
            port_base: 42000,
            port_span: 512,
            limits: ResourceLimits::default(),
        }
    }
}

/// In-memory bookkeeping for one pooled container. Never persisted; lost on
/// process restart, in which case the runtime container is presumed gone.
#[derive(Debug, Clone)]
pub struct PooledContainer {
    pub id: Uuid,
    pub runtime_handle: String,
    pub image: String,
    pub reserved: bool,
    pub last_used: Instant,
    pub port: u16,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ImagePoolStats {
    pub total: usize,
    pub available: usize,
    pub reserved: usize,
}

type Buckets = HashMap<String, VecDeque<PooledContainer>>;

pub struct WarmPool {
    config: PoolConfig,
    runtime: Arc<dyn ContainerRuntime>,
    breaker: CircuitBreaker,
    buckets: Arc<RwLock<Buckets>>,
    eviction_task: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl WarmPool {
    pub fn new(
        config: PoolConfig,
        runtime: Arc<dyn ContainerRuntime>,
        breaker: CircuitBreaker,
    ) -> Self {
        Self {
            config,
            runtime,
            breaker,
            buckets: Arc::new(RwLock::new(HashMap::new())),
            eviction_task: parking_lot::Mutex::new(None),
        }
    }

    /// Pre-warm the configured images and start the eviction timer. Warmup
    /// failures are logged per container and never abort initialization.
    pub async fn initialize(&self) -> Result<()> {
        for image in self.config.images.clone() {
            for _ in 0..self.config.warm_per_image {
                let mut buckets = self.buckets.write().await;
                match self.grow(&mut buckets, &image, false).await {
                    Ok(entry) => {
                        debug!(image = %image, id = %entry.id, "pre-warmed container")
                    }
                    Err(e) => {
                        warn!(image = %image, error = %e, "pre-warm failed, skipping image");
                        break;
                    }
                }
            }
        }

        self.start_eviction_task();
        info!(images = self.config.images.len(), "container pool initialized");
        Ok(())
    }

    /// Reserve a warm container for `image`. Grows the bucket synchronously
    /// while under the per-image cap; returns None at the cap so the caller
    /// falls back to on-demand creation.
    pub async fn acquire(&self, image: &str) -> Result<Option<PooledContainer>> {
        let mut buckets = self.buckets.write().await;

        if let Some(bucket) = buckets.get_mut(image) {
            if let Some(entry) = bucket.iter_mut().find(|e| !e.reserved) {
                entry.reserved = true;
                entry.last_used = Instant::now();
                debug!(image, id = %entry.id, "served container from pool");
                return Ok(Some(entry.clone()));
            }
        }

        let occupied = buckets.get(image).map_or(0, VecDeque::len);
        if occupied >= self.config.max_per_image {
            debug!(image, occupied, "pool at capacity");
            return Ok(None);
        }

        let entry = self.grow(&mut buckets, image, true).await?;
        Ok(Some(entry))
    }

    /// Return a reserved entry to the pool. The container is wiped before it
    /// becomes available again; if the wipe fails the entry is removed
    /// rather than re-pooled.
    pub async fn release(&self, id: Uuid) -> Result<()> {
        let entry = {
            let buckets = self.buckets.read().await;
            buckets
                .values()
                .flatten()
                .find(|e| e.id == id)
                .cloned()
        };

        let Some(entry) = entry else {
            warn!(%id, "release of untracked pool container ignored");
            return Ok(());
        };

        match self.reset_container(&entry).await {
            Ok(()) => {
                let mut buckets = self.buckets.write().await;
                if let Some(slot) = buckets
                    .get_mut(&entry.image)
                    .and_then(|b| b.iter_mut().find(|e| e.id == id))
                {
                    slot.reserved = false;
                    slot.last_used = Instant::now();
                }
                debug!(%id, image = %entry.image, "container returned to pool");
                Ok(())
            }
            Err(e) => {
                warn!(%id, error = %e, "reset failed, evicting container from pool");
                self.discard(id).await;
                Ok(())
            }
        }
    }

    /// Release the entry tracking `handle`, if any. Returns whether the
    /// handle belonged to the pool.
    pub async fn release_by_handle(&self, handle: &str) -> Result<bool> {
        let id = {
            let buckets = self.buckets.read().await;
            buckets
                .values()
                .flatten()
                .find(|e| e.runtime_handle == handle)
                .map(|e| e.id)
        };

        match id {
            Some(id) => {
                self.release(id).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Evict the entry tracking `handle` and destroy its container.
    /// Returns whether the handle belonged to the pool.
    pub async fn discard_by_handle(&self, handle: &str) -> bool {
        let id = {
            let buckets = self.buckets.read().await;
            buckets
                .values()
                .flatten()
                .find(|e| e.runtime_handle == handle)
                .map(|e| e.id)
        };

        match id {
            Some(id) => {
                self.discard(id).await;
                true
            }
            None => false,
        }
    }

    /// Remove an entry and its runtime container, tolerating runtime errors.
    pub async fn discard(&self, id: Uuid) {
        let entry = {
            let mut buckets = self.buckets.write().await;
            let mut found = None;
            for bucket in buckets.values_mut() {
                if let Some(pos) = bucket.iter().position(|e| e.id == id) {
                    found = bucket.remove(pos);
                    break;
                }
            }
            found
        };

        if let Some(entry) = entry {
            destroy_container(&self.runtime, &self.breaker, &entry.runtime_handle).await;
            debug!(%id, image = %entry.image, "evicted pool container");
        }
    }

    /// Per-image counts for dashboards.
    pub async fn stats(&self) -> HashMap<String, ImagePoolStats> {
        let buckets = self.buckets.read().await;
        buckets
            .iter()
            .map(|(image, bucket)| {
                let reserved = bucket.iter().filter(|e| e.reserved).count();
                (
                    image.clone(),
                    ImagePoolStats {
                        total: bucket.len(),
                        available: bucket.len() - reserved,
                        reserved,
                    },
                )
            })
            .collect()
    }

    /// Cancel the eviction timer and destroy every tracked container.
    pub async fn shutdown(&self) {
        if let Some(task) = self.eviction_task.lock().take() {
            task.abort();
        }

        let drained: Vec<PooledContainer> = {
            let mut buckets = self.buckets.write().await;
            buckets.drain().flat_map(|(_, bucket)| bucket).collect()
        };

        for entry in &drained {
            destroy_container(&self.runtime, &self.breaker, &entry.runtime_handle).await;
        }
        info!(removed = drained.len(), "container pool shut down");
    }

    /// Create and start one pooled container, inserting it into `buckets`.
    /// Caller holds the write lock, which keeps growth synchronous.
    async fn grow(
        &self,
        buckets: &mut Buckets,
        image: &str,
        reserved: bool,
    ) -> Result<PooledContainer> {
        let port = self.free_pool_port(buckets)?;
        let id = Uuid::new_v4();
        let spec = ContainerCreateSpec {
            name: format!("workden-pool-{}", id.simple()),
            image: image.to_string(),
            env: Vec::new(),
            limits: self.config.limits.clone(),
            host_port: Some(port),
            labels: HashMap::from([
                ("workden.pooled".to_string(), "true".to_string()),
                ("workden.image".to_string(), image.to_string()),
            ]),
        };

        let runtime = &self.runtime;
        let handle = self
            .breaker
            .execute(|| async { runtime.create(&spec).await })
            .await?;

        if let Err(e) = self
            .breaker
            .execute(|| async { runtime.start(&handle).await })
            .await
        {
            destroy_container(&self.runtime, &self.breaker, &handle).await;
            return Err(e);
        }

        let entry = PooledContainer {
            id,
            runtime_handle: handle,
            image: image.to_string(),
            reserved,
            last_used: Instant::now(),
            port,
        };
        buckets
            .entry(image.to_string())
            .or_default()
            .push_back(entry.clone());
        Ok(entry)
    }

    /// First unoccupied port in the pool's dedicated range, ascending.
    fn free_pool_port(&self, buckets: &Buckets) -> Result<u16> {
        let used: std::collections::HashSet<u16> =
            buckets.values().flatten().map(|e| e.port).collect();
        let base = self.config.port_base;
        let end = base.saturating_add(self.config.port_span);
        (base..end)
            .find(|p| !used.contains(p))
            .ok_or(WorkdenError::PortExhausted { base, end })
    }

    async fn reset_container(&self, entry: &PooledContainer) -> Result<()> {
        let runtime = &self.runtime;
        let handle = entry.runtime_handle.clone();
        self.breaker
            .execute(|| async { runtime.exec(&handle, RESET_COMMAND).await })
            .await?;
        Ok(())
    }

    fn start_eviction_task(&self) {
        let buckets = Arc::clone(&self.buckets);
        let runtime = Arc::clone(&self.runtime);
        let breaker = self.breaker.clone();
        let max_idle = self.config.max_idle;

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(max_idle / 2);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                evict_idle(&buckets, &runtime, &breaker, max_idle).await;
            }
        });

        *self.eviction_task.lock() = Some(task);
    }
}

/// One eviction pass: drop unreserved entries idle beyond `max_idle`.
async fn evict_idle(
    buckets: &Arc<RwLock<Buckets>>,
    runtime: &Arc<dyn ContainerRuntime>,
    breaker: &CircuitBreaker,
    max_idle: Duration,
) {
    let expired: Vec<PooledContainer> = {
        let mut buckets = buckets.write().await;
        let mut expired = Vec::new();
        for bucket in buckets.values_mut() {
            let mut keep = VecDeque::with_capacity(bucket.len());
            while let Some(entry) = bucket.pop_front() {
                if !entry.reserved && entry.last_used.elapsed() > max_idle {
                    expired.push(entry);
                } else {
                    keep.push_back(entry);
                }
            }
            *bucket = keep;
        }
        expired
    };

    for entry in &expired {
        debug!(id = %entry.id, image = %entry.image, "evicting idle pool container");
        destroy_container(runtime, breaker, &entry.runtime_handle).await;
    }
}

/// Best-effort stop+remove; runtime errors are logged, never propagated.
async fn destroy_container(
    runtime: &Arc<dyn ContainerRuntime>,
    breaker: &CircuitBreaker,
    handle: &str,
) {
    if let Err(e) = breaker
        .execute(|| async { runtime.stop(handle).await })
        .await
    {
        warn!(handle, error = %e, "failed to stop pooled container");
    }
    if let Err(e) = breaker
        .execute(|| async { runtime.remove(handle).await })
        .await
    {
        warn!(handle, error = %e, "failed to remove pooled container");
    }
}
