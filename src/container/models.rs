use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::resource_limits::ResourceLimits;

/// Workspace lifecycle states.
///
/// `Terminated` never appears in the store; it marks a record that has been
/// deleted and only shows up in audit detail text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkspaceStatus {
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
    Terminated,
}

impl WorkspaceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stopped => "STOPPED",
            Self::Starting => "STARTING",
            Self::Running => "RUNNING",
            Self::Stopping => "STOPPING",
            Self::Error => "ERROR",
            Self::Terminated => "TERMINATED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "STOPPED" => Some(Self::Stopped),
            "STARTING" => Some(Self::Starting),
            "RUNNING" => Some(Self::Running),
            "STOPPING" => Some(Self::Stopping),
            "ERROR" => Some(Self::Error),
            "TERMINATED" => Some(Self::Terminated),
            _ => None,
        }
    }

    /// A start attempt is only legal from these states.
    pub fn can_start(&self) -> bool {
        matches!(self, Self::Stopped | Self::Error)
    }
}

impl std::fmt::Display for WorkspaceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The persisted per-owner workspace record.
///
/// Invariants enforced by the manager and the store schema:
/// `(owner_id, name)` unique; `port` set and unique among RUNNING records;
/// `runtime_handle` set iff status is STARTING, RUNNING or STOPPING.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceRecord {
    pub id: Uuid,
    pub owner_id: String,
    pub name: String,
    pub image: String,
    pub status: WorkspaceStatus,
    pub limits: ResourceLimits,
    pub port: Option<u16>,
    pub runtime_handle: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub last_activity_at: DateTime<Utc>,
}

impl WorkspaceRecord {
    /// A fresh record as `create_workspace` persists it: STOPPED, no port,
    /// no runtime handle.
    pub fn new(spec: WorkspaceSpec, default_limits: ResourceLimits) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            owner_id: spec.owner_id,
            name: spec.name,
            image: spec.image,
            status: WorkspaceStatus::Stopped,
            limits: spec.limits.unwrap_or(default_limits),
            port: None,
            runtime_handle: None,
            created_at: now,
            started_at: None,
            stopped_at: None,
            last_activity_at: now,
        }
    }

    pub fn touch(&mut self) {
        self.last_activity_at = Utc::now();
    }
}

/// Input for `create_workspace`. Limits fall back to the configured
/// deployment defaults when not given.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceSpec {
    pub owner_id: String,
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub limits: Option<ResourceLimits>,
}

/// Conjunctive filter over workspace records.
#[derive(Debug, Clone, Default)]
pub struct WorkspaceFilter {
    pub owner_id: Option<String>,
    pub statuses: Option<Vec<WorkspaceStatus>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Pagination {
    pub page: u32,
    pub page_size: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            page: 1,
            page_size: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaginatedResult<T> {
    pub items: Vec<T>,
    pub total: i64,
    pub page: u32,
    pub page_size: u32,
    pub total_pages: u32,
}

impl<T> PaginatedResult<T> {
    pub fn new(items: Vec<T>, total: i64, page: u32, page_size: u32) -> Self {
        let total_pages = if page_size == 0 {
            0
        } else {
            ((total as u64).div_ceil(page_size as u64)) as u32
        };
        Self {
            items,
            total,
            page,
            page_size,
            total_pages,
        }
    }

    pub fn empty(page: u32, page_size: u32) -> Self {
        Self::new(Vec::new(), 0, page, page_size)
    }
}

/// Typed per-owner environment preferences, persisted by the store and
/// translated deterministically into container environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvPreferences {
    pub shell: String,
    pub timezone: String,
    pub locale: String,
    /// Extra variables; BTreeMap keeps the translation order stable.
    #[serde(default)]
    pub extra: BTreeMap<String, String>,
}

impl Default for EnvPreferences {
    fn default() -> Self {
        Self {
            shell: "/bin/bash".to_string(),
            timezone: "UTC".to_string(),
            locale: "en_US.UTF-8".to_string(),
            extra: BTreeMap::new(),
        }
    }
}

impl EnvPreferences {
    /// Docker `KEY=value` environment lines, in a fixed order.
    pub fn to_env(&self) -> Vec<String> {
        let mut env = vec![
            format!("SHELL={}", self.shell),
            format!("TZ={}", self.timezone),
            format!("LANG={}", self.locale),
        ];
        for (key, value) in &self.extra {
            env.push(format!("{key}={value}"));
        }
        env
    }
}

/// Outcome of a batch stop (idle sweep or admin force-cleanup). Per-item
/// failures land in `errors` and never abort the rest of the batch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CleanupReport {
    pub cleaned: Vec<Uuid>,
    pub errors: Vec<CleanupError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupError {
    pub id: Uuid,
    pub message: String,
}
