//! Append-only audit trail for workspace lifecycle actions.
//!
//! Every state-changing operation writes one event; events are never
//! mutated or deleted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditAction {
    Create,
    Start,
    Stop,
    Delete,
    Error,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "CREATE",
            Self::Start => "START",
            Self::Stop => "STOP",
            Self::Delete => "DELETE",
            Self::Error => "ERROR",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "CREATE" => Some(Self::Create),
            "START" => Some(Self::Start),
            "STOP" => Some(Self::Stop),
            "DELETE" => Some(Self::Delete),
            "ERROR" => Some(Self::Error),
            _ => None,
        }
    }
}

impl std::fmt::Display for AuditAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single audit trail entry. `actor_id` is the owner for self-service
/// actions, the admin id for administrative ones, or `"system"` for the
/// idle sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: Uuid,
    pub action: AuditAction,
    pub container_id: Uuid,
    pub owner_id: String,
    pub actor_id: String,
    pub detail: String,
    pub created_at: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(
        action: AuditAction,
        container_id: Uuid,
        owner_id: impl Into<String>,
        actor_id: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            action,
            container_id,
            owner_id: owner_id.into(),
            actor_id: actor_id.into(),
            detail: detail.into(),
            created_at: Utc::now(),
        }
    }
}

/// Filter for reading the audit trail. All fields are conjunctive.
#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    pub container_id: Option<Uuid>,
    pub owner_id: Option<String>,
    pub action: Option<AuditAction>,
    /// Maximum number of events returned, newest first. Defaults to 100.
    pub limit: Option<u32>,
}
