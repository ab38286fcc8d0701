mod common;

use chrono::{Duration, Utc};
use common::*;
use workden::audit::{AuditAction, AuditEvent, AuditQuery};
use workden::container::models::{
    EnvPreferences, Pagination, WorkspaceFilter, WorkspaceRecord, WorkspaceStatus,
};
use workden::container::resource_limits::ResourceLimits;
use workden::database::{SqliteStore, StoreError, WorkspaceStore};

fn record(owner: &str, name: &str) -> WorkspaceRecord {
    WorkspaceRecord::new(spec(owner, name), ResourceLimits::default())
}

#[tokio::test]
async fn insert_and_fetch_roundtrip() {
    let store = SqliteStore::in_memory().await.unwrap();
    let original = record("alice", "dev");
    store.insert_workspace(&original).await.unwrap();

    let fetched = store.workspace_by_id(original.id).await.unwrap().unwrap();
    assert_eq!(fetched.id, original.id);
    assert_eq!(fetched.owner_id, "alice");
    assert_eq!(fetched.name, "dev");
    assert_eq!(fetched.status, WorkspaceStatus::Stopped);
    assert_eq!(fetched.limits.memory.limit_mb, original.limits.memory.limit_mb);
    assert_eq!(fetched.limits.cpu.shares, original.limits.cpu.shares);
    // Timestamps are persisted at microsecond precision.
    assert_eq!(
        fetched.created_at.timestamp_micros(),
        original.created_at.timestamp_micros()
    );
    assert!(fetched.port.is_none());

    let by_owner = store.workspace_by_owner("alice").await.unwrap().unwrap();
    assert_eq!(by_owner.id, original.id);
}

#[tokio::test]
async fn owner_name_uniqueness_is_enforced() {
    let store = SqliteStore::in_memory().await.unwrap();
    store.insert_workspace(&record("alice", "dev")).await.unwrap();

    let err = store
        .insert_workspace(&record("alice", "dev"))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Duplicate));

    // Same name under another owner is fine.
    store.insert_workspace(&record("bob", "dev")).await.unwrap();
}

#[tokio::test]
async fn conditional_update_applies_only_on_expected_status() {
    let store = SqliteStore::in_memory().await.unwrap();
    let mut ws = record("alice", "dev");
    store.insert_workspace(&ws).await.unwrap();

    ws.status = WorkspaceStatus::Starting;
    // Stale expectation loses the race.
    assert!(!store
        .update_workspace(&ws, WorkspaceStatus::Running)
        .await
        .unwrap());
    assert!(store
        .update_workspace(&ws, WorkspaceStatus::Stopped)
        .await
        .unwrap());

    let fetched = store.workspace_by_id(ws.id).await.unwrap().unwrap();
    assert_eq!(fetched.status, WorkspaceStatus::Starting);
}

#[tokio::test]
async fn bound_ports_reports_only_bound_records() {
    let store = SqliteStore::in_memory().await.unwrap();
    let mut a = record("alice", "dev");
    let b = record("bob", "dev");
    store.insert_workspace(&a).await.unwrap();
    store.insert_workspace(&b).await.unwrap();

    a.status = WorkspaceStatus::Running;
    a.port = Some(41003);
    a.runtime_handle = Some("h-1".to_string());
    store
        .update_workspace(&a, WorkspaceStatus::Stopped)
        .await
        .unwrap();

    assert_eq!(store.bound_ports().await.unwrap(), vec![41003]);
}

#[tokio::test]
async fn idle_query_is_bounded_by_cutoff_and_status() {
    let store = SqliteStore::in_memory().await.unwrap();

    let mut stale = record("alice", "dev");
    stale.status = WorkspaceStatus::Running;
    stale.runtime_handle = Some("h-stale".to_string());
    stale.port = Some(41000);
    stale.last_activity_at = Utc::now() - Duration::minutes(45);
    store.insert_workspace(&stale).await.unwrap();

    let mut fresh = record("bob", "dev");
    fresh.status = WorkspaceStatus::Running;
    fresh.runtime_handle = Some("h-fresh".to_string());
    fresh.port = Some(41001);
    fresh.last_activity_at = Utc::now() - Duration::minutes(10);
    store.insert_workspace(&fresh).await.unwrap();

    let mut stopped = record("carol", "dev");
    stopped.last_activity_at = Utc::now() - Duration::minutes(90);
    store.insert_workspace(&stopped).await.unwrap();

    let cutoff = Utc::now() - Duration::minutes(30);
    let idle = store.running_idle_since(cutoff).await.unwrap();
    assert_eq!(idle.len(), 1);
    assert_eq!(idle[0].id, stale.id);
}

#[tokio::test]
async fn filters_compose_over_owner_and_status() {
    let store = SqliteStore::in_memory().await.unwrap();

    let mut a = record("alice", "dev");
    a.status = WorkspaceStatus::Running;
    a.runtime_handle = Some("h-a".to_string());
    a.port = Some(41000);
    store.insert_workspace(&a).await.unwrap();
    store.insert_workspace(&record("alice", "scratch")).await.unwrap();
    store.insert_workspace(&record("bob", "dev")).await.unwrap();

    let filter = WorkspaceFilter {
        owner_id: Some("alice".to_string()),
        statuses: Some(vec![WorkspaceStatus::Running]),
    };
    let matched = store.filtered_workspaces(&filter).await.unwrap();
    assert_eq!(matched.len(), 1);
    assert_eq!(matched[0].id, a.id);

    let all_alice = store
        .filtered_workspaces(&WorkspaceFilter {
            owner_id: Some("alice".to_string()),
            statuses: None,
        })
        .await
        .unwrap();
    assert_eq!(all_alice.len(), 2);
}

#[tokio::test]
async fn list_paginates_with_totals() {
    let store = SqliteStore::in_memory().await.unwrap();
    for i in 0..5 {
        store
            .insert_workspace(&record(&format!("owner-{i}"), "dev"))
            .await
            .unwrap();
    }

    let page = store
        .list_workspaces(
            &WorkspaceFilter::default(),
            &Pagination {
                page: 2,
                page_size: 2,
            },
        )
        .await
        .unwrap();

    assert_eq!(page.items.len(), 2);
    assert_eq!(page.total, 5);
    assert_eq!(page.total_pages, 3);
}

#[tokio::test]
async fn audit_trail_is_append_only_and_filtered() {
    let store = SqliteStore::in_memory().await.unwrap();
    let ws = record("alice", "dev");

    for (action, detail) in [
        (AuditAction::Create, "created"),
        (AuditAction::Start, "started on port 41000"),
        (AuditAction::Stop, "idle for over 30 minutes"),
    ] {
        store
            .append_audit(&AuditEvent::new(action, ws.id, "alice", "system", detail))
            .await
            .unwrap();
    }

    let all = store
        .audit_events(&AuditQuery {
            container_id: Some(ws.id),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(all.len(), 3);

    let stops = store
        .audit_events(&AuditQuery {
            container_id: Some(ws.id),
            action: Some(AuditAction::Stop),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(stops.len(), 1);
    assert_eq!(stops[0].detail, "idle for over 30 minutes");

    let limited = store
        .audit_events(&AuditQuery {
            container_id: Some(ws.id),
            limit: Some(2),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(limited.len(), 2);
}

#[tokio::test]
async fn env_preferences_roundtrip() {
    let store = SqliteStore::in_memory().await.unwrap();
    assert!(store.env_preferences("alice").await.unwrap().is_none());

    let mut prefs = EnvPreferences::default();
    prefs.shell = "/bin/zsh".to_string();
    prefs
        .extra
        .insert("EDITOR".to_string(), "nvim".to_string());
    store.put_env_preferences("alice", &prefs).await.unwrap();

    let fetched = store.env_preferences("alice").await.unwrap().unwrap();
    assert_eq!(fetched.shell, "/bin/zsh");
    assert_eq!(fetched.extra.get("EDITOR").map(String::as_str), Some("nvim"));

    // Upsert replaces.
    prefs.timezone = "Europe/Berlin".to_string();
    store.put_env_preferences("alice", &prefs).await.unwrap();
    let fetched = store.env_preferences("alice").await.unwrap().unwrap();
    assert_eq!(fetched.timezone, "Europe/Berlin");
}
