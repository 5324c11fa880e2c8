//! Control-surface operations: validation, bulk actions, auth, analytics
//! and health surfaces.

mod common;

use chrono::{Duration, Utc};
use common::TestApp;
use serde_json::json;
use server_core::kernel::analytics::{self, HourlyDelta};
use server_core::kernel::auth::ApiKey;
use server_core::kernel::ops::{BulkTaskAction, ComponentHealth, CreateTaskInput, TimeRange};
use server_core::kernel::record::Record;
use server_core::CoreError;

#[tokio::test]
async fn create_task_validates_and_rejects_duplicates() {
    let app = TestApp::new().await;
    let ops = app.ops();
    let now = common::test_now();

    let bad_content = ops
        .create_task(
            CreateTaskInput {
                project_id: app.project.id,
                media_path: "src/m1.mp4".into(),
                content_data: json!(["not", "an", "object"]),
                scheduled_at: None,
                priority: None,
            },
            now,
        )
        .await;
    assert!(matches!(bad_content, Err(CoreError::InvalidInput(_))));

    let escape = ops
        .create_task(
            CreateTaskInput {
                project_id: app.project.id,
                media_path: "../outside.mp4".into(),
                content_data: json!({"caption": "x"}),
                scheduled_at: None,
                priority: None,
            },
            now,
        )
        .await;
    assert!(matches!(escape, Err(CoreError::InvalidInput(_))));

    let created = ops
        .create_task(
            CreateTaskInput {
                project_id: app.project.id,
                media_path: "src/m1.mp4".into(),
                content_data: json!({"caption": "x"}),
                scheduled_at: None,
                priority: None,
            },
            now,
        )
        .await
        .unwrap();
    assert_eq!(created.scheduled_at, now);

    let duplicate = ops
        .create_task(
            CreateTaskInput {
                project_id: app.project.id,
                media_path: "src/m1.mp4".into(),
                content_data: json!({"caption": "y"}),
                scheduled_at: None,
                priority: None,
            },
            now,
        )
        .await;
    assert!(matches!(duplicate, Err(CoreError::Conflict(_))));

    let ghost_project = ops
        .create_task(
            CreateTaskInput {
                project_id: uuid::Uuid::new_v4(),
                media_path: "src/m2.mp4".into(),
                content_data: json!({"caption": "x"}),
                scheduled_at: None,
                priority: None,
            },
            now,
        )
        .await;
    assert!(matches!(ghost_project, Err(CoreError::NotFound(_))));
}

#[tokio::test]
async fn bulk_action_reports_per_id_outcomes() {
    let app = TestApp::new().await;
    let ops = app.ops();
    let now = Utc::now();

    let a = app.seed_task("a.mp4", now + Duration::hours(1), 0).await;
    let b = app.seed_task("b.mp4", now + Duration::hours(2), 0).await;
    let ghost = uuid::Uuid::new_v4();

    let outcomes = ops
        .bulk_action(&[a.id, b.id, ghost], BulkTaskAction::ExecuteNow, now)
        .await
        .unwrap();
    assert_eq!(outcomes.len(), 3);
    assert!(outcomes[0].ok);
    assert!(outcomes[1].ok);
    assert!(!outcomes[2].ok, "unknown id reported per-id, not fatal");

    // Both targets are now due.
    let claimed = app.store().claim_due_tasks("w1", now, 10).await.unwrap();
    assert_eq!(claimed.len(), 2);

    let cancel = ops
        .bulk_action(&[a.id], BulkTaskAction::Cancel, now)
        .await
        .unwrap();
    assert!(!cancel[0].ok, "running task cannot be cancelled");
}

#[tokio::test]
async fn execute_now_makes_future_task_claimable() {
    let app = TestApp::new().await;
    let ops = app.ops();
    let now = Utc::now();
    let task = app.seed_task("a.mp4", now + Duration::days(2), 0).await;

    assert!(app.store().claim_due_tasks("w1", now, 5).await.unwrap().is_empty());

    ops.execute_task_now(task.id, now).await.unwrap();
    let claimed = app.store().claim_due_tasks("w1", now, 5).await.unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].id, task.id);
}

#[tokio::test]
async fn api_key_authentication_roundtrip() {
    let app = TestApp::new().await;
    let ops = app.ops();

    let key = ApiKey::new(
        app.user.id,
        "plain-secret-123",
        "ci",
        vec!["tasks:read".into(), "tasks:write".into()],
    );
    key.insert(app.pool()).await.unwrap();

    let caller = ops.authenticate_key("plain-secret-123").await.unwrap();
    assert_eq!(caller.user.id, app.user.id);
    assert_eq!(caller.permissions, vec!["tasks:read", "tasks:write"]);

    let refreshed = ApiKey::find_by_id(key.id, app.pool()).await.unwrap();
    assert!(refreshed.last_used_at.is_some(), "authentication bumps last_used_at");

    let wrong = ops.authenticate_key("wrong-secret").await;
    assert!(matches!(wrong, Err(CoreError::NotFound(_))));

    // A disabled key is indistinguishable from an unknown one.
    let mut disabled = refreshed;
    disabled.active = false;
    disabled.update(app.pool()).await.unwrap();
    let inactive = ops.authenticate_key("plain-secret-123").await;
    assert!(matches!(inactive, Err(CoreError::NotFound(_))));
}

#[tokio::test]
async fn analytics_overview_aggregates_range() {
    let app = TestApp::new().await;
    let ops = app.ops();
    let now = Utc::now();
    let hour = analytics::hour_floor(now);

    analytics::upsert_hourly(hour, app.project.id, HourlyDelta::success(2.0), app.pool())
        .await
        .unwrap();
    analytics::upsert_hourly(
        hour - Duration::hours(2),
        app.project.id,
        HourlyDelta::failure(1.0),
        app.pool(),
    )
    .await
    .unwrap();

    let overview = ops
        .analytics_overview(TimeRange::last_hours(24, now + Duration::hours(1)), Some(app.project.id))
        .await
        .unwrap();
    assert_eq!(overview.successful_tasks, 1);
    assert_eq!(overview.failed_tasks, 1);
    assert!((overview.total_duration_seconds - 3.0).abs() < 1e-9);

    // A range before the buckets sees nothing.
    let empty = ops
        .analytics_overview(
            TimeRange {
                since: now - Duration::days(30),
                until: now - Duration::days(29),
            },
            Some(app.project.id),
        )
        .await
        .unwrap();
    assert_eq!(empty.successful_tasks, 0);

    let inverted = ops
        .analytics_overview(
            TimeRange {
                since: now,
                until: now - Duration::hours(1),
            },
            None,
        )
        .await;
    assert!(matches!(inverted, Err(CoreError::InvalidInput(_))));
}

#[tokio::test]
async fn health_and_status_surfaces() {
    let app = TestApp::new().await;
    let ops = app.ops();
    let now = Utc::now();
    app.seed_task("a.mp4", now + Duration::hours(1), 0).await;

    let health = ops.health().await;
    assert_eq!(health.db, ComponentHealth::Healthy);
    // No service loop attached in one-shot mode.
    assert_eq!(health.workers, ComponentHealth::Down);
    assert_eq!(health.governor, ComponentHealth::Healthy);

    let status = ops.scheduler_status().await.unwrap();
    assert_eq!(status.backlog, 1);
    assert!(status.last_run_at.is_none());
    assert!(status.pressure.day_remaining > 0.99);

    let counts = ops.counts_by_status().await.unwrap();
    assert_eq!(counts.pending, 1);
    assert_eq!(counts.total(), 1);
}

#[tokio::test]
async fn project_and_source_lifecycle() {
    let app = TestApp::new().await;
    let ops = app.ops();

    let project = ops
        .create_project(app.user.id, "second-project", Some("backup feed"))
        .await
        .unwrap();

    // Unique per owner.
    let duplicate = ops.create_project(app.user.id, "second-project", None).await;
    assert!(matches!(duplicate, Err(CoreError::Conflict(_))));

    let blank = ops.create_project(app.user.id, "   ", None).await;
    assert!(matches!(blank, Err(CoreError::InvalidInput(_))));

    std::fs::create_dir(app.media_root.path().join("feed-b")).unwrap();
    let source = ops.create_source(project.id, "feed-b").await.unwrap();
    assert_eq!(ops.list_sources(project.id).await.unwrap().len(), 1);

    let found = ops.find_project_by_name("second-project").await.unwrap();
    assert_eq!(found.id, project.id);

    ops.delete_source(source.id).await.unwrap();
    ops.delete_project(project.id).await.unwrap();
    let gone = ops.get_project(project.id).await;
    assert!(matches!(gone, Err(CoreError::NotFound(_))));
}

#[tokio::test]
async fn scan_via_ops_reports_counts() {
    let app = TestApp::new().await;
    let ops = app.ops();
    let now = Utc::now();

    app.seed_media("m1.mp4", &json!({"caption": "clip"}));
    app.seed_media("m2.jpg", &json!({"caption": "photo"}));

    let report = ops.scan_project(app.project.id, now).await.unwrap();
    assert_eq!(report.discovered, 2);
    assert_eq!(report.created, 2);

    let unknown = ops.scan_project(uuid::Uuid::new_v4(), now).await;
    assert!(matches!(unknown, Err(CoreError::NotFound(_))));
}
