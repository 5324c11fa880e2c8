//! Publishing-task model and its state machine.
//!
//! Claiming uses a single `FOR UPDATE SKIP LOCKED` CTE so that at most one
//! worker observes a successful claim per task per version. Completion and
//! rescheduling are conditional on the optimistic `version` token; zero rows
//! affected means the caller lost the race and must re-read.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::common::error::{CoreError, CoreResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "task_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    Running,
    Success,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Success | TaskStatus::Failed)
    }
}

const TASK_COLUMNS: &str = "id, project_id, source_id, media_path, content_data, status, \
     scheduled_at, priority, retry_count, worker_id, lease_expires_at, last_error, \
     version, created_at, updated_at";

#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct PublishingTask {
    pub id: Uuid,
    pub project_id: Uuid,
    /// Absent for tasks created directly by an operator.
    pub source_id: Option<Uuid>,
    /// Natural key within the project; relative to the media root.
    pub media_path: String,
    /// Metadata snapshot captured at ingest.
    pub content_data: serde_json::Value,
    pub status: TaskStatus,
    /// Earliest instant at which a worker may claim.
    pub scheduled_at: DateTime<Utc>,
    /// Higher claims first among eligible.
    pub priority: i32,
    /// Cumulative failed attempts.
    pub retry_count: i32,
    pub worker_id: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Optimistic-lock token, bumped on every mutation.
    pub version: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A row to be inserted by [`create`](NewTask). Discovery assigns the
/// provisional `scheduled_at`; the scheduler places it properly later.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub project_id: Uuid,
    pub source_id: Option<Uuid>,
    pub media_path: String,
    pub content_data: serde_json::Value,
    pub scheduled_at: DateTime<Utc>,
    pub priority: i32,
}

/// Result of completing one claimed execution.
#[derive(Debug, Clone)]
pub enum TaskOutcome {
    /// Terminal success.
    Success,
    /// Failed this attempt; retry at the given instant if budget remains.
    Retry {
        error: String,
        retry_at: DateTime<Utc>,
    },
    /// Terminal failure regardless of remaining budget.
    Permanent { error: String },
}

impl PublishingTask {
    pub async fn find_by_id(id: Uuid, db: &PgPool) -> CoreResult<Self> {
        sqlx::query_as::<_, Self>(&format!(
            "SELECT {TASK_COLUMNS} FROM publishing_tasks WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(db)
        .await?
        .ok_or(CoreError::NotFound("task"))
    }

    /// Look up by the natural key `(project_id, media_path)`.
    pub async fn find_by_media_path(
        project_id: Uuid,
        media_path: &str,
        db: &PgPool,
    ) -> CoreResult<Self> {
        sqlx::query_as::<_, Self>(&format!(
            "SELECT {TASK_COLUMNS} FROM publishing_tasks \
             WHERE project_id = $1 AND media_path = $2"
        ))
        .bind(project_id)
        .bind(media_path)
        .fetch_optional(db)
        .await?
        .ok_or(CoreError::NotFound("task"))
    }

    /// Atomically claim up to `limit` due tasks for `worker_id`.
    ///
    /// Eligibility: `pending` with `scheduled_at <= now`, optionally scoped
    /// to one project. Order: `priority DESC, scheduled_at ASC, id ASC`.
    /// Claimed rows move to `running` with a bumped version and a lease of
    /// `lease_ttl_secs`.
    pub async fn claim_due(
        worker_id: &str,
        now: DateTime<Utc>,
        limit: i64,
        lease_ttl_secs: i64,
        project_id: Option<Uuid>,
        db: &PgPool,
    ) -> CoreResult<Vec<Self>> {
        let tasks = sqlx::query_as::<_, Self>(&format!(
            r#"
            WITH due AS (
                SELECT id
                FROM publishing_tasks
                WHERE status = 'pending' AND scheduled_at <= $1
                  AND ($5::uuid IS NULL OR project_id = $5)
                ORDER BY priority DESC, scheduled_at ASC, id ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE publishing_tasks t
            SET status = 'running',
                version = version + 1,
                worker_id = $3,
                lease_expires_at = $1 + make_interval(secs => $4),
                updated_at = NOW()
            FROM due
            WHERE t.id = due.id
            RETURNING {columns}
            "#,
            columns = qualified_columns("t")
        ))
        .bind(now)
        .bind(limit)
        .bind(worker_id)
        .bind(lease_ttl_secs as f64)
        .bind(project_id)
        .fetch_all(db)
        .await?;

        Ok(tasks)
    }

    /// Transition a claimed task out of `running`.
    ///
    /// `Retry` moves the task back to `pending` with an incremented
    /// `retry_count`, unless the attempt budget is spent, in which case it
    /// terminates as `failed`. Returns the resulting status.
    pub async fn complete(
        task_id: Uuid,
        expected_version: i32,
        outcome: &TaskOutcome,
        max_retries: i32,
        db: &PgPool,
    ) -> CoreResult<TaskStatus> {
        let status = match outcome {
            TaskOutcome::Success => {
                sqlx::query_scalar::<_, TaskStatus>(
                    r#"
                    UPDATE publishing_tasks
                    SET status = 'success',
                        worker_id = NULL,
                        lease_expires_at = NULL,
                        last_error = NULL,
                        version = version + 1,
                        updated_at = NOW()
                    WHERE id = $1 AND version = $2 AND status = 'running'
                    RETURNING status
                    "#,
                )
                .bind(task_id)
                .bind(expected_version)
                .fetch_optional(db)
                .await?
            }
            TaskOutcome::Retry { error, retry_at } => {
                sqlx::query_scalar::<_, TaskStatus>(
                    r#"
                    UPDATE publishing_tasks
                    SET status = CASE WHEN retry_count + 1 > $3
                                      THEN 'failed'::task_status
                                      ELSE 'pending'::task_status END,
                        scheduled_at = CASE WHEN retry_count + 1 > $3
                                            THEN scheduled_at
                                            ELSE $4 END,
                        retry_count = retry_count + 1,
                        last_error = $5,
                        worker_id = NULL,
                        lease_expires_at = NULL,
                        version = version + 1,
                        updated_at = NOW()
                    WHERE id = $1 AND version = $2 AND status = 'running'
                    RETURNING status
                    "#,
                )
                .bind(task_id)
                .bind(expected_version)
                .bind(max_retries)
                .bind(retry_at)
                .bind(error)
                .fetch_optional(db)
                .await?
            }
            TaskOutcome::Permanent { error } => {
                sqlx::query_scalar::<_, TaskStatus>(
                    r#"
                    UPDATE publishing_tasks
                    SET status = 'failed',
                        retry_count = retry_count + 1,
                        last_error = $3,
                        worker_id = NULL,
                        lease_expires_at = NULL,
                        version = version + 1,
                        updated_at = NOW()
                    WHERE id = $1 AND version = $2 AND status = 'running'
                    RETURNING status
                    "#,
                )
                .bind(task_id)
                .bind(expected_version)
                .bind(error)
                .fetch_optional(db)
                .await?
            }
        };

        status.ok_or_else(|| {
            CoreError::Conflict(format!(
                "task {task_id} moved past version {expected_version}"
            ))
        })
    }

    /// Move a `pending` task to a new slot, guarded by `version`.
    pub async fn reschedule(
        task_id: Uuid,
        expected_version: i32,
        new_scheduled_at: DateTime<Utc>,
        db: &PgPool,
    ) -> CoreResult<()> {
        let rows = sqlx::query(
            r#"
            UPDATE publishing_tasks
            SET scheduled_at = $3,
                version = version + 1,
                updated_at = NOW()
            WHERE id = $1 AND version = $2 AND status = 'pending'
            "#,
        )
        .bind(task_id)
        .bind(expected_version)
        .bind(new_scheduled_at)
        .execute(db)
        .await?
        .rows_affected();

        if rows == 0 {
            return Err(CoreError::Conflict(format!(
                "task {task_id} moved past version {expected_version}"
            )));
        }
        Ok(())
    }

    /// All pending tasks of a project, in planning order.
    pub async fn pending_for_project(project_id: Uuid, db: &PgPool) -> CoreResult<Vec<Self>> {
        let tasks = sqlx::query_as::<_, Self>(&format!(
            r#"
            SELECT {TASK_COLUMNS}
            FROM publishing_tasks
            WHERE project_id = $1 AND status = 'pending'
            ORDER BY priority DESC, created_at ASC, id ASC
            "#
        ))
        .bind(project_id)
        .fetch_all(db)
        .await?;

        Ok(tasks)
    }

    /// Slots already committed (claimed or published) for a project at or
    /// after `since`. The planner seeds its per-day counters from these.
    pub async fn committed_slots_since(
        project_id: Uuid,
        since: DateTime<Utc>,
        db: &PgPool,
    ) -> CoreResult<Vec<DateTime<Utc>>> {
        let slots = sqlx::query_scalar::<_, DateTime<Utc>>(
            r#"
            SELECT scheduled_at
            FROM publishing_tasks
            WHERE project_id = $1 AND status IN ('running', 'success') AND scheduled_at >= $2
            ORDER BY scheduled_at
            "#,
        )
        .bind(project_id)
        .bind(since)
        .fetch_all(db)
        .await?;

        Ok(slots)
    }

    /// Distinct project ids that currently have pending tasks.
    pub async fn projects_with_backlog(db: &PgPool) -> CoreResult<Vec<Uuid>> {
        let ids = sqlx::query_scalar::<_, Uuid>(
            "SELECT DISTINCT project_id FROM publishing_tasks WHERE status = 'pending'",
        )
        .fetch_all(db)
        .await?;

        Ok(ids)
    }
}

fn qualified_columns(alias: &str) -> String {
    TASK_COLUMNS
        .split(", ")
        .map(|c| format!("{alias}.{}", c.trim()))
        .collect::<Vec<_>>()
        .join(", ")
}
