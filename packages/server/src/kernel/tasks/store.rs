//! Durable task store.
//!
//! The store is the sole arbiter of task state: workers, the scheduler and
//! the control surface all go through it and never cache rows. Every
//! operation is one transaction; multi-row writes that must be atomic (log
//! append + hourly roll-up, stale-claim recovery + log rows) share one.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use crate::common::error::{CoreError, CoreResult};
use crate::common::pagination::{Page, Paged};
use crate::config::WorkerConfig;
use crate::kernel::analytics::{self, HourlyDelta};
use crate::kernel::tasks::log::{NewLog, PublishingLog};
use crate::kernel::tasks::task::{NewTask, PublishingTask, TaskOutcome, TaskStatus};

#[derive(Debug, Clone)]
pub struct TaskStore {
    pool: PgPool,
    max_retries: i32,
    lease_ttl_secs: i64,
}

/// Outcome of an idempotent batch insert.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CreateReport {
    pub created: usize,
    /// Rows skipped because `(project_id, media_path)` already existed.
    pub skipped: usize,
}

/// Filters for task listings.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub project_id: Option<Uuid>,
}

/// Operator patch for a pending task.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct TaskPatch {
    pub priority: Option<i32>,
    pub scheduled_at: Option<DateTime<Utc>>,
}

/// Task counts by status.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct StatusCounts {
    pub pending: i64,
    pub running: i64,
    pub success: i64,
    pub failed: i64,
}

impl StatusCounts {
    pub fn total(&self) -> i64 {
        self.pending + self.running + self.success + self.failed
    }
}

impl TaskStore {
    pub fn new(pool: PgPool, max_retries: i32, lease_ttl_secs: i64) -> Self {
        Self {
            pool,
            max_retries,
            lease_ttl_secs,
        }
    }

    pub fn from_config(pool: PgPool, workers: &WorkerConfig) -> Self {
        Self::new(pool, workers.max_retries, workers.lease_ttl_s)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn max_retries(&self) -> i32 {
        self.max_retries
    }

    /// Idempotent batch insert. Rows colliding on `(project_id, media_path)`
    /// are silently skipped and reported in the count.
    pub async fn create_tasks(&self, batch: &[NewTask]) -> CoreResult<CreateReport> {
        let mut report = CreateReport::default();
        let mut tx = self.pool.begin().await?;

        for task in batch {
            let rows = sqlx::query(
                r#"
                INSERT INTO publishing_tasks
                    (id, project_id, source_id, media_path, content_data, status,
                     scheduled_at, priority, retry_count, version, created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, 'pending', $6, $7, 0, 1, NOW(), NOW())
                ON CONFLICT (project_id, media_path) DO NOTHING
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(task.project_id)
            .bind(task.source_id)
            .bind(&task.media_path)
            .bind(&task.content_data)
            .bind(task.scheduled_at)
            .bind(task.priority)
            .execute(&mut *tx)
            .await?
            .rows_affected();

            if rows == 1 {
                report.created += 1;
            } else {
                report.skipped += 1;
            }
        }

        tx.commit().await?;
        Ok(report)
    }

    /// See [`PublishingTask::claim_due`].
    pub async fn claim_due_tasks(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
        limit: i64,
    ) -> CoreResult<Vec<PublishingTask>> {
        PublishingTask::claim_due(worker_id, now, limit, self.lease_ttl_secs, None, &self.pool)
            .await
    }

    /// Claim scoped to one project, for bounded one-shot runs.
    pub async fn claim_due_tasks_for_project(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
        limit: i64,
        project_id: Uuid,
    ) -> CoreResult<Vec<PublishingTask>> {
        PublishingTask::claim_due(
            worker_id,
            now,
            limit,
            self.lease_ttl_secs,
            Some(project_id),
            &self.pool,
        )
        .await
    }

    /// See [`PublishingTask::complete`].
    pub async fn complete_task(
        &self,
        task_id: Uuid,
        expected_version: i32,
        outcome: &TaskOutcome,
    ) -> CoreResult<TaskStatus> {
        PublishingTask::complete(task_id, expected_version, outcome, self.max_retries, &self.pool)
            .await
    }

    /// See [`PublishingTask::reschedule`].
    pub async fn reschedule_task(
        &self,
        task_id: Uuid,
        expected_version: i32,
        new_scheduled_at: DateTime<Utc>,
    ) -> CoreResult<()> {
        PublishingTask::reschedule(task_id, expected_version, new_scheduled_at, &self.pool).await
    }

    pub async fn get_task(&self, task_id: Uuid) -> CoreResult<PublishingTask> {
        PublishingTask::find_by_id(task_id, &self.pool).await
    }

    /// Append a log row and, for terminal outcomes, fold it into the hourly
    /// bucket. Both writes commit atomically.
    pub async fn record_outcome(
        &self,
        log: NewLog,
        project_id: Uuid,
        rollup: Option<HourlyDelta>,
    ) -> CoreResult<PublishingLog> {
        let mut tx = self.pool.begin().await?;

        let row = log.insert(&mut *tx).await?;
        if let Some(delta) = rollup {
            let hour = analytics::hour_floor(row.published_at);
            analytics::upsert_hourly(hour, project_id, delta, &mut *tx).await?;
        }

        tx.commit().await?;
        Ok(row)
    }

    /// Append a log row without touching the roll-up.
    pub async fn append_log(&self, log: NewLog) -> CoreResult<PublishingLog> {
        log.insert(&self.pool).await
    }

    pub async fn list_logs(&self, task_id: Uuid) -> CoreResult<Vec<PublishingLog>> {
        PublishingLog::find_by_task(task_id, &self.pool).await
    }

    /// Revert `running` rows whose lease expired at or before `now`.
    ///
    /// Each recovered task goes back to `pending` with `retry_count + 1`
    /// (terminal `failed` once the budget is spent) and gets a
    /// `lease_expired` log row, all in one transaction.
    pub async fn recover_stale_claims(&self, now: DateTime<Utc>) -> CoreResult<Vec<Uuid>> {
        let mut tx = self.pool.begin().await?;

        let recovered: Vec<Uuid> = sqlx::query_scalar(
            r#"
            UPDATE publishing_tasks
            SET status = CASE WHEN retry_count + 1 > $2
                              THEN 'failed'::task_status
                              ELSE 'pending'::task_status END,
                retry_count = retry_count + 1,
                worker_id = NULL,
                lease_expires_at = NULL,
                last_error = 'claim lease expired',
                version = version + 1,
                updated_at = NOW()
            WHERE status = 'running' AND lease_expires_at <= $1
            RETURNING id
            "#,
        )
        .bind(now)
        .bind(self.max_retries)
        .fetch_all(&mut *tx)
        .await?;

        for task_id in &recovered {
            NewLog::lease_expired(*task_id, now).insert(&mut *tx).await?;
        }

        tx.commit().await?;

        if !recovered.is_empty() {
            tracing::warn!(count = recovered.len(), "recovered stale claims");
        }
        Ok(recovered)
    }

    pub async fn list_tasks(
        &self,
        filter: TaskFilter,
        page: Page,
    ) -> CoreResult<Paged<PublishingTask>> {
        page.validate()?;

        let total: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM publishing_tasks
            WHERE ($1::task_status IS NULL OR status = $1)
              AND ($2::uuid IS NULL OR project_id = $2)
            "#,
        )
        .bind(filter.status)
        .bind(filter.project_id)
        .fetch_one(&self.pool)
        .await?;

        let items = sqlx::query_as::<_, PublishingTask>(
            r#"
            SELECT id, project_id, source_id, media_path, content_data, status,
                   scheduled_at, priority, retry_count, worker_id, lease_expires_at,
                   last_error, version, created_at, updated_at
            FROM publishing_tasks
            WHERE ($1::task_status IS NULL OR status = $1)
              AND ($2::uuid IS NULL OR project_id = $2)
            ORDER BY scheduled_at ASC, id ASC
            OFFSET $3 LIMIT $4
            "#,
        )
        .bind(filter.status)
        .bind(filter.project_id)
        .bind(page.offset)
        .bind(page.limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(Paged::new(items, total, page))
    }

    pub async fn counts_by_status(&self) -> CoreResult<StatusCounts> {
        let rows = sqlx::query_as::<_, (TaskStatus, i64)>(
            "SELECT status, COUNT(*) FROM publishing_tasks GROUP BY status",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut counts = StatusCounts::default();
        for (status, count) in rows {
            match status {
                TaskStatus::Pending => counts.pending = count,
                TaskStatus::Running => counts.running = count,
                TaskStatus::Success => counts.success = count,
                TaskStatus::Failed => counts.failed = count,
            }
        }
        Ok(counts)
    }

    /// Operator patch; only `pending` tasks can move.
    pub async fn update_task(
        &self,
        task_id: Uuid,
        patch: TaskPatch,
    ) -> CoreResult<PublishingTask> {
        let updated = sqlx::query_as::<_, PublishingTask>(
            r#"
            UPDATE publishing_tasks
            SET priority = COALESCE($2, priority),
                scheduled_at = COALESCE($3, scheduled_at),
                version = version + 1,
                updated_at = NOW()
            WHERE id = $1 AND status = 'pending'
            RETURNING id, project_id, source_id, media_path, content_data, status,
                      scheduled_at, priority, retry_count, worker_id, lease_expires_at,
                      last_error, version, created_at, updated_at
            "#,
        )
        .bind(task_id)
        .bind(patch.priority)
        .bind(patch.scheduled_at)
        .fetch_optional(&self.pool)
        .await?;

        match updated {
            Some(task) => Ok(task),
            None => {
                let task = self.get_task(task_id).await?;
                Err(CoreError::Conflict(format!(
                    "task {task_id} is {:?}, only pending tasks can be updated",
                    task.status
                )))
            }
        }
    }

    /// Make a pending task immediately claimable.
    pub async fn execute_task_now(&self, task_id: Uuid, now: DateTime<Utc>) -> CoreResult<()> {
        self.update_task(
            task_id,
            TaskPatch {
                priority: None,
                scheduled_at: Some(now),
            },
        )
        .await?;
        Ok(())
    }

    /// Cancel a pending task: terminal `failed` with a cancellation log row.
    pub async fn cancel_task(&self, task_id: Uuid, now: DateTime<Utc>) -> CoreResult<()> {
        let mut tx = self.pool.begin().await?;

        let cancelled: Option<Uuid> = sqlx::query_scalar(
            r#"
            UPDATE publishing_tasks
            SET status = 'failed',
                last_error = 'cancelled',
                worker_id = NULL,
                lease_expires_at = NULL,
                version = version + 1,
                updated_at = NOW()
            WHERE id = $1 AND status = 'pending'
            RETURNING id
            "#,
        )
        .bind(task_id)
        .fetch_optional(&mut *tx)
        .await?;

        match cancelled {
            Some(id) => {
                NewLog::cancelled(id, now).insert(&mut *tx).await?;
                tx.commit().await?;
                Ok(())
            }
            None => {
                tx.rollback().await?;
                let task = self.get_task(task_id).await?;
                Err(CoreError::Conflict(format!(
                    "task {task_id} is {:?}, only pending tasks can be cancelled",
                    task.status
                )))
            }
        }
    }

    pub async fn delete_task(&self, task_id: Uuid) -> CoreResult<()> {
        let rows = sqlx::query("DELETE FROM publishing_tasks WHERE id = $1")
            .bind(task_id)
            .execute(&self.pool)
            .await?
            .rows_affected();

        if rows == 0 {
            return Err(CoreError::NotFound("task"));
        }
        Ok(())
    }

    /// How many tasks exist for a source (any status). The scanner uses this
    /// for the `used_items` counter.
    pub async fn count_tasks_for_source(&self, source_id: Uuid) -> CoreResult<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM publishing_tasks WHERE source_id = $1")
                .bind(source_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }
}
