//! Control-surface operations.
//!
//! The HTTP layer (out of tree) and the CLI are thin adapters over this
//! operation set. Every method is side-effect-scoped, returns structured
//! results, and surfaces failures as [`CoreError`] without leaking internal
//! detail.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::common::error::{CoreError, CoreResult};
use crate::common::pagination::{Page, Paged};
use crate::common::paths::normalize_media_path;
use crate::kernel::analytics::{self, AnalyticsHourly, AnalyticsOverview};
use crate::kernel::auth::{self, AuthenticatedCaller};
use crate::kernel::deps::EngineDeps;
use crate::kernel::governor::Pressure;
use crate::kernel::projects::{ContentSource, Project};
use crate::kernel::record::Record;
use crate::kernel::scanner::{ScanReport, Scanner};
use crate::kernel::service::ServiceStatus;
use crate::kernel::tasks::log::PublishingLog;
use crate::kernel::tasks::store::{StatusCounts, TaskFilter, TaskPatch};
use crate::kernel::tasks::task::{NewTask, PublishingTask};

/// Inputs for operator-created tasks.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateTaskInput {
    pub project_id: Uuid,
    pub media_path: String,
    pub content_data: serde_json::Value,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub priority: Option<i32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BulkTaskAction {
    ExecuteNow,
    Cancel,
    Delete,
}

/// Per-id result of a bulk action.
#[derive(Debug, Clone, Serialize)]
pub struct BulkOutcome {
    pub task_id: Uuid,
    pub ok: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentHealth {
    Healthy,
    Degraded,
    Down,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct Health {
    pub db: ComponentHealth,
    pub workers: ComponentHealth,
    pub governor: ComponentHealth,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub last_run_at: Option<DateTime<Utc>>,
    pub backlog: i64,
    pub pressure: Pressure,
}

/// Time range for analytics queries.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct TimeRange {
    pub since: DateTime<Utc>,
    pub until: DateTime<Utc>,
}

impl TimeRange {
    pub fn last_hours(hours: i64, now: DateTime<Utc>) -> Self {
        Self {
            since: now - Duration::hours(hours),
            until: now,
        }
    }

    fn validate(&self) -> CoreResult<()> {
        if self.since >= self.until {
            return Err(CoreError::InvalidInput("range start must precede end".into()));
        }
        Ok(())
    }
}

/// The control-surface facade over the engine.
#[derive(Clone)]
pub struct Ops {
    deps: Arc<EngineDeps>,
    status: Option<Arc<tokio::sync::RwLock<ServiceStatus>>>,
}

impl Ops {
    pub fn new(deps: Arc<EngineDeps>) -> Self {
        Self { deps, status: None }
    }

    /// Attach the live service status published by `serve`.
    pub fn with_status(mut self, status: Arc<tokio::sync::RwLock<ServiceStatus>>) -> Self {
        self.status = Some(status);
        self
    }

    // ---- tasks ----

    pub async fn list_tasks(
        &self,
        filter: TaskFilter,
        page: Page,
    ) -> CoreResult<Paged<PublishingTask>> {
        self.deps.store.list_tasks(filter, page).await
    }

    pub async fn get_task(&self, task_id: Uuid) -> CoreResult<PublishingTask> {
        self.deps.store.get_task(task_id).await
    }

    pub async fn list_task_logs(&self, task_id: Uuid) -> CoreResult<Vec<PublishingLog>> {
        // Surface not-found before returning an empty history.
        self.deps.store.get_task(task_id).await?;
        self.deps.store.list_logs(task_id).await
    }

    pub async fn create_task(
        &self,
        input: CreateTaskInput,
        now: DateTime<Utc>,
    ) -> CoreResult<PublishingTask> {
        Project::find_by_id(input.project_id, &self.deps.pool).await?;

        if !input.content_data.is_object() {
            return Err(CoreError::InvalidInput(
                "content_data must be a JSON object".into(),
            ));
        }
        let media_path =
            normalize_media_path(&self.deps.config.media.root, Path::new(&input.media_path))?;

        let report = self
            .deps
            .store
            .create_tasks(&[NewTask {
                project_id: input.project_id,
                source_id: None,
                media_path: media_path.clone(),
                content_data: input.content_data,
                scheduled_at: input.scheduled_at.unwrap_or(now),
                priority: input.priority.unwrap_or(0),
            }])
            .await?;

        if report.created == 0 {
            return Err(CoreError::Conflict(format!(
                "task for {media_path:?} already exists in this project"
            )));
        }

        PublishingTask::find_by_media_path(input.project_id, &media_path, &self.deps.pool).await
    }

    pub async fn update_task(&self, task_id: Uuid, patch: TaskPatch) -> CoreResult<PublishingTask> {
        self.deps.store.update_task(task_id, patch).await
    }

    pub async fn delete_task(&self, task_id: Uuid) -> CoreResult<()> {
        self.deps.store.delete_task(task_id).await
    }

    pub async fn execute_task_now(&self, task_id: Uuid, now: DateTime<Utc>) -> CoreResult<()> {
        self.deps.store.execute_task_now(task_id, now).await
    }

    pub async fn cancel_task(&self, task_id: Uuid, now: DateTime<Utc>) -> CoreResult<()> {
        self.deps.store.cancel_task(task_id, now).await
    }

    pub async fn bulk_action(
        &self,
        task_ids: &[Uuid],
        action: BulkTaskAction,
        now: DateTime<Utc>,
    ) -> CoreResult<Vec<BulkOutcome>> {
        let mut outcomes = Vec::with_capacity(task_ids.len());
        for task_id in task_ids {
            let result = match action {
                BulkTaskAction::ExecuteNow => self.execute_task_now(*task_id, now).await,
                BulkTaskAction::Cancel => self.cancel_task(*task_id, now).await,
                BulkTaskAction::Delete => self.delete_task(*task_id).await,
            };
            outcomes.push(match result {
                Ok(()) => BulkOutcome {
                    task_id: *task_id,
                    ok: true,
                    error: None,
                },
                Err(e) => BulkOutcome {
                    task_id: *task_id,
                    ok: false,
                    error: Some(e.to_string()),
                },
            });
        }
        Ok(outcomes)
    }

    pub async fn counts_by_status(&self) -> CoreResult<StatusCounts> {
        self.deps.store.counts_by_status().await
    }

    // ---- projects and sources ----

    pub async fn create_project(
        &self,
        owner_id: Uuid,
        name: &str,
        description: Option<&str>,
    ) -> CoreResult<Project> {
        if name.trim().is_empty() {
            return Err(CoreError::InvalidInput("project name must not be empty".into()));
        }
        Project::new(owner_id, name.trim(), description)
            .insert(&self.deps.pool)
            .await
    }

    pub async fn get_project(&self, project_id: Uuid) -> CoreResult<Project> {
        Project::find_by_id(project_id, &self.deps.pool).await
    }

    pub async fn find_project_by_name(&self, name: &str) -> CoreResult<Project> {
        Project::find_by_name(name, &self.deps.pool)
            .await?
            .ok_or(CoreError::NotFound("project"))
    }

    pub async fn list_projects(&self) -> CoreResult<Vec<Project>> {
        Project::list(&self.deps.pool).await
    }

    pub async fn delete_project(&self, project_id: Uuid) -> CoreResult<()> {
        let project = Project::find_by_id(project_id, &self.deps.pool).await?;
        project.delete(&self.deps.pool).await
    }

    pub async fn create_source(&self, project_id: Uuid, path: &str) -> CoreResult<ContentSource> {
        Project::find_by_id(project_id, &self.deps.pool).await?;
        let normalized =
            normalize_media_path(&self.deps.config.media.root, Path::new(path))?;
        ContentSource::new(project_id, &normalized)
            .insert(&self.deps.pool)
            .await
    }

    pub async fn list_sources(&self, project_id: Uuid) -> CoreResult<Vec<ContentSource>> {
        ContentSource::find_by_project(project_id, &self.deps.pool).await
    }

    pub async fn delete_source(&self, source_id: Uuid) -> CoreResult<()> {
        let source = ContentSource::find_by_id(source_id, &self.deps.pool).await?;
        source.delete(&self.deps.pool).await
    }

    pub async fn scan_project(&self, project_id: Uuid, now: DateTime<Utc>) -> CoreResult<ScanReport> {
        Project::find_by_id(project_id, &self.deps.pool).await?;
        Scanner::new(Arc::clone(&self.deps)).scan_project(project_id, now).await
    }

    // ---- status surfaces ----

    pub async fn scheduler_status(&self) -> CoreResult<SchedulerStatus> {
        let counts = self.deps.store.counts_by_status().await?;
        let last_run_at = match &self.status {
            Some(status) => status.read().await.scheduler_last_run,
            None => None,
        };
        Ok(SchedulerStatus {
            last_run_at,
            backlog: counts.pending,
            pressure: self.deps.governor.pressure().await,
        })
    }

    pub async fn governor_status(&self) -> Pressure {
        self.deps.governor.pressure().await
    }

    pub async fn health(&self) -> Health {
        let db = match sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&self.deps.pool)
            .await
        {
            Ok(_) => ComponentHealth::Healthy,
            Err(_) => ComponentHealth::Down,
        };

        let workers = match &self.status {
            Some(status) => {
                let status = status.read().await;
                if status.workers_alive == 0 {
                    ComponentHealth::Down
                } else if status.workers_alive < self.deps.config.workers.count {
                    ComponentHealth::Degraded
                } else {
                    ComponentHealth::Healthy
                }
            }
            // No service loop attached (one-shot CLI invocations).
            None => ComponentHealth::Down,
        };

        let pressure = self.deps.governor.pressure().await;
        let governor = if pressure.day_remaining <= 0.0 {
            ComponentHealth::Degraded
        } else {
            ComponentHealth::Healthy
        };

        Health {
            db,
            workers,
            governor,
        }
    }

    // ---- analytics ----

    pub async fn analytics_overview(
        &self,
        range: TimeRange,
        project_id: Option<Uuid>,
    ) -> CoreResult<AnalyticsOverview> {
        range.validate()?;
        analytics::overview(project_id, range.since, range.until, &self.deps.pool).await
    }

    pub async fn analytics_trends(
        &self,
        range: TimeRange,
        project_id: Option<Uuid>,
    ) -> CoreResult<Vec<AnalyticsHourly>> {
        range.validate()?;
        analytics::trends(project_id, range.since, range.until, &self.deps.pool).await
    }

    // ---- auth ----

    pub async fn authenticate_key(&self, plaintext: &str) -> CoreResult<AuthenticatedCaller> {
        auth::authenticate_key(plaintext, &self.deps.pool).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn time_range_rejects_inverted_bounds() {
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap();
        let range = TimeRange {
            since: now,
            until: now - Duration::hours(1),
        };
        assert!(range.validate().is_err());
        assert!(TimeRange::last_hours(24, now).validate().is_ok());
    }
}
