//! Hourly analytics roll-up.
//!
//! Terminal task outcomes are accumulated into `(hour, project)` buckets in
//! the same transaction that appends the publishing log row, so each log row
//! is rolled up exactly once and no sweep or marker column is needed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::common::error::CoreResult;

/// Floor an instant to its UTC hour bucket.
pub fn hour_floor(ts: DateTime<Utc>) -> DateTime<Utc> {
    let secs = ts.timestamp();
    let floored = secs - secs.rem_euclid(3600);
    DateTime::from_timestamp(floored, 0).unwrap_or(ts)
}

/// Counter adjustments for one bucket.
#[derive(Debug, Clone, Copy, Default)]
pub struct HourlyDelta {
    pub successful_tasks: i64,
    pub failed_tasks: i64,
    pub duration_seconds: f64,
}

impl HourlyDelta {
    pub fn success(duration_seconds: f64) -> Self {
        Self {
            successful_tasks: 1,
            failed_tasks: 0,
            duration_seconds,
        }
    }

    pub fn failure(duration_seconds: f64) -> Self {
        Self {
            successful_tasks: 0,
            failed_tasks: 1,
            duration_seconds,
        }
    }
}

#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct AnalyticsHourly {
    pub hour_timestamp: DateTime<Utc>,
    pub project_id: Uuid,
    pub successful_tasks: i64,
    pub failed_tasks: i64,
    pub total_duration_seconds: f64,
}

/// Atomically accumulate a delta into an hour bucket.
pub async fn upsert_hourly<'e, E>(
    hour: DateTime<Utc>,
    project_id: Uuid,
    delta: HourlyDelta,
    db: E,
) -> CoreResult<()>
where
    E: sqlx::PgExecutor<'e>,
{
    sqlx::query(
        r#"
        INSERT INTO analytics_hourly
            (hour_timestamp, project_id, successful_tasks, failed_tasks, total_duration_seconds)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (hour_timestamp, project_id) DO UPDATE SET
            successful_tasks = analytics_hourly.successful_tasks + EXCLUDED.successful_tasks,
            failed_tasks = analytics_hourly.failed_tasks + EXCLUDED.failed_tasks,
            total_duration_seconds =
                analytics_hourly.total_duration_seconds + EXCLUDED.total_duration_seconds
        "#,
    )
    .bind(hour)
    .bind(project_id)
    .bind(delta.successful_tasks)
    .bind(delta.failed_tasks)
    .bind(delta.duration_seconds)
    .execute(db)
    .await?;

    Ok(())
}

/// Aggregate numbers over a time range.
#[derive(FromRow, Debug, Clone, Default, Serialize)]
pub struct AnalyticsOverview {
    pub successful_tasks: i64,
    pub failed_tasks: i64,
    pub total_duration_seconds: f64,
}

impl AnalyticsOverview {
    pub fn success_rate(&self) -> f64 {
        let total = self.successful_tasks + self.failed_tasks;
        if total == 0 {
            return 0.0;
        }
        self.successful_tasks as f64 / total as f64
    }
}

pub async fn overview(
    project_id: Option<Uuid>,
    since: DateTime<Utc>,
    until: DateTime<Utc>,
    db: &PgPool,
) -> CoreResult<AnalyticsOverview> {
    let row = sqlx::query_as::<_, AnalyticsOverview>(
        r#"
        SELECT COALESCE(SUM(successful_tasks), 0)::BIGINT AS successful_tasks,
               COALESCE(SUM(failed_tasks), 0)::BIGINT AS failed_tasks,
               COALESCE(SUM(total_duration_seconds), 0)::DOUBLE PRECISION
                   AS total_duration_seconds
        FROM analytics_hourly
        WHERE hour_timestamp >= $1 AND hour_timestamp < $2
          AND ($3::uuid IS NULL OR project_id = $3)
        "#,
    )
    .bind(since)
    .bind(until)
    .bind(project_id)
    .fetch_one(db)
    .await?;

    Ok(row)
}

/// Per-hour buckets over a time range, oldest first.
pub async fn trends(
    project_id: Option<Uuid>,
    since: DateTime<Utc>,
    until: DateTime<Utc>,
    db: &PgPool,
) -> CoreResult<Vec<AnalyticsHourly>> {
    let rows = sqlx::query_as::<_, AnalyticsHourly>(
        r#"
        SELECT hour_timestamp, project_id, successful_tasks, failed_tasks,
               total_duration_seconds
        FROM analytics_hourly
        WHERE hour_timestamp >= $1 AND hour_timestamp < $2
          AND ($3::uuid IS NULL OR project_id = $3)
        ORDER BY hour_timestamp ASC
        "#,
    )
    .bind(since)
    .bind(until)
    .bind(project_id)
    .fetch_all(db)
    .await?;

    Ok(rows)
}
