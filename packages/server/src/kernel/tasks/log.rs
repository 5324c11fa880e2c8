//! Append-only record of publication attempts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::common::error::CoreResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "log_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum LogStatus {
    Success,
    TransientError,
    QuotaError,
    PermanentError,
    LeaseExpired,
    Cancelled,
}

/// One execution attempt. Rows are inserted by the worker (or by stale-claim
/// recovery and cancellation) and never updated.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct PublishingLog {
    pub id: Uuid,
    pub task_id: Uuid,
    pub status: LogStatus,
    /// Platform post id, present on success.
    pub post_id: Option<String>,
    /// The caption as rendered for this attempt.
    pub caption: Option<String>,
    pub error_message: Option<String>,
    pub duration_seconds: Option<f64>,
    pub published_at: DateTime<Utc>,
}

/// A log row under construction.
#[derive(Debug, Clone)]
pub struct NewLog {
    pub task_id: Uuid,
    pub status: LogStatus,
    pub post_id: Option<String>,
    pub caption: Option<String>,
    pub error_message: Option<String>,
    pub duration_seconds: Option<f64>,
    pub published_at: DateTime<Utc>,
}

impl NewLog {
    pub fn success(
        task_id: Uuid,
        post_id: &str,
        caption: &str,
        duration_seconds: f64,
        published_at: DateTime<Utc>,
    ) -> Self {
        Self {
            task_id,
            status: LogStatus::Success,
            post_id: Some(post_id.to_string()),
            caption: Some(caption.to_string()),
            error_message: None,
            duration_seconds: Some(duration_seconds),
            published_at,
        }
    }

    pub fn failure(
        task_id: Uuid,
        status: LogStatus,
        error: &str,
        caption: Option<&str>,
        duration_seconds: f64,
        published_at: DateTime<Utc>,
    ) -> Self {
        Self {
            task_id,
            status,
            post_id: None,
            caption: caption.map(String::from),
            error_message: Some(error.to_string()),
            duration_seconds: Some(duration_seconds),
            published_at,
        }
    }

    pub fn lease_expired(task_id: Uuid, recovered_at: DateTime<Utc>) -> Self {
        Self {
            task_id,
            status: LogStatus::LeaseExpired,
            post_id: None,
            caption: None,
            error_message: Some("claim lease expired".to_string()),
            duration_seconds: None,
            published_at: recovered_at,
        }
    }

    pub fn cancelled(task_id: Uuid, cancelled_at: DateTime<Utc>) -> Self {
        Self {
            task_id,
            status: LogStatus::Cancelled,
            post_id: None,
            caption: None,
            error_message: Some("cancelled".to_string()),
            duration_seconds: None,
            published_at: cancelled_at,
        }
    }

    /// Insert on any executor (pool or open transaction).
    pub async fn insert<'e, E>(&self, db: E) -> CoreResult<PublishingLog>
    where
        E: sqlx::PgExecutor<'e>,
    {
        let row = sqlx::query_as::<_, PublishingLog>(
            r#"
            INSERT INTO publishing_logs
                (id, task_id, status, post_id, caption, error_message,
                 duration_seconds, published_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING id, task_id, status, post_id, caption, error_message,
                      duration_seconds, published_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(self.task_id)
        .bind(self.status)
        .bind(&self.post_id)
        .bind(&self.caption)
        .bind(&self.error_message)
        .bind(self.duration_seconds)
        .bind(self.published_at)
        .fetch_one(db)
        .await?;

        Ok(row)
    }
}

impl PublishingLog {
    /// Attempt history for a task, oldest first.
    pub async fn find_by_task(task_id: Uuid, db: &sqlx::PgPool) -> CoreResult<Vec<Self>> {
        let rows = sqlx::query_as::<_, Self>(
            r#"
            SELECT id, task_id, status, post_id, caption, error_message,
                   duration_seconds, published_at
            FROM publishing_logs
            WHERE task_id = $1
            ORDER BY published_at ASC, id ASC
            "#,
        )
        .bind(task_id)
        .fetch_all(db)
        .await?;

        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_row_carries_post_id_and_duration() {
        let row = NewLog::success(Uuid::new_v4(), "T1", "hello", 1.5, Utc::now());
        assert_eq!(row.status, LogStatus::Success);
        assert_eq!(row.post_id.as_deref(), Some("T1"));
        assert_eq!(row.duration_seconds, Some(1.5));
        assert!(row.error_message.is_none());
    }

    #[test]
    fn lease_expiry_row_has_no_duration() {
        let row = NewLog::lease_expired(Uuid::new_v4(), Utc::now());
        assert_eq!(row.status, LogStatus::LeaseExpired);
        assert!(row.duration_seconds.is_none());
        assert!(row.post_id.is_none());
    }
}
