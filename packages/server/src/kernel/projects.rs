//! Project and content-source models.
//!
//! A project is a logical content namespace; content sources are the
//! directories under it that the scanner walks. Source counters are mutated
//! only by the scanner.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::common::error::{CoreError, CoreResult};
use crate::kernel::record::Record;

#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Project {
    pub fn new(owner_id: Uuid, name: &str, description: Option<&str>) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner_id,
            name: name.to_string(),
            description: description.map(String::from),
            created_at: Utc::now(),
        }
    }

    /// Find a project by name, across owners.
    pub async fn find_by_name(name: &str, db: &PgPool) -> CoreResult<Option<Self>> {
        let project = sqlx::query_as::<_, Self>(
            "SELECT id, owner_id, name, description, created_at FROM projects WHERE name = $1 LIMIT 1",
        )
        .bind(name)
        .fetch_optional(db)
        .await?;

        Ok(project)
    }

    pub async fn list(db: &PgPool) -> CoreResult<Vec<Self>> {
        let projects = sqlx::query_as::<_, Self>(
            "SELECT id, owner_id, name, description, created_at FROM projects ORDER BY name",
        )
        .fetch_all(db)
        .await?;

        Ok(projects)
    }
}

#[async_trait]
impl Record for Project {
    const TABLE: &'static str = "projects";
    type Id = Uuid;

    async fn find_by_id(id: Uuid, db: &PgPool) -> CoreResult<Self> {
        sqlx::query_as::<_, Self>(
            "SELECT id, owner_id, name, description, created_at FROM projects WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(db)
        .await?
        .ok_or(CoreError::NotFound("project"))
    }

    async fn insert(&self, db: &PgPool) -> CoreResult<Self> {
        let project = sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO projects (id, owner_id, name, description, created_at)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id, owner_id, name, description, created_at
            "#,
        )
        .bind(self.id)
        .bind(self.owner_id)
        .bind(&self.name)
        .bind(&self.description)
        .bind(self.created_at)
        .fetch_one(db)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
                CoreError::Conflict(format!("project {:?} already exists for owner", self.name))
            }
            other => CoreError::Storage(other),
        })?;

        Ok(project)
    }

    async fn update(&self, db: &PgPool) -> CoreResult<Self> {
        sqlx::query_as::<_, Self>(
            r#"
            UPDATE projects SET name = $1, description = $2
            WHERE id = $3
            RETURNING id, owner_id, name, description, created_at
            "#,
        )
        .bind(&self.name)
        .bind(&self.description)
        .bind(self.id)
        .fetch_optional(db)
        .await?
        .ok_or(CoreError::NotFound("project"))
    }

    async fn delete(&self, db: &PgPool) -> CoreResult<()> {
        sqlx::query("DELETE FROM projects WHERE id = $1")
            .bind(self.id)
            .execute(db)
            .await?;
        Ok(())
    }
}

/// Type tag for a content source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "source_kind", rename_all = "snake_case")]
pub enum SourceKind {
    #[default]
    Directory,
}

#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct ContentSource {
    pub id: Uuid,
    pub project_id: Uuid,
    /// Path relative to the media root (or absolute under it at creation).
    pub path: String,
    pub kind: SourceKind,
    pub enabled: bool,
    pub total_items: i32,
    pub used_items: i32,
    pub last_scanned: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl ContentSource {
    pub fn new(project_id: Uuid, path: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            project_id,
            path: path.to_string(),
            kind: SourceKind::Directory,
            enabled: true,
            total_items: 0,
            used_items: 0,
            last_scanned: None,
            created_at: Utc::now(),
        }
    }

    pub async fn find_by_project(project_id: Uuid, db: &PgPool) -> CoreResult<Vec<Self>> {
        let sources = sqlx::query_as::<_, Self>(
            r#"
            SELECT id, project_id, path, kind, enabled, total_items, used_items,
                   last_scanned, created_at
            FROM content_sources
            WHERE project_id = $1
            ORDER BY created_at
            "#,
        )
        .bind(project_id)
        .fetch_all(db)
        .await?;

        Ok(sources)
    }

    pub async fn find_enabled(db: &PgPool) -> CoreResult<Vec<Self>> {
        let sources = sqlx::query_as::<_, Self>(
            r#"
            SELECT id, project_id, path, kind, enabled, total_items, used_items,
                   last_scanned, created_at
            FROM content_sources
            WHERE enabled = true
            ORDER BY created_at
            "#,
        )
        .fetch_all(db)
        .await?;

        Ok(sources)
    }

    /// Record the result of a scan. The scanner is the only caller.
    pub async fn record_scan(
        &self,
        total_items: i32,
        used_items: i32,
        scanned_at: DateTime<Utc>,
        db: &PgPool,
    ) -> CoreResult<()> {
        sqlx::query(
            r#"
            UPDATE content_sources
            SET total_items = $1, used_items = $2, last_scanned = $3
            WHERE id = $4
            "#,
        )
        .bind(total_items)
        .bind(used_items)
        .bind(scanned_at)
        .bind(self.id)
        .execute(db)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl Record for ContentSource {
    const TABLE: &'static str = "content_sources";
    type Id = Uuid;

    async fn find_by_id(id: Uuid, db: &PgPool) -> CoreResult<Self> {
        sqlx::query_as::<_, Self>(
            r#"
            SELECT id, project_id, path, kind, enabled, total_items, used_items,
                   last_scanned, created_at
            FROM content_sources
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(db)
        .await?
        .ok_or(CoreError::NotFound("content source"))
    }

    async fn insert(&self, db: &PgPool) -> CoreResult<Self> {
        let source = sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO content_sources
                (id, project_id, path, kind, enabled, total_items, used_items,
                 last_scanned, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING id, project_id, path, kind, enabled, total_items, used_items,
                      last_scanned, created_at
            "#,
        )
        .bind(self.id)
        .bind(self.project_id)
        .bind(&self.path)
        .bind(self.kind)
        .bind(self.enabled)
        .bind(self.total_items)
        .bind(self.used_items)
        .bind(self.last_scanned)
        .bind(self.created_at)
        .fetch_one(db)
        .await?;

        Ok(source)
    }

    async fn update(&self, db: &PgPool) -> CoreResult<Self> {
        sqlx::query_as::<_, Self>(
            r#"
            UPDATE content_sources
            SET path = $1, kind = $2, enabled = $3
            WHERE id = $4
            RETURNING id, project_id, path, kind, enabled, total_items, used_items,
                      last_scanned, created_at
            "#,
        )
        .bind(&self.path)
        .bind(self.kind)
        .bind(self.enabled)
        .bind(self.id)
        .fetch_optional(db)
        .await?
        .ok_or(CoreError::NotFound("content source"))
    }

    async fn delete(&self, db: &PgPool) -> CoreResult<()> {
        sqlx::query("DELETE FROM content_sources WHERE id = $1")
            .bind(self.id)
            .execute(db)
            .await?;
        Ok(())
    }
}
