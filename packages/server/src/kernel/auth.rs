//! Users and API keys.
//!
//! The control surface authenticates callers by hashing the presented key
//! and looking up the hash. Plaintext keys are never stored; the core
//! treats the authenticated caller as opaque beyond its permission set.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::common::error::{CoreError, CoreResult};
use crate::kernel::record::Record;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "user_role", rename_all = "snake_case")]
pub enum UserRole {
    Admin,
    #[default]
    Operator,
    Viewer,
}

#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub role: UserRole,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn new(username: &str, role: UserRole) -> Self {
        Self {
            id: Uuid::new_v4(),
            username: username.to_string(),
            role,
            created_at: Utc::now(),
        }
    }
}

#[async_trait]
impl Record for User {
    const TABLE: &'static str = "users";
    type Id = Uuid;

    async fn find_by_id(id: Uuid, db: &PgPool) -> CoreResult<Self> {
        sqlx::query_as::<_, Self>("SELECT id, username, role, created_at FROM users WHERE id = $1")
            .bind(id)
            .fetch_optional(db)
            .await?
            .ok_or(CoreError::NotFound("user"))
    }

    async fn insert(&self, db: &PgPool) -> CoreResult<Self> {
        let user = sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO users (id, username, role, created_at)
            VALUES ($1, $2, $3, $4)
            RETURNING id, username, role, created_at
            "#,
        )
        .bind(self.id)
        .bind(&self.username)
        .bind(self.role)
        .bind(self.created_at)
        .fetch_one(db)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
                CoreError::Conflict(format!("username {:?} is taken", self.username))
            }
            other => CoreError::Storage(other),
        })?;

        Ok(user)
    }

    async fn update(&self, db: &PgPool) -> CoreResult<Self> {
        sqlx::query_as::<_, Self>(
            r#"
            UPDATE users SET username = $1, role = $2
            WHERE id = $3
            RETURNING id, username, role, created_at
            "#,
        )
        .bind(&self.username)
        .bind(self.role)
        .bind(self.id)
        .fetch_optional(db)
        .await?
        .ok_or(CoreError::NotFound("user"))
    }

    async fn delete(&self, db: &PgPool) -> CoreResult<()> {
        sqlx::query("DELETE FROM users WHERE id = $1")
            .bind(self.id)
            .execute(db)
            .await?;
        Ok(())
    }
}

#[derive(FromRow, Debug, Clone)]
pub struct ApiKey {
    pub id: Uuid,
    pub user_id: Uuid,
    /// hex(SHA-256) of the plaintext key.
    pub key_hash: String,
    pub label: String,
    pub permissions: Vec<String>,
    pub active: bool,
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl ApiKey {
    /// Create a key record for a plaintext secret. The plaintext is hashed
    /// immediately and never retained.
    pub fn new(user_id: Uuid, plaintext: &str, label: &str, permissions: Vec<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            key_hash: hash_key(plaintext),
            label: label.to_string(),
            permissions,
            active: true,
            last_used_at: None,
            created_at: Utc::now(),
        }
    }
}

#[async_trait]
impl Record for ApiKey {
    const TABLE: &'static str = "api_keys";
    type Id = Uuid;

    async fn find_by_id(id: Uuid, db: &PgPool) -> CoreResult<Self> {
        sqlx::query_as::<_, Self>(
            r#"
            SELECT id, user_id, key_hash, label, permissions, active, last_used_at, created_at
            FROM api_keys WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(db)
        .await?
        .ok_or(CoreError::NotFound("api key"))
    }

    async fn insert(&self, db: &PgPool) -> CoreResult<Self> {
        let key = sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO api_keys
                (id, user_id, key_hash, label, permissions, active, last_used_at, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING id, user_id, key_hash, label, permissions, active, last_used_at, created_at
            "#,
        )
        .bind(self.id)
        .bind(self.user_id)
        .bind(&self.key_hash)
        .bind(&self.label)
        .bind(&self.permissions)
        .bind(self.active)
        .bind(self.last_used_at)
        .bind(self.created_at)
        .fetch_one(db)
        .await?;

        Ok(key)
    }

    async fn update(&self, db: &PgPool) -> CoreResult<Self> {
        sqlx::query_as::<_, Self>(
            r#"
            UPDATE api_keys SET label = $1, permissions = $2, active = $3
            WHERE id = $4
            RETURNING id, user_id, key_hash, label, permissions, active, last_used_at, created_at
            "#,
        )
        .bind(&self.label)
        .bind(&self.permissions)
        .bind(self.active)
        .bind(self.id)
        .fetch_optional(db)
        .await?
        .ok_or(CoreError::NotFound("api key"))
    }

    async fn delete(&self, db: &PgPool) -> CoreResult<()> {
        sqlx::query("DELETE FROM api_keys WHERE id = $1")
            .bind(self.id)
            .execute(db)
            .await?;
        Ok(())
    }
}

/// The caller resolved from a valid API key.
#[derive(Debug, Clone, Serialize)]
pub struct AuthenticatedCaller {
    pub user: User,
    pub permissions: Vec<String>,
}

/// Hash a plaintext API key for storage or lookup.
pub fn hash_key(plaintext: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(plaintext.as_bytes());
    hex::encode(hasher.finalize())
}

/// Validate a plaintext key and resolve the calling user.
///
/// Unknown and disabled keys are indistinguishable to the caller. Bumps
/// `last_used_at` on success.
pub async fn authenticate_key(plaintext: &str, db: &PgPool) -> CoreResult<AuthenticatedCaller> {
    let hash = hash_key(plaintext);

    let key = sqlx::query_as::<_, ApiKey>(
        r#"
        UPDATE api_keys
        SET last_used_at = NOW()
        WHERE key_hash = $1 AND active = true
        RETURNING id, user_id, key_hash, label, permissions, active, last_used_at, created_at
        "#,
    )
    .bind(&hash)
    .fetch_optional(db)
    .await?
    .ok_or(CoreError::NotFound("api key"))?;

    let user = User::find_by_id(key.user_id, db).await?;

    Ok(AuthenticatedCaller {
        user,
        permissions: key.permissions,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_stable_and_hex() {
        let a = hash_key("secret-key");
        let b = hash_key("secret-key");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn different_keys_hash_differently() {
        assert_ne!(hash_key("a"), hash_key("b"));
    }

    #[test]
    fn new_key_never_stores_plaintext() {
        let key = ApiKey::new(Uuid::new_v4(), "super-secret", "ci", vec!["tasks:read".into()]);
        assert_ne!(key.key_hash, "super-secret");
        assert!(key.active);
        assert!(key.last_used_at.is_none());
    }
}
