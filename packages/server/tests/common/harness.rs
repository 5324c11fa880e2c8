//! Test harness with testcontainers for integration testing.
//!
//! One Postgres container is shared across the whole test run; each test
//! gets its own freshly migrated database inside it, so assertions never
//! see another test's rows.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tempfile::TempDir;
use testcontainers::runners::AsyncRunner;
use testcontainers::ContainerAsync;
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;
use uuid::Uuid;

use server_core::config::CoreConfig;
use server_core::kernel::auth::{User, UserRole};
use server_core::kernel::deps::EngineDeps;
use server_core::kernel::generator::PassthroughGenerator;
use server_core::kernel::governor::RateGovernor;
use server_core::kernel::ops::Ops;
use server_core::kernel::projects::{ContentSource, Project};
use server_core::kernel::publisher::Publisher;
use server_core::kernel::record::Record;
use server_core::kernel::scanner::Scanner;
use server_core::kernel::scheduler::{Cadence, Scheduler};
use server_core::kernel::tasks::store::TaskStore;
use server_core::kernel::tasks::task::{NewTask, PublishingTask};
use server_core::kernel::tasks::worker::WorkerPoolConfig;

use super::mocks::MockPublisher;

/// Whole-second "now": survives the store's microsecond precision, so
/// round-tripped instants compare equal.
pub fn test_now() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp(now.timestamp(), 0).expect("valid timestamp")
}

struct SharedTestInfra {
    admin_pool: PgPool,
    base_url: String,
    _postgres: ContainerAsync<Postgres>,
}

static SHARED_INFRA: OnceCell<SharedTestInfra> = OnceCell::const_new();

impl SharedTestInfra {
    async fn init() -> Result<Self> {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        let postgres = Postgres::default()
            .start()
            .await
            .context("Failed to start Postgres container")?;

        let host = postgres.get_host().await?;
        let port = postgres.get_host_port_ipv4(5432).await?;
        let base_url = format!("postgres://postgres:postgres@{host}:{port}");

        let admin_pool = PgPool::connect(&format!("{base_url}/postgres"))
            .await
            .context("Failed to connect to Postgres")?;

        Ok(Self {
            admin_pool,
            base_url,
            _postgres: postgres,
        })
    }

    async fn get() -> &'static Self {
        SHARED_INFRA
            .get_or_init(|| async {
                Self::init()
                    .await
                    .expect("Failed to initialize shared test infrastructure")
            })
            .await
    }
}

/// Per-test application: isolated database, temp media root, mock egress.
pub struct TestApp {
    pub deps: Arc<EngineDeps>,
    pub publisher: Arc<MockPublisher>,
    pub media_root: TempDir,
    pub user: User,
    pub project: Project,
    pub source: ContentSource,
}

impl TestApp {
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    pub async fn with_config(tweak: impl FnOnce(&mut CoreConfig)) -> Self {
        let infra = SharedTestInfra::get().await;

        let db_name = format!("test_{}", Uuid::new_v4().simple());
        sqlx::query(&format!(r#"CREATE DATABASE "{db_name}""#))
            .execute(&infra.admin_pool)
            .await
            .expect("create test database");

        let url = format!("{}/{db_name}", infra.base_url);
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await
            .expect("connect to test database");
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .expect("run migrations");

        let media_root = tempfile::tempdir().expect("create media root");
        std::fs::create_dir(media_root.path().join("src")).expect("create source dir");

        let mut config = CoreConfig::default();
        config.db.url = url;
        config.media.root = media_root.path().to_path_buf();
        config.generator.enabled = false;
        // Generous governor so only quota tests hit it; tests that need a
        // tight ceiling override via `tweak`.
        config.rate.per_minute = 6_000;
        config.rate.burst = 1_000;
        config.rate.per_day = 100_000;
        // A zero check interval makes governor admission non-blocking.
        config.workers.check_interval_s = 0;
        config.workers.backoff_base_s = 1;
        config.workers.backoff_max_s = 8;
        tweak(&mut config);

        let publisher = Arc::new(MockPublisher::default());
        let governor = Arc::new(RateGovernor::new(&config.rate));
        let deps = Arc::new(EngineDeps::new(
            pool.clone(),
            Arc::new(PassthroughGenerator),
            Arc::clone(&publisher) as Arc<dyn Publisher>,
            governor,
            config,
        ));

        let suffix = Uuid::new_v4().simple().to_string();
        let user = User::new(&format!("operator-{suffix}"), UserRole::Operator)
            .insert(&pool)
            .await
            .expect("insert user");
        let project = Project::new(user.id, &format!("project-{suffix}"), None)
            .insert(&pool)
            .await
            .expect("insert project");
        let source = ContentSource::new(project.id, "src")
            .insert(&pool)
            .await
            .expect("insert source");

        Self {
            deps,
            publisher,
            media_root,
            user,
            project,
            source,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.deps.pool
    }

    pub fn store(&self) -> &TaskStore {
        &self.deps.store
    }

    pub fn ops(&self) -> Ops {
        Ops::new(Arc::clone(&self.deps))
    }

    pub fn scanner(&self) -> Scanner {
        Scanner::new(Arc::clone(&self.deps))
    }

    pub fn scheduler(&self) -> Scheduler {
        let tz = self.deps.config.tz().expect("timezone");
        Scheduler::new(
            self.deps.store.clone(),
            Cadence::from_config(&self.deps.config.scheduler, tz),
        )
    }

    pub fn worker_config(&self) -> WorkerPoolConfig {
        WorkerPoolConfig::from_config(&self.deps.config.workers)
    }

    /// Drop a media file plus sibling metadata under the test source.
    pub fn seed_media(&self, name: &str, metadata: &serde_json::Value) {
        let dir = self.media_root.path().join("src");
        std::fs::write(dir.join(name), b"media-bytes").expect("write media");

        let stem = name.rsplit_once('.').map(|(stem, _)| stem).unwrap_or(name);
        std::fs::write(
            dir.join(format!("{stem}.json")),
            serde_json::to_vec(metadata).expect("serialize metadata"),
        )
        .expect("write metadata");
    }

    /// Create one task directly in the store (media file included) and
    /// return the stored row.
    pub async fn seed_task(
        &self,
        name: &str,
        scheduled_at: DateTime<Utc>,
        priority: i32,
    ) -> PublishingTask {
        let metadata = serde_json::json!({"caption": format!("caption for {name}")});
        self.seed_media(name, &metadata);

        let media_path = format!("src/{name}");
        self.store()
            .create_tasks(&[NewTask {
                project_id: self.project.id,
                source_id: Some(self.source.id),
                media_path: media_path.clone(),
                content_data: metadata,
                scheduled_at,
                priority,
            }])
            .await
            .expect("create task");

        PublishingTask::find_by_media_path(self.project.id, &media_path, self.pool())
            .await
            .expect("fetch seeded task")
    }
}
