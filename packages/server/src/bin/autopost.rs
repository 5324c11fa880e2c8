//! CLI launcher for the publishing engine.
//!
//! Exit codes: 0 success, 2 configuration error, 3 database unavailable,
//! 4 partial failure (some tasks failed), 1 anything else.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use server_core::common::pagination::Page;
use server_core::kernel::service::Service;
use server_core::kernel::tasks::worker::{WorkerPool, WorkerPoolConfig};
use server_core::kernel::{EngineDeps, Ops};
use server_core::{CoreConfig, CoreError};

const EXIT_OK: i32 = 0;
const EXIT_OTHER: i32 = 1;
const EXIT_CONFIG: i32 = 2;
const EXIT_DB: i32 = 3;
const EXIT_PARTIAL: i32 = 4;

#[derive(Parser)]
#[command(name = "autopost")]
#[command(about = "Scheduled media publishing engine")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the worker pool, scheduler and scanner loops
    Serve,

    /// One-shot scanner run
    Scan {
        /// Limit to one project by name
        #[arg(long)]
        project: Option<String>,
    },

    /// Claim and execute up to N due tasks, then exit
    RunOnce {
        #[arg(long)]
        project: Option<String>,
        #[arg(long, default_value_t = 10)]
        limit: i64,
    },

    /// Print task counts and component health
    Status,

    /// Database maintenance
    Db {
        #[command(subcommand)]
        command: DbCommands,
    },
}

#[derive(Subcommand)]
enum DbCommands {
    /// Apply pending migrations
    Migrate,
    /// Drop and recreate the schema, then migrate
    Reset {
        /// Confirm the destructive reset
        #[arg(long)]
        yes: bool,
    },
    /// Write a pg_dump backup to the given path
    Backup { path: PathBuf },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,server_core=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    std::process::exit(run(cli).await);
}

async fn run(cli: Cli) -> i32 {
    let config = match CoreConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "failed to load configuration");
            return EXIT_CONFIG;
        }
    };

    let pool = match connect(&config).await {
        Ok(pool) => pool,
        Err(e) => {
            error!(error = %e, "database unavailable");
            return EXIT_DB;
        }
    };

    let result = match cli.command {
        Commands::Serve => cmd_serve(pool, config).await,
        Commands::Scan { project } => cmd_scan(pool, config, project.as_deref()).await,
        Commands::RunOnce { project, limit } => {
            cmd_run_once(pool, config, project.as_deref(), limit).await
        }
        Commands::Status => cmd_status(pool, config).await,
        Commands::Db { command } => cmd_db(pool, &config, command).await,
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "command failed");
            exit_code_for(&e)
        }
    }
}

fn exit_code_for(error: &CoreError) -> i32 {
    match error {
        CoreError::Config(_) => EXIT_CONFIG,
        CoreError::Storage(_) => EXIT_DB,
        _ => EXIT_OTHER,
    }
}

async fn connect(config: &CoreConfig) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(config.db.pool_size)
        .connect(&config.db.url)
        .await
}

async fn migrate(pool: &PgPool) -> Result<(), CoreError> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| CoreError::Storage(sqlx::Error::Migrate(Box::new(e))))
}

async fn cmd_serve(pool: PgPool, config: CoreConfig) -> Result<i32, CoreError> {
    migrate(&pool).await?;
    let deps = Arc::new(EngineDeps::from_config(pool, config)?);
    Service::new(deps).run_until_shutdown().await?;
    Ok(EXIT_OK)
}

async fn cmd_scan(
    pool: PgPool,
    config: CoreConfig,
    project: Option<&str>,
) -> Result<i32, CoreError> {
    let deps = Arc::new(EngineDeps::without_egress(pool, config));
    let ops = Ops::new(Arc::clone(&deps));
    let now = Utc::now();

    let report = match project {
        Some(name) => {
            let project = ops.find_project_by_name(name).await?;
            ops.scan_project(project.id, now).await?
        }
        None => {
            let mut sum = server_core::kernel::scanner::ScanReport::default();
            for project in ops.list_projects().await? {
                let report = ops.scan_project(project.id, now).await?;
                sum.discovered += report.discovered;
                sum.created += report.created;
                sum.skipped_existing += report.skipped_existing;
                sum.invalid += report.invalid;
            }
            sum
        }
    };

    println!(
        "discovered {} / created {} / skipped {} / invalid {}",
        report.discovered, report.created, report.skipped_existing, report.invalid
    );
    Ok(EXIT_OK)
}

async fn cmd_run_once(
    pool: PgPool,
    config: CoreConfig,
    project: Option<&str>,
    limit: i64,
) -> Result<i32, CoreError> {
    let deps = Arc::new(EngineDeps::from_config(pool, config)?);
    let ops = Ops::new(Arc::clone(&deps));

    let project_id = match project {
        Some(name) => Some(ops.find_project_by_name(name).await?.id),
        None => None,
    };

    let worker_config = WorkerPoolConfig::from_config(&deps.config.workers);
    let report =
        WorkerPool::run_once(&deps, &worker_config, Utc::now(), limit, project_id).await?;

    println!(
        "claimed {} / succeeded {} / retried {} / failed {}",
        report.claimed, report.succeeded, report.retried, report.failed
    );
    if report.failed > 0 {
        return Ok(EXIT_PARTIAL);
    }
    Ok(EXIT_OK)
}

async fn cmd_status(pool: PgPool, config: CoreConfig) -> Result<i32, CoreError> {
    let deps = Arc::new(EngineDeps::without_egress(pool, config));
    let ops = Ops::new(Arc::clone(&deps));

    let counts = ops.counts_by_status().await?;
    let health = ops.health().await;
    let pressure = ops.governor_status().await;

    println!(
        "tasks: pending {} / running {} / success {} / failed {} (total {})",
        counts.pending,
        counts.running,
        counts.success,
        counts.failed,
        counts.total()
    );
    println!(
        "health: db {:?} / workers {:?} / governor {:?}",
        health.db, health.workers, health.governor
    );
    println!(
        "governor: minute {:.0}% / day {:.0}% remaining",
        pressure.minute_remaining * 100.0,
        pressure.day_remaining * 100.0
    );

    // Paged peek at the upcoming queue.
    let page = ops
        .list_tasks(Default::default(), Page::new(0, 5)?)
        .await?;
    for task in &page.items {
        println!(
            "  {:?} {} scheduled {} (retries {})",
            task.status, task.media_path, task.scheduled_at, task.retry_count
        );
    }

    Ok(EXIT_OK)
}

async fn cmd_db(pool: PgPool, config: &CoreConfig, command: DbCommands) -> Result<i32, CoreError> {
    match command {
        DbCommands::Migrate => {
            migrate(&pool).await?;
            println!("migrations applied");
            Ok(EXIT_OK)
        }
        DbCommands::Reset { yes } => {
            if !yes {
                eprintln!("refusing to reset without --yes");
                return Ok(EXIT_OTHER);
            }
            sqlx::query("DROP SCHEMA public CASCADE")
                .execute(&pool)
                .await?;
            sqlx::query("CREATE SCHEMA public").execute(&pool).await?;
            migrate(&pool).await?;
            println!("database reset");
            Ok(EXIT_OK)
        }
        DbCommands::Backup { path } => {
            let status = tokio::process::Command::new("pg_dump")
                .arg("--format=custom")
                .arg("--file")
                .arg(&path)
                .arg(&config.db.url)
                .status()
                .await
                .map_err(|e| CoreError::InvalidInput(format!("cannot run pg_dump: {e}")))?;

            if !status.success() {
                eprintln!("pg_dump exited with {status}");
                return Ok(EXIT_OTHER);
            }
            println!("backup written to {}", path.display());
            Ok(EXIT_OK)
        }
    }
}
