//! Application configuration.
//!
//! Loaded once at startup from an optional TOML file merged with environment
//! variables, then threaded into every component constructor. Credentials
//! never live in the file: the `credentials_ref` options name environment
//! variables that are resolved at startup.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use chrono_tz::Tz;
use dotenvy::dotenv;
use serde::Deserialize;

use crate::common::error::{CoreError, CoreResult};

/// Top-level configuration for the engine.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CoreConfig {
    #[serde(default)]
    pub db: DbConfig,
    #[serde(default)]
    pub media: MediaConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub workers: WorkerConfig,
    #[serde(default)]
    pub rate: RateConfig,
    #[serde(default)]
    pub generator: GeneratorConfig,
    #[serde(default)]
    pub publisher: PublisherConfig,
    #[serde(default)]
    pub scanner: ScannerConfig,
    /// IANA timezone governing blackout/optimal hours and day boundaries.
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

impl Default for CoreConfig {
    fn default() -> Self {
        toml_defaults()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DbConfig {
    /// Connection string for the task store.
    #[serde(default)]
    pub url: String,
    /// Max concurrent database operations.
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
}

impl Default for DbConfig {
    fn default() -> Self {
        toml_defaults()
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct MediaConfig {
    /// Base directory for resolving stored media paths.
    #[serde(default)]
    pub root: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SchedulerConfig {
    #[serde(default = "default_min_publish_interval_s")]
    pub min_publish_interval_s: i64,
    #[serde(default = "default_optimal_hours")]
    pub optimal_hours: BTreeSet<u32>,
    #[serde(default = "default_blackout_hours")]
    pub blackout_hours: BTreeSet<u32>,
    #[serde(default = "default_daily_min_tasks")]
    pub daily_min_tasks: u32,
    #[serde(default = "default_daily_max_tasks")]
    pub daily_max_tasks: u32,
    #[serde(default = "default_planning_horizon_hours")]
    pub planning_horizon_hours: i64,
    #[serde(default = "default_scheduler_tick_interval_s")]
    pub tick_interval_s: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        toml_defaults()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkerConfig {
    #[serde(default = "default_worker_count")]
    pub count: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: i64,
    #[serde(default = "default_check_interval_s")]
    pub check_interval_s: u64,
    #[serde(default = "default_task_timeout_s")]
    pub task_timeout_s: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: i32,
    #[serde(default = "default_backoff_base_s")]
    pub backoff_base_s: u64,
    #[serde(default = "default_backoff_max_s")]
    pub backoff_max_s: u64,
    #[serde(default = "default_lease_ttl_s")]
    pub lease_ttl_s: i64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        toml_defaults()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateConfig {
    #[serde(default = "default_rate_per_minute")]
    pub per_minute: u32,
    #[serde(default = "default_rate_burst")]
    pub burst: u32,
    #[serde(default = "default_rate_per_day")]
    pub per_day: u32,
}

impl Default for RateConfig {
    fn default() -> Self {
        toml_defaults()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GeneratorConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Adapter selection: `openai` or `passthrough`.
    #[serde(default = "default_generator_provider")]
    pub provider: String,
    #[serde(default = "default_generator_model")]
    pub model: String,
    /// Name of the environment variable holding the API key.
    #[serde(default = "default_generator_credentials_ref")]
    pub credentials_ref: String,
    /// Target language code for generated captions.
    #[serde(default = "default_language")]
    pub language: String,
    /// Free-form style hints appended to the generation prompt.
    #[serde(default)]
    pub style_hints: Vec<String>,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        toml_defaults()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PublisherConfig {
    /// Adapter selection: `chirp`.
    #[serde(default = "default_publisher_provider")]
    pub provider: String,
    /// Name of the environment variable holding the bearer token.
    #[serde(default = "default_publisher_credentials_ref")]
    pub credentials_ref: String,
    #[serde(default = "default_char_limit")]
    pub char_limit: usize,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default = "default_upload_base")]
    pub upload_base: String,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        toml_defaults()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScannerConfig {
    /// Media file extensions picked up by the scanner (lowercase, no dot).
    #[serde(default = "default_media_extensions")]
    pub media_extensions: Vec<String>,
    /// Extension of the sibling metadata file.
    #[serde(default = "default_metadata_extension")]
    pub metadata_extension: String,
    #[serde(default = "default_scanner_tick_interval_s")]
    pub tick_interval_s: u64,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        toml_defaults()
    }
}

// Serde-default helpers. Structs with non-trivial defaults deserialize an
// empty TOML table so `Default` and `#[serde(default = ...)]` cannot drift.
fn toml_defaults<T: serde::de::DeserializeOwned>() -> T {
    toml::from_str("").expect("empty table must deserialize via field defaults")
}

fn default_timezone() -> String {
    "UTC".to_string()
}
fn default_pool_size() -> u32 {
    10
}
fn default_min_publish_interval_s() -> i64 {
    14_400
}
fn default_optimal_hours() -> BTreeSet<u32> {
    [9, 12, 15, 18, 21].into_iter().collect()
}
fn default_blackout_hours() -> BTreeSet<u32> {
    (0..=6).collect()
}
fn default_daily_min_tasks() -> u32 {
    5
}
fn default_daily_max_tasks() -> u32 {
    6
}
fn default_planning_horizon_hours() -> i64 {
    72
}
fn default_scheduler_tick_interval_s() -> u64 {
    60
}
fn default_worker_count() -> usize {
    3
}
fn default_batch_size() -> i64 {
    5
}
fn default_check_interval_s() -> u64 {
    30
}
fn default_task_timeout_s() -> u64 {
    300
}
fn default_max_retries() -> i32 {
    3
}
fn default_backoff_base_s() -> u64 {
    60
}
fn default_backoff_max_s() -> u64 {
    3_600
}
fn default_lease_ttl_s() -> i64 {
    600
}
fn default_rate_per_minute() -> u32 {
    30
}
fn default_rate_burst() -> u32 {
    5
}
fn default_rate_per_day() -> u32 {
    50
}
fn default_true() -> bool {
    true
}
fn default_generator_provider() -> String {
    "openai".to_string()
}
fn default_generator_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_generator_credentials_ref() -> String {
    "OPENAI_API_KEY".to_string()
}
fn default_language() -> String {
    "en".to_string()
}
fn default_publisher_provider() -> String {
    "chirp".to_string()
}
fn default_publisher_credentials_ref() -> String {
    "CHIRP_BEARER_TOKEN".to_string()
}
fn default_char_limit() -> usize {
    280
}
fn default_api_base() -> String {
    "https://api.chirp.example/2".to_string()
}
fn default_upload_base() -> String {
    "https://upload.chirp.example/1.1".to_string()
}
fn default_media_extensions() -> Vec<String> {
    ["mp4", "mov", "avi", "jpg", "jpeg", "png", "gif"]
        .into_iter()
        .map(String::from)
        .collect()
}
fn default_metadata_extension() -> String {
    "json".to_string()
}
fn default_scanner_tick_interval_s() -> u64 {
    3_600
}

impl CoreConfig {
    /// Load configuration: `.env`, then the TOML file (if present), then
    /// environment overrides, then validation.
    pub fn load(path: Option<&Path>) -> CoreResult<Self> {
        let _ = dotenv();

        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|e| {
                    CoreError::Config(format!("cannot read {}: {e}", path.display()))
                })?;
                Self::parse(&raw)?
            }
            None => CoreConfig::default(),
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document into a config (no env, no validation).
    pub fn parse(raw: &str) -> CoreResult<Self> {
        toml::from_str(raw).map_err(|e| CoreError::Config(e.to_string()))
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("DATABASE_URL") {
            self.db.url = url;
        }
        if let Ok(root) = std::env::var("MEDIA_ROOT") {
            self.media.root = PathBuf::from(root);
        }
        if let Ok(tz) = std::env::var("AUTOPOST_TIMEZONE") {
            self.timezone = tz;
        }
    }

    /// Validate cross-field constraints. Errors here are fatal at startup.
    pub fn validate(&self) -> CoreResult<()> {
        if self.db.url.is_empty() {
            return Err(CoreError::Config(
                "db.url is required (or set DATABASE_URL)".into(),
            ));
        }
        if self.media.root.as_os_str().is_empty() {
            return Err(CoreError::Config(
                "media.root is required (or set MEDIA_ROOT)".into(),
            ));
        }
        if self.scheduler.daily_max_tasks == 0 {
            return Err(CoreError::Config(
                "scheduler.daily_max_tasks must be >= 1".into(),
            ));
        }
        if self.scheduler.daily_min_tasks > self.scheduler.daily_max_tasks {
            return Err(CoreError::Config(
                "scheduler.daily_min_tasks must not exceed daily_max_tasks".into(),
            ));
        }
        if self.scheduler.blackout_hours.iter().any(|h| *h > 23)
            || self.scheduler.optimal_hours.iter().any(|h| *h > 23)
        {
            return Err(CoreError::Config(
                "scheduler hours must be in 0..=23".into(),
            ));
        }
        if self.scheduler.blackout_hours.len() == 24 {
            return Err(CoreError::Config(
                "scheduler.blackout_hours must leave at least one open hour".into(),
            ));
        }
        if self.workers.count == 0 {
            return Err(CoreError::Config("workers.count must be >= 1".into()));
        }
        if self.workers.max_retries < 0 {
            return Err(CoreError::Config("workers.max_retries must be >= 0".into()));
        }
        // A lease that can lapse mid-execution would let a second worker
        // claim a task that is still running.
        if self.workers.lease_ttl_s <= self.workers.task_timeout_s as i64 {
            return Err(CoreError::Config(
                "workers.lease_ttl_s must exceed workers.task_timeout_s".into(),
            ));
        }
        if self.publisher.char_limit == 0 {
            return Err(CoreError::Config("publisher.char_limit must be >= 1".into()));
        }
        if self.rate.burst == 0 || self.rate.per_minute == 0 || self.rate.per_day == 0 {
            return Err(CoreError::Config("rate limits must be >= 1".into()));
        }
        self.tz()?;
        Ok(())
    }

    /// The configured timezone, parsed.
    pub fn tz(&self) -> CoreResult<Tz> {
        self.timezone
            .parse::<Tz>()
            .map_err(|_| CoreError::Config(format!("unknown timezone {:?}", self.timezone)))
    }

    /// Resolve a credential reference (an env-var name) to its value.
    pub fn resolve_credential(&self, reference: &str) -> CoreResult<String> {
        std::env::var(reference)
            .map_err(|_| CoreError::Config(format!("credential env var {reference} is not set")))
    }
}
