//! Worker pool driving pending tasks to terminal state.
//!
//! Workers share one claim queue through `claim_due_tasks` and never cache
//! task state. One claimed task runs the pipeline: resolve media → caption →
//! governor admission → publish → log + roll-up → complete. Within a task
//! the sequence {claim, log append, complete} is linearizable; each step
//! commits before the next begins.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::common::error::{with_storage_retries, AdapterError, CoreError, CoreResult};
use crate::common::paths::resolve_media_path;
use crate::config::WorkerConfig;
use crate::kernel::analytics::HourlyDelta;
use crate::kernel::deps::EngineDeps;
use crate::kernel::governor::Admission;
use crate::kernel::publisher::MediaFile;
use crate::kernel::tasks::log::{LogStatus, NewLog};
use crate::kernel::tasks::task::{PublishingTask, TaskOutcome, TaskStatus};

/// Pool timing knobs, resolved from configuration.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub count: usize,
    pub batch_size: i64,
    pub check_interval: Duration,
    pub task_timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl WorkerPoolConfig {
    pub fn from_config(workers: &WorkerConfig) -> Self {
        Self {
            count: workers.count,
            batch_size: workers.batch_size,
            check_interval: Duration::from_secs(workers.check_interval_s),
            task_timeout: Duration::from_secs(workers.task_timeout_s),
            backoff_base: Duration::from_secs(workers.backoff_base_s),
            backoff_max: Duration::from_secs(workers.backoff_max_s),
        }
    }

    /// Governor admission budget. Waiting longer than one poll period would
    /// only starve the worker; the task stays claimable for a later pass.
    fn acquire_deadline(&self) -> Duration {
        self.check_interval.min(self.task_timeout)
    }
}

/// Exponential backoff with jitter: `base * 2^retry` clamped to `max`, plus
/// a uniform component in `[0, base)`.
pub fn backoff_delay(retry_count: i32, base: Duration, max: Duration) -> Duration {
    let exponent = retry_count.clamp(0, 20) as u32;
    let scaled = base.saturating_mul(2u32.saturating_pow(exponent)).min(max);

    let jitter_secs = base.as_secs_f64();
    if jitter_secs > 0.0 {
        let jitter = rand::thread_rng().gen_range(0.0..jitter_secs);
        scaled + Duration::from_secs_f64(jitter)
    } else {
        scaled
    }
}

/// How one attempt failed, before it is mapped onto a task outcome.
#[derive(Debug)]
enum FailureClass {
    Transient,
    Quota { cooldown: Duration },
    Permanent,
}

enum AttemptResult {
    Published { post_id: String, caption: String },
    Failed {
        class: FailureClass,
        error: String,
        caption: Option<String>,
    },
}

impl From<AdapterError> for FailureClass {
    fn from(error: AdapterError) -> Self {
        match error {
            AdapterError::Transient(_) => FailureClass::Transient,
            AdapterError::Quota { cooldown } => FailureClass::Quota { cooldown },
            AdapterError::Permanent(_) => FailureClass::Permanent,
        }
    }
}

/// Summary of a bounded `run-once` pass.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct RunOnceReport {
    pub claimed: usize,
    pub succeeded: usize,
    pub retried: usize,
    pub failed: usize,
}

pub struct WorkerPool {
    deps: Arc<EngineDeps>,
    config: WorkerPoolConfig,
}

impl WorkerPool {
    pub fn new(deps: Arc<EngineDeps>) -> Self {
        let config = WorkerPoolConfig::from_config(&deps.config.workers);
        Self { deps, config }
    }

    pub fn with_config(deps: Arc<EngineDeps>, config: WorkerPoolConfig) -> Self {
        Self { deps, config }
    }

    /// Run `count` workers until shutdown is requested. In-flight executions
    /// finish; only claiming stops.
    pub async fn run(self, shutdown: Arc<AtomicBool>) {
        let mut handles = Vec::with_capacity(self.config.count);
        for index in 0..self.config.count {
            let worker_id = format!("worker-{index}-{}", Uuid::new_v4());
            handles.push(tokio::spawn(worker_loop(
                Arc::clone(&self.deps),
                self.config.clone(),
                worker_id,
                Arc::clone(&shutdown),
            )));
        }
        futures::future::join_all(handles).await;
    }

    /// Claim and execute up to `limit` due tasks, then return. Used by the
    /// CLI and by tests; `now` is the logical claim instant.
    pub async fn run_once(
        deps: &EngineDeps,
        config: &WorkerPoolConfig,
        now: DateTime<Utc>,
        limit: i64,
        project_id: Option<Uuid>,
    ) -> CoreResult<RunOnceReport> {
        let worker_id = format!("run-once-{}", Uuid::new_v4());
        let tasks = match project_id {
            Some(project_id) => {
                deps.store
                    .claim_due_tasks_for_project(&worker_id, now, limit, project_id)
                    .await?
            }
            None => deps.store.claim_due_tasks(&worker_id, now, limit).await?,
        };

        let mut report = RunOnceReport {
            claimed: tasks.len(),
            ..Default::default()
        };
        for task in tasks {
            match execute_claimed(deps, config, &task, now).await? {
                TaskStatus::Success => report.succeeded += 1,
                TaskStatus::Pending => report.retried += 1,
                TaskStatus::Failed => report.failed += 1,
                TaskStatus::Running => {
                    return Err(CoreError::Invariant(format!(
                        "task {} still running after completion", task.id
                    )))
                }
            }
        }
        Ok(report)
    }
}

async fn worker_loop(
    deps: Arc<EngineDeps>,
    config: WorkerPoolConfig,
    worker_id: String,
    shutdown: Arc<AtomicBool>,
) {
    info!(worker_id = %worker_id, batch_size = config.batch_size, "worker starting");

    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }

        let tasks = match deps
            .store
            .claim_due_tasks(&worker_id, Utc::now(), config.batch_size)
            .await
        {
            Ok(tasks) => tasks,
            Err(e) => {
                error!(worker_id = %worker_id, error = %e, "failed to claim tasks");
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        };

        if tasks.is_empty() {
            tokio::time::sleep(config.check_interval).await;
            continue;
        }

        debug!(worker_id = %worker_id, count = tasks.len(), "claimed tasks");

        // Claimed tasks run to completion even if shutdown arrives mid-batch;
        // only further claiming stops.
        for task in tasks {
            let task_id = task.id;
            match execute_claimed(&deps, &config, &task, Utc::now()).await {
                Ok(status) => {
                    debug!(worker_id = %worker_id, task_id = %task_id, ?status, "task completed")
                }
                Err(e) => {
                    error!(worker_id = %worker_id, task_id = %task_id, error = %e, "task execution errored")
                }
            }
        }
    }

    info!(worker_id = %worker_id, "worker stopped");
}

/// Drive one claimed task to its next state and return it.
///
/// `now` is the logical execution instant: log rows, backoff targets and
/// quota cooldowns are computed from it.
pub async fn execute_claimed(
    deps: &EngineDeps,
    config: &WorkerPoolConfig,
    task: &PublishingTask,
    now: DateTime<Utc>,
) -> CoreResult<TaskStatus> {
    let started = std::time::Instant::now();

    let attempt = match tokio::time::timeout(config.task_timeout, attempt(deps, config, task)).await
    {
        Ok(result) => result,
        Err(_) => AttemptResult::Failed {
            class: FailureClass::Transient,
            error: format!(
                "execution exceeded task timeout of {}s",
                config.task_timeout.as_secs()
            ),
            caption: None,
        },
    };
    let duration = started.elapsed().as_secs_f64();

    // The attempt that spends the budget is terminal even for retryable
    // failures; the roll-up has to agree with the store's transition.
    let budget_spent = task.retry_count + 1 > deps.store.max_retries();

    let (log, rollup, outcome) = match attempt {
        AttemptResult::Published { post_id, caption } => (
            NewLog::success(task.id, &post_id, &caption, duration, now),
            Some(HourlyDelta::success(duration)),
            TaskOutcome::Success,
        ),
        AttemptResult::Failed {
            class,
            error,
            caption,
        } => {
            warn!(task_id = %task.id, error = %error, "attempt failed");
            let (log_status, outcome) = match class {
                FailureClass::Transient => (
                    LogStatus::TransientError,
                    TaskOutcome::Retry {
                        error: error.clone(),
                        retry_at: now
                            + chrono::Duration::from_std(backoff_delay(
                                task.retry_count,
                                config.backoff_base,
                                config.backoff_max,
                            ))
                            .unwrap_or_else(|_| chrono::Duration::seconds(60)),
                    },
                ),
                FailureClass::Quota { cooldown } => (
                    LogStatus::QuotaError,
                    TaskOutcome::Retry {
                        error: error.clone(),
                        retry_at: now
                            + chrono::Duration::from_std(cooldown)
                                .unwrap_or_else(|_| chrono::Duration::hours(24)),
                    },
                ),
                FailureClass::Permanent => {
                    (LogStatus::PermanentError, TaskOutcome::Permanent { error: error.clone() })
                }
            };

            let terminal = matches!(outcome, TaskOutcome::Permanent { .. }) || budget_spent;
            let rollup = terminal.then(|| HourlyDelta::failure(duration));
            (
                NewLog::failure(task.id, log_status, &error, caption.as_deref(), duration, now),
                rollup,
                outcome,
            )
        }
    };

    with_storage_retries(|| deps.store.record_outcome(log.clone(), task.project_id, rollup))
        .await?;
    with_storage_retries(|| deps.store.complete_task(task.id, task.version, &outcome)).await
}

/// The side-effect-free part of an execution: everything up to (and
/// including) the publish call, with no store writes.
async fn attempt(
    deps: &EngineDeps,
    config: &WorkerPoolConfig,
    task: &PublishingTask,
) -> AttemptResult {
    let media_path = resolve_media_path(&deps.config.media.root, &task.media_path);
    if let Err(e) = tokio::fs::metadata(&media_path).await {
        return AttemptResult::Failed {
            class: FailureClass::Permanent,
            error: format!("media {} missing or unreadable: {e}", media_path.display()),
            caption: None,
        };
    }

    let request = deps.caption_request(&task.content_data);
    let caption = match deps.generator.generate(&request).await {
        Ok(caption) => caption,
        Err(e) => {
            return AttemptResult::Failed {
                error: e.to_string(),
                class: e.into(),
                caption: None,
            }
        }
    };

    match deps.governor.acquire(config.acquire_deadline()).await {
        Admission::Acquired => {}
        Admission::Timeout => {
            return AttemptResult::Failed {
                class: FailureClass::Transient,
                error: "rate governor admission timed out".into(),
                caption: Some(caption),
            }
        }
        Admission::QuotaExhausted { cooldown } => {
            return AttemptResult::Failed {
                class: FailureClass::Quota { cooldown },
                error: format!("daily quota exhausted, cooldown {}s", cooldown.as_secs()),
                caption: Some(caption),
            }
        }
    }

    match deps
        .publisher
        .publish(&caption, &MediaFile::new(media_path))
        .await
    {
        Ok(receipt) => AttemptResult::Published {
            post_id: receipt.post_id,
            caption,
        },
        Err(e) => AttemptResult::Failed {
            error: e.to_string(),
            class: e.into(),
            caption: Some(caption),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_exponentially_within_bounds() {
        let base = Duration::from_secs(60);
        let max = Duration::from_secs(3600);

        for retry in 0..8 {
            let delay = backoff_delay(retry, base, max);
            let floor = base.saturating_mul(2u32.saturating_pow(retry as u32)).min(max);
            assert!(delay >= floor, "retry {retry}: {delay:?} < {floor:?}");
            assert!(delay < floor + base, "retry {retry}: jitter exceeded base");
        }
    }

    #[test]
    fn backoff_is_clamped_at_max() {
        let base = Duration::from_secs(60);
        let max = Duration::from_secs(3600);
        let delay = backoff_delay(30, base, max);
        assert!(delay >= max);
        assert!(delay < max + base);
    }

    #[test]
    fn zero_base_backoff_is_zero() {
        assert_eq!(
            backoff_delay(3, Duration::ZERO, Duration::from_secs(10)),
            Duration::ZERO
        );
    }

    #[test]
    fn adapter_errors_map_to_failure_classes() {
        assert!(matches!(
            FailureClass::from(AdapterError::Transient("x".into())),
            FailureClass::Transient
        ));
        assert!(matches!(
            FailureClass::from(AdapterError::Permanent("x".into())),
            FailureClass::Permanent
        ));
        match FailureClass::from(AdapterError::Quota {
            cooldown: Duration::from_secs(30),
        }) {
            FailureClass::Quota { cooldown } => assert_eq!(cooldown, Duration::from_secs(30)),
            other => panic!("expected quota, got {other:?}"),
        }
    }

    #[test]
    fn acquire_deadline_never_exceeds_task_timeout() {
        let config = WorkerPoolConfig {
            count: 1,
            batch_size: 1,
            check_interval: Duration::from_secs(30),
            task_timeout: Duration::from_secs(10),
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(60),
        };
        assert_eq!(config.acquire_deadline(), Duration::from_secs(10));
    }
}
