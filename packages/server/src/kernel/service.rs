//! Service assembly for `serve`.
//!
//! Wires the periodic loops together: the worker pool, the scheduler tick
//! (which also recovers stale claims), and the scanner tick. Each loop
//! observes one shared shutdown flag and exits at its next iteration;
//! in-flight executions get to finish.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{error, info};

use crate::common::error::CoreResult;
use crate::kernel::deps::EngineDeps;
use crate::kernel::scanner::Scanner;
use crate::kernel::scheduler::{Cadence, Scheduler};
use crate::kernel::tasks::worker::WorkerPool;

/// Live state published by the running service, consumed by the status
/// surfaces.
#[derive(Debug, Clone, Copy, Default)]
pub struct ServiceStatus {
    pub scheduler_last_run: Option<DateTime<Utc>>,
    pub workers_alive: usize,
}

pub struct Service {
    deps: Arc<EngineDeps>,
    status: Arc<RwLock<ServiceStatus>>,
    shutdown: Arc<AtomicBool>,
}

impl Service {
    pub fn new(deps: Arc<EngineDeps>) -> Self {
        Self {
            deps,
            status: Arc::new(RwLock::new(ServiceStatus::default())),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Status cell for attaching to [`crate::kernel::ops::Ops`].
    pub fn status(&self) -> Arc<RwLock<ServiceStatus>> {
        Arc::clone(&self.status)
    }

    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// Run all loops until shutdown is requested.
    pub async fn run(self) -> CoreResult<()> {
        let tz = self.deps.config.tz()?;

        // Leases abandoned by a previous process are recovered before any
        // new claims happen.
        let recovered = self.deps.store.recover_stale_claims(Utc::now()).await?;
        if !recovered.is_empty() {
            info!(count = recovered.len(), "recovered claims from previous run");
        }

        info!(
            workers = self.deps.config.workers.count,
            scheduler_tick_s = self.deps.config.scheduler.tick_interval_s,
            scanner_tick_s = self.deps.config.scanner.tick_interval_s,
            "service starting"
        );

        let workers = {
            let deps = Arc::clone(&self.deps);
            let status = Arc::clone(&self.status);
            let shutdown = Arc::clone(&self.shutdown);
            tokio::spawn(async move {
                let count = deps.config.workers.count;
                status.write().await.workers_alive = count;
                WorkerPool::new(deps).run(shutdown).await;
                status.write().await.workers_alive = 0;
            })
        };

        let scheduler = {
            let deps = Arc::clone(&self.deps);
            let status = Arc::clone(&self.status);
            let shutdown = Arc::clone(&self.shutdown);
            let cadence = Cadence::from_config(&deps.config.scheduler, tz);
            let tick = Duration::from_secs(deps.config.scheduler.tick_interval_s);
            tokio::spawn(async move {
                let scheduler = Scheduler::new(deps.store.clone(), cadence);
                while !shutdown.load(Ordering::SeqCst) {
                    let now = Utc::now();
                    if let Err(e) = deps.store.recover_stale_claims(now).await {
                        error!(error = %e, "stale-claim recovery failed");
                    }
                    match scheduler.run_once(now).await {
                        Ok(report) => {
                            status.write().await.scheduler_last_run = Some(now);
                            if report.planned > 0 || report.conflicts > 0 {
                                info!(
                                    planned = report.planned,
                                    conflicts = report.conflicts,
                                    backlog = report.backlog,
                                    "scheduler tick"
                                );
                            }
                        }
                        Err(e) => error!(error = %e, "scheduler tick failed"),
                    }
                    sleep_with_shutdown(tick, &shutdown).await;
                }
                info!("scheduler loop stopped");
            })
        };

        let scanner = {
            let deps = Arc::clone(&self.deps);
            let shutdown = Arc::clone(&self.shutdown);
            let tick = Duration::from_secs(deps.config.scanner.tick_interval_s);
            tokio::spawn(async move {
                let scanner = Scanner::new(Arc::clone(&deps));
                while !shutdown.load(Ordering::SeqCst) {
                    match scanner.scan_all(Utc::now()).await {
                        Ok(report) => {
                            if report.created > 0 || report.invalid > 0 {
                                info!(
                                    discovered = report.discovered,
                                    created = report.created,
                                    invalid = report.invalid,
                                    "scan tick"
                                );
                            }
                        }
                        Err(e) => error!(error = %e, "scan tick failed"),
                    }
                    sleep_with_shutdown(tick, &shutdown).await;
                }
                info!("scanner loop stopped");
            })
        };

        let _ = futures::future::join3(workers, scheduler, scanner).await;
        info!("service stopped");
        Ok(())
    }

    /// Run until a Ctrl-C signal arrives.
    pub async fn run_until_shutdown(self) -> CoreResult<()> {
        let shutdown = self.shutdown_handle();
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("received shutdown signal");
            shutdown.store(true, Ordering::SeqCst);
        });

        self.run().await
    }
}

/// Sleep up to `duration`, waking early when shutdown is requested.
async fn sleep_with_shutdown(duration: Duration, shutdown: &AtomicBool) {
    let slice = Duration::from_millis(500);
    let mut remaining = duration;
    while remaining > Duration::ZERO && !shutdown.load(Ordering::SeqCst) {
        let step = remaining.min(slice);
        tokio::time::sleep(step).await;
        remaining = remaining.saturating_sub(step);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn sleep_with_shutdown_wakes_early() {
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);

        let sleeper = tokio::spawn(async move {
            sleep_with_shutdown(Duration::from_secs(3600), &flag).await;
        });

        tokio::time::sleep(Duration::from_secs(2)).await;
        shutdown.store(true, Ordering::SeqCst);
        tokio::time::timeout(Duration::from_secs(2), sleeper)
            .await
            .expect("sleeper should wake after shutdown")
            .unwrap();
    }
}
