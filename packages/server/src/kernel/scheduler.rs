//! Cadence scheduler.
//!
//! Periodically rewrites `scheduled_at` on pending tasks so the projected
//! publication stream satisfies the cadence rules: per-project spacing,
//! blackout hours, optimal-hour preference, daily caps and the planning
//! horizon. Placement itself is a pure function over plain inputs; the
//! surrounding service applies placements with the optimistic `version`
//! token and tolerates conflicts (the loser is re-planned next tick).
//!
//! Local-time arithmetic happens only here: instants stay UTC everywhere
//! else, and the configured timezone governs hour and day boundaries.

use std::collections::HashMap;

use chrono::{DateTime, Duration, NaiveDate, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use uuid::Uuid;

use crate::common::error::{CoreError, CoreResult};
use crate::config::SchedulerConfig;
use crate::kernel::tasks::store::TaskStore;
use crate::kernel::tasks::task::PublishingTask;

/// How far past the cursor the planner will look for an optimal hour before
/// settling for the nearest non-blackout slot.
const OPTIMAL_SEARCH_WINDOW_HOURS: i64 = 8;

/// The cadence rules, resolved from configuration.
#[derive(Debug, Clone)]
pub struct Cadence {
    pub min_interval: Duration,
    pub optimal_hours: std::collections::BTreeSet<u32>,
    pub blackout_hours: std::collections::BTreeSet<u32>,
    pub daily_max: usize,
    pub horizon: Duration,
    pub tz: Tz,
}

impl Cadence {
    pub fn from_config(config: &SchedulerConfig, tz: Tz) -> Self {
        Self {
            min_interval: Duration::seconds(config.min_publish_interval_s),
            optimal_hours: config.optimal_hours.clone(),
            blackout_hours: config.blackout_hours.clone(),
            daily_max: config.daily_max_tasks as usize,
            horizon: Duration::hours(config.planning_horizon_hours),
            tz,
        }
    }

    fn local_hour(&self, ts: DateTime<Utc>) -> u32 {
        ts.with_timezone(&self.tz).hour()
    }

    fn local_date(&self, ts: DateTime<Utc>) -> NaiveDate {
        ts.with_timezone(&self.tz).date_naive()
    }

    fn is_blackout(&self, ts: DateTime<Utc>) -> bool {
        self.blackout_hours.contains(&self.local_hour(ts))
    }

    fn is_optimal(&self, ts: DateTime<Utc>) -> bool {
        self.optimal_hours.contains(&self.local_hour(ts))
    }

    /// The UTC instant where the local hour containing `ts` begins.
    fn local_hour_start(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        let local = ts.with_timezone(&self.tz);
        local
            .with_minute(0)
            .and_then(|t| t.with_second(0))
            .and_then(|t| t.with_nanosecond(0))
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or(ts)
    }

    fn next_local_hour_start(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        self.local_hour_start(ts) + Duration::hours(1)
    }

    /// The UTC instant where the next local day begins.
    fn next_local_day_start(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        let local = ts.with_timezone(&self.tz);
        let next_date = local.date_naive().succ_opt();
        let midnight = next_date.and_then(|d| d.and_hms_opt(0, 0, 0));
        match midnight.and_then(|naive| self.tz.from_local_datetime(&naive).earliest()) {
            Some(start) => start.with_timezone(&Utc),
            // DST gap at midnight: step past it hour by hour instead.
            None => self.local_hour_start(ts) + Duration::hours(24),
        }
    }
}

/// Planner view of one pending task.
#[derive(Debug, Clone)]
pub struct PlanInput {
    pub id: Uuid,
    pub version: i32,
    pub priority: i32,
    pub created_at: DateTime<Utc>,
    pub scheduled_at: DateTime<Utc>,
}

impl From<&PublishingTask> for PlanInput {
    fn from(task: &PublishingTask) -> Self {
        Self {
            id: task.id,
            version: task.version,
            priority: task.priority,
            created_at: task.created_at,
            scheduled_at: task.scheduled_at,
        }
    }
}

/// One computed placement, carrying the version the plan was based on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    pub task_id: Uuid,
    pub version: i32,
    pub scheduled_at: DateTime<Utc>,
}

/// Place a project's pending tasks on the timeline.
///
/// `committed` holds the slots of already claimed or published tasks: the
/// latest one anchors the spacing cursor, and all of them count against the
/// daily caps. Tasks that do not fit inside the horizon are left out of the
/// result and keep their provisional `scheduled_at`.
pub fn plan_project(
    tasks: &[PlanInput],
    now: DateTime<Utc>,
    committed: &[DateTime<Utc>],
    cadence: &Cadence,
) -> Vec<Placement> {
    let mut ordered: Vec<&PlanInput> = tasks.iter().collect();
    ordered.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then(a.created_at.cmp(&b.created_at))
            .then(a.id.cmp(&b.id))
    });

    let horizon_end = now + cadence.horizon;
    let mut day_counts: HashMap<NaiveDate, usize> = HashMap::new();
    for slot in committed {
        *day_counts.entry(cadence.local_date(*slot)).or_default() += 1;
    }

    let mut cursor = now;
    if let Some(last) = committed.iter().max() {
        let spaced = *last + cadence.min_interval;
        if spaced > cursor {
            cursor = spaced;
        }
    }

    let mut placements = Vec::with_capacity(ordered.len());
    for task in ordered {
        let slot = match next_slot(cursor, horizon_end, &day_counts, cadence) {
            Some(slot) => slot,
            None => break,
        };

        *day_counts.entry(cadence.local_date(slot)).or_default() += 1;
        cursor = slot + cadence.min_interval;
        placements.push(Placement {
            task_id: task.id,
            version: task.version,
            scheduled_at: slot,
        });
    }

    placements
}

/// The earliest admissible slot at or after `from`: outside blackout hours,
/// under the daily cap, and on an optimal hour when one is reachable within
/// the search window.
fn next_slot(
    from: DateTime<Utc>,
    horizon_end: DateTime<Utc>,
    day_counts: &HashMap<NaiveDate, usize>,
    cadence: &Cadence,
) -> Option<DateTime<Utc>> {
    let day_full = |ts: DateTime<Utc>| {
        day_counts
            .get(&cadence.local_date(ts))
            .is_some_and(|count| *count >= cadence.daily_max)
    };

    let mut candidate = from;
    loop {
        if candidate > horizon_end {
            return None;
        }
        if cadence.is_blackout(candidate) {
            candidate = cadence.next_local_hour_start(candidate);
            continue;
        }
        if day_full(candidate) {
            candidate = cadence.next_local_day_start(candidate);
            continue;
        }

        if !cadence.optimal_hours.is_empty() && !cadence.is_optimal(candidate) {
            let window_end = candidate + Duration::hours(OPTIMAL_SEARCH_WINDOW_HOURS);
            let mut probe = cadence.next_local_hour_start(candidate);
            while probe <= window_end && probe <= horizon_end {
                if cadence.is_optimal(probe) && !cadence.is_blackout(probe) && !day_full(probe) {
                    return Some(probe);
                }
                probe = cadence.next_local_hour_start(probe);
            }
        }

        return Some(candidate);
    }
}

/// Result of one scheduler pass.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct SchedulerReport {
    /// Placements applied.
    pub planned: usize,
    /// Placements already matching the stored slot.
    pub unchanged: usize,
    /// Placements dropped on a version conflict.
    pub conflicts: usize,
    /// Pending tasks seen across all projects.
    pub backlog: usize,
}

pub struct Scheduler {
    store: TaskStore,
    cadence: Cadence,
}

impl Scheduler {
    pub fn new(store: TaskStore, cadence: Cadence) -> Self {
        Self { store, cadence }
    }

    pub fn cadence(&self) -> &Cadence {
        &self.cadence
    }

    /// One planning pass over every project with a backlog. Idempotent: a
    /// second pass over a stable store applies nothing.
    pub async fn run_once(&self, now: DateTime<Utc>) -> CoreResult<SchedulerReport> {
        let mut report = SchedulerReport::default();
        let pool = self.store.pool();

        for project_id in PublishingTask::projects_with_backlog(pool).await? {
            let pending = PublishingTask::pending_for_project(project_id, pool).await?;
            report.backlog += pending.len();

            // 48h of slack covers the current local day in any timezone.
            let committed =
                PublishingTask::committed_slots_since(project_id, now - Duration::hours(48), pool)
                    .await?;

            let inputs: Vec<PlanInput> = pending.iter().map(PlanInput::from).collect();
            let current: HashMap<Uuid, DateTime<Utc>> =
                inputs.iter().map(|t| (t.id, t.scheduled_at)).collect();

            for placement in plan_project(&inputs, now, &committed, &self.cadence) {
                if current.get(&placement.task_id) == Some(&placement.scheduled_at) {
                    report.unchanged += 1;
                    continue;
                }
                match self
                    .store
                    .reschedule_task(placement.task_id, placement.version, placement.scheduled_at)
                    .await
                {
                    Ok(()) => report.planned += 1,
                    Err(CoreError::Conflict(_)) => {
                        report.conflicts += 1;
                        tracing::debug!(
                            task_id = %placement.task_id,
                            "placement lost a version race, re-planning next tick"
                        );
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        tracing::debug!(
            planned = report.planned,
            unchanged = report.unchanged,
            conflicts = report.conflicts,
            backlog = report.backlog,
            "scheduler pass complete"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cadence() -> Cadence {
        Cadence {
            min_interval: Duration::hours(4),
            optimal_hours: [9, 12, 15, 18, 21].into_iter().collect(),
            blackout_hours: (0..=6).collect(),
            daily_max: 5,
            horizon: Duration::hours(72),
            tz: chrono_tz::UTC,
        }
    }

    fn input(id_byte: u8, priority: i32, created_at: DateTime<Utc>) -> PlanInput {
        PlanInput {
            id: Uuid::from_bytes([id_byte; 16]),
            version: 1,
            priority,
            created_at,
            scheduled_at: created_at,
        }
    }

    fn monday_8am() -> DateTime<Utc> {
        // 2026-03-09 is a Monday.
        Utc.with_ymd_and_hms(2026, 3, 9, 8, 0, 0).unwrap()
    }

    #[test]
    fn placements_respect_spacing_blackout_and_optimal() {
        let now = monday_8am();
        // Nine tasks fit the 72h horizon with every slot on an optimal hour.
        let tasks: Vec<PlanInput> = (0..9).map(|i| input(i, 0, now)).collect();

        let placements = plan_project(&tasks, now, &[], &cadence());
        assert_eq!(placements.len(), 9);

        let cadence = cadence();
        for pair in placements.windows(2) {
            let gap = pair[1].scheduled_at - pair[0].scheduled_at;
            assert!(gap >= cadence.min_interval, "gap {gap} below minimum");
        }
        for placement in &placements {
            let hour = placement.scheduled_at.hour();
            assert!(!cadence.blackout_hours.contains(&hour), "hour {hour} in blackout");
            assert!(cadence.optimal_hours.contains(&hour), "hour {hour} not optimal");
        }

        // First slot snaps forward from 08:00 to the 09:00 optimum.
        assert_eq!(
            placements[0].scheduled_at,
            Utc.with_ymd_and_hms(2026, 3, 9, 9, 0, 0).unwrap()
        );
    }

    #[test]
    fn horizon_leaves_overflow_unplaced() {
        let now = monday_8am();
        let tasks: Vec<PlanInput> = (0..40).map(|i| input(i, 0, now)).collect();

        let placements = plan_project(&tasks, now, &[], &cadence());
        assert!(placements.len() < tasks.len());
        for placement in &placements {
            assert!(placement.scheduled_at <= now + Duration::hours(72));
        }
    }

    #[test]
    fn daily_cap_pushes_overflow_to_next_day() {
        let now = monday_8am();
        let mut tight = cadence();
        tight.min_interval = Duration::hours(1);
        tight.daily_max = 2;

        let tasks: Vec<PlanInput> = (0..4).map(|i| input(i, 0, now)).collect();
        let placements = plan_project(&tasks, now, &[], &tight);
        assert_eq!(placements.len(), 4);

        let mut by_day: HashMap<NaiveDate, usize> = HashMap::new();
        for placement in &placements {
            *by_day.entry(placement.scheduled_at.date_naive()).or_default() += 1;
        }
        assert!(by_day.values().all(|count| *count <= 2));
        assert!(by_day.len() >= 2);
    }

    #[test]
    fn committed_slots_anchor_spacing_and_count_against_caps() {
        let now = monday_8am();
        let committed = vec![Utc.with_ymd_and_hms(2026, 3, 9, 7, 0, 0).unwrap()];

        let tasks = vec![input(1, 0, now)];
        let placements = plan_project(&tasks, now, &committed, &cadence());

        // 07:00 + 4h spacing pushes past 09:00; next optimum is 12:00.
        assert_eq!(
            placements[0].scheduled_at,
            Utc.with_ymd_and_hms(2026, 3, 9, 12, 0, 0).unwrap()
        );
    }

    #[test]
    fn priority_wins_earliest_slot_with_id_tiebreak() {
        let now = monday_8am();
        let low = input(1, 0, now);
        let high = input(2, 5, now);
        let tie_a = input(3, 5, now);

        let placements = plan_project(&[low.clone(), tie_a.clone(), high.clone()], now, &[], &cadence());
        assert_eq!(placements[0].task_id, high.id);
        assert_eq!(placements[1].task_id, tie_a.id);
        assert_eq!(placements[2].task_id, low.id);
        assert!(placements[0].scheduled_at < placements[2].scheduled_at);
    }

    #[test]
    fn planning_is_a_fixed_point() {
        let now = monday_8am();
        let tasks: Vec<PlanInput> = (0..6).map(|i| input(i, 0, now)).collect();

        let first = plan_project(&tasks, now, &[], &cadence());

        // Feed the placements back as the stored slots and re-plan.
        let replanned: Vec<PlanInput> = tasks
            .iter()
            .map(|t| {
                let placed = first.iter().find(|p| p.task_id == t.id);
                PlanInput {
                    scheduled_at: placed.map(|p| p.scheduled_at).unwrap_or(t.scheduled_at),
                    ..t.clone()
                }
            })
            .collect();
        let second = plan_project(&replanned, now, &[], &cadence());

        assert_eq!(first, second);
    }

    #[test]
    fn blackout_hours_respect_configured_timezone() {
        let mut local = cadence();
        local.tz = chrono_tz::America::Chicago;

        // 03:00 in Chicago is 09:00 UTC (CDT): blacked out locally even
        // though the UTC hour is fine.
        let now = Utc.with_ymd_and_hms(2026, 7, 6, 8, 0, 0).unwrap();
        let tasks = vec![input(1, 0, now)];
        let placements = plan_project(&tasks, now, &[], &local);

        let local_hour = placements[0]
            .scheduled_at
            .with_timezone(&local.tz)
            .hour();
        assert!(!local.blackout_hours.contains(&local_hour));
        assert!(local.optimal_hours.contains(&local_hour));
    }

    #[test]
    fn empty_backlog_plans_nothing() {
        let placements = plan_project(&[], monday_8am(), &[], &cadence());
        assert!(placements.is_empty());
    }
}
