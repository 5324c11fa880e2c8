//! Rate governor guarding external API calls.
//!
//! Two disciplines compose: a token bucket for short-term spacing
//! (`capacity = burst`, refill `per_minute / 60` tokens per second) and a
//! rolling 24-hour ceiling (`per_day` publication stamps). The rolling
//! window is the documented choice over a local-midnight reset: a stamp
//! stops counting exactly 24 hours after it was taken.
//!
//! All state lives under one `tokio::sync::Mutex`; a waiter holds the lock
//! while it sleeps, so admissions are served strictly FIFO.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::config::RateConfig;

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Result of an admission attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Admission {
    Acquired,
    /// The minute bucket could not admit before the caller's deadline.
    Timeout,
    /// The daily ceiling is reached and will not clear before the deadline;
    /// callers should reschedule after `cooldown`.
    QuotaExhausted { cooldown: Duration },
}

/// Remaining capacity fractions, for the scheduler and operator surfaces.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct Pressure {
    /// Fraction of the burst bucket currently available, in `[0, 1]`.
    pub minute_remaining: f64,
    /// Fraction of the daily ceiling currently available, in `[0, 1]`.
    pub day_remaining: f64,
}

struct GovernorState {
    minute_tokens: f64,
    last_refill: Instant,
    day_stamps: VecDeque<Instant>,
}

impl GovernorState {
    fn refill(&mut self, now: Instant, rate_per_sec: f64, capacity: f64) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.minute_tokens = (self.minute_tokens + elapsed.as_secs_f64() * rate_per_sec)
            .min(capacity);
        self.last_refill = now;
    }

    fn prune(&mut self, now: Instant) {
        while let Some(front) = self.day_stamps.front() {
            if now.saturating_duration_since(*front) >= DAY {
                self.day_stamps.pop_front();
            } else {
                break;
            }
        }
    }
}

pub struct RateGovernor {
    per_minute: f64,
    burst: f64,
    per_day: usize,
    state: Mutex<GovernorState>,
}

impl RateGovernor {
    pub fn new(config: &RateConfig) -> Self {
        Self {
            per_minute: f64::from(config.per_minute),
            burst: f64::from(config.burst),
            per_day: config.per_day as usize,
            state: Mutex::new(GovernorState {
                minute_tokens: f64::from(config.burst),
                last_refill: Instant::now(),
                day_stamps: VecDeque::new(),
            }),
        }
    }

    /// Block until both buckets admit, the deadline passes, or the daily
    /// ceiling rules out admission before the deadline.
    pub async fn acquire(&self, deadline: Duration) -> Admission {
        let deadline = Instant::now() + deadline;
        let rate_per_sec = self.per_minute / 60.0;

        let mut state = self.state.lock().await;
        loop {
            let now = Instant::now();
            state.refill(now, rate_per_sec, self.burst);
            state.prune(now);

            if state.day_stamps.len() >= self.per_day {
                let oldest = match state.day_stamps.front() {
                    Some(stamp) => *stamp,
                    None => now,
                };
                let clears_at = oldest + DAY;
                if clears_at > deadline {
                    return Admission::QuotaExhausted {
                        cooldown: clears_at.saturating_duration_since(now),
                    };
                }
                tokio::time::sleep_until(clears_at).await;
                continue;
            }

            if state.minute_tokens >= 1.0 {
                state.minute_tokens -= 1.0;
                state.day_stamps.push_back(now);
                return Admission::Acquired;
            }

            let wait = Duration::from_secs_f64((1.0 - state.minute_tokens) / rate_per_sec);
            let ready_at = now + wait;
            if ready_at > deadline {
                return Admission::Timeout;
            }
            tokio::time::sleep_until(ready_at).await;
        }
    }

    /// Current remaining-capacity fractions.
    pub async fn pressure(&self) -> Pressure {
        let rate_per_sec = self.per_minute / 60.0;
        let mut state = self.state.lock().await;
        let now = Instant::now();
        state.refill(now, rate_per_sec, self.burst);
        state.prune(now);

        Pressure {
            minute_remaining: (state.minute_tokens / self.burst).clamp(0.0, 1.0),
            day_remaining: if self.per_day == 0 {
                0.0
            } else {
                ((self.per_day - state.day_stamps.len().min(self.per_day)) as f64
                    / self.per_day as f64)
                    .clamp(0.0, 1.0)
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(per_minute: u32, burst: u32, per_day: u32) -> RateConfig {
        RateConfig {
            per_minute,
            burst,
            per_day,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn burst_admits_immediately_then_throttles() {
        let governor = RateGovernor::new(&config(60, 2, 100));

        assert_eq!(governor.acquire(Duration::ZERO).await, Admission::Acquired);
        assert_eq!(governor.acquire(Duration::ZERO).await, Admission::Acquired);

        // Bucket empty; refill is 1 token/s so a zero deadline times out.
        assert_eq!(governor.acquire(Duration::ZERO).await, Admission::Timeout);

        // A 2s budget covers the 1s refill.
        assert_eq!(
            governor.acquire(Duration::from_secs(2)).await,
            Admission::Acquired
        );
    }

    #[tokio::test(start_paused = true)]
    async fn daily_ceiling_reports_cooldown() {
        let governor = RateGovernor::new(&config(600, 10, 2));

        assert_eq!(governor.acquire(Duration::ZERO).await, Admission::Acquired);
        assert_eq!(governor.acquire(Duration::ZERO).await, Admission::Acquired);

        match governor.acquire(Duration::from_secs(60)).await {
            Admission::QuotaExhausted { cooldown } => {
                assert!(cooldown > Duration::from_secs(23 * 3600));
                assert!(cooldown <= DAY);
            }
            other => panic!("expected quota exhaustion, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn daily_window_rolls_over() {
        let governor = RateGovernor::new(&config(600, 10, 1));

        assert_eq!(governor.acquire(Duration::ZERO).await, Admission::Acquired);
        assert!(matches!(
            governor.acquire(Duration::ZERO).await,
            Admission::QuotaExhausted { .. }
        ));

        tokio::time::advance(DAY + Duration::from_secs(1)).await;
        assert_eq!(governor.acquire(Duration::ZERO).await, Admission::Acquired);
    }

    #[tokio::test(start_paused = true)]
    async fn pressure_tracks_both_buckets() {
        let governor = RateGovernor::new(&config(60, 4, 4));

        let pressure = governor.pressure().await;
        assert!((pressure.minute_remaining - 1.0).abs() < 1e-9);
        assert!((pressure.day_remaining - 1.0).abs() < 1e-9);

        governor.acquire(Duration::ZERO).await;
        governor.acquire(Duration::ZERO).await;

        let pressure = governor.pressure().await;
        assert!(pressure.minute_remaining < 1.0);
        assert!((pressure.day_remaining - 0.5).abs() < 1e-9);
    }
}
