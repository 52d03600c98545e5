//! Adaptive backoff controller.
//!
//! Holds the delay state shared by every call through one governor and turns
//! the recent success/error history into an advised wait. The controller never
//! sleeps and never fails; it only answers "how long".

use crate::config::{BusyHours, GovernorConfig};
use chrono::Timelike;
use rand::Rng;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Outcomes older than this no longer influence the health score.
pub const HEALTH_WINDOW: Duration = Duration::from_secs(600);

const HEALTH_FLOOR: f64 = 0.1;
const HEALTH_CEILING: f64 = 1.0;
const HEALTH_STEP_UP: f64 = 0.1;
const HEALTH_STEP_DOWN: f64 = 0.2;
const SUCCESS_STREAK: u32 = 3;
/// Extra escalation for quota errors that carry no retry hint.
const QUOTA_ESCALATION: f64 = 1.5;

const BUSY_JITTER: (f64, f64) = (0.9, 1.3);
const CALM_JITTER: (f64, f64) = (0.8, 1.1);

#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    pub min_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
    pub success_factor: f64,
    pub busy_hours: Option<BusyHours>,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::from(&GovernorConfig::default())
    }
}

impl From<&GovernorConfig> for BackoffConfig {
    fn from(cfg: &GovernorConfig) -> Self {
        Self {
            min_delay: cfg.min_delay(),
            max_delay: cfg.max_delay(),
            backoff_factor: cfg.backoff_factor,
            success_factor: cfg.success_factor,
            busy_hours: cfg.busy_hours,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackoffSnapshot {
    pub current_delay: Duration,
    pub min_delay: Duration,
    pub max_delay: Duration,
    pub health_score: f64,
    pub consecutive_errors: u32,
    pub consecutive_successes: u32,
    pub quota_exceeded: bool,
    pub retry_after: Option<Duration>,
    /// Successes still inside the health window.
    pub window_successes: usize,
    /// Errors still inside the health window.
    pub window_errors: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Success,
    Error,
}

#[derive(Debug)]
struct State {
    /// Seconds; kept as f64 so repeated factors do not accumulate rounding.
    current_delay: f64,
    health_score: f64,
    consecutive_errors: u32,
    consecutive_successes: u32,
    quota_exceeded: bool,
    retry_after: Option<Duration>,
    outcomes: VecDeque<(Instant, Outcome)>,
}

impl State {
    fn prune(&mut self, now: Instant) {
        while let Some((at, _)) = self.outcomes.front() {
            if now.duration_since(*at) > HEALTH_WINDOW {
                self.outcomes.pop_front();
            } else {
                break;
            }
        }
    }

    fn counts(&self) -> (usize, usize) {
        let errors = self
            .outcomes
            .iter()
            .filter(|(_, o)| *o == Outcome::Error)
            .count();
        (self.outcomes.len() - errors, errors)
    }
}

/// Adaptive delay state machine driven by `record_success` / `record_error`.
pub struct BackoffController {
    cfg: BackoffConfig,
    min_secs: f64,
    max_secs: f64,
    state: Mutex<State>,
}

impl BackoffController {
    pub fn new(cfg: BackoffConfig) -> Self {
        let min_secs = cfg.min_delay.as_secs_f64();
        let max_secs = cfg.max_delay.as_secs_f64().max(min_secs);
        Self {
            min_secs,
            max_secs,
            state: Mutex::new(State {
                current_delay: min_secs,
                health_score: HEALTH_CEILING,
                consecutive_errors: 0,
                consecutive_successes: 0,
                quota_exceeded: false,
                retry_after: None,
                outcomes: VecDeque::new(),
            }),
            cfg,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // State is plain data; a panic mid-update cannot leave it unusable.
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn config(&self) -> &BackoffConfig {
        &self.cfg
    }

    pub fn record_success(&self) {
        let mut st = self.lock();
        let now = Instant::now();
        st.outcomes.push_back((now, Outcome::Success));
        st.prune(now);

        st.consecutive_successes = st.consecutive_successes.saturating_add(1);
        st.consecutive_errors = 0;
        st.quota_exceeded = false;
        st.retry_after = None;
        st.health_score = (st.health_score + HEALTH_STEP_UP).min(HEALTH_CEILING);

        if st.consecutive_successes >= SUCCESS_STREAK {
            let previous = st.current_delay;
            st.current_delay = (previous * self.cfg.success_factor).max(self.min_secs);
            st.consecutive_successes = 0;
            debug!(
                previous_delay_secs = previous,
                current_delay_secs = st.current_delay,
                "success streak reduced delay"
            );
        }
    }

    /// Record a failed call. `retry_after` is only meaningful for quota errors.
    pub fn record_error(&self, is_quota_error: bool, retry_after: Option<Duration>) {
        let mut st = self.lock();
        let now = Instant::now();
        st.outcomes.push_back((now, Outcome::Error));
        st.prune(now);

        st.consecutive_errors = st.consecutive_errors.saturating_add(1);
        st.consecutive_successes = 0;
        st.health_score = (st.health_score - HEALTH_STEP_DOWN).max(HEALTH_FLOOR);

        if is_quota_error {
            st.quota_exceeded = true;
            match retry_after {
                Some(hint) => {
                    st.retry_after = Some(hint);
                    st.current_delay = st.current_delay.max(hint.as_secs_f64());
                }
                None => {
                    st.current_delay *= self.cfg.backoff_factor * QUOTA_ESCALATION;
                }
            }
        } else {
            st.current_delay *= self.cfg.backoff_factor;
        }
        st.current_delay = st.current_delay.clamp(self.min_secs, self.max_secs);

        warn!(
            quota = is_quota_error,
            retry_after_secs = retry_after.map(|d| d.as_secs_f64()),
            consecutive_errors = st.consecutive_errors,
            health_score = st.health_score,
            current_delay_secs = st.current_delay,
            "upstream error recorded"
        );
    }

    /// Advised wait before the next call, recomputed from the recent window.
    pub fn compute_delay(&self) -> Duration {
        let jitter = self.draw_jitter();
        self.compute_delay_with_jitter(jitter)
    }

    fn draw_jitter(&self) -> f64 {
        let (lo, hi) = if self.in_busy_period() {
            BUSY_JITTER
        } else {
            CALM_JITTER
        };
        rand::thread_rng().gen_range(lo..=hi)
    }

    fn in_busy_period(&self) -> bool {
        self.cfg
            .busy_hours
            .map(|busy| busy.contains(chrono::Utc::now().hour()))
            .unwrap_or(false)
    }

    pub(crate) fn compute_delay_with_jitter(&self, jitter: f64) -> Duration {
        let mut st = self.lock();
        st.prune(Instant::now());

        let (successes, errors) = st.counts();
        let total = successes + errors;
        let error_rate = if total == 0 {
            0.0
        } else {
            errors as f64 / total as f64
        };
        st.health_score = (1.0 - error_rate).max(HEALTH_FLOOR);

        let multiplier = health_multiplier(errors, st.health_score);
        let secs = (st.current_delay * multiplier * jitter).clamp(self.min_secs, self.max_secs);

        debug!(
            error_rate,
            health_score = st.health_score,
            multiplier,
            jitter,
            delay_secs = secs,
            "computed governor delay"
        );
        Duration::from_secs_f64(secs)
    }

    /// The server-suggested wait, if a quota error is still pending.
    pub fn pending_retry_after(&self) -> Option<Duration> {
        let st = self.lock();
        if st.quota_exceeded {
            st.retry_after
        } else {
            None
        }
    }

    pub fn clear_quota_exceeded(&self) {
        let mut st = self.lock();
        st.quota_exceeded = false;
        st.retry_after = None;
    }

    pub fn current_delay(&self) -> Duration {
        Duration::from_secs_f64(self.lock().current_delay)
    }

    pub fn health_score(&self) -> f64 {
        self.lock().health_score
    }

    pub fn snapshot(&self) -> BackoffSnapshot {
        let mut st = self.lock();
        st.prune(Instant::now());
        let (window_successes, window_errors) = st.counts();
        BackoffSnapshot {
            current_delay: Duration::from_secs_f64(st.current_delay),
            min_delay: self.cfg.min_delay,
            max_delay: self.cfg.max_delay,
            health_score: st.health_score,
            consecutive_errors: st.consecutive_errors,
            consecutive_successes: st.consecutive_successes,
            quota_exceeded: st.quota_exceeded,
            retry_after: st.retry_after,
            window_successes,
            window_errors,
        }
    }
}

fn health_multiplier(window_errors: usize, health_score: f64) -> f64 {
    if window_errors >= 3 {
        2.0
    } else if window_errors >= 1 {
        1.5
    } else {
        health_score.max(0.7)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller(min: u64, max: u64) -> BackoffController {
        BackoffController::new(BackoffConfig {
            min_delay: Duration::from_secs(min),
            max_delay: Duration::from_secs(max),
            backoff_factor: 1.5,
            success_factor: 0.9,
            busy_hours: None,
        })
    }

    #[test]
    fn test_initial_state() {
        let bc = controller(4, 10);
        let snap = bc.snapshot();
        assert_eq!(snap.current_delay, Duration::from_secs(4));
        assert_eq!(snap.health_score, 1.0);
        assert!(!snap.quota_exceeded);
        assert_eq!(snap.window_errors, 0);
    }

    #[test]
    fn test_transient_error_multiplies_delay() {
        let bc = controller(4, 10);
        bc.record_error(false, None);
        assert_eq!(bc.current_delay(), Duration::from_secs(6));
        let snap = bc.snapshot();
        assert_eq!(snap.consecutive_errors, 1);
        assert!((snap.health_score - 0.8).abs() < 1e-9);
        assert!(!snap.quota_exceeded);
    }

    #[test]
    fn test_quota_error_without_hint_escalates_harder() {
        let bc = controller(4, 100);
        bc.record_error(true, None);
        // 4 * 1.5 * 1.5
        assert_eq!(bc.current_delay(), Duration::from_secs(9));
        assert!(bc.snapshot().quota_exceeded);
        assert_eq!(bc.pending_retry_after(), None);
    }

    #[test]
    fn test_quota_error_with_hint_raises_delay_to_hint() {
        let bc = controller(4, 300);
        bc.record_error(true, Some(Duration::from_secs(30)));
        assert!(bc.current_delay() >= Duration::from_secs(30));
        assert_eq!(bc.pending_retry_after(), Some(Duration::from_secs(30)));

        bc.clear_quota_exceeded();
        assert_eq!(bc.pending_retry_after(), None);
    }

    #[test]
    fn test_quota_hint_beyond_max_is_clamped_but_kept_as_retry_after() {
        let bc = controller(4, 10);
        bc.record_error(true, Some(Duration::from_secs(30)));
        assert_eq!(bc.current_delay(), Duration::from_secs(10));
        assert_eq!(bc.pending_retry_after(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_three_successes_reduce_delay_within_bounds() {
        let bc = controller(1, 10);
        bc.record_error(false, None);
        bc.record_error(false, None);
        let before = bc.current_delay();
        assert!(before > Duration::from_secs(1));

        bc.record_success();
        bc.record_success();
        assert_eq!(bc.current_delay(), before);
        bc.record_success();

        let after = bc.current_delay();
        assert!(after < before);
        assert!(after.as_secs_f64() >= before.as_secs_f64() * 0.8 - 1e-9);
        assert_eq!(bc.snapshot().consecutive_successes, 0);
    }

    #[test]
    fn test_successes_never_go_below_min_delay() {
        let bc = controller(4, 10);
        for _ in 0..30 {
            bc.record_success();
        }
        assert_eq!(bc.current_delay(), Duration::from_secs(4));
        assert_eq!(bc.health_score(), 1.0);
    }

    #[test]
    fn test_success_clears_quota_flag() {
        let bc = controller(4, 60);
        bc.record_error(true, Some(Duration::from_secs(20)));
        bc.record_success();
        let snap = bc.snapshot();
        assert!(!snap.quota_exceeded);
        assert_eq!(snap.retry_after, None);
        assert_eq!(snap.consecutive_errors, 0);
    }

    #[test]
    fn test_delay_invariant_over_mixed_sequences() {
        let bc = controller(2, 40);
        for i in 0..200u32 {
            match i % 7 {
                0 | 3 => bc.record_error(false, None),
                1 => bc.record_error(true, None),
                2 => bc.record_error(true, Some(Duration::from_secs((i % 90) as u64))),
                _ => bc.record_success(),
            }
            let d = bc.current_delay();
            assert!(d >= Duration::from_secs(2) && d <= Duration::from_secs(40), "{:?}", d);
            let h = bc.health_score();
            assert!((0.1..=1.0).contains(&h), "{}", h);
        }
    }

    #[test]
    fn test_five_errors_floor_health_and_double_multiplier() {
        let bc = controller(1, 300);
        for _ in 0..5 {
            bc.record_error(false, None);
        }
        assert!((bc.health_score() - 0.1).abs() < 1e-9);

        let current = bc.current_delay().as_secs_f64();
        let delay = bc.compute_delay_with_jitter(1.0);
        assert!((delay.as_secs_f64() - (current * 2.0).min(300.0)).abs() < 1e-6);
        assert!((bc.health_score() - 0.1).abs() < 1e-9);
        assert_eq!(health_multiplier(5, 0.1), 2.0);
    }

    #[test]
    fn test_health_multiplier_tiers() {
        assert_eq!(health_multiplier(0, 1.0), 1.0);
        assert_eq!(health_multiplier(0, 0.5), 0.7);
        assert_eq!(health_multiplier(1, 0.5), 1.5);
        assert_eq!(health_multiplier(2, 0.3), 1.5);
        assert_eq!(health_multiplier(3, 0.1), 2.0);
    }

    #[test]
    fn test_single_error_uses_one_and_a_half_multiplier() {
        let bc = controller(1, 100);
        bc.record_success();
        bc.record_error(false, None);
        // one success, one error: health recomputed to 0.5
        let current = bc.current_delay().as_secs_f64();
        let delay = bc.compute_delay_with_jitter(1.0);
        assert!((delay.as_secs_f64() - current * 1.5).abs() < 1e-6);
        assert!((bc.health_score() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_compute_delay_is_clamped() {
        let bc = controller(4, 10);
        // healthy: 4 * 1.0 * 0.8 would be 3.2, clamped up to min
        assert_eq!(bc.compute_delay_with_jitter(0.8), Duration::from_secs(4));

        for _ in 0..6 {
            bc.record_error(false, None);
        }
        assert_eq!(bc.compute_delay_with_jitter(1.3), Duration::from_secs(10));
    }

    #[test]
    fn test_random_jitter_stays_in_bounds() {
        let bc = controller(4, 10);
        for _ in 0..100 {
            let d = bc.compute_delay();
            assert!(d >= Duration::from_secs(4) && d <= Duration::from_secs(10));
        }
    }

    fn controller_with_busy_hours(busy: BusyHours) -> BackoffController {
        BackoffController::new(BackoffConfig {
            busy_hours: Some(busy),
            ..controller(4, 10).config().clone()
        })
    }

    #[test]
    fn test_busy_hours_widen_jitter() {
        let hour = chrono::Utc::now().hour();
        // one hour either side so a boundary crossing mid-test stays busy
        let bc = controller_with_busy_hours(BusyHours::new((hour + 23) % 24, (hour + 2) % 24));
        assert!(bc.in_busy_period());
        for _ in 0..200 {
            let j = bc.draw_jitter();
            assert!((BUSY_JITTER.0..=BUSY_JITTER.1).contains(&j), "{}", j);
        }
    }

    #[test]
    fn test_outside_busy_hours_uses_calm_jitter() {
        let hour = chrono::Utc::now().hour();
        let bc = controller_with_busy_hours(BusyHours::new((hour + 3) % 24, (hour + 5) % 24));
        assert!(!bc.in_busy_period());
        for _ in 0..200 {
            let j = bc.draw_jitter();
            assert!((CALM_JITTER.0..=CALM_JITTER.1).contains(&j), "{}", j);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_outcomes_expire_after_health_window() {
        let bc = controller(1, 100);
        for _ in 0..4 {
            bc.record_error(false, None);
        }
        assert_eq!(bc.snapshot().window_errors, 4);

        tokio::time::advance(HEALTH_WINDOW + Duration::from_secs(1)).await;

        let snap = bc.snapshot();
        assert_eq!(snap.window_errors, 0);
        bc.compute_delay_with_jitter(1.0);
        assert_eq!(bc.health_score(), 1.0);
    }
}
