use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info};

pub const HOUR: Duration = Duration::from_secs(3600);
pub const DAY: Duration = Duration::from_secs(86_400);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QuotaLimits {
    pub max_daily: Option<u32>,
    pub max_hourly: Option<u32>,
}

impl QuotaLimits {
    pub fn unlimited() -> Self {
        Self::default()
    }

    pub fn with_daily(mut self, limit: u32) -> Self {
        self.max_daily = Some(limit);
        self
    }

    pub fn with_hourly(mut self, limit: u32) -> Self {
        self.max_hourly = Some(limit);
        self
    }
}

#[derive(Debug, Clone)]
pub struct QuotaSnapshot {
    pub daily_count: u32,
    pub hourly_count: u32,
    pub max_daily: Option<u32>,
    pub max_hourly: Option<u32>,
    /// `None` when the window is unlimited.
    pub daily_remaining: Option<u32>,
    pub hourly_remaining: Option<u32>,
    /// Reservations taken but not yet committed or released.
    pub in_flight: u32,
}

#[derive(Debug)]
struct Counters {
    daily_count: u32,
    hourly_count: u32,
    daily_window_start: Instant,
    hourly_window_start: Instant,
    in_flight: u32,
}

impl Counters {
    fn reset_elapsed(&mut self, now: Instant) {
        if now.duration_since(self.hourly_window_start) >= HOUR {
            if self.hourly_count > 0 {
                info!(previous = self.hourly_count, "hourly quota window reset");
            }
            self.hourly_count = 0;
            self.hourly_window_start = now;
        }
        if now.duration_since(self.daily_window_start) >= DAY {
            if self.daily_count > 0 {
                info!(previous = self.daily_count, "daily quota window reset");
            }
            self.daily_count = 0;
            self.daily_window_start = now;
        }
    }
}

/// Request counters over fixed hourly and daily windows.
///
/// Windows are reset lazily on the next check or record call; nothing here
/// sleeps or runs in the background.
///
/// Concurrent callers go through [`QuotaTracker::try_reserve`]: in-flight
/// reservations count against both limits until they are committed (the call
/// succeeded) or released (it failed or was abandoned).
pub struct QuotaTracker {
    limits: QuotaLimits,
    state: Mutex<Counters>,
    released: Notify,
}

/// A slot of daily/hourly budget held by one in-flight call.
///
/// Dropping the permit without [`commit`](QuotaPermit::commit) gives the slot back.
#[must_use = "dropping a permit releases the reserved quota"]
pub struct QuotaPermit<'a> {
    tracker: &'a QuotaTracker,
    committed: bool,
}

impl QuotaPermit<'_> {
    /// Turn the reservation into a counted request.
    pub fn commit(mut self) {
        self.committed = true;
        let mut st = self.tracker.lock();
        st.in_flight = st.in_flight.saturating_sub(1);
        st.reset_elapsed(Instant::now());
        st.daily_count = st.daily_count.saturating_add(1);
        st.hourly_count = st.hourly_count.saturating_add(1);
    }
}

impl Drop for QuotaPermit<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        {
            let mut st = self.tracker.lock();
            st.in_flight = st.in_flight.saturating_sub(1);
        }
        debug!("quota reservation released");
        self.tracker.released.notify_waiters();
    }
}

impl QuotaTracker {
    pub fn new(limits: QuotaLimits) -> Self {
        let now = Instant::now();
        Self {
            limits,
            state: Mutex::new(Counters {
                daily_count: 0,
                hourly_count: 0,
                daily_window_start: now,
                hourly_window_start: now,
                in_flight: 0,
            }),
            released: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Counters> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn limits(&self) -> QuotaLimits {
        self.limits
    }

    pub fn record_request(&self) {
        let mut st = self.lock();
        st.reset_elapsed(Instant::now());
        st.daily_count = st.daily_count.saturating_add(1);
        st.hourly_count = st.hourly_count.saturating_add(1);
    }

    /// Whether a new upstream call fits in both windows.
    pub fn check_quota_limits(&self) -> bool {
        let mut st = self.lock();
        st.reset_elapsed(Instant::now());
        self.within_limits(&st)
    }

    fn daily_exhausted(&self, st: &Counters) -> bool {
        self.limits
            .max_daily
            .map_or(false, |max| st.daily_count.saturating_add(st.in_flight) >= max)
    }

    fn hourly_exhausted(&self, st: &Counters) -> bool {
        self.limits
            .max_hourly
            .map_or(false, |max| st.hourly_count.saturating_add(st.in_flight) >= max)
    }

    fn within_limits(&self, st: &Counters) -> bool {
        !self.daily_exhausted(st) && !self.hourly_exhausted(st)
    }

    fn wait_locked(&self, st: &Counters, now: Instant) -> Duration {
        let mut wait = Duration::ZERO;
        if self.daily_exhausted(st) {
            wait = wait.max((st.daily_window_start + DAY).saturating_duration_since(now));
        }
        if self.hourly_exhausted(st) {
            wait = wait.max((st.hourly_window_start + HOUR).saturating_duration_since(now));
        }
        wait
    }

    /// Time until every exhausted window has reset, or `None` if a call is
    /// permitted now. In-flight reservations count as spent.
    pub fn time_until_available(&self) -> Option<Duration> {
        let mut st = self.lock();
        let now = Instant::now();
        st.reset_elapsed(now);
        if self.within_limits(&st) {
            return None;
        }
        Some(self.wait_locked(&st, now))
    }

    /// Atomically check both windows and hold one slot of budget.
    ///
    /// On refusal returns the time until the exhausted windows reset. A
    /// released reservation can free budget sooner; see [`QuotaTracker::released`].
    pub fn try_reserve(&self) -> Result<QuotaPermit<'_>, Duration> {
        let mut st = self.lock();
        let now = Instant::now();
        st.reset_elapsed(now);
        if !self.within_limits(&st) {
            return Err(self.wait_locked(&st, now));
        }
        st.in_flight = st.in_flight.saturating_add(1);
        Ok(QuotaPermit {
            tracker: self,
            committed: false,
        })
    }

    /// Signalled whenever an uncommitted reservation is given back.
    pub fn released(&self) -> &Notify {
        &self.released
    }

    pub fn snapshot(&self) -> QuotaSnapshot {
        let mut st = self.lock();
        st.reset_elapsed(Instant::now());
        QuotaSnapshot {
            daily_count: st.daily_count,
            hourly_count: st.hourly_count,
            max_daily: self.limits.max_daily,
            max_hourly: self.limits.max_hourly,
            daily_remaining: self
                .limits
                .max_daily
                .map(|max| max.saturating_sub(st.daily_count)),
            hourly_remaining: self
                .limits
                .max_hourly
                .map(|max| max.saturating_sub(st.hourly_count)),
            in_flight: st.in_flight,
        }
    }
}
