use super::backoff::{BackoffConfig, BackoffController};
use super::quota::{QuotaLimits, QuotaPermit, QuotaTracker};
use crate::cache::{CacheBackend, CacheConfig, Fingerprint, ResponseCache};
use crate::config::GovernorConfig;
use crate::{Error, Result};
use rand::Rng;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Length of the per-minute reservation window.
pub const RATE_WINDOW: Duration = Duration::from_secs(60);
/// Added to a full-window wait so the oldest reservation has surely expired.
const WINDOW_BUFFER: Duration = Duration::from_millis(100);
const MAX_SLOT_JITTER_MS: u64 = 200;
const RETRY_AFTER_BUFFER_MS: (u64, u64) = (1_000, 3_000);

#[derive(Debug, Clone)]
pub struct GovernorStats {
    pub requests_in_last_minute: usize,
    pub max_requests_per_minute: usize,
    pub current_delay: Duration,
    pub cache_size: usize,
    pub health_score: f64,
    pub consecutive_errors: u32,
    pub quota_exceeded: bool,
    pub daily_requests: u32,
    pub hourly_requests: u32,
}

#[derive(Debug, Default)]
struct Window {
    reservations: VecDeque<Instant>,
    last_call: Option<Instant>,
}

impl Window {
    fn prune(&mut self, now: Instant) {
        while let Some(at) = self.reservations.front() {
            if now.duration_since(*at) >= RATE_WINDOW {
                self.reservations.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Gatekeeper for every outbound call to the rate-limited service.
///
/// - Sliding 60s window of reservations bounded by `requests_per_minute`
/// - Adaptive pacing from the [`BackoffController`]
/// - Daily/hourly counters in the [`QuotaTracker`]
/// - Fingerprint cache in the [`ResponseCache`]
///
/// Construct one per upstream quota and share it behind an `Arc`.
pub struct RequestGovernor {
    requests_per_minute: usize,
    window: Mutex<Window>,
    backoff: BackoffController,
    quota: QuotaTracker,
    cache: ResponseCache,
}

impl RequestGovernor {
    /// Validate `config` and build a governor with the default cache backend.
    pub fn new(config: &GovernorConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::from_parts(
            config.requests_per_minute,
            BackoffController::new(BackoffConfig::from(config)),
            QuotaTracker::new(quota_limits(config)),
            ResponseCache::from_config(CacheConfig::from(config)),
        ))
    }

    /// Like [`RequestGovernor::new`] but caching through a caller-supplied backend.
    pub fn with_cache_backend(
        config: &GovernorConfig,
        backend: Box<dyn CacheBackend>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self::from_parts(
            config.requests_per_minute,
            BackoffController::new(BackoffConfig::from(config)),
            QuotaTracker::new(quota_limits(config)),
            ResponseCache::new(CacheConfig::from(config), backend),
        ))
    }

    pub fn from_parts(
        requests_per_minute: u32,
        backoff: BackoffController,
        quota: QuotaTracker,
        cache: ResponseCache,
    ) -> Self {
        Self {
            requests_per_minute: requests_per_minute.max(1) as usize,
            window: Mutex::new(Window::default()),
            backoff,
            quota,
            cache,
        }
    }

    pub fn backoff(&self) -> &BackoffController {
        &self.backoff
    }

    pub fn quota(&self) -> &QuotaTracker {
        &self.quota
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    /// Wait until an outbound call may be issued, then reserve a slot for it.
    ///
    /// Dropping the returned future before it completes leaves no reservation.
    pub async fn wait_if_needed(&self) {
        let honored_hint = self.pace().await;
        self.reserve_slot().await;
        if honored_hint {
            self.backoff.clear_quota_exceeded();
            info!("upstream retry window elapsed, resuming requests");
        }
    }

    /// [`wait_if_needed`](Self::wait_if_needed), abandoned with
    /// [`Error::Cancelled`] if `token` fires first.
    pub async fn wait_with_cancel(&self, token: &CancellationToken) -> Result<()> {
        tokio::select! {
            _ = token.cancelled() => {
                debug!("governor wait cancelled");
                Err(Error::Cancelled)
            }
            _ = self.wait_if_needed() => Ok(()),
        }
    }

    /// Sleep for a pending server retry hint, or for the adaptive delay.
    /// Returns whether a retry hint was waited out.
    async fn pace(&self) -> bool {
        let since_last = self
            .window
            .lock()
            .await
            .last_call
            .map(|at| at.elapsed());

        if let Some(retry_after) = self.backoff.pending_retry_after() {
            let buffer = rand::thread_rng().gen_range(RETRY_AFTER_BUFFER_MS.0..=RETRY_AFTER_BUFFER_MS.1);
            let wait = retry_after
                .saturating_sub(since_last.unwrap_or(Duration::ZERO))
                .saturating_add(Duration::from_millis(buffer));
            warn!(
                retry_after_secs = retry_after.as_secs_f64(),
                wait_secs = wait.as_secs_f64(),
                "honoring upstream retry hint"
            );
            sleep(wait).await;
            return true;
        }

        if let Some(elapsed) = since_last {
            let wait = self.backoff.compute_delay().saturating_sub(elapsed);
            if !wait.is_zero() {
                debug!(wait_secs = wait.as_secs_f64(), "adaptive pacing delay");
                sleep(wait).await;
            }
        }
        false
    }

    /// Reserve a slot in the per-minute window. The count check and the append
    /// happen under one lock acquisition; the lock is never held while sleeping.
    async fn reserve_slot(&self) {
        let mut jittered = false;
        loop {
            let wait = {
                let mut window = self.window.lock().await;
                let now = Instant::now();
                window.prune(now);
                let oldest = window.reservations.front().copied();
                match oldest {
                    Some(oldest) if window.reservations.len() >= self.requests_per_minute => {
                        Some(RATE_WINDOW.saturating_sub(now.duration_since(oldest)) + WINDOW_BUFFER)
                    }
                    _ if jittered => {
                        window.reservations.push_back(now);
                        window.last_call = Some(now);
                        return;
                    }
                    _ => None,
                }
            };

            match wait {
                Some(wait) => {
                    info!(
                        wait_secs = wait.as_secs_f64(),
                        limit = self.requests_per_minute,
                        "per-minute window full, waiting for a slot"
                    );
                    sleep(wait).await;
                }
                None => {
                    jittered = true;
                    let jitter = rand::thread_rng().gen_range(0..=MAX_SLOT_JITTER_MS);
                    sleep(Duration::from_millis(jitter)).await;
                }
            }
        }
    }

    /// Record a successful upstream call: improves backoff health and counts
    /// the request against the daily/hourly quota.
    pub fn record_success(&self) {
        self.backoff.record_success();
        self.quota.record_request();
    }

    /// Like [`record_success`](Self::record_success) for a call that held a
    /// quota reservation.
    pub fn record_reserved_success(&self, permit: QuotaPermit<'_>) {
        self.backoff.record_success();
        permit.commit();
    }

    pub fn record_error(&self, is_rate_limit: bool, retry_after: Option<Duration>) {
        self.backoff.record_error(is_rate_limit, retry_after);
    }

    pub async fn try_get_cached<T: DeserializeOwned>(&self, fingerprint: &Fingerprint) -> Result<Option<T>> {
        self.cache.get(fingerprint).await
    }

    pub async fn put_cache<T: Serialize>(&self, fingerprint: &Fingerprint, value: &T) -> Result<()> {
        self.cache.put(fingerprint, value).await
    }

    pub async fn requests_in_last_minute(&self) -> usize {
        let mut window = self.window.lock().await;
        window.prune(Instant::now());
        window.reservations.len()
    }

    pub async fn get_stats(&self) -> GovernorStats {
        let requests_in_last_minute = self.requests_in_last_minute().await;
        let backoff = self.backoff.snapshot();
        let quota = self.quota.snapshot();
        // A failing backend reads as empty rather than hiding the other stats.
        let cache_size = self.cache.size().await.unwrap_or(0);
        GovernorStats {
            requests_in_last_minute,
            max_requests_per_minute: self.requests_per_minute,
            current_delay: backoff.current_delay,
            cache_size,
            health_score: backoff.health_score,
            consecutive_errors: backoff.consecutive_errors,
            quota_exceeded: backoff.quota_exceeded,
            daily_requests: quota.daily_count,
            hourly_requests: quota.hourly_count,
        }
    }
}

fn quota_limits(config: &GovernorConfig) -> QuotaLimits {
    QuotaLimits {
        max_daily: config.max_daily_requests,
        max_hourly: config.requests_per_hour,
    }
}
