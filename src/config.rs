//! Governor configuration.
//!
//! Configuration can come from YAML or JSON documents, from environment
//! variables, or from the `with_*` builder methods. Every path ends in
//! [`GovernorConfig::validate`], which rejects parameters the governor cannot
//! honor before any state is constructed.

use crate::{Error, ErrorContext, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Longest backoff delay accepted for long-horizon throttling.
pub const MAX_DELAY_CEILING_SECS: f64 = 300.0;

/// A daily interval (UTC hours, `start_hour` inclusive, `end_hour` exclusive)
/// during which the upstream is expected to be busy. Wraps past midnight
/// when `start_hour > end_hour`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusyHours {
    pub start_hour: u32,
    pub end_hour: u32,
}

impl BusyHours {
    pub fn new(start_hour: u32, end_hour: u32) -> Self {
        Self {
            start_hour,
            end_hour,
        }
    }

    pub fn contains(&self, hour: u32) -> bool {
        if self.start_hour <= self.end_hour {
            hour >= self.start_hour && hour < self.end_hour
        } else {
            hour >= self.start_hour || hour < self.end_hour
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernorConfig {
    /// Reservations allowed in any 60s window.
    pub requests_per_minute: u32,
    pub min_delay_seconds: f64,
    pub max_delay_seconds: f64,
    pub enable_caching: bool,
    pub cache_duration_seconds: u64,
    pub cache_max_entries: usize,
    /// `None` disables the daily quota.
    pub max_daily_requests: Option<u32>,
    /// `None` disables the hourly quota.
    pub requests_per_hour: Option<u32>,
    /// Delay multiplier applied on errors (> 1).
    pub backoff_factor: f64,
    /// Delay multiplier applied after a streak of successes (in [0.8, 1)).
    pub success_factor: f64,
    pub max_retries: u32,
    pub busy_hours: Option<BusyHours>,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 14,
            min_delay_seconds: 4.0,
            max_delay_seconds: 10.0,
            enable_caching: true,
            cache_duration_seconds: 1800,
            cache_max_entries: 1000,
            max_daily_requests: None,
            requests_per_hour: None,
            backoff_factor: 1.5,
            success_factor: 0.9,
            max_retries: 3,
            busy_hours: None,
        }
    }
}

impl GovernorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a YAML (or JSON, which is a YAML subset) document and validate it.
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let cfg: GovernorConfig = serde_yaml::from_str(content).map_err(|e| {
            Error::configuration_with_context(
                format!("Invalid governor configuration: {}", e),
                ErrorContext::new().with_source("governor_config"),
            )
        })?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            Error::configuration_with_context(
                format!("Failed to read configuration file: {}", e),
                ErrorContext::new()
                    .with_details(path.display().to_string())
                    .with_source("governor_config"),
            )
        })?;
        Self::from_yaml_str(&content)
    }

    /// Apply overrides from the environment:
    /// - `QUOTA_GOVERNOR_RPM`
    /// - `QUOTA_GOVERNOR_MIN_DELAY_SECS` / `QUOTA_GOVERNOR_MAX_DELAY_SECS`
    /// - `QUOTA_GOVERNOR_DAILY_LIMIT` / `QUOTA_GOVERNOR_HOURLY_LIMIT`
    /// - `QUOTA_GOVERNOR_CACHE` (`true`/`false`)
    ///
    /// Unparseable values are ignored.
    pub fn with_env_overrides(mut self) -> Self {
        fn var<T: std::str::FromStr>(name: &str) -> Option<T> {
            std::env::var(name).ok().and_then(|s| s.trim().parse::<T>().ok())
        }

        if let Some(rpm) = var::<u32>("QUOTA_GOVERNOR_RPM") {
            self.requests_per_minute = rpm;
        }
        if let Some(min) = var::<f64>("QUOTA_GOVERNOR_MIN_DELAY_SECS") {
            self.min_delay_seconds = min;
        }
        if let Some(max) = var::<f64>("QUOTA_GOVERNOR_MAX_DELAY_SECS") {
            self.max_delay_seconds = max;
        }
        if let Some(daily) = var::<u32>("QUOTA_GOVERNOR_DAILY_LIMIT") {
            self.max_daily_requests = Some(daily);
        }
        if let Some(hourly) = var::<u32>("QUOTA_GOVERNOR_HOURLY_LIMIT") {
            self.requests_per_hour = Some(hourly);
        }
        if let Some(cache) = var::<bool>("QUOTA_GOVERNOR_CACHE") {
            self.enable_caching = cache;
        }
        self
    }

    pub fn with_requests_per_minute(mut self, rpm: u32) -> Self {
        self.requests_per_minute = rpm;
        self
    }

    pub fn with_delays(mut self, min: Duration, max: Duration) -> Self {
        self.min_delay_seconds = min.as_secs_f64();
        self.max_delay_seconds = max.as_secs_f64();
        self
    }

    pub fn with_caching(mut self, enabled: bool) -> Self {
        self.enable_caching = enabled;
        self
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_duration_seconds = ttl.as_secs();
        self
    }

    pub fn with_daily_limit(mut self, limit: u32) -> Self {
        self.max_daily_requests = Some(limit);
        self
    }

    pub fn with_hourly_limit(mut self, limit: u32) -> Self {
        self.requests_per_hour = Some(limit);
        self
    }

    pub fn with_backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = factor;
        self
    }

    pub fn with_success_factor(mut self, factor: f64) -> Self {
        self.success_factor = factor;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_busy_hours(mut self, busy: BusyHours) -> Self {
        self.busy_hours = Some(busy);
        self
    }

    pub fn min_delay(&self) -> Duration {
        Duration::from_secs_f64(self.min_delay_seconds)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_secs_f64(self.max_delay_seconds)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_duration_seconds)
    }

    /// Reject parameters that would break the governor's invariants.
    pub fn validate(&self) -> Result<()> {
        let invalid = |field: &str, msg: String| -> Result<()> {
            Err(Error::configuration_with_context(
                msg,
                ErrorContext::new()
                    .with_field_path(field)
                    .with_source("governor_config"),
            ))
        };

        if self.requests_per_minute == 0 {
            return invalid(
                "requests_per_minute",
                "requests_per_minute must be at least 1".into(),
            );
        }
        if !self.min_delay_seconds.is_finite() || self.min_delay_seconds <= 0.0 {
            return invalid(
                "min_delay_seconds",
                format!(
                    "min_delay_seconds must be a positive number, got {}",
                    self.min_delay_seconds
                ),
            );
        }
        if !self.max_delay_seconds.is_finite()
            || self.max_delay_seconds <= 0.0
            || self.max_delay_seconds > MAX_DELAY_CEILING_SECS
        {
            return invalid(
                "max_delay_seconds",
                format!(
                    "max_delay_seconds must be in (0, {}], got {}",
                    MAX_DELAY_CEILING_SECS, self.max_delay_seconds
                ),
            );
        }
        if self.min_delay_seconds > self.max_delay_seconds {
            return invalid(
                "min_delay_seconds",
                format!(
                    "min_delay_seconds ({}) exceeds max_delay_seconds ({})",
                    self.min_delay_seconds, self.max_delay_seconds
                ),
            );
        }
        if !self.backoff_factor.is_finite() || self.backoff_factor <= 1.0 {
            return invalid(
                "backoff_factor",
                format!("backoff_factor must be > 1, got {}", self.backoff_factor),
            );
        }
        if !(0.8..1.0).contains(&self.success_factor) {
            return invalid(
                "success_factor",
                format!(
                    "success_factor must be in [0.8, 1.0), got {}",
                    self.success_factor
                ),
            );
        }
        if self.enable_caching && self.cache_duration_seconds == 0 {
            return invalid(
                "cache_duration_seconds",
                "cache_duration_seconds must be positive when caching is enabled".into(),
            );
        }
        if self.enable_caching && self.cache_max_entries == 0 {
            return invalid(
                "cache_max_entries",
                "cache_max_entries must be positive when caching is enabled".into(),
            );
        }
        if let Some(busy) = self.busy_hours {
            if busy.start_hour >= 24 || busy.end_hour >= 24 || busy.start_hour == busy.end_hour {
                return invalid(
                    "busy_hours",
                    format!(
                        "busy_hours must be two distinct hours in 0..24, got {}..{}",
                        busy.start_hour, busy.end_hour
                    ),
                );
            }
        }
        Ok(())
    }
}
