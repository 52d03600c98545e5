//! # Rate Governance Module
//!
//! Keeps outbound traffic to a quota-limited service inside its per-minute,
//! per-hour and per-day limits while adapting the pacing to how the service
//! is currently behaving.
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`quota`] | Daily and hourly request counters with lazy window resets |
//! | [`backoff`] | Adaptive delay state driven by success/error history |
//! | [`governor`] | Per-minute sliding window composing the pieces above |
//!
//! ## Backoff
//!
//! Errors multiply the current delay by the backoff factor; quota errors
//! escalate harder or jump to the server's retry hint. Every third
//! consecutive success shrinks the delay again. The advised wait also scales
//! with a 10-minute health score and a random jitter.
//!
//! ```rust
//! use quota_governor::resilience::backoff::{BackoffConfig, BackoffController};
//! use std::time::Duration;
//!
//! let backoff = BackoffController::new(BackoffConfig::default());
//! backoff.record_error(false, None);
//! assert!(backoff.current_delay() > Duration::from_secs(4));
//! ```
//!
//! ## Governor
//!
//! ```rust,no_run
//! use quota_governor::{GovernorConfig, RequestGovernor};
//! use std::sync::Arc;
//!
//! # async fn demo() -> quota_governor::Result<()> {
//! let governor = Arc::new(RequestGovernor::new(&GovernorConfig::default())?);
//! governor.wait_if_needed().await;
//! // issue the upstream call, then report the outcome
//! governor.record_success();
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod governor;
pub mod quota;

pub use backoff::{BackoffConfig, BackoffController, BackoffSnapshot};
pub use governor::{GovernorStats, RequestGovernor};
pub use quota::{QuotaLimits, QuotaPermit, QuotaSnapshot, QuotaTracker};
