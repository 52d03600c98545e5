//! # quota-governor
//!
//! Adaptive request governance for quota-limited, rate-limited upstream
//! services.
//!
//! ## Overview
//!
//! Every outbound call passes through a [`RequestGovernor`] that decides
//! whether to proceed now, how long to wait, and whether a cached answer
//! already satisfies the request. Observed successes and errors feed back into
//! the pacing of later calls.
//!
//! ## Key Features
//!
//! - **Per-minute window**: never more than `requests_per_minute` reservations in any 60s
//! - **Adaptive backoff**: delay grows on errors, shrinks on success streaks
//! - **Quota windows**: optional hourly and daily ceilings
//! - **Response cache**: fingerprint-keyed with a fixed TTL
//! - **Typed errors**: upstream failures are classified once, never by message text
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use quota_governor::client::{GenerateRequest, GovernedClientBuilder};
//! use quota_governor::transport::HttpTextGenerator;
//! use quota_governor::GovernorConfig;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> quota_governor::Result<()> {
//!     let client = GovernedClientBuilder::new()
//!         .config(GovernorConfig::default().with_hourly_limit(100))
//!         .generator(Arc::new(HttpTextGenerator::from_env("gemini-1.5-flash")?))
//!         .build()?;
//!
//!     let request = GenerateRequest::new("acme", "Summarize this week's product news")
//!         .with_mode("news");
//!     let answer = client.generate(&request).await?;
//!     println!("{}", answer);
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`config`] | Governor configuration, YAML/env loading and validation |
//! | [`resilience`] | Quota tracker, backoff controller and request governor |
//! | [`cache`] | Response cache and request fingerprints |
//! | [`client`] | Governed client facade and retry policy |
//! | [`transport`] | HTTP implementation of the upstream contract |
//! | [`error`] | Error taxonomy |

pub mod cache;
pub mod client;
pub mod config;
pub mod resilience;
pub mod transport;

pub use cache::{Fingerprint, FingerprintBuilder, ResponseCache};
pub use client::{GenerateRequest, GenerationConfig, GovernedClient, GovernedClientBuilder, TextGenerator};
pub use config::GovernorConfig;
pub use resilience::{GovernorStats, RequestGovernor};

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for the library
pub mod error;
pub use error::{ApiError, Error, ErrorContext};
