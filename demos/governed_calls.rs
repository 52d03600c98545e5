//! Several callers sharing one governor.
//!
//! Uses the HTTP generator when `QUOTA_GOVERNOR_API_KEY` (or `GEMINI_API_KEY`)
//! is set, otherwise a local stand-in so the demo runs offline.
//!
//! Run with: `RUST_LOG=quota_governor=info cargo run --example governed_calls`

use async_trait::async_trait;
use quota_governor::client::{GenerateRequest, GovernedClientBuilder};
use quota_governor::transport::HttpTextGenerator;
use quota_governor::{ApiError, GenerationConfig, GovernorConfig, RequestGovernor, TextGenerator};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

struct Offline;

#[async_trait]
impl TextGenerator for Offline {
    async fn generate(&self, prompt: &str, _: &GenerationConfig) -> Result<String, ApiError> {
        Ok(format!("(offline) {} characters of prompt received", prompt.len()))
    }

    fn name(&self) -> &str {
        "offline"
    }
}

#[tokio::main]
async fn main() -> quota_governor::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = GovernorConfig::default()
        .with_requests_per_minute(6)
        .with_delays(Duration::from_secs(1), Duration::from_secs(30))
        .with_hourly_limit(50)
        .with_env_overrides();
    let governor = Arc::new(RequestGovernor::new(&config)?);

    let generator: Arc<dyn TextGenerator> = if std::env::var("QUOTA_GOVERNOR_API_KEY").is_ok()
        || std::env::var("GEMINI_API_KEY").is_ok()
    {
        Arc::new(HttpTextGenerator::from_env("gemini-1.5-flash")?)
    } else {
        Arc::new(Offline)
    };

    // Two facades, one quota.
    let news = GovernedClientBuilder::new()
        .governor(Arc::clone(&governor))
        .generator(Arc::clone(&generator))
        .build()?;
    let social = GovernedClientBuilder::new()
        .governor(Arc::clone(&governor))
        .generator(generator)
        .max_retries(1)
        .build()?;

    let requests = vec![
        GenerateRequest::new("acme", "What did acme announce this week?").with_mode("news"),
        GenerateRequest::new("acme", "Top posts about acme")
            .with_mode("twitter")
            .with_secondary("globex"),
        // identical identity to the first request: served from cache
        GenerateRequest::new("acme", "What did acme announce this week?").with_mode("news"),
    ];

    for (i, request) in requests.iter().enumerate() {
        let client = if i % 2 == 0 { &news } else { &social };
        let (answer, stats) = client.generate_with_stats(request).await?;
        println!(
            "#{} cached={} attempts={} waited={:.1}s -> {}",
            i,
            stats.from_cache,
            stats.attempts,
            stats.waited.as_secs_f64(),
            answer
        );
    }

    let stats = governor.get_stats().await;
    println!(
        "window {}/{} | delay {:.1}s | health {:.2} | cache {} | hour {}",
        stats.requests_in_last_minute,
        stats.max_requests_per_minute,
        stats.current_delay.as_secs_f64(),
        stats.health_score,
        stats.cache_size,
        stats.hourly_requests
    );
    Ok(())
}
