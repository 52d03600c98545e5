use async_trait::async_trait;
use futures::future::join_all;
use quota_governor::client::{GenerateRequest, GovernedClient, GovernedClientBuilder};
use quota_governor::{ApiError, Error, GenerationConfig, GovernorConfig, TextGenerator};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Upstream double replaying a fixed script, then answering "ok".
struct ScriptedGenerator {
    script: Mutex<VecDeque<Result<String, ApiError>>>,
    calls: AtomicU32,
}

impl ScriptedGenerator {
    fn new(script: Vec<Result<String, ApiError>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            calls: AtomicU32::new(0),
        })
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TextGenerator for ScriptedGenerator {
    async fn generate(&self, prompt: &str, _: &GenerationConfig) -> Result<String, ApiError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Ok(format!("ok: {}", prompt)))
    }
}

fn fast_config() -> GovernorConfig {
    GovernorConfig::new()
        .with_requests_per_minute(60)
        .with_delays(Duration::from_secs(1), Duration::from_secs(300))
}

fn client(config: GovernorConfig, generator: Arc<ScriptedGenerator>) -> GovernedClient {
    GovernedClientBuilder::new()
        .config(config)
        .generator(generator)
        .build()
        .unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_cache_hit_skips_upstream_and_governor() {
    let upstream = ScriptedGenerator::new(vec![Ok("fresh".into())]);
    let client = client(fast_config(), upstream.clone());
    let request = GenerateRequest::new("acme", "news").with_mode("twitter");

    let (first, stats) = client.generate_with_stats(&request).await.unwrap();
    assert_eq!(first, "fresh");
    assert!(!stats.from_cache);
    assert_eq!(stats.attempts, 1);

    let before = client.governor().requests_in_last_minute().await;
    let (second, stats) = client.generate_with_stats(&request).await.unwrap();
    assert_eq!(second, "fresh");
    assert!(stats.from_cache);
    assert_eq!(stats.attempts, 0);
    assert_eq!(upstream.calls(), 1);
    assert_eq!(client.governor().requests_in_last_minute().await, before);
}

#[tokio::test(start_paused = true)]
async fn test_bypass_cache_forces_fresh_call() {
    let upstream = ScriptedGenerator::new(vec![Ok("one".into()), Ok("two".into())]);
    let client = client(fast_config(), upstream.clone());
    let request = GenerateRequest::new("acme", "news");

    assert_eq!(client.generate(&request).await.unwrap(), "one");
    let fresh = client
        .generate(&request.clone().bypass_cache(true))
        .await
        .unwrap();
    assert_eq!(fresh, "two");
    // the fresh answer replaced the cached one
    assert_eq!(client.generate(&request).await.unwrap(), "two");
    assert_eq!(upstream.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_rate_limit_retry_honors_server_hint() {
    let upstream = ScriptedGenerator::new(vec![
        Err(ApiError::rate_limited(Some(Duration::from_secs(30)))),
        Ok("recovered".into()),
    ]);
    let client = client(fast_config(), upstream.clone());

    let start = Instant::now();
    let (answer, stats) = client
        .generate_with_stats(&GenerateRequest::new("acme", "q"))
        .await
        .unwrap();
    assert_eq!(answer, "recovered");
    assert_eq!(stats.attempts, 2);
    assert_eq!(stats.retry_count, 1);
    assert!(start.elapsed() >= Duration::from_secs(30), "{:?}", start.elapsed());

    let gov = client.governor().get_stats().await;
    assert!(!gov.quota_exceeded);
    assert_eq!(gov.consecutive_errors, 0);
    assert!(gov.current_delay >= Duration::from_secs(27));
}

#[tokio::test(start_paused = true)]
async fn test_malformed_surfaces_without_retry() {
    let upstream = ScriptedGenerator::new(vec![Err(ApiError::malformed("no candidates"))]);
    let client = client(fast_config(), upstream.clone());

    let err = client
        .generate(&GenerateRequest::new("acme", "q"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Malformed { .. }), "{:?}", err);
    assert_eq!(upstream.calls(), 1);

    let stats = client.governor().get_stats().await;
    assert_eq!(stats.consecutive_errors, 1);
    assert!(!stats.quota_exceeded);
    assert_eq!(stats.daily_requests, 0);
}

#[tokio::test(start_paused = true)]
async fn test_retries_exhausted_reports_last_error() {
    let upstream = ScriptedGenerator::new(vec![
        Err(ApiError::transient("503")),
        Err(ApiError::transient("503")),
        Err(ApiError::transient("502")),
    ]);
    let client = client(fast_config().with_max_retries(2), upstream.clone());

    let err = client
        .generate(&GenerateRequest::new("acme", "q"))
        .await
        .unwrap_err();
    match err {
        Error::RetriesExhausted { attempts, last } => {
            assert_eq!(attempts, 3);
            assert!(matches!(*last, Error::Transient { ref message } if message.contains("502")));
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(upstream.calls(), 3);
    assert_eq!(client.governor().get_stats().await.consecutive_errors, 3);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_hourly_quota_blocks_until_reset() {
    let upstream = ScriptedGenerator::new(vec![]);
    let client = client(fast_config().with_hourly_limit(1), upstream.clone());

    client.generate(&GenerateRequest::new("acme", "first")).await.unwrap();
    let start = Instant::now();
    client.generate(&GenerateRequest::new("acme", "second")).await.unwrap();

    assert!(start.elapsed() >= Duration::from_secs(3590), "{:?}", start.elapsed());
    assert_eq!(upstream.calls(), 2);
    let stats = client.governor().get_stats().await;
    assert_eq!(stats.hourly_requests, 1);
    assert_eq!(stats.daily_requests, 2);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_while_waiting_for_quota() {
    let upstream = ScriptedGenerator::new(vec![]);
    let client = client(fast_config().with_daily_limit(1), upstream.clone());
    client.generate(&GenerateRequest::new("acme", "first")).await.unwrap();

    let token = CancellationToken::new();
    let cancel = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(10)).await;
        cancel.cancel();
    });

    let err = client
        .generate_with_cancel(&GenerateRequest::new("acme", "second"), &token)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Cancelled));
    assert_eq!(upstream.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_callers_share_one_window() {
    let upstream = ScriptedGenerator::new(vec![]);
    let config = GovernorConfig::new()
        .with_requests_per_minute(3)
        .with_delays(Duration::from_secs(1), Duration::from_secs(2));
    let client = client(config, upstream.clone());

    let start = Instant::now();
    let calls = (0..6).map(|i| {
        let client = client.clone();
        async move {
            client
                .generate(&GenerateRequest::new("acme", format!("q{}", i)))
                .await
        }
    });
    let results = join_all(calls).await;

    assert!(results.iter().all(|r| r.is_ok()));
    assert_eq!(upstream.calls(), 6);
    // six reservations at three per minute need a second window
    assert!(start.elapsed() >= Duration::from_secs(60), "{:?}", start.elapsed());
    assert!(client.governor().requests_in_last_minute().await <= 3);
}

/// Upstream double that takes a while to answer and fails the first call.
struct SlowGenerator {
    calls: AtomicU32,
}

#[async_trait]
impl TextGenerator for SlowGenerator {
    async fn generate(&self, prompt: &str, _: &GenerationConfig) -> Result<String, ApiError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(5)).await;
        if n == 0 {
            return Err(ApiError::transient("upstream hiccup"));
        }
        Ok(format!("ok: {}", prompt))
    }
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_callers_never_exceed_hourly_quota() {
    let upstream = Arc::new(SlowGenerator {
        calls: AtomicU32::new(0),
    });
    let client = GovernedClientBuilder::new()
        .config(
            GovernorConfig::new()
                .with_requests_per_minute(10)
                .with_delays(Duration::from_secs(1), Duration::from_secs(2))
                .with_hourly_limit(2),
        )
        .generator(upstream.clone())
        .build()
        .unwrap();

    let calls = (0..6).map(|i| {
        let client = client.clone();
        async move {
            client
                .generate(&GenerateRequest::new("acme", format!("q{}", i)))
                .await
        }
    });
    // short of the hourly reset: callers past the budget are still waiting
    let outcome = tokio::time::timeout(Duration::from_secs(600), join_all(calls)).await;
    assert!(outcome.is_err());

    let quota = client.governor().quota().snapshot();
    assert_eq!(quota.hourly_count, 2);
    assert_eq!(quota.in_flight, 0);
    // the failed first call released its slot to a waiting caller
    assert_eq!(upstream.calls.load(Ordering::SeqCst), 3);
}
