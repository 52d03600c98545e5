//! quota-governor CLI: exercise a governor against a simulated upstream and
//! inspect effective configuration.
//!
//! Usage:
//!   quota-governor-cli simulate [OPTIONS]     Run requests through a governed client
//!   quota-governor-cli config [--config <p>]  Print the effective configuration as YAML

use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use futures::future::join_all;
use quota_governor::client::{GenerateRequest, GovernedClientBuilder};
use quota_governor::{ApiError, GenerationConfig, GovernorConfig, TextGenerator};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        print_usage();
        std::process::exit(1);
    }

    let result = match args[1].as_str() {
        "simulate" => cmd_simulate(&args[2..]).await,
        "config" => cmd_config(&args[2..]).await,
        "version" | "--version" | "-V" => {
            cmd_version();
            Ok(())
        }
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {other}");
            eprintln!();
            print_usage();
            std::process::exit(1);
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

fn print_usage() {
    println!(
        r#"quota-governor-cli: adaptive request governor tooling

USAGE:
    quota-governor-cli <COMMAND> [OPTIONS]

COMMANDS:
    simulate                    Run requests against a simulated upstream
        --requests <n>          Total requests (default 10)
        --distinct <n>          Distinct queries; repeats hit the cache (default = requests)
        --concurrency <n>       Concurrent workers (default 2)
        --throttle-every <n>    Upstream answers 429 on every n-th call (default 0 = never)
        --retry-after <secs>    Retry hint sent with simulated 429s (default 5)
        --config <path>         YAML/JSON governor configuration
    config [--config <path>]    Print the effective configuration as YAML
    version                     Show version information
    help                        Show this help message

ENVIRONMENT:
    QUOTA_GOVERNOR_RPM, QUOTA_GOVERNOR_MIN_DELAY_SECS, QUOTA_GOVERNOR_MAX_DELAY_SECS,
    QUOTA_GOVERNOR_DAILY_LIMIT, QUOTA_GOVERNOR_HOURLY_LIMIT, QUOTA_GOVERNOR_CACHE
    RUST_LOG                    Log filter (e.g. quota_governor=debug)"#
    );
}

fn cmd_version() {
    println!("quota-governor-cli {}", env!("CARGO_PKG_VERSION"));
}

fn flag_value<'a>(args: &'a [String], name: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == name)
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str())
}

fn flag_u64(args: &[String], name: &str, default: u64) -> anyhow::Result<u64> {
    match flag_value(args, name) {
        Some(raw) => raw
            .parse()
            .with_context(|| format!("{name} expects a non-negative integer, got {raw:?}")),
        None => Ok(default),
    }
}

async fn load_config(args: &[String]) -> anyhow::Result<GovernorConfig> {
    let base = match flag_value(args, "--config") {
        Some(path) => GovernorConfig::from_file(path)
            .await
            .with_context(|| format!("loading {path}"))?,
        None => GovernorConfig::default(),
    };
    let cfg = base.with_env_overrides();
    cfg.validate()?;
    Ok(cfg)
}

async fn cmd_config(args: &[String]) -> anyhow::Result<()> {
    let cfg = load_config(args).await?;
    print!("{}", serde_yaml::to_string(&cfg)?);
    Ok(())
}

/// Upstream double that throttles on a fixed cadence.
struct SimulatedUpstream {
    calls: AtomicU64,
    throttle_every: u64,
    retry_after: Duration,
}

#[async_trait]
impl TextGenerator for SimulatedUpstream {
    async fn generate(&self, prompt: &str, _: &GenerationConfig) -> Result<String, ApiError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::time::sleep(Duration::from_millis(50)).await;
        if self.throttle_every > 0 && n % self.throttle_every == 0 {
            return Err(ApiError::rate_limited(Some(self.retry_after)));
        }
        Ok(format!("simulated answer #{n} for {prompt:?}"))
    }

    fn name(&self) -> &str {
        "simulated"
    }
}

async fn cmd_simulate(args: &[String]) -> anyhow::Result<()> {
    let cfg = load_config(args).await?;
    let requests = flag_u64(args, "--requests", 10)?;
    let distinct = flag_u64(args, "--distinct", requests)?.max(1);
    let concurrency = flag_u64(args, "--concurrency", 2)?.max(1);
    let upstream = Arc::new(SimulatedUpstream {
        calls: AtomicU64::new(0),
        throttle_every: flag_u64(args, "--throttle-every", 0)?,
        retry_after: Duration::from_secs(flag_u64(args, "--retry-after", 5)?),
    });
    if requests == 0 {
        bail!("--requests must be at least 1");
    }

    println!(
        "Simulating {requests} requests ({distinct} distinct) with {concurrency} workers at {} rpm",
        cfg.requests_per_minute
    );

    let client = GovernedClientBuilder::new()
        .config(cfg)
        .generator(upstream.clone())
        .build()?;

    let next = Arc::new(AtomicU64::new(0));
    let start = Instant::now();
    let workers = (0..concurrency).map(|worker| {
        let client = client.clone();
        let next = Arc::clone(&next);
        async move {
            let mut outcomes = Vec::new();
            loop {
                let i = next.fetch_add(1, Ordering::SeqCst);
                if i >= requests {
                    break;
                }
                let request = GenerateRequest::new("simulation", format!("query {}", i % distinct));
                let outcome = client.generate_with_stats(&request).await;
                match &outcome {
                    Ok((_, stats)) => println!(
                        "[worker {worker}] #{i:<4} ok   attempts={} cached={} waited={:.1}s",
                        stats.attempts,
                        stats.from_cache,
                        stats.waited.as_secs_f64()
                    ),
                    Err(e) => println!("[worker {worker}] #{i:<4} fail {e}"),
                }
                outcomes.push(outcome.is_ok());
            }
            outcomes
        }
    });

    let results: Vec<bool> = join_all(workers).await.into_iter().flatten().collect();
    let ok = results.iter().filter(|ok| **ok).count();
    let stats = client.governor().get_stats().await;
    let cache = client.governor().cache().stats();

    println!("\n=== Summary ===");
    println!("succeeded:           {ok}/{}", results.len());
    println!("upstream calls:      {}", upstream.calls.load(Ordering::SeqCst));
    println!("elapsed:             {:.1}s", start.elapsed().as_secs_f64());
    println!(
        "window:              {}/{} in last minute",
        stats.requests_in_last_minute, stats.max_requests_per_minute
    );
    println!("current delay:       {:.2}s", stats.current_delay.as_secs_f64());
    println!("health score:        {:.2}", stats.health_score);
    println!("consecutive errors:  {}", stats.consecutive_errors);
    println!(
        "cache:               {} entries, {} hits, {} misses",
        stats.cache_size, cache.hits, cache.misses
    );
    println!(
        "quota:               {} today, {} this hour",
        stats.daily_requests, stats.hourly_requests
    );

    if ok < results.len() {
        return Err(anyhow!("{} requests failed", results.len() - ok));
    }
    Ok(())
}
