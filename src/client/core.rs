use super::generator::TextGenerator;
use super::policy::{is_rate_limit, Decision, RetryPolicy};
use super::request::GenerateRequest;
use crate::error::ApiError;
use crate::resilience::{QuotaPermit, RequestGovernor};
use crate::{Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Per-call facts for observability.
#[derive(Debug, Clone)]
pub struct CallStats {
    pub request_id: String,
    /// Upstream attempts made; 0 when served from cache.
    pub attempts: u32,
    pub retry_count: u32,
    pub from_cache: bool,
    /// Time spent blocked on quota windows and governor waits.
    pub waited: Duration,
    pub duration: Duration,
}

impl CallStats {
    fn new(request_id: String) -> Self {
        Self {
            request_id,
            attempts: 0,
            retry_count: 0,
            from_cache: false,
            waited: Duration::ZERO,
            duration: Duration::ZERO,
        }
    }
}

/// The only component that talks to the upstream service.
///
/// Every call goes cache lookup, quota gate, governor wait, upstream call,
/// outcome recording and then the retry decision. Clones share the governor
/// and generator.
#[derive(Clone)]
pub struct GovernedClient {
    pub(crate) governor: Arc<RequestGovernor>,
    pub(crate) generator: Arc<dyn TextGenerator>,
    pub(crate) policy: RetryPolicy,
}

impl GovernedClient {
    pub fn new(governor: Arc<RequestGovernor>, generator: Arc<dyn TextGenerator>) -> Self {
        Self {
            governor,
            generator,
            policy: RetryPolicy::default(),
        }
    }

    pub fn governor(&self) -> &Arc<RequestGovernor> {
        &self.governor
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub async fn generate(&self, request: &GenerateRequest) -> Result<String> {
        Ok(self.generate_with_stats(request).await?.0)
    }

    /// Like [`generate`](Self::generate), but abandoned with
    /// [`Error::Cancelled`] if `token` fires while the call is waiting.
    pub async fn generate_with_cancel(
        &self,
        request: &GenerateRequest,
        token: &CancellationToken,
    ) -> Result<String> {
        Ok(self.run(request, Some(token)).await?.0)
    }

    pub async fn generate_with_stats(&self, request: &GenerateRequest) -> Result<(String, CallStats)> {
        self.run(request, None).await
    }

    async fn run(
        &self,
        request: &GenerateRequest,
        token: Option<&CancellationToken>,
    ) -> Result<(String, CallStats)> {
        let start = Instant::now();
        let mut stats = CallStats::new(Uuid::new_v4().to_string());
        let fingerprint = request.fingerprint();

        if !request.bypass_cache {
            match self.governor.try_get_cached::<String>(&fingerprint).await {
                Ok(Some(hit)) => {
                    stats.from_cache = true;
                    stats.duration = start.elapsed();
                    debug!(
                        request_id = stats.request_id.as_str(),
                        subject = request.subject.as_str(),
                        "served from response cache"
                    );
                    return Ok((hit, stats));
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(request_id = stats.request_id.as_str(), error = %e, "cache lookup failed");
                }
            }
        }

        let mut attempt: u32 = 0;
        loop {
            let wait_start = Instant::now();
            let permit = self.acquire_quota(&stats.request_id, token).await?;
            match token {
                Some(t) => self.governor.wait_with_cancel(t).await?,
                None => self.governor.wait_if_needed().await,
            }
            stats.waited += wait_start.elapsed();
            stats.attempts = attempt + 1;

            let call_start = Instant::now();
            let result = self
                .generator
                .generate(request.prompt_text(), &request.config)
                .await;

            match result {
                Ok(text) => {
                    self.governor.record_reserved_success(permit);
                    if let Err(e) = self.governor.put_cache(&fingerprint, &text).await {
                        warn!(request_id = stats.request_id.as_str(), error = %e, "failed to cache response");
                    }
                    stats.retry_count = attempt;
                    stats.duration = start.elapsed();
                    info!(
                        request_id = stats.request_id.as_str(),
                        generator = self.generator.name(),
                        attempts = stats.attempts,
                        waited_ms = stats.waited.as_millis() as u64,
                        call_ms = call_start.elapsed().as_millis() as u64,
                        "governed request succeeded"
                    );
                    return Ok((text, stats));
                }
                Err(e) => {
                    drop(permit);
                    let retry_after = match &e {
                        ApiError::RateLimited { retry_after } => *retry_after,
                        _ => None,
                    };
                    self.governor.record_error(is_rate_limit(&e), retry_after);

                    match self.policy.decide(&e, attempt) {
                        Decision::Retry => {
                            warn!(
                                request_id = stats.request_id.as_str(),
                                attempt,
                                max_retries = self.policy.max_retries,
                                error = %e,
                                "upstream call failed, retrying"
                            );
                            attempt = attempt.saturating_add(1);
                        }
                        Decision::Fail => {
                            let attempts = attempt + 1;
                            info!(
                                request_id = stats.request_id.as_str(),
                                attempts,
                                error = %e,
                                "governed request failed"
                            );
                            if matches!(e, ApiError::Malformed { .. }) {
                                return Err(e.into());
                            }
                            return Err(Error::RetriesExhausted {
                                attempts,
                                last: Box::new(e.into()),
                            });
                        }
                    }
                }
            }
        }
    }

    /// Hold one slot of daily/hourly budget for the coming attempt, waiting
    /// for a window reset or for another caller to give its slot back.
    async fn acquire_quota(
        &self,
        request_id: &str,
        token: Option<&CancellationToken>,
    ) -> Result<QuotaPermit<'_>> {
        let quota = self.governor.quota();
        loop {
            // registered before the check so a release in between is not missed
            let released = quota.released().notified();
            let wait = match quota.try_reserve() {
                Ok(permit) => return Ok(permit),
                Err(wait) => wait,
            };
            let snapshot = quota.snapshot();
            warn!(
                request_id,
                daily = snapshot.daily_count,
                hourly = snapshot.hourly_count,
                in_flight = snapshot.in_flight,
                wait_secs = wait.as_secs_f64(),
                "request quota exhausted, waiting for window reset"
            );
            let cancelled = async {
                match token {
                    Some(t) => t.cancelled().await,
                    None => std::future::pending::<()>().await,
                }
            };
            tokio::select! {
                _ = cancelled => return Err(Error::Cancelled),
                _ = tokio::time::sleep(wait) => {}
                _ = released => {}
            }
        }
    }
}
