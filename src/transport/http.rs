use crate::client::generator::{GenerationConfig, TextGenerator};
use crate::error::ApiError;
use crate::{Error, ErrorContext, Result};
use async_trait::async_trait;
use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;
use tracing::debug;
use url::Url;

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";
pub const DEFAULT_MODEL: &str = "gemini-1.5-flash";
/// Upper bound on any server retry hint.
pub const MAX_RETRY_HINT: Duration = Duration::from_secs(86_400);

/// [`TextGenerator`] over a `generateContent`-style HTTP endpoint.
///
/// Env configuration:
/// - `QUOTA_GOVERNOR_API_KEY` (falls back to `GEMINI_API_KEY`)
/// - `QUOTA_GOVERNOR_BASE_URL`
/// - `QUOTA_GOVERNOR_HTTP_TIMEOUT_SECS` (default 30)
pub struct HttpTextGenerator {
    client: reqwest::Client,
    endpoint: Url,
    model: String,
    api_key: Option<String>,
}

impl HttpTextGenerator {
    pub fn new(base_url: &str, model: &str) -> Result<Self> {
        let endpoint = Self::endpoint_for(base_url, model)?;

        let timeout_secs = env::var("QUOTA_GOVERNOR_HTTP_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(30);

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .pool_idle_timeout(Some(Duration::from_secs(90)))
            .build()
            .map_err(|e| {
                Error::runtime_with_context(
                    format!("Failed to build HTTP client: {}", e),
                    ErrorContext::new().with_source("http_transport"),
                )
            })?;

        Ok(Self {
            client,
            endpoint,
            model: model.to_string(),
            api_key: None,
        })
    }

    /// Base URL and API key from the environment.
    pub fn from_env(model: &str) -> Result<Self> {
        let base_url =
            env::var("QUOTA_GOVERNOR_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        let mut generator = Self::new(&base_url, model)?;
        generator.api_key = env::var("QUOTA_GOVERNOR_API_KEY")
            .or_else(|_| env::var("GEMINI_API_KEY"))
            .ok();
        Ok(generator)
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    fn endpoint_for(base_url: &str, model: &str) -> Result<Url> {
        let invalid = |msg: String| {
            Error::configuration_with_context(
                msg,
                ErrorContext::new()
                    .with_field_path("base_url")
                    .with_details(base_url.to_string())
                    .with_source("http_transport"),
            )
        };

        let base = Url::parse(base_url).map_err(|e| invalid(format!("Invalid base URL: {}", e)))?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(invalid(format!("Unsupported URL scheme: {}", base.scheme())));
        }
        if model.is_empty() || model.contains('/') {
            return Err(Error::configuration_with_context(
                format!("Invalid model id: {:?}", model),
                ErrorContext::new()
                    .with_field_path("model")
                    .with_source("http_transport"),
            ));
        }

        let full = format!(
            "{}/v1beta/models/{}:generateContent",
            base.as_str().trim_end_matches('/'),
            model
        );
        Url::parse(&full).map_err(|e| invalid(format!("Invalid endpoint URL: {}", e)))
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateBody<'a> {
    contents: [Content<'a>; 1],
    generation_config: &'a GenerationConfig,
}

#[derive(Serialize)]
struct Content<'a> {
    parts: [Part<'a>; 1],
}

#[derive(Serialize)]
struct Part<'a> {
    text: &'a str,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Deserialize)]
struct CandidatePart {
    text: Option<String>,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    details: Vec<ErrorDetail>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ErrorDetail {
    retry_delay: Option<String>,
}

#[async_trait]
impl TextGenerator for HttpTextGenerator {
    async fn generate(&self, prompt: &str, config: &GenerationConfig) -> std::result::Result<String, ApiError> {
        let body = GenerateBody {
            contents: [Content {
                parts: [Part { text: prompt }],
            }],
            generation_config: config,
        };

        let mut req = self.client.post(self.endpoint.clone()).json(&body);
        if let Some(key) = &self.api_key {
            req = req.header("x-goog-api-key", key);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| ApiError::transient(format!("request failed: {}", e)))?;
        let status = resp.status();
        let headers = resp.headers().clone();
        let text = resp
            .text()
            .await
            .map_err(|e| ApiError::transient(format!("failed to read response body: {}", e)))?;

        debug!(
            model = self.model.as_str(),
            http_status = status.as_u16(),
            body_len = text.len(),
            "generateContent response"
        );

        if !status.is_success() {
            return Err(classify_failure(status, &headers, &text));
        }
        extract_text(&text)
    }

    fn name(&self) -> &str {
        &self.model
    }
}

/// Map a non-success response onto the upstream error taxonomy.
pub(crate) fn classify_failure(status: StatusCode, headers: &HeaderMap, body: &str) -> ApiError {
    let envelope = serde_json::from_str::<ErrorEnvelope>(body).ok();
    let exhausted = envelope
        .as_ref()
        .and_then(|e| e.error.status.as_deref())
        .map_or(false, |s| s == "RESOURCE_EXHAUSTED");

    if status == StatusCode::TOO_MANY_REQUESTS || exhausted {
        let retry_after = retry_after_header(headers).or_else(|| {
            envelope.as_ref().and_then(|e| {
                e.error
                    .details
                    .iter()
                    .find_map(|d| d.retry_delay.as_deref().and_then(parse_retry_delay))
            })
        });
        return ApiError::rate_limited(retry_after);
    }

    if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        return ApiError::transient(format!("HTTP {}", status.as_u16()));
    }

    ApiError::malformed(format!("HTTP {}: {}", status.as_u16(), truncate(body, 200)))
}

fn retry_after_header(headers: &HeaderMap) -> Option<Duration> {
    let raw = headers.get("retry-after")?.to_str().ok()?;
    let secs: u64 = raw.trim().parse().ok()?;
    Some(Duration::from_secs(secs).min(MAX_RETRY_HINT))
}

/// Parse a protobuf-style duration such as `"30s"` or `"1.5s"`, capped at
/// [`MAX_RETRY_HINT`].
pub(crate) fn parse_retry_delay(raw: &str) -> Option<Duration> {
    let secs: f64 = raw.trim().strip_suffix('s')?.parse().ok()?;
    if !secs.is_finite() || secs < 0.0 {
        return None;
    }
    if secs >= MAX_RETRY_HINT.as_secs_f64() {
        return Some(MAX_RETRY_HINT);
    }
    Duration::try_from_secs_f64(secs).ok()
}

fn extract_text(body: &str) -> std::result::Result<String, ApiError> {
    let parsed: GenerateResponse = serde_json::from_str(body)
        .map_err(|e| ApiError::malformed(format!("invalid response JSON: {}", e)))?;
    let candidate = parsed
        .candidates
        .into_iter()
        .next()
        .ok_or_else(|| ApiError::malformed("response has no candidates"))?;
    let text: String = candidate
        .content
        .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
        .unwrap_or_default();
    if text.trim().is_empty() {
        return Err(ApiError::malformed("candidate has no text"));
    }
    Ok(text)
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
