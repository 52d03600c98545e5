use mockito::{Matcher, Server};
use quota_governor::client::{GenerateRequest, GovernedClientBuilder};
use quota_governor::transport::HttpTextGenerator;
use quota_governor::{ApiError, Error, GenerationConfig, GovernorConfig, TextGenerator};
use std::sync::Arc;
use std::time::Duration;

const PATH: &str = "/v1beta/models/test-model:generateContent";

const OK_BODY: &str = r#"{
  "candidates": [
    {"content": {"parts": [{"text": "Acme shipped "}, {"text": "a new widget."}], "role": "model"}}
  ]
}"#;

#[tokio::test]
async fn test_success_sends_prompt_and_config() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", PATH)
        .match_header("x-goog-api-key", "secret")
        .match_body(Matcher::PartialJson(serde_json::json!({
            "contents": [{"parts": [{"text": "what's new?"}]}],
            "generationConfig": {"maxOutputTokens": 2000, "topK": 40}
        })))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(OK_BODY)
        .create_async()
        .await;

    let generator = HttpTextGenerator::new(&server.url(), "test-model")
        .unwrap()
        .with_api_key("secret");
    let text = generator
        .generate("what's new?", &GenerationConfig::default())
        .await
        .unwrap();

    assert_eq!(text, "Acme shipped a new widget.");
    mock.assert_async().await;
}

#[tokio::test]
async fn test_429_with_retry_delay_in_body() {
    let mut server = Server::new_async().await;
    let _mock = server
        .mock("POST", PATH)
        .with_status(429)
        .with_header("content-type", "application/json")
        .with_body(
            r#"{"error": {"code": 429, "status": "RESOURCE_EXHAUSTED",
                "details": [{"@type": "type.googleapis.com/google.rpc.RetryInfo", "retryDelay": "30s"}]}}"#,
        )
        .create_async()
        .await;

    let generator = HttpTextGenerator::new(&server.url(), "test-model").unwrap();
    let err = generator
        .generate("q", &GenerationConfig::default())
        .await
        .unwrap_err();
    assert_eq!(err, ApiError::rate_limited(Some(Duration::from_secs(30))));
}

#[tokio::test]
async fn test_429_with_retry_after_header() {
    let mut server = Server::new_async().await;
    let _mock = server
        .mock("POST", PATH)
        .with_status(429)
        .with_header("retry-after", "7")
        .with_body("slow down")
        .create_async()
        .await;

    let generator = HttpTextGenerator::new(&server.url(), "test-model").unwrap();
    let err = generator
        .generate("q", &GenerationConfig::default())
        .await
        .unwrap_err();
    assert_eq!(err, ApiError::rate_limited(Some(Duration::from_secs(7))));
}

#[tokio::test]
async fn test_server_error_is_transient_and_bad_request_is_malformed() {
    let mut server = Server::new_async().await;
    let _unavailable = server
        .mock("POST", "/v1beta/models/flaky:generateContent")
        .with_status(503)
        .create_async()
        .await;
    let _bad = server
        .mock("POST", "/v1beta/models/strict:generateContent")
        .with_status(400)
        .with_body(r#"{"error": {"code": 400, "status": "INVALID_ARGUMENT"}}"#)
        .create_async()
        .await;

    let flaky = HttpTextGenerator::new(&server.url(), "flaky").unwrap();
    assert!(matches!(
        flaky.generate("q", &GenerationConfig::default()).await,
        Err(ApiError::Transient { .. })
    ));

    let strict = HttpTextGenerator::new(&server.url(), "strict").unwrap();
    assert!(matches!(
        strict.generate("q", &GenerationConfig::default()).await,
        Err(ApiError::Malformed { .. })
    ));
}

#[tokio::test]
async fn test_empty_candidates_is_malformed() {
    let mut server = Server::new_async().await;
    let _mock = server
        .mock("POST", PATH)
        .with_status(200)
        .with_body(r#"{"candidates": []}"#)
        .create_async()
        .await;

    let generator = HttpTextGenerator::new(&server.url(), "test-model").unwrap();
    assert!(matches!(
        generator.generate("q", &GenerationConfig::default()).await,
        Err(ApiError::Malformed { .. })
    ));
}

#[tokio::test]
async fn test_governed_client_retries_transient_http_failure() {
    let mut server = Server::new_async().await;
    let failing = server
        .mock("POST", PATH)
        .with_status(500)
        .expect(1)
        .create_async()
        .await;

    let generator = HttpTextGenerator::new(&server.url(), "test-model").unwrap();
    let client = GovernedClientBuilder::new()
        .config(
            GovernorConfig::new()
                .with_delays(Duration::from_millis(10), Duration::from_millis(50))
                .with_caching(false),
        )
        .generator(Arc::new(generator))
        .max_retries(0)
        .build()
        .unwrap();

    let err = client
        .generate(&GenerateRequest::new("acme", "q"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::RetriesExhausted { attempts: 1, .. }), "{:?}", err);
    failing.assert_async().await;
    assert_eq!(client.governor().get_stats().await.consecutive_errors, 1);
}
