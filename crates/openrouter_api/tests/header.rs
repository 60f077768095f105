use openrouter_api::headers::build_headers;
use openrouter_api::retry::{is_retryable_http_error, retry_delay_ms};
use openrouter_api::{
    normalize_chat_completions_url, OpenRouterClient, OpenRouterConfig, OpenRouterError,
};
use std::time::Duration;

#[test]
fn headers_require_api_key() {
    let error = build_headers(&OpenRouterConfig::new("   ")).expect_err("blank key must fail");
    assert!(matches!(error, OpenRouterError::MissingApiKey));
}

#[test]
fn headers_include_bearer_and_attribution() {
    let config = OpenRouterConfig::new(" sk-or-1 ")
        .with_referer("https://example.org")
        .with_app_title("viewer")
        .insert_header("X-Custom", " v ");

    let headers = build_headers(&config).expect("headers");

    assert_eq!(headers["authorization"], "Bearer sk-or-1");
    assert_eq!(headers["accept"], "text/event-stream");
    assert_eq!(headers["HTTP-Referer"], "https://example.org");
    assert_eq!(headers["X-Title"], "viewer");
    assert_eq!(headers["x-custom"], "v");
    assert!(headers["User-Agent"].starts_with("mol-agent/"));
}

#[test]
fn client_request_targets_normalized_endpoint() {
    let client = OpenRouterClient::new(
        OpenRouterConfig::new("key").with_base_url("https://openrouter.ai/api/"),
    )
    .expect("client");
    let request = openrouter_api::ChatCompletionRequest::new(
        "m",
        vec![serde_json::json!({"role": "user", "content": "hi"})],
    );

    let built = client
        .build_request(&request)
        .expect("build request")
        .build()
        .expect("request");

    assert_eq!(built.url().as_str(), "https://openrouter.ai/api/v1/chat/completions");
    assert_eq!(built.method(), "POST");
}

#[test]
fn url_normalization_rules() {
    assert_eq!(
        normalize_chat_completions_url(""),
        "https://openrouter.ai/api/v1/chat/completions"
    );
    assert_eq!(
        normalize_chat_completions_url("http://127.0.0.1:9/v1/chat/completions/"),
        "http://127.0.0.1:9/v1/chat/completions"
    );
    assert_eq!(
        normalize_chat_completions_url("http://localhost:8080"),
        "http://localhost:8080/chat/completions"
    );
}

#[test]
fn retry_policy_and_backoff() {
    assert!(is_retryable_http_error(429, ""));
    assert!(is_retryable_http_error(400, "Upstream connect error"));
    assert!(!is_retryable_http_error(401, "invalid api key"));
    assert_eq!(retry_delay_ms(0), Duration::from_millis(1000));
    assert_eq!(retry_delay_ms(2), Duration::from_millis(4000));
}
