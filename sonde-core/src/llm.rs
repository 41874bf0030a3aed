//! LLM gateway abstraction and adapters.
//!
//! Defines the `LlmGateway` trait for model-agnostic one-shot generation,
//! helpers layered on top of it (transient-error retry with exponential
//! backoff, parse-or-reformulate for structured output), and two adapters:
//! an OpenAI-compatible HTTP gateway (OpenAI, Azure, Ollama, vLLM,
//! LM Studio) and a queued mock for tests.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, info};

use crate::budget::BudgetManager;
use crate::config::LlmConfig;
use crate::error::LlmError;
use crate::types::TokenUsage;

/// A one-shot generation request: system framing plus a single prompt.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub system: String,
    pub prompt: String,
    pub temperature: f32,
    pub max_tokens: Option<usize>,
}

impl GenerationRequest {
    pub fn new(system: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            prompt: prompt.into(),
            temperature: 0.3,
            max_tokens: None,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

/// The gateway's answer to a generation request.
#[derive(Debug, Clone)]
pub struct GenerationResponse {
    pub text: String,
    pub usage: TokenUsage,
    pub model: String,
}

/// Trait for LLM gateways.
#[async_trait]
pub trait LlmGateway: Send + Sync {
    /// Perform a full generation and return the response.
    async fn generate(&self, request: GenerationRequest) -> Result<GenerationResponse, LlmError>;

    /// Estimate the token count for a piece of text.
    fn estimate_tokens(&self, text: &str) -> usize;

    /// Return the context window size for this gateway/model.
    fn context_window(&self) -> usize;

    /// Return the model name.
    fn model_name(&self) -> &str;
}

/// Send a generation request with retry logic and exponential backoff.
///
/// Retries on transient errors (RateLimited, Timeout, Connection) up to
/// `max_retries` times with exponential backoff (1s, 2s, 4s, ..., capped
/// at 32s). Rate limits honor the provider's retry-after when it exceeds
/// the backoff. Non-transient errors are returned immediately.
pub async fn generate_with_retry(
    gateway: &dyn LlmGateway,
    request: GenerationRequest,
    max_retries: u32,
) -> Result<GenerationResponse, LlmError> {
    let mut last_error = None;

    for attempt in 0..=max_retries {
        match gateway.generate(request.clone()).await {
            Ok(response) => return Ok(response),
            Err(e) if e.is_retryable() => {
                if attempt < max_retries {
                    let backoff_secs = std::cmp::min(1u64 << attempt, 32);
                    let wait = match &e {
                        LlmError::RateLimited { retry_after_secs } => {
                            std::cmp::max(*retry_after_secs, backoff_secs)
                        }
                        _ => backoff_secs,
                    };
                    info!(
                        attempt = attempt + 1,
                        max_retries,
                        backoff_secs = wait,
                        error = %e,
                        "Retrying after transient error"
                    );
                    tokio::time::sleep(Duration::from_secs(wait)).await;
                    last_error = Some(e);
                } else {
                    return Err(e);
                }
            }
            Err(e) => return Err(e),
        }
    }

    Err(last_error.unwrap_or(LlmError::Connection {
        message: "Max retries exceeded".to_string(),
    }))
}

/// Generate a structured response and parse it with `parse`.
///
/// A response that fails to parse gets one stricter follow-up request
/// before the caller's deterministic fallback applies: `Ok(Some(_))` is a
/// parsed value, `Ok(None)` means both attempts were unusable. Transport
/// errors from the first call are returned to the caller; a transport
/// error on the follow-up reads as unusable. Usage from both calls is
/// recorded against `budget`.
pub async fn generate_parsed<T, F>(
    gateway: &dyn LlmGateway,
    request: GenerationRequest,
    max_retries: u32,
    budget: &BudgetManager,
    parse: F,
) -> Result<Option<T>, LlmError>
where
    F: Fn(&str) -> Option<T>,
{
    let response = generate_with_retry(gateway, request.clone(), max_retries).await?;
    budget.record_usage(response.usage);
    if let Some(parsed) = parse(&response.text) {
        return Ok(Some(parsed));
    }

    let mut reformulated = request;
    reformulated.prompt.push_str(
        "\n\nYour previous reply could not be parsed. Reply with only the \
         requested JSON object, with no prose and no code fences.",
    );
    match generate_with_retry(gateway, reformulated, max_retries).await {
        Ok(response) => {
            budget.record_usage(response.usage);
            Ok(parse(&response.text))
        }
        Err(e) => {
            debug!(error = %e, "Reformulation request failed");
            Ok(None)
        }
    }
}

/// Token counter using tiktoken-rs for accurate BPE tokenization.
pub struct TokenCounter {
    bpe: tiktoken_rs::CoreBPE,
}

impl TokenCounter {
    /// Create a token counter for the given model.
    /// Falls back to cl100k_base if the model isn't recognized.
    pub fn for_model(model: &str) -> Self {
        let bpe = tiktoken_rs::get_bpe_from_model(model).unwrap_or_else(|_| {
            tiktoken_rs::cl100k_base().expect("cl100k_base should be available")
        });
        Self { bpe }
    }

    /// Count the number of tokens in a string.
    pub fn count(&self, text: &str) -> usize {
        self.bpe.encode_with_special_tokens(text).len()
    }
}

// ---------------------------------------------------------------------------
// OpenAI-compatible gateway
// ---------------------------------------------------------------------------

/// OpenAI-compatible LLM gateway.
///
/// Works against any endpoint that follows the OpenAI chat completions
/// API format.
pub struct OpenAiCompatGateway {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    context_window: usize,
    default_max_tokens: usize,
    timeout_secs: u64,
    token_counter: TokenCounter,
}

impl OpenAiCompatGateway {
    /// Create a new gateway from configuration.
    ///
    /// Reads the API key from the environment variable named in
    /// `config.api_key_env`. Local endpoints (Ollama, vLLM, LM Studio)
    /// get a dummy bearer token when no key is set.
    pub fn new(config: &LlmConfig) -> Result<Self, LlmError> {
        let is_local = config
            .base_url
            .as_ref()
            .map(|u| u.contains("localhost") || u.contains("127.0.0.1"))
            .unwrap_or(false);

        let api_key = std::env::var(&config.api_key_env)
            .ok()
            .or_else(|| {
                if is_local {
                    debug!("No API key set for local provider; using dummy bearer token");
                    Some("ollama".to_string())
                } else {
                    None
                }
            })
            .ok_or_else(|| LlmError::AuthFailed {
                provider: format!("OpenAI-compatible: env var '{}' not set", config.api_key_env),
            })?;

        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| "https://api.openai.com/v1".to_string());

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_else(|_| Client::new());

        Ok(Self {
            client,
            base_url,
            api_key,
            model: config.model.clone(),
            context_window: config.context_window,
            default_max_tokens: config.max_tokens,
            timeout_secs: config.timeout_secs,
            token_counter: TokenCounter::for_model(&config.model),
        })
    }

    /// Parse an OpenAI-format response body into a GenerationResponse.
    fn parse_response(body: &Value, model: &str) -> Result<GenerationResponse, LlmError> {
        let choice =
            body.get("choices")
                .and_then(|c| c.get(0))
                .ok_or_else(|| LlmError::ResponseParse {
                    message: "No choices in response".to_string(),
                })?;

        let text = choice
            .get("message")
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .ok_or_else(|| LlmError::ResponseParse {
                message: "No message content in choice".to_string(),
            })?
            .to_string();

        let usage_obj = body.get("usage");
        let usage = TokenUsage {
            input_tokens: usage_obj
                .and_then(|u| u.get("prompt_tokens"))
                .and_then(|t| t.as_u64())
                .unwrap_or(0),
            output_tokens: usage_obj
                .and_then(|u| u.get("completion_tokens"))
                .and_then(|t| t.as_u64())
                .unwrap_or(0),
        };

        let resp_model = body
            .get("model")
            .and_then(|m| m.as_str())
            .unwrap_or(model)
            .to_string();

        Ok(GenerationResponse {
            text,
            usage,
            model: resp_model,
        })
    }

    /// Map an HTTP status code to the appropriate LlmError.
    fn map_http_error(status: reqwest::StatusCode, body: &str) -> LlmError {
        match status.as_u16() {
            401 => {
                debug!(body = %body, "Authentication failed (401)");
                LlmError::AuthFailed {
                    provider: "OpenAI-compatible".to_string(),
                }
            }
            429 => {
                let retry_secs = serde_json::from_str::<Value>(body)
                    .ok()
                    .and_then(|v| {
                        v.get("error")?
                            .get("message")?
                            .as_str()
                            .map(|s| s.to_string())
                    })
                    .and_then(|msg| {
                        msg.split("in ")
                            .last()
                            .and_then(|s| s.trim_end_matches('s').parse::<u64>().ok())
                    })
                    .unwrap_or(5);
                LlmError::RateLimited {
                    retry_after_secs: retry_secs,
                }
            }
            status if status >= 500 => LlmError::ProviderDown {
                message: format!("Server error ({}): {}", status, body),
            },
            _ => LlmError::ApiRequest {
                message: format!("HTTP {}: {}", status, body),
            },
        }
    }
}

#[async_trait]
impl LlmGateway for OpenAiCompatGateway {
    async fn generate(&self, request: GenerationRequest) -> Result<GenerationResponse, LlmError> {
        let url = format!("{}/chat/completions", self.base_url);

        let body = json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": request.system },
                { "role": "user", "content": request.prompt },
            ],
            "temperature": request.temperature,
            "max_tokens": request.max_tokens.unwrap_or(self.default_max_tokens),
            "stream": false,
        });

        debug!(url = %url, model = %self.model, "Sending completion request");

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::Timeout {
                        timeout_secs: self.timeout_secs,
                    }
                } else if e.is_connect() {
                    LlmError::Connection {
                        message: format!("Connection failed: {}", e),
                    }
                } else {
                    LlmError::ApiRequest {
                        message: format!("Request failed: {}", e),
                    }
                }
            })?;

        let status = response.status();
        let response_body = response.text().await.map_err(|e| LlmError::ApiRequest {
            message: format!("Failed to read response body: {}", e),
        })?;

        if !status.is_success() {
            return Err(Self::map_http_error(status, &response_body));
        }

        let json: Value =
            serde_json::from_str(&response_body).map_err(|e| LlmError::ResponseParse {
                message: format!("Invalid JSON: {}", e),
            })?;

        Self::parse_response(&json, &self.model)
    }

    fn estimate_tokens(&self, text: &str) -> usize {
        self.token_counter.count(text)
    }

    fn context_window(&self) -> usize {
        self.context_window
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

// ---------------------------------------------------------------------------
// Mock gateway
// ---------------------------------------------------------------------------

/// A mock LLM gateway for testing and development.
///
/// Responses (and scripted errors) are queued and returned in order.
/// An empty queue yields a canned fallback response so incidental calls
/// never panic a test.
pub struct MockLlm {
    model: String,
    context_window: usize,
    queue: Mutex<VecDeque<Result<GenerationResponse, LlmError>>>,
    calls: AtomicUsize,
}

impl MockLlm {
    pub fn new() -> Self {
        Self {
            model: "mock-model".to_string(),
            context_window: 128_000,
            queue: Mutex::new(VecDeque::new()),
            calls: AtomicUsize::new(0),
        }
    }

    /// Create a MockLlm that always returns the given text.
    ///
    /// Queues multiple copies of the response so it can handle multiple
    /// calls.
    pub fn with_response(text: &str) -> Self {
        let gateway = Self::new();
        for _ in 0..20 {
            gateway.queue_response(Self::text_response(text));
        }
        gateway
    }

    /// Queue a response to be returned by the next `generate` call.
    pub fn queue_response(&self, response: GenerationResponse) {
        self.queue.lock().unwrap().push_back(Ok(response));
    }

    /// Queue a text response.
    pub fn queue_text(&self, text: &str) {
        self.queue_response(Self::text_response(text));
    }

    /// Queue an error to be returned by the next `generate` call.
    pub fn queue_error(&self, error: LlmError) {
        self.queue.lock().unwrap().push_back(Err(error));
    }

    /// Create a simple text response for testing.
    pub fn text_response(text: &str) -> GenerationResponse {
        GenerationResponse {
            text: text.to_string(),
            usage: TokenUsage {
                input_tokens: 100,
                output_tokens: 50,
            },
            model: "mock-model".to_string(),
        }
    }

    /// Number of `generate` calls received so far.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Default for MockLlm {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LlmGateway for MockLlm {
    async fn generate(&self, _request: GenerationRequest) -> Result<GenerationResponse, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut queue = self.queue.lock().unwrap();
        match queue.pop_front() {
            Some(result) => result,
            None => Ok(Self::text_response(
                "Mock gateway: no queued responses available.",
            )),
        }
    }

    fn estimate_tokens(&self, text: &str) -> usize {
        text.len() / 4
    }

    fn context_window(&self) -> usize {
        self.context_window
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::Budget;

    /// A gateway that fails N times before succeeding.
    struct FailingGateway {
        failures_remaining: Mutex<usize>,
        error_type: String,
    }

    impl FailingGateway {
        fn new(failures: usize, error_type: &str) -> Self {
            Self {
                failures_remaining: Mutex::new(failures),
                error_type: error_type.to_string(),
            }
        }
    }

    #[async_trait]
    impl LlmGateway for FailingGateway {
        async fn generate(
            &self,
            _request: GenerationRequest,
        ) -> Result<GenerationResponse, LlmError> {
            let mut remaining = self.failures_remaining.lock().unwrap();
            if *remaining > 0 {
                *remaining -= 1;
                match self.error_type.as_str() {
                    "rate_limited" => Err(LlmError::RateLimited {
                        retry_after_secs: 0,
                    }),
                    "timeout" => Err(LlmError::Timeout { timeout_secs: 5 }),
                    "connection" => Err(LlmError::Connection {
                        message: "connection reset".into(),
                    }),
                    _ => Err(LlmError::ApiRequest {
                        message: "non-retryable".into(),
                    }),
                }
            } else {
                Ok(MockLlm::text_response("Success after retry"))
            }
        }

        fn estimate_tokens(&self, _text: &str) -> usize {
            100
        }
        fn context_window(&self) -> usize {
            128_000
        }
        fn model_name(&self) -> &str {
            "failing-mock"
        }
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_failures() {
        let gateway = FailingGateway::new(2, "connection");
        let request = GenerationRequest::new("system", "prompt");

        let result = generate_with_retry(&gateway, request, 3).await;
        assert!(result.is_ok());
        assert_eq!(result.unwrap().text, "Success after retry");
    }

    #[tokio::test]
    async fn test_retry_exhausted() {
        let gateway = FailingGateway::new(5, "timeout");
        let request = GenerationRequest::new("system", "prompt");

        let result = generate_with_retry(&gateway, request, 1).await;
        assert!(result.is_err());
        assert!(matches!(result.unwrap_err(), LlmError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_retry_non_retryable_fails_immediately() {
        let gateway = FailingGateway::new(1, "non_retryable");
        let request = GenerationRequest::new("system", "prompt");

        let result = generate_with_retry(&gateway, request, 3).await;
        assert!(result.is_err());
        assert!(matches!(result.unwrap_err(), LlmError::ApiRequest { .. }));
    }

    #[tokio::test]
    async fn test_retry_rate_limited() {
        let gateway = FailingGateway::new(1, "rate_limited");
        let request = GenerationRequest::new("system", "prompt");

        let result = generate_with_retry(&gateway, request, 2).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_mock_queue_order() {
        let mock = MockLlm::new();
        mock.queue_text("first");
        mock.queue_text("second");

        let request = GenerationRequest::new("sys", "p");
        let first = mock.generate(request.clone()).await.unwrap();
        let second = mock.generate(request.clone()).await.unwrap();
        assert_eq!(first.text, "first");
        assert_eq!(second.text, "second");
        assert_eq!(mock.call_count(), 2);

        // Queue exhausted: fallback text, never a panic.
        let third = mock.generate(request).await.unwrap();
        assert!(third.text.contains("no queued responses"));
    }

    #[tokio::test]
    async fn test_mock_scripted_error() {
        let mock = MockLlm::new();
        mock.queue_error(LlmError::ProviderDown {
            message: "503".into(),
        });
        mock.queue_text("recovered");

        let request = GenerationRequest::new("sys", "p");
        let err = mock.generate(request.clone()).await.unwrap_err();
        assert!(matches!(err, LlmError::ProviderDown { .. }));
        let ok = mock.generate(request).await.unwrap();
        assert_eq!(ok.text, "recovered");
    }

    #[tokio::test]
    async fn test_generate_parsed_first_attempt() {
        let mock = MockLlm::new();
        mock.queue_text("{\"value\": 7}");
        let budget = BudgetManager::new(Budget::default());

        let request = GenerationRequest::new("sys", "p");
        let parsed = generate_parsed(&mock, request, 0, &budget, |text| {
            serde_json::from_str::<Value>(text).ok()
        })
        .await
        .unwrap();

        assert_eq!(parsed.unwrap()["value"], 7);
        assert_eq!(mock.call_count(), 1);
        assert_eq!(budget.tokens_consumed(), 150);
    }

    #[tokio::test]
    async fn test_generate_parsed_reformulates_once() {
        let mock = MockLlm::new();
        mock.queue_text("not json");
        mock.queue_text("{\"value\": 7}");
        let budget = BudgetManager::new(Budget::default());

        let request = GenerationRequest::new("sys", "p");
        let parsed = generate_parsed(&mock, request, 0, &budget, |text| {
            serde_json::from_str::<Value>(text).ok()
        })
        .await
        .unwrap();

        assert!(parsed.is_some());
        assert_eq!(mock.call_count(), 2);
        // Usage from both attempts lands on the budget.
        assert_eq!(budget.tokens_consumed(), 300);
    }

    #[tokio::test]
    async fn test_generate_parsed_gives_up_after_reformulation() {
        let mock = MockLlm::new();
        mock.queue_text("not json");
        mock.queue_text("still not json");
        let budget = BudgetManager::new(Budget::default());

        let request = GenerationRequest::new("sys", "p");
        let parsed = generate_parsed(&mock, request, 0, &budget, |text| {
            serde_json::from_str::<Value>(text).ok()
        })
        .await
        .unwrap();

        assert!(parsed.is_none());
        assert_eq!(mock.call_count(), 2);
    }

    #[tokio::test]
    async fn test_generate_parsed_surfaces_first_call_error() {
        let mock = MockLlm::new();
        mock.queue_error(LlmError::AuthFailed {
            provider: "mock".into(),
        });
        let budget = BudgetManager::new(Budget::default());

        let request = GenerationRequest::new("sys", "p");
        let err = generate_parsed(&mock, request, 0, &budget, |_| Some(()))
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::AuthFailed { .. }));
        assert_eq!(mock.call_count(), 1);
    }

    #[tokio::test]
    async fn test_generate_parsed_failed_reformulation_reads_unusable() {
        let mock = MockLlm::new();
        mock.queue_text("not json");
        mock.queue_error(LlmError::ProviderDown {
            message: "503".into(),
        });
        let budget = BudgetManager::new(Budget::default());

        let request = GenerationRequest::new("sys", "p");
        let parsed = generate_parsed(&mock, request, 0, &budget, |text| {
            serde_json::from_str::<Value>(text).ok()
        })
        .await
        .unwrap();

        assert!(parsed.is_none());
        assert_eq!(mock.call_count(), 2);
    }

    #[test]
    fn test_parse_response_extracts_text_and_usage() {
        let body = json!({
            "choices": [{
                "message": { "role": "assistant", "content": "hello" },
                "finish_reason": "stop"
            }],
            "usage": { "prompt_tokens": 12, "completion_tokens": 3 },
            "model": "gpt-4o-mini"
        });
        let response = OpenAiCompatGateway::parse_response(&body, "fallback-model").unwrap();
        assert_eq!(response.text, "hello");
        assert_eq!(response.usage.input_tokens, 12);
        assert_eq!(response.usage.output_tokens, 3);
        assert_eq!(response.model, "gpt-4o-mini");
    }

    #[test]
    fn test_parse_response_missing_choices() {
        let body = json!({ "usage": {} });
        let err = OpenAiCompatGateway::parse_response(&body, "m").unwrap_err();
        assert!(matches!(err, LlmError::ResponseParse { .. }));
    }

    #[test]
    fn test_map_http_error() {
        let err = OpenAiCompatGateway::map_http_error(reqwest::StatusCode::UNAUTHORIZED, "");
        assert!(matches!(err, LlmError::AuthFailed { .. }));

        let err = OpenAiCompatGateway::map_http_error(reqwest::StatusCode::TOO_MANY_REQUESTS, "{}");
        assert!(matches!(err, LlmError::RateLimited { .. }));

        let err =
            OpenAiCompatGateway::map_http_error(reqwest::StatusCode::INTERNAL_SERVER_ERROR, "boom");
        assert!(matches!(err, LlmError::ProviderDown { .. }));

        let err = OpenAiCompatGateway::map_http_error(reqwest::StatusCode::BAD_REQUEST, "nope");
        assert!(matches!(err, LlmError::ApiRequest { .. }));
    }

    #[test]
    fn test_token_counter_counts() {
        let counter = TokenCounter::for_model("gpt-4o-mini");
        assert_eq!(counter.count(""), 0);
        assert!(counter.count("hello world") > 0);
        assert!(counter.count("a longer sentence with several words") > counter.count("a"));
    }

    #[test]
    fn test_generation_request_builders() {
        let request = GenerationRequest::new("sys", "prompt")
            .with_temperature(0.9)
            .with_max_tokens(256);
        assert!((request.temperature - 0.9).abs() < f32::EPSILON);
        assert_eq!(request.max_tokens, Some(256));
    }
}
