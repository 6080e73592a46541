//! Chat LLM adapter.
//!
//! The production implementation talks to an OpenRouter-compatible
//! `/chat/completions` endpoint with reqwest; tests use [`MockChatClient`]
//! with scripted responses.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Mutex;

use crate::error::{CoreError, Result};

pub const DEFAULT_OPENROUTER_URL: &str = "https://openrouter.ai/api/v1";

/// Options for a single chat call
#[derive(Debug, Clone)]
pub struct ChatOptions {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub response_format: Option<ResponseFormat>,
}

impl ChatOptions {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            max_tokens: 4000,
            temperature: 0.1,
            response_format: None,
        }
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_json_schema(mut self, name: impl Into<String>, schema: Value) -> Self {
        self.response_format = Some(ResponseFormat::JsonSchema {
            name: name.into(),
            schema,
        });
        self
    }
}

/// Structured-output request modes
#[derive(Debug, Clone)]
pub enum ResponseFormat {
    JsonObject,
    JsonSchema { name: String, schema: Value },
}

/// Narrow chat interface; not idempotent, retries permitted with identical
/// parameters.
#[async_trait]
pub trait ChatClient: Send + Sync {
    async fn chat(&self, prompt: &str, options: &ChatOptions) -> Result<String>;
}

/// OpenRouter-compatible chat client
pub struct OpenRouterChatClient {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl OpenRouterChatClient {
    pub fn new(api_key: &str) -> Self {
        Self::with_base_url(api_key, DEFAULT_OPENROUTER_URL)
    }

    pub fn with_base_url(api_key: &str, base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", self.api_key))
                .map_err(|_| CoreError::Config("invalid chat API key".into()))?,
        );
        Ok(headers)
    }
}

#[async_trait]
impl ChatClient for OpenRouterChatClient {
    async fn chat(&self, prompt: &str, options: &ChatOptions) -> Result<String> {
        let response_format = options.response_format.as_ref().map(|f| match f {
            ResponseFormat::JsonObject => serde_json::json!({ "type": "json_object" }),
            ResponseFormat::JsonSchema { name, schema } => serde_json::json!({
                "type": "json_schema",
                "json_schema": { "name": name, "strict": true, "schema": schema }
            }),
        });

        let request = ChatRequest {
            model: &options.model,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
            max_tokens: options.max_tokens,
            temperature: options.temperature,
            response_format,
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .headers(self.headers()?)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(map_status(status, &body, "chat"));
        }

        let parsed: ChatResponse = response.json().await.map_err(|e| {
            CoreError::UpstreamMalformedResponse(format!("chat response decode failed: {e}"))
        })?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .filter(|c| !c.is_empty())
            .ok_or_else(|| {
                CoreError::UpstreamMalformedResponse("chat response had no choices".into())
            })?;

        tracing::debug!(
            model = %options.model,
            response_len = content.len(),
            "Chat completion received"
        );
        Ok(content)
    }
}

/// Map an HTTP error status onto the typed error kinds.
pub(crate) fn map_status(status: reqwest::StatusCode, body: &str, service: &str) -> CoreError {
    let detail = format!("{service} returned {status}: {}", truncate(body, 300));
    if status.as_u16() == 429 {
        CoreError::UpstreamRateLimited(detail)
    } else if status.as_u16() == 401 || status.as_u16() == 403 {
        CoreError::PermissionDenied(detail)
    } else if status.is_server_error() {
        CoreError::UpstreamUnavailable(detail)
    } else {
        CoreError::UpstreamMalformedResponse(detail)
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<Value>,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: String,
}

/// Rate-limited, retried, timeout-guarded chat execution.
///
/// Pipelines hold one of these per run instead of wiring the bucket,
/// retry and timeout at every call site.
pub struct ChatRunner<'a> {
    pub client: &'a dyn ChatClient,
    pub bucket: &'a super::rate_limit::TokenBucket,
    pub timeout: std::time::Duration,
    pub model: String,
}

impl ChatRunner<'_> {
    pub async fn run(&self, prompt: &str, max_tokens: u32) -> Result<String> {
        let options = ChatOptions::new(self.model.clone()).with_max_tokens(max_tokens);
        self.run_with_options(prompt, &options).await
    }

    pub async fn run_with_options(&self, prompt: &str, options: &ChatOptions) -> Result<String> {
        self.bucket.acquire().await;
        super::with_retry("chat", || {
            super::with_timeout("chat", self.timeout, self.client.chat(prompt, options))
        })
        .await
    }
}

/// Scripted chat client for tests.
///
/// Replies are consumed front-to-back; when the queue runs dry the default
/// response is returned. `Err` entries surface as `UpstreamUnavailable`.
pub struct MockChatClient {
    replies: Mutex<VecDeque<std::result::Result<String, String>>>,
    default_response: String,
    pub prompts: Mutex<Vec<String>>,
}

impl MockChatClient {
    pub fn new() -> Self {
        Self {
            replies: Mutex::new(VecDeque::new()),
            default_response: "mock response".to_string(),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn with_responses<I, S>(responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let client = Self::new();
        {
            let mut replies = client.replies.lock().unwrap();
            for r in responses {
                replies.push_back(Ok(r.into()));
            }
        }
        client
    }

    pub fn with_default_response(mut self, response: impl Into<String>) -> Self {
        self.default_response = response.into();
        self
    }

    pub fn push_response(&self, response: impl Into<String>) {
        self.replies.lock().unwrap().push_back(Ok(response.into()));
    }

    pub fn push_failure(&self, message: impl Into<String>) {
        self.replies.lock().unwrap().push_back(Err(message.into()));
    }

    pub fn call_count(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }
}

impl Default for MockChatClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChatClient for MockChatClient {
    async fn chat(&self, prompt: &str, _options: &ChatOptions) -> Result<String> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        match self.replies.lock().unwrap().pop_front() {
            Some(Ok(reply)) => Ok(reply),
            Some(Err(message)) => Err(CoreError::UpstreamUnavailable(message)),
            None => Ok(self.default_response.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_replays_scripted_responses() {
        let client = MockChatClient::with_responses(["first", "second"]);
        let options = ChatOptions::new("test-model");
        assert_eq!(client.chat("a", &options).await.unwrap(), "first");
        assert_eq!(client.chat("b", &options).await.unwrap(), "second");
        assert_eq!(client.chat("c", &options).await.unwrap(), "mock response");
        assert_eq!(client.call_count(), 3);
    }

    #[tokio::test]
    async fn mock_failure_surfaces_as_unavailable() {
        let client = MockChatClient::new();
        client.push_failure("down for maintenance");
        let err = client
            .chat("x", &ChatOptions::new("test-model"))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::UpstreamUnavailable(_)));
    }

    #[test]
    fn status_mapping() {
        use reqwest::StatusCode;
        assert!(matches!(
            map_status(StatusCode::TOO_MANY_REQUESTS, "", "chat"),
            CoreError::UpstreamRateLimited(_)
        ));
        assert!(matches!(
            map_status(StatusCode::SERVICE_UNAVAILABLE, "", "chat"),
            CoreError::UpstreamUnavailable(_)
        ));
        assert!(matches!(
            map_status(StatusCode::UNAUTHORIZED, "", "chat"),
            CoreError::PermissionDenied(_)
        ));
        assert!(matches!(
            map_status(StatusCode::BAD_REQUEST, "", "chat"),
            CoreError::UpstreamMalformedResponse(_)
        ));
    }
}
