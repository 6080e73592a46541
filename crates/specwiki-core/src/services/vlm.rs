//! Vision-language model adapter for captioning.
//!
//! Captions make visual regions searchable by text embedding. The
//! production implementation sends chat-completion requests with image
//! content parts (base64 data URLs) to an OpenRouter-compatible endpoint;
//! HTML inputs go as plain text.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::Deserialize;
use serde_json::json;

use super::chat::{map_status, DEFAULT_OPENROUTER_URL};
use crate::error::{CoreError, Result};

/// What gets captioned
#[derive(Debug, Clone)]
pub enum VlmInput {
    Image { bytes: Bytes, content_type: String },
    Html(String),
}

/// A caption with the time the model spent producing it
#[derive(Debug, Clone)]
pub struct Caption {
    pub caption: String,
    pub duration: Duration,
}

/// Narrow captioning interface; not idempotent, retries permitted.
#[async_trait]
pub trait VlmClient: Send + Sync {
    async fn caption(
        &self,
        input: &VlmInput,
        prompt: &str,
        language: &str,
        model: &str,
    ) -> Result<Caption>;
}

/// OpenRouter-compatible vision client
pub struct OpenRouterVlmClient {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl OpenRouterVlmClient {
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
}

#[async_trait]
impl VlmClient for OpenRouterVlmClient {
    async fn caption(
        &self,
        input: &VlmInput,
        prompt: &str,
        language: &str,
        model: &str,
    ) -> Result<Caption> {
        let full_prompt = format!("{prompt}\n\nWrite the caption in {language}.");

        let content = match input {
            VlmInput::Image {
                bytes,
                content_type,
            } => {
                let data_url = format!("data:{content_type};base64,{}", BASE64.encode(bytes));
                json!([
                    { "type": "text", "text": full_prompt },
                    { "type": "image_url", "image_url": { "url": data_url } }
                ])
            }
            VlmInput::Html(html) => {
                json!(format!("{full_prompt}\n\nHTML table:\n{html}"))
            }
        };

        let request = json!({
            "model": model,
            "messages": [{ "role": "user", "content": content }],
            "max_tokens": 2000,
            "temperature": 0.1,
        });

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", self.api_key))
                .map_err(|_| CoreError::Config("invalid VLM API key".into()))?,
        );

        let start = Instant::now();
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .headers(headers)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(map_status(status, &body, "vlm"));
        }

        let parsed: VlmResponse = response.json().await.map_err(|e| {
            CoreError::UpstreamMalformedResponse(format!("VLM response decode failed: {e}"))
        })?;

        let caption = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| {
                CoreError::UpstreamMalformedResponse("VLM response had no caption".into())
            })?;

        Ok(Caption {
            caption,
            duration: start.elapsed(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct VlmResponse {
    choices: Vec<VlmChoice>,
}

#[derive(Debug, Deserialize)]
struct VlmChoice {
    message: VlmMessage,
}

#[derive(Debug, Deserialize)]
struct VlmMessage {
    #[serde(default)]
    content: String,
}

/// Scripted VLM for tests; falls back to a canned caption per input kind.
pub struct MockVlmClient {
    replies: Mutex<VecDeque<std::result::Result<String, String>>>,
    pub calls: Mutex<Vec<String>>,
}

impl MockVlmClient {
    pub fn new() -> Self {
        Self {
            replies: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn push_caption(&self, caption: impl Into<String>) {
        self.replies.lock().unwrap().push_back(Ok(caption.into()));
    }

    pub fn push_failure(&self, message: impl Into<String>) {
        self.replies.lock().unwrap().push_back(Err(message.into()));
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

impl Default for MockVlmClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VlmClient for MockVlmClient {
    async fn caption(
        &self,
        input: &VlmInput,
        prompt: &str,
        _language: &str,
        _model: &str,
    ) -> Result<Caption> {
        let kind = match input {
            VlmInput::Image { .. } => "image",
            VlmInput::Html(_) => "html",
        };
        let prompt_head: String = prompt.chars().take(60).collect();
        self.calls.lock().unwrap().push(format!("{kind}: {prompt_head}"));

        match self.replies.lock().unwrap().pop_front() {
            Some(Ok(caption)) => Ok(Caption {
                caption,
                duration: Duration::from_millis(10),
            }),
            Some(Err(message)) => Err(CoreError::UpstreamUnavailable(message)),
            None => Ok(Caption {
                caption: format!("mock {kind} caption"),
                duration: Duration::from_millis(10),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_tracks_input_kind() {
        let client = MockVlmClient::new();
        let image = VlmInput::Image {
            bytes: Bytes::from_static(b"png"),
            content_type: "image/png".into(),
        };
        let caption = client.caption(&image, "Describe", "danish", "m").await.unwrap();
        assert_eq!(caption.caption, "mock image caption");

        let html = VlmInput::Html("<table></table>".into());
        let caption = client.caption(&html, "Describe", "danish", "m").await.unwrap();
        assert_eq!(caption.caption, "mock html caption");
        assert_eq!(client.call_count(), 2);
    }

    #[tokio::test]
    async fn scripted_failure() {
        let client = MockVlmClient::new();
        client.push_failure("vision model offline");
        let html = VlmInput::Html("<table/>".into());
        assert!(client.caption(&html, "p", "english", "m").await.is_err());
    }
}
