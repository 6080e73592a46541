//! Text embedding adapter.
//!
//! Production implementation targets a Voyage-compatible `/embeddings`
//! endpoint. Output dimension is validated on every call; a mismatch is a
//! malformed-response error, never silently stored.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};

use super::chat::map_status;
use crate::error::{CoreError, Result};

pub const DEFAULT_VOYAGE_URL: &str = "https://api.voyageai.com/v1";

/// Narrow embedding interface; idempotent.
#[async_trait]
pub trait EmbeddingClient: Send + Sync {
    /// Embed a batch of texts, one vector per input in order.
    async fn embed(&self, texts: &[String], model: &str) -> Result<Vec<Vec<f32>>>;

    /// Expected output dimension D
    fn dimensions(&self) -> usize;
}

/// Voyage-compatible embedding client
pub struct VoyageEmbeddingClient {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    dimensions: usize,
}

impl VoyageEmbeddingClient {
    pub fn new(api_key: &str, dimensions: usize) -> Self {
        Self::with_base_url(api_key, DEFAULT_VOYAGE_URL, dimensions)
    }

    pub fn with_base_url(api_key: &str, base_url: &str, dimensions: usize) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            dimensions,
        }
    }
}

#[async_trait]
impl EmbeddingClient for VoyageEmbeddingClient {
    async fn embed(&self, texts: &[String], model: &str) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", self.api_key))
                .map_err(|_| CoreError::Config("invalid embedding API key".into()))?,
        );

        let request = EmbedRequest {
            model,
            input: texts,
        };

        let response = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .headers(headers)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(map_status(status, &body, "embedding"));
        }

        let parsed: EmbedResponse = response.json().await.map_err(|e| {
            CoreError::UpstreamMalformedResponse(format!("embedding response decode failed: {e}"))
        })?;

        if parsed.data.len() != texts.len() {
            return Err(CoreError::UpstreamMalformedResponse(format!(
                "embedding count mismatch: sent {}, got {}",
                texts.len(),
                parsed.data.len()
            )));
        }

        let mut rows = parsed.data;
        rows.sort_by_key(|d| d.index);

        let mut vectors = Vec::with_capacity(rows.len());
        for row in rows {
            if row.embedding.len() != self.dimensions {
                return Err(CoreError::UpstreamMalformedResponse(format!(
                    "embedding dimension mismatch: expected {}, got {}",
                    self.dimensions,
                    row.embedding.len()
                )));
            }
            vectors.push(row.embedding);
        }
        Ok(vectors)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    data: Vec<EmbedRow>,
}

#[derive(Debug, Deserialize)]
struct EmbedRow {
    index: usize,
    embedding: Vec<f32>,
}

/// Deterministic embedder for tests.
///
/// Known texts can be pinned to explicit vectors; everything else gets a
/// unit vector derived from its content hash, so equal text always embeds
/// equally.
pub struct MockEmbeddingClient {
    dimensions: usize,
    pinned: Mutex<HashMap<String, Vec<f32>>>,
    /// Fail the next N calls with `UpstreamUnavailable`
    fail_next: Mutex<usize>,
}

impl MockEmbeddingClient {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions,
            pinned: Mutex::new(HashMap::new()),
            fail_next: Mutex::new(0),
        }
    }

    /// Pin a text to an explicit vector (padded/normalized to D).
    pub fn pin(&self, text: impl Into<String>, vector: Vec<f32>) {
        let mut padded = vector;
        padded.resize(self.dimensions, 0.0);
        self.pinned.lock().unwrap().insert(text.into(), padded);
    }

    pub fn fail_next_calls(&self, n: usize) {
        *self.fail_next.lock().unwrap() = n;
    }

    fn hash_vector(&self, text: &str) -> Vec<f32> {
        let hash = blake3::hash(text.as_bytes());
        let bytes = hash.as_bytes();
        let mut v: Vec<f32> = (0..self.dimensions)
            .map(|i| {
                let b = bytes[i % bytes.len()];
                (b as f32 / 255.0) - 0.5 + (i as f32 * 1e-3)
            })
            .collect();
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut v {
                *x /= norm;
            }
        }
        v
    }
}

#[async_trait]
impl EmbeddingClient for MockEmbeddingClient {
    async fn embed(&self, texts: &[String], _model: &str) -> Result<Vec<Vec<f32>>> {
        {
            let mut fail = self.fail_next.lock().unwrap();
            if *fail > 0 {
                *fail -= 1;
                return Err(CoreError::UpstreamUnavailable(
                    "mock embedding failure".into(),
                ));
            }
        }
        let pinned = self.pinned.lock().unwrap();
        Ok(texts
            .iter()
            .map(|t| pinned.get(t).cloned().unwrap_or_else(|| self.hash_vector(t)))
            .collect())
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_is_deterministic() {
        let client = MockEmbeddingClient::new(8);
        let a = client.embed(&["hello".into()], "m").await.unwrap();
        let b = client.embed(&["hello".into()], "m").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a[0].len(), 8);
    }

    #[tokio::test]
    async fn pinned_vectors_take_precedence() {
        let client = MockEmbeddingClient::new(4);
        client.pin("query", vec![1.0, 0.0, 0.0, 0.0]);
        let v = client.embed(&["query".into()], "m").await.unwrap();
        assert_eq!(v[0], vec![1.0, 0.0, 0.0, 0.0]);
    }

    #[tokio::test]
    async fn scripted_failures_then_recovery() {
        let client = MockEmbeddingClient::new(4);
        client.fail_next_calls(2);
        assert!(client.embed(&["a".into()], "m").await.is_err());
        assert!(client.embed(&["a".into()], "m").await.is_err());
        assert!(client.embed(&["a".into()], "m").await.is_ok());
    }
}
