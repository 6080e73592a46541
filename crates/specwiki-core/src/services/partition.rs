//! Remote PDF partitioner adapter.
//!
//! High-fidelity partitioning (element categories, table HTML and
//! coordinates) is delegated to an Unstructured-compatible service. The call
//! is idempotent per (content hash, config); the hash doubles as a cache key
//! for callers.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;

use super::chat::map_status;
use crate::config::{OcrStrategy, PartitionConfig};
use crate::error::{CoreError, Result};
use crate::models::Bbox;

/// One element as returned by the partitioner, before normalization
#[derive(Debug, Clone)]
pub struct RawElement {
    pub id: String,
    pub page: u32,
    pub text: String,
    /// Partitioner category string ("NarrativeText", "Table", "Title", ...)
    pub category: String,
    pub coordinates: Option<Bbox>,
    /// HTML representation, present on tables
    pub html: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct RawPartition {
    pub elements: Vec<RawElement>,
    pub page_count: u32,
}

/// Narrow partitioner interface; idempotent per (content hash, cfg).
#[async_trait]
pub trait PartitionClient: Send + Sync {
    async fn analyze(&self, pdf: Bytes, config: &PartitionConfig) -> Result<RawPartition>;
}

/// Unstructured-compatible partition service client
pub struct UnstructuredPartitionClient {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl UnstructuredPartitionClient {
    pub fn new(api_key: &str, base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn strategy_str(config: &PartitionConfig) -> &'static str {
        match config.ocr_strategy {
            OcrStrategy::Fast => "fast",
            OcrStrategy::Auto => "auto",
            OcrStrategy::HiRes => "hi_res",
        }
    }
}

#[async_trait]
impl PartitionClient for UnstructuredPartitionClient {
    async fn analyze(&self, pdf: Bytes, config: &PartitionConfig) -> Result<RawPartition> {
        let content_hash = blake3::hash(&pdf).to_hex().to_string();
        tracing::debug!(
            bytes = pdf.len(),
            content_hash = %content_hash,
            strategy = Self::strategy_str(config),
            "Partitioning PDF"
        );

        let file_part = Part::bytes(pdf.to_vec())
            .file_name("document.pdf")
            .mime_str("application/pdf")
            .map_err(|e| CoreError::InvalidInput(format!("bad mime type: {e}")))?;

        let mut form = Form::new()
            .part("files", file_part)
            .text("strategy", Self::strategy_str(config))
            .text("coordinates", "true");
        if config.extract_tables {
            form = form.text("skip_infer_table_types", "[]");
        }

        let response = self
            .client
            .post(format!("{}/general/v0/general", self.base_url))
            .header("unstructured-api-key", self.api_key.clone())
            .multipart(form)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(map_status(status, &body, "partition"));
        }

        let rows: Vec<UnstructuredElement> = response.json().await.map_err(|e| {
            CoreError::UpstreamMalformedResponse(format!("partition response decode failed: {e}"))
        })?;

        let mut page_count = 0;
        let elements = rows
            .into_iter()
            .map(|row| {
                let page = row.metadata.page_number.unwrap_or(1);
                page_count = page_count.max(page);
                RawElement {
                    id: row.element_id,
                    page,
                    text: row.text,
                    category: row.element_type,
                    coordinates: row.metadata.coordinates.and_then(|c| c.bbox()),
                    html: row.metadata.text_as_html,
                }
            })
            .collect();

        Ok(RawPartition {
            elements,
            page_count,
        })
    }
}

#[derive(Debug, Deserialize)]
struct UnstructuredElement {
    #[serde(default)]
    element_id: String,
    #[serde(rename = "type")]
    element_type: String,
    #[serde(default)]
    text: String,
    #[serde(default)]
    metadata: UnstructuredMetadata,
}

#[derive(Debug, Default, Deserialize)]
struct UnstructuredMetadata {
    page_number: Option<u32>,
    text_as_html: Option<String>,
    coordinates: Option<UnstructuredCoordinates>,
}

#[derive(Debug, Deserialize)]
struct UnstructuredCoordinates {
    #[serde(default)]
    points: Vec<(f32, f32)>,
}

impl UnstructuredCoordinates {
    /// Axis-aligned bounding box of the polygon points
    fn bbox(&self) -> Option<Bbox> {
        if self.points.is_empty() {
            return None;
        }
        let mut x0 = f32::MAX;
        let mut y0 = f32::MAX;
        let mut x1 = f32::MIN;
        let mut y1 = f32::MIN;
        for (x, y) in &self.points {
            x0 = x0.min(*x);
            y0 = y0.min(*y);
            x1 = x1.max(*x);
            y1 = y1.max(*y);
        }
        Some(Bbox { x0, y0, x1, y1 })
    }
}

/// Scripted partitioner for tests.
pub struct MockPartitionClient {
    results: Mutex<VecDeque<std::result::Result<RawPartition, String>>>,
    pub call_count: Mutex<usize>,
}

impl MockPartitionClient {
    pub fn new() -> Self {
        Self {
            results: Mutex::new(VecDeque::new()),
            call_count: Mutex::new(0),
        }
    }

    pub fn push_result(&self, partition: RawPartition) {
        self.results.lock().unwrap().push_back(Ok(partition));
    }

    pub fn push_failure(&self, message: impl Into<String>) {
        self.results.lock().unwrap().push_back(Err(message.into()));
    }
}

impl Default for MockPartitionClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PartitionClient for MockPartitionClient {
    async fn analyze(&self, _pdf: Bytes, _config: &PartitionConfig) -> Result<RawPartition> {
        *self.call_count.lock().unwrap() += 1;
        match self.results.lock().unwrap().pop_front() {
            Some(Ok(partition)) => Ok(partition),
            Some(Err(message)) => Err(CoreError::UpstreamUnavailable(message)),
            None => Ok(RawPartition::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn polygon_points_collapse_to_bbox() {
        let coords = UnstructuredCoordinates {
            points: vec![(10.0, 20.0), (110.0, 20.0), (110.0, 80.0), (10.0, 80.0)],
        };
        let bbox = coords.bbox().unwrap();
        assert_eq!(bbox.x0, 10.0);
        assert_eq!(bbox.y0, 20.0);
        assert_eq!(bbox.x1, 110.0);
        assert_eq!(bbox.y1, 80.0);
    }

    #[tokio::test]
    async fn mock_replays_and_counts() {
        let client = MockPartitionClient::new();
        client.push_result(RawPartition {
            elements: vec![RawElement {
                id: "e1".into(),
                page: 1,
                text: "hello".into(),
                category: "NarrativeText".into(),
                coordinates: None,
                html: None,
            }],
            page_count: 1,
        });
        let out = client
            .analyze(Bytes::from_static(b"%PDF"), &PartitionConfig::default())
            .await
            .unwrap();
        assert_eq!(out.elements.len(), 1);
        assert_eq!(*client.call_count.lock().unwrap(), 1);
    }
}
