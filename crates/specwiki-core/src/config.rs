//! Pipeline configuration.
//!
//! One nested mapping configures every run. Each component reads its own
//! namespace through a typed struct; unknown keys are rejected at the
//! component boundary but preserved when loading a previously stored
//! snapshot, so old runs keep deserializing after the schema grows.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CoreError, Result};

/// Full effective configuration for a run.
///
/// The serialized form of this struct is what gets snapshotted onto the run
/// record; [`PipelineConfig::content_hash`] over that form drives stage-level
/// cache invalidation.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    pub defaults: DefaultsConfig,
    pub indexing: IndexingConfig,
    pub query: QueryConfig,
    pub wiki: WikiConfig,
    pub checklist: ChecklistConfig,
    pub orchestrator: OrchestratorConfig,
    pub timeouts: TimeoutConfig,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl PipelineConfig {
    /// Parse a config mapping, rejecting unrecognized keys.
    ///
    /// Use this at the component boundary (new runs). Loading a stored
    /// snapshot goes through [`PipelineConfig::from_snapshot`] instead.
    pub fn from_value_strict(value: Value) -> Result<Self> {
        let config: PipelineConfig = serde_json::from_value(value)?;
        let unknown = config.unknown_keys();
        if !unknown.is_empty() {
            return Err(CoreError::Config(format!(
                "unrecognized config keys: {}",
                unknown.join(", ")
            )));
        }
        Ok(config)
    }

    /// Parse a stored config snapshot, preserving unknown keys.
    pub fn from_snapshot(value: Value) -> Result<Self> {
        Ok(serde_json::from_value(value)?)
    }

    /// Serialize for snapshot storage (unknown keys round-trip).
    pub fn snapshot(&self) -> Value {
        serde_json::to_value(self).expect("config serializes")
    }

    /// Stable hash of the effective configuration.
    ///
    /// serde_json maps are ordered, so equal configs hash equally.
    pub fn content_hash(&self) -> String {
        let encoded = serde_json::to_string(self).expect("config serializes");
        blake3::hash(encoded.as_bytes()).to_hex().to_string()
    }

    fn unknown_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.extra.keys().cloned().collect();
        keys.extend(self.indexing.extra.keys().map(|k| format!("indexing.{k}")));
        keys.extend(
            self.indexing
                .partition
                .extra
                .keys()
                .map(|k| format!("indexing.partition.{k}")),
        );
        keys.extend(
            self.indexing
                .enrichment
                .extra
                .keys()
                .map(|k| format!("indexing.enrichment.{k}")),
        );
        keys.extend(
            self.indexing
                .chunking
                .extra
                .keys()
                .map(|k| format!("indexing.chunking.{k}")),
        );
        keys.extend(
            self.indexing
                .embedding
                .extra
                .keys()
                .map(|k| format!("indexing.embedding.{k}")),
        );
        keys.extend(self.query.extra.keys().map(|k| format!("query.{k}")));
        keys.extend(
            self.query
                .retrieval
                .extra
                .keys()
                .map(|k| format!("query.retrieval.{k}")),
        );
        keys.extend(self.wiki.extra.keys().map(|k| format!("wiki.{k}")));
        keys.extend(
            self.wiki
                .generation
                .extra
                .keys()
                .map(|k| format!("wiki.generation.{k}")),
        );
        keys.extend(
            self.wiki
                .semantic_clusters
                .extra
                .keys()
                .map(|k| format!("wiki.semantic_clusters.{k}")),
        );
        keys.extend(self.checklist.extra.keys().map(|k| format!("checklist.{k}")));
        keys.extend(
            self.orchestrator
                .extra
                .keys()
                .map(|k| format!("orchestrator.{k}")),
        );
        keys.extend(self.timeouts.extra.keys().map(|k| format!("timeouts.{k}")));
        keys
    }

    /// Language the pipelines write their output in
    pub fn language(&self) -> &str {
        &self.defaults.language
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DefaultsConfig {
    /// Output language everywhere ("danish" or "english")
    pub language: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            language: "danish".to_string(),
            extra: Default::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct IndexingConfig {
    pub partition: PartitionConfig,
    pub enrichment: EnrichmentConfig,
    pub chunking: ChunkingConfig,
    pub embedding: EmbeddingConfig,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// OCR / partition fidelity mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OcrStrategy {
    #[default]
    Auto,
    Fast,
    HiRes,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PartitionConfig {
    pub ocr_strategy: OcrStrategy,
    pub extract_tables: bool,
    pub extract_images: bool,
    /// Minimum raster area (width * height in pixels) for an embedded image
    /// to count as meaningful during page analysis
    pub min_image_area: u64,
    /// Minimum vector path count for a page to count as drawing-heavy
    pub min_drawing_count: usize,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self {
            ocr_strategy: OcrStrategy::Auto,
            extract_tables: true,
            extract_images: true,
            min_image_area: 10_000,
            min_drawing_count: 50,
            extra: Default::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EnrichmentConfig {
    /// VLM model id passed to the caption service
    pub vlm_model: String,
    /// Language captions are written in; falls back to `defaults.language`
    pub caption_language: Option<String>,
    /// Character budget for surrounding text context in caption prompts
    pub max_text_context_length: usize,
    /// At most this many text snippets from the page feed the prompt
    pub max_page_text_elements: usize,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            vlm_model: "google/gemini-2.0-flash-001".to_string(),
            caption_language: None,
            max_text_context_length: 2000,
            max_page_text_elements: 10,
            extra: Default::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStrategy {
    #[default]
    ElementBased,
    Semantic,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ChunkingConfig {
    pub strategy: ChunkStrategy,
    /// Merge target: adjacent candidates under this length are merged forward
    pub min_chunk_size: usize,
    /// Split ceiling: candidates over this length are split semantically
    pub max_chunk_size: usize,
    /// Character overlap between adjacent sub-chunks of a split
    pub overlap: usize,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            strategy: ChunkStrategy::ElementBased,
            min_chunk_size: 200,
            max_chunk_size: 1000,
            overlap: 100,
            extra: Default::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub model: String,
    pub dimensions: usize,
    pub batch_size: usize,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model: "voyage-multilingual-2".to_string(),
            dimensions: 1024,
            batch_size: 32,
            extra: Default::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QueryConfig {
    pub retrieval: RetrievalConfig,
    /// Chat model that synthesizes answers from retrieved chunks
    pub model: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            retrieval: RetrievalConfig::default(),
            model: "google/gemini-2.0-flash-001".to_string(),
            extra: Default::default(),
        }
    }
}

/// 4-band similarity thresholds for one language
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Thresholds {
    pub excellent: f32,
    pub good: f32,
    pub acceptable: f32,
    pub minimum: f32,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            excellent: 0.75,
            good: 0.60,
            acceptable: 0.40,
            minimum: 0.25,
        }
    }
}

impl Thresholds {
    /// Danish-tuned thresholds (multilingual embeddings score lower on Danish)
    pub fn danish() -> Self {
        Self {
            excellent: 0.70,
            good: 0.55,
            acceptable: 0.35,
            minimum: 0.20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetrievalConfig {
    pub embedding_model: String,
    pub dimensions: usize,
    pub top_k: usize,
    pub similarity_thresholds: Thresholds,
    pub danish_thresholds: Thresholds,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            embedding_model: "voyage-multilingual-2".to_string(),
            dimensions: 1024,
            top_k: 5,
            similarity_thresholds: Thresholds::default(),
            danish_thresholds: Thresholds::danish(),
            extra: Default::default(),
        }
    }
}

impl RetrievalConfig {
    pub fn thresholds_for_language(&self, language: &str) -> Thresholds {
        if language.eq_ignore_ascii_case("danish") {
            self.danish_thresholds
        } else {
            self.similarity_thresholds
        }
    }

    pub fn minimum_threshold(&self, language: &str) -> f32 {
        self.thresholds_for_language(language).minimum
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WikiConfig {
    /// Count of overview queries generated for the Overview stage
    pub overview_query_count: usize,
    /// Chat model driving overview, naming, structure and markdown stages
    pub model: String,
    pub generation: WikiGenerationConfig,
    pub semantic_clusters: ClusteringConfig,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl Default for WikiConfig {
    fn default() -> Self {
        Self {
            overview_query_count: 12,
            model: "google/gemini-2.0-flash-001".to_string(),
            generation: WikiGenerationConfig::default(),
            semantic_clusters: ClusteringConfig::default(),
            extra: Default::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WikiGenerationConfig {
    pub max_pages: usize,
    pub queries_per_page: usize,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl Default for WikiGenerationConfig {
    fn default() -> Self {
        Self {
            max_pages: 8,
            queries_per_page: 4,
            extra: Default::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClusteringConfig {
    /// Semantic clustering runs by default; disable to hand Structure
    /// Generation an empty cluster summary list
    pub enabled: bool,
    pub min_clusters: usize,
    pub max_clusters: usize,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl Default for ClusteringConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_clusters: 4,
            max_clusters: 10,
            extra: Default::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ChecklistConfig {
    /// Chat model driving all three checklist LLM stages
    pub model: String,
    /// Cap on retrieved chunks handed to the analysis prompt
    pub max_analysis_chunks: usize,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl Default for ChecklistConfig {
    fn default() -> Self {
        Self {
            model: "openai/gpt-4o-mini".to_string(),
            max_analysis_chunks: 50,
            extra: Default::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Concurrent per-document pipelines
    pub parallelism: usize,
    /// Concurrent embedding batches inside the Embedding stage
    pub batch_concurrency: usize,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            parallelism: 4,
            batch_concurrency: 4,
            extra: Default::default(),
        }
    }
}

/// Per-service RPC timeouts in seconds
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TimeoutConfig {
    pub partition_secs: u64,
    pub vlm_secs: u64,
    pub embed_secs: u64,
    pub chat_secs: u64,
    pub datastore_secs: u64,
    pub objectstore_secs: u64,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            partition_secs: 600,
            vlm_secs: 60,
            embed_secs: 30,
            chat_secs: 60,
            datastore_secs: 10,
            objectstore_secs: 30,
            extra: Default::default(),
        }
    }
}

impl TimeoutConfig {
    pub fn partition(&self) -> Duration {
        Duration::from_secs(self.partition_secs)
    }
    pub fn vlm(&self) -> Duration {
        Duration::from_secs(self.vlm_secs)
    }
    pub fn embed(&self) -> Duration {
        Duration::from_secs(self.embed_secs)
    }
    pub fn chat(&self) -> Duration {
        Duration::from_secs(self.chat_secs)
    }
    pub fn datastore(&self) -> Duration {
        Duration::from_secs(self.datastore_secs)
    }
    pub fn objectstore(&self) -> Duration {
        Duration::from_secs(self.objectstore_secs)
    }
}
