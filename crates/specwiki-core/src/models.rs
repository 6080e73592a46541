//! Core data model: runs, documents, elements, chunks, stage results.
//!
//! `StageData` is the tagged union persisted inside a `StageResult`; the
//! discriminator is the stage name, so every completed stage row carries a
//! payload that deserializes back into the right type.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Who may read artifacts derived from a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessLevel {
    Public,
    Auth,
    Private,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadKind {
    UserProject,
    Email,
}

/// Run lifecycle status, shared by indexing, wiki and checklist runs.
///
/// `CompletedWithWarnings` is a distinct persisted status: some documents
/// failed or some chunks could not be embedded, with the detail recorded in
/// the run's `error_message`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    CompletedWithWarnings,
    Failed,
}

impl RunStatus {
    /// Completed well enough for downstream pipelines to consume the corpus
    pub fn is_terminal_success(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::CompletedWithWarnings)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::CompletedWithWarnings => "completed_with_warnings",
            RunStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// One invocation of the indexing pipeline over a set of PDFs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexingRun {
    pub id: Uuid,
    pub access_level: AccessLevel,
    pub upload_kind: UploadKind,
    pub user_id: Option<Uuid>,
    pub project_id: Option<Uuid>,
    pub status: RunStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Full effective config used for this run
    pub config_snapshot: Value,
    pub error_message: Option<String>,
}

impl IndexingRun {
    pub fn new(access_level: AccessLevel, upload_kind: UploadKind, config_snapshot: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            access_level,
            upload_kind,
            user_id: None,
            project_id: None,
            status: RunStatus::Pending,
            started_at: None,
            completed_at: None,
            config_snapshot,
            error_message: None,
        }
    }
}

/// A source PDF; shared across runs via the run-document junction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: Uuid,
    pub filename: String,
    /// Object-store key of the source PDF
    pub blob_key: String,
    pub page_count: Option<u32>,
    pub byte_size: u64,
    pub owner_id: Option<Uuid>,
}

/// Normalized element categories out of partitioning
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ElementCategory {
    NarrativeText,
    Title,
    Table,
    ExtractedPage,
    ListItem,
    UncategorizedText,
}

impl ElementCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ElementCategory::NarrativeText => "NarrativeText",
            ElementCategory::Title => "Title",
            ElementCategory::Table => "Table",
            ElementCategory::ExtractedPage => "ExtractedPage",
            ElementCategory::ListItem => "ListItem",
            ElementCategory::UncategorizedText => "UncategorizedText",
        }
    }
}

/// PDF-space bounding box (points, origin top-left after normalization)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bbox {
    pub x0: f32,
    pub y0: f32,
    pub x1: f32,
    pub y1: f32,
}

impl Bbox {
    pub fn width(&self) -> f32 {
        (self.x1 - self.x0).max(0.0)
    }
    pub fn height(&self) -> f32 {
        (self.y1 - self.y0).max(0.0)
    }
}

/// Structural metadata attached by the Metadata stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructuralMetadata {
    pub source_filename: String,
    pub page_number: u32,
    pub content_type: String,
    pub element_category: ElementCategory,
    pub element_id: String,
    pub has_numbers: bool,
    pub text_complexity: TextComplexity,
    pub section_title_inherited: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextComplexity {
    Simple,
    Complex,
}

/// VLM caption results attached by the Enrichment stage
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnrichmentMetadata {
    pub vlm_model: String,
    pub table_image_caption: Option<String>,
    pub table_html_caption: Option<String>,
    pub full_page_image_caption: Option<String>,
    pub caption_word_count: usize,
    pub processing_duration_seconds: f64,
    pub vlm_processed: bool,
    pub vlm_processing_error: Option<String>,
}

/// One extracted element of a document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Element {
    pub id: String,
    pub page: u32,
    pub text: String,
    pub category: ElementCategory,
    pub coordinates: Option<Bbox>,
    pub structural: Option<StructuralMetadata>,
    pub enrichment: Option<EnrichmentMetadata>,
}

impl Element {
    pub fn new(page: u32, text: impl Into<String>, category: ElementCategory) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            page,
            text: text.into(),
            category,
            coordinates: None,
            structural: None,
            enrichment: None,
        }
    }
}

/// A table with both an HTML representation and a rendered image
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableElement {
    pub element: Element,
    pub html: String,
    /// Object-store key of the rendered table region, when extracted
    pub image_key: Option<String>,
}

/// A full-page rasterization for visually dense pages
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageImage {
    pub page: u32,
    pub storage_key: String,
    pub width: u32,
    pub height: u32,
}

/// Per-page analysis recorded by partitioning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageAnalysis {
    pub page: u32,
    pub meaningful_image_count: usize,
    pub drawing_count: usize,
    pub has_tables: bool,
    /// Text extraction is skipped on such pages; the whole page is captioned
    pub needs_extraction: bool,
}

/// Document-level facts carried through the per-document stages
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentInfo {
    pub document_id: Uuid,
    pub filename: String,
    pub page_count: u32,
    pub byte_size: u64,
    /// blake3 of the source bytes; partitioning is idempotent per (hash, cfg)
    pub content_hash: String,
}

/// Metadata persisted with every chunk
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub page_number: u32,
    pub element_category: ElementCategory,
    pub source_filename: String,
    pub section_title_inherited: Option<String>,
    pub element_id: Option<String>,
    /// Element ids folded into this chunk by small-chunk merging
    #[serde(default)]
    pub merged_from: Vec<String>,
    pub enrichment: Option<EnrichmentMetadata>,
}

/// The atomic retrieval unit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub id: Uuid,
    pub document_id: Uuid,
    pub indexing_run_id: Uuid,
    pub ordinal: u32,
    pub content: String,
    pub metadata: ChunkMetadata,
    /// None before the Embedding stage, or after a permanent batch failure
    pub embedding: Option<Vec<f32>>,
}

/// Row shape returned by the store's nearest-neighbor search
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkMatch {
    pub id: Uuid,
    pub document_id: Uuid,
    pub indexing_run_id: Uuid,
    pub content: String,
    pub metadata: ChunkMetadata,
    /// Stored embedding when the backend returns it; enables exact
    /// similarity recomputation
    pub embedding: Option<Vec<f32>>,
}

// ---------------------------------------------------------------------------
// Stage results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// Every pipeline stage, across all three pipelines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    // indexing (per document, then the run-wide barrier)
    Partition,
    Metadata,
    Enrichment,
    Chunking,
    Embedding,
    // wiki
    MetadataCollection,
    Overview,
    Clustering,
    Structure,
    PageRetrieval,
    Markdown,
    // checklist
    ChecklistParse,
    ChecklistRetrieval,
    ChecklistAnalysis,
    ChecklistStructure,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Partition => "partition",
            Stage::Metadata => "metadata",
            Stage::Enrichment => "enrichment",
            Stage::Chunking => "chunking",
            Stage::Embedding => "embedding",
            Stage::MetadataCollection => "metadata_collection",
            Stage::Overview => "overview",
            Stage::Clustering => "clustering",
            Stage::Structure => "structure",
            Stage::PageRetrieval => "page_retrieval",
            Stage::Markdown => "markdown",
            Stage::ChecklistParse => "checklist_parse",
            Stage::ChecklistRetrieval => "checklist_retrieval",
            Stage::ChecklistAnalysis => "checklist_analysis",
            Stage::ChecklistStructure => "checklist_structure",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Typed stage payloads, discriminated by stage name
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "stage_name", rename_all = "snake_case")]
pub enum StageData {
    Partition(PartitionOutput),
    Metadata(MetadataOutput),
    Enrichment(EnrichmentOutput),
    Chunking(ChunkingOutput),
    Embedding(EmbeddingOutput),
    MetadataCollection(MetadataCollectionOutput),
    Overview(OverviewOutput),
    Clustering(ClusteringOutput),
    Structure(WikiStructure),
    PageRetrieval(PageRetrievalOutput),
    Markdown(MarkdownOutput),
    ChecklistParse(ChecklistParseOutput),
    ChecklistRetrieval(ChecklistRetrievalOutput),
    ChecklistAnalysis(ChecklistAnalysisOutput),
    ChecklistStructure(ChecklistStructureOutput),
}

impl StageData {
    /// Summary statistics recorded alongside the payload on completion
    pub fn summary(&self) -> serde_json::Map<String, Value> {
        let value = match self {
            StageData::Partition(output) => serde_json::json!({
                "text_elements": output.text_elements.len(),
                "table_elements": output.table_elements.len(),
                "page_images": output.extracted_pages.len(),
                "page_count": output.document_metadata.page_count,
            }),
            StageData::Metadata(output) => serde_json::json!({
                "elements": output.text_elements.len() + output.table_elements.len(),
                "sections": output.page_sections.len(),
            }),
            StageData::Enrichment(output) => serde_json::json!({
                "captions_generated": output.captions_generated,
                "captions_failed": output.captions_failed,
            }),
            StageData::Chunking(output) => serde_json::json!({
                "total_chunks_created": output.stats.total_chunks_created,
                "average_chunk_size": output.stats.average_chunk_size,
                "elements_split": output.stats.splitting_stats.elements_split,
                "elements_merged": output.stats.merging_stats.elements_merged,
            }),
            StageData::Embedding(output) => serde_json::json!({
                "embeddings_generated": output.embeddings_generated,
                "embeddings_failed": output.embeddings_failed,
                "embedding_model": output.embedding_model,
            }),
            StageData::MetadataCollection(output) => serde_json::json!({
                "total_documents": output.total_documents,
                "total_chunks": output.total_chunks,
                "chunks_with_embeddings": output.chunks_with_embeddings.len(),
            }),
            StageData::Overview(output) => serde_json::json!({
                "overview_queries": output.overview_queries.len(),
                "retrieved_chunks": output.overview_data.retrieved_chunks,
                "overview_length": output.project_overview.len(),
            }),
            StageData::Clustering(output) => serde_json::json!({
                "n_clusters": output.n_clusters,
                "clustered_chunks": output.clusters.len(),
            }),
            StageData::Structure(output) => serde_json::json!({
                "pages": output.pages.len(),
                "title": output.title,
            }),
            StageData::PageRetrieval(output) => serde_json::json!({
                "pages": output.page_contents.len(),
                "total_chunks": output
                    .page_contents
                    .values()
                    .map(|p| p.retrieved_chunks.len())
                    .sum::<usize>(),
            }),
            StageData::Markdown(output) => serde_json::json!({
                "pages": output.pages.len(),
            }),
            StageData::ChecklistParse(output) => serde_json::json!({
                "items": output.items.len(),
                "queries": output.queries.len(),
            }),
            StageData::ChecklistRetrieval(output) => serde_json::json!({
                "chunks": output.chunk_ids.len(),
                "queries": output.query_count,
            }),
            StageData::ChecklistAnalysis(output) => serde_json::json!({
                "analysis_length": output.raw_analysis.len(),
            }),
            StageData::ChecklistStructure(output) => serde_json::json!({
                "results": output.results.len(),
            }),
        };
        match value {
            Value::Object(map) => map,
            _ => Default::default(),
        }
    }

    pub fn stage(&self) -> Stage {
        match self {
            StageData::Partition(_) => Stage::Partition,
            StageData::Metadata(_) => Stage::Metadata,
            StageData::Enrichment(_) => Stage::Enrichment,
            StageData::Chunking(_) => Stage::Chunking,
            StageData::Embedding(_) => Stage::Embedding,
            StageData::MetadataCollection(_) => Stage::MetadataCollection,
            StageData::Overview(_) => Stage::Overview,
            StageData::Clustering(_) => Stage::Clustering,
            StageData::Structure(_) => Stage::Structure,
            StageData::PageRetrieval(_) => Stage::PageRetrieval,
            StageData::Markdown(_) => Stage::Markdown,
            StageData::ChecklistParse(_) => Stage::ChecklistParse,
            StageData::ChecklistRetrieval(_) => Stage::ChecklistRetrieval,
            StageData::ChecklistAnalysis(_) => Stage::ChecklistAnalysis,
            StageData::ChecklistStructure(_) => Stage::ChecklistStructure,
        }
    }
}

/// Polymorphic per-stage record keyed by (run id, document id?, stage name).
///
/// Immutable once status is `Completed` or `Failed`; reruns write a fresh
/// row only when the config hash changed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageResult {
    pub run_id: Uuid,
    pub document_id: Option<Uuid>,
    pub stage: Stage,
    pub status: StageStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<f64>,
    pub summary_stats: serde_json::Map<String, Value>,
    pub sample_outputs: Option<Value>,
    /// Hash of the effective config this result was produced under
    pub config_hash: Option<String>,
    pub data: Option<StageData>,
    pub error_message: Option<String>,
}

impl StageResult {
    pub fn running(
        run_id: Uuid,
        document_id: Option<Uuid>,
        stage: Stage,
        config_hash: Option<String>,
    ) -> Self {
        Self {
            run_id,
            document_id,
            stage,
            status: StageStatus::Running,
            started_at: Some(Utc::now()),
            completed_at: None,
            duration_seconds: None,
            summary_stats: Default::default(),
            sample_outputs: None,
            config_hash,
            data: None,
            error_message: None,
        }
    }

    pub fn complete(
        mut self,
        data: StageData,
        summary_stats: serde_json::Map<String, Value>,
    ) -> Self {
        let now = Utc::now();
        self.duration_seconds = self
            .started_at
            .map(|t| (now - t).num_milliseconds() as f64 / 1000.0);
        self.completed_at = Some(now);
        self.status = StageStatus::Completed;
        self.summary_stats = summary_stats;
        self.data = Some(data);
        self
    }

    pub fn fail(mut self, error: impl Into<String>) -> Self {
        let now = Utc::now();
        self.duration_seconds = self
            .started_at
            .map(|t| (now - t).num_milliseconds() as f64 / 1000.0);
        self.completed_at = Some(now);
        self.status = StageStatus::Failed;
        self.error_message = Some(error.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Indexing stage outputs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionOutput {
    pub text_elements: Vec<Element>,
    pub table_elements: Vec<TableElement>,
    pub extracted_pages: BTreeMap<u32, PageImage>,
    pub page_analysis: Vec<PageAnalysis>,
    pub document_metadata: DocumentInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataOutput {
    pub text_elements: Vec<Element>,
    pub table_elements: Vec<TableElement>,
    pub extracted_pages: BTreeMap<u32, PageImage>,
    pub document_metadata: DocumentInfo,
    /// Inherited section title per page, from the reading-order sweep
    pub page_sections: BTreeMap<u32, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichmentOutput {
    pub text_elements: Vec<Element>,
    pub table_elements: Vec<TableElement>,
    pub extracted_pages: BTreeMap<u32, PageImage>,
    pub document_metadata: DocumentInfo,
    pub page_sections: BTreeMap<u32, String>,
    pub captions_generated: usize,
    pub captions_failed: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SplittingStats {
    pub elements_split: usize,
    pub sub_chunks_created: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MergingStats {
    pub merge_groups: usize,
    pub elements_merged: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkingStats {
    pub total_chunks_created: usize,
    pub average_chunk_size: f64,
    pub splitting_stats: SplittingStats,
    pub merging_stats: MergingStats,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkingOutput {
    pub chunks: Vec<Chunk>,
    pub stats: ChunkingStats,
    pub sample_chunks: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingOutput {
    pub embeddings_generated: usize,
    pub embeddings_failed: usize,
    pub embedding_model: String,
    pub embedding_dimensions: usize,
    pub batch_size_used: usize,
    pub average_embedding_time_seconds: f64,
}

// ---------------------------------------------------------------------------
// Wiki stage outputs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WikiDocumentSummary {
    pub id: Uuid,
    pub filename: String,
    pub size: u64,
    pub page_count: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataCollectionOutput {
    pub indexing_run_id: Uuid,
    pub total_documents: usize,
    pub total_chunks: usize,
    pub documents: Vec<WikiDocumentSummary>,
    pub chunks_with_embeddings: Vec<Uuid>,
    pub section_headers_distribution: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverviewOutput {
    pub project_overview: String,
    pub overview_queries: Vec<String>,
    pub overview_data: OverviewData,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverviewData {
    pub retrieved_chunks: usize,
    /// Result count per overview query
    pub query_results: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSummary {
    pub cluster_id: usize,
    pub cluster_name: String,
    pub chunk_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusteringOutput {
    /// Chunk id -> cluster id
    pub clusters: BTreeMap<Uuid, usize>,
    pub cluster_summaries: Vec<ClusterSummary>,
    pub n_clusters: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WikiPagePlan {
    pub id: String,
    pub title: String,
    pub description: String,
    pub queries: Vec<String>,
    #[serde(default)]
    pub relevance_score: Option<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WikiStructure {
    pub title: String,
    pub description: String,
    pub pages: Vec<WikiPagePlan>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageContent {
    pub retrieved_chunks: Vec<Uuid>,
    pub source_documents: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageRetrievalOutput {
    pub page_contents: BTreeMap<String, PageContent>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkdownOutput {
    pub pages: Vec<WikiPageMeta>,
}

/// Per-page metadata recorded on the wiki run once markdown is persisted
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WikiPageMeta {
    pub id: String,
    pub title: String,
    pub description: String,
    /// lowercase-kebab, unique within the run
    pub filename: String,
    pub storage_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WikiRun {
    pub id: Uuid,
    pub indexing_run_id: Uuid,
    pub status: RunStatus,
    pub storage_prefix: String,
    pub pages_metadata: Vec<WikiPageMeta>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl WikiRun {
    pub fn new(indexing_run_id: Uuid) -> Self {
        let id = Uuid::new_v4();
        Self {
            id,
            indexing_run_id,
            status: RunStatus::Pending,
            storage_prefix: format!("wiki/{id}"),
            pages_metadata: Vec::new(),
            error_message: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }
}

/// A rendered wiki page
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WikiPage {
    pub id: String,
    pub wiki_run_id: Uuid,
    pub title: String,
    pub description: String,
    pub queries: Vec<String>,
    pub markdown: String,
    pub storage_key: String,
}

// ---------------------------------------------------------------------------
// Checklist
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChecklistItem {
    pub number: String,
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChecklistParseOutput {
    pub items: Vec<ChecklistItem>,
    pub queries: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChecklistRetrievalOutput {
    pub chunk_ids: Vec<Uuid>,
    pub query_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChecklistAnalysisOutput {
    pub raw_analysis: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChecklistStructureOutput {
    pub results: Vec<ChecklistResult>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChecklistStatus {
    Found,
    Missing,
    Risk,
    Conditions,
    PendingClarification,
}

impl ChecklistStatus {
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "found" => Some(ChecklistStatus::Found),
            "missing" => Some(ChecklistStatus::Missing),
            "risk" => Some(ChecklistStatus::Risk),
            "conditions" => Some(ChecklistStatus::Conditions),
            "pending_clarification" => Some(ChecklistStatus::PendingClarification),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChecklistSource {
    pub document: String,
    pub page: Option<u32>,
    pub excerpt: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChecklistResult {
    pub item_number: String,
    pub item_name: String,
    pub status: ChecklistStatus,
    pub description: String,
    /// In [0, 1] when the model supplied one
    pub confidence: Option<f32>,
    pub primary_source: Option<ChecklistSource>,
    pub sources: Vec<ChecklistSource>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChecklistRun {
    pub id: Uuid,
    pub indexing_run_id: Uuid,
    pub checklist_content: String,
    pub model_name: String,
    pub access_level: AccessLevel,
    pub status: RunStatus,
    pub progress_current: u32,
    pub progress_total: u32,
    pub raw_analysis: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ChecklistRun {
    pub fn new(
        indexing_run_id: Uuid,
        checklist_content: impl Into<String>,
        model_name: impl Into<String>,
        access_level: AccessLevel,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            indexing_run_id,
            checklist_content: checklist_content.into(),
            model_name: model_name.into(),
            access_level,
            status: RunStatus::Pending,
            progress_current: 0,
            progress_total: 4,
            raw_analysis: None,
            error_message: None,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_data_discriminator_is_stage_name() {
        let data = StageData::Embedding(EmbeddingOutput {
            embeddings_generated: 10,
            embeddings_failed: 0,
            embedding_model: "voyage-multilingual-2".into(),
            embedding_dimensions: 1024,
            batch_size_used: 32,
            average_embedding_time_seconds: 0.2,
        });
        let value = serde_json::to_value(&data).unwrap();
        assert_eq!(value["stage_name"], "embedding");
        let back: StageData = serde_json::from_value(value).unwrap();
        assert_eq!(back.stage(), Stage::Embedding);
    }

    #[test]
    fn stage_result_lifecycle() {
        let run = Uuid::new_v4();
        let doc = Uuid::new_v4();
        let result = StageResult::running(run, Some(doc), Stage::Chunking, Some("abc".into()));
        assert_eq!(result.status, StageStatus::Running);
        assert!(result.started_at.is_some());

        let completed = result.complete(
            StageData::Chunking(ChunkingOutput {
                chunks: vec![],
                stats: ChunkingStats {
                    total_chunks_created: 0,
                    average_chunk_size: 0.0,
                    splitting_stats: Default::default(),
                    merging_stats: Default::default(),
                },
                sample_chunks: vec![],
            }),
            Default::default(),
        );
        assert_eq!(completed.status, StageStatus::Completed);
        assert!(completed.data.is_some());
        assert!(completed.duration_seconds.is_some());
    }

    #[test]
    fn failed_stage_keeps_error_message() {
        let result = StageResult::running(Uuid::new_v4(), None, Stage::Overview, None)
            .fail("chat call failed");
        assert_eq!(result.status, StageStatus::Failed);
        assert_eq!(result.error_message.as_deref(), Some("chat call failed"));
        assert!(result.data.is_none());
    }

    #[test]
    fn checklist_status_parses_loosely() {
        assert_eq!(ChecklistStatus::parse("FOUND"), Some(ChecklistStatus::Found));
        assert_eq!(
            ChecklistStatus::parse("pending_clarification"),
            Some(ChecklistStatus::PendingClarification)
        );
        assert_eq!(ChecklistStatus::parse("unknown"), None);
    }

    #[test]
    fn terminal_success_covers_warning_status() {
        assert!(RunStatus::Completed.is_terminal_success());
        assert!(RunStatus::CompletedWithWarnings.is_terminal_success());
        assert!(!RunStatus::Failed.is_terminal_success());
        assert!(!RunStatus::Running.is_terminal_success());
    }
}
