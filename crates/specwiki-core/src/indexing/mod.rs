//! Indexing pipeline orchestration.
//!
//! Per-document stages (Partition → Metadata → Enrichment → Chunking) run as
//! independent tasks bounded by the configured parallelism; the run-wide
//! Embedding stage is a barrier behind all of them. Every stage persists a
//! typed StageResult, and a rerun reuses completed results as long as the
//! config snapshot hash still matches.

pub mod chunking;
pub mod embedding;
pub mod enrichment;
pub mod metadata;
pub mod partition;
pub mod progress;

pub use progress::{ProgressTracker, RunProgress, StageCounts};

use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::error::{CoreError, Result};
use crate::models::{
    ChunkingOutput, Document, EnrichmentOutput, MetadataOutput, PartitionOutput, RunStatus, Stage,
    StageData, StageResult, StageStatus,
};
use crate::services::{
    EmbeddingClient, PartitionClient, RateLimiters, VlmClient,
};
use crate::store::{DataStore, ObjectStore};

use embedding::EmbeddingStage;
use enrichment::EnrichmentStage;
use partition::PartitionStage;

pub struct IndexingOrchestrator {
    store: Arc<dyn DataStore>,
    objects: Arc<dyn ObjectStore>,
    partition_client: Arc<dyn PartitionClient>,
    vlm: Arc<dyn VlmClient>,
    embedder: Arc<dyn EmbeddingClient>,
    limiters: RateLimiters,
    config: PipelineConfig,
    progress: ProgressTracker,
}

/// What happened to one document's per-document pipeline
struct DocumentOutcome {
    filename: String,
    result: Result<usize>,
}

impl IndexingOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn DataStore>,
        objects: Arc<dyn ObjectStore>,
        partition_client: Arc<dyn PartitionClient>,
        vlm: Arc<dyn VlmClient>,
        embedder: Arc<dyn EmbeddingClient>,
        limiters: RateLimiters,
        config: PipelineConfig,
    ) -> Self {
        let progress = ProgressTracker::new(store.clone());
        Self {
            store,
            objects,
            partition_client,
            vlm,
            embedder,
            limiters,
            config,
            progress,
        }
    }

    pub fn progress(&self) -> &ProgressTracker {
        &self.progress
    }

    /// Drive one indexing run to a terminal status.
    pub async fn run(&self, run_id: Uuid, cancel: CancellationToken) -> Result<RunStatus> {
        let run = self
            .store
            .get_indexing_run(run_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("indexing run {run_id}")))?;
        tracing::info!(run = %run_id, status = %run.status, "Starting indexing run");

        self.store
            .update_indexing_run_status(run_id, RunStatus::Running, None)
            .await?;

        match self.execute(run_id, &cancel).await {
            Ok((status, message)) => {
                self.store
                    .update_indexing_run_status(run_id, status, message)
                    .await?;
                tracing::info!(run = %run_id, status = %status, "Indexing run finished");
                Ok(status)
            }
            Err(e) => {
                let message = if matches!(e, CoreError::Cancelled) {
                    "cancelled".to_string()
                } else {
                    e.to_string()
                };
                self.store
                    .update_indexing_run_status(run_id, RunStatus::Failed, Some(message))
                    .await?;
                tracing::error!(run = %run_id, error = %e, "Indexing run failed");
                Err(e)
            }
        }
    }

    async fn execute(
        &self,
        run_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<(RunStatus, Option<String>)> {
        let documents = self.store.documents_for_run(run_id).await?;
        if documents.is_empty() {
            return Err(CoreError::InvalidInput(
                "indexing run has no documents".into(),
            ));
        }

        let config_hash = self.config.content_hash();
        let parallelism = self.config.orchestrator.parallelism.max(1);

        let outcomes: Vec<DocumentOutcome> = stream::iter(
            documents
                .iter()
                .map(|doc| self.process_document(run_id, doc, &config_hash, cancel)),
        )
        .buffer_unordered(parallelism)
        .collect()
        .await;

        if let Some(outcome) = outcomes
            .iter()
            .find(|o| matches!(o.result, Err(CoreError::Cancelled)))
        {
            tracing::warn!(document = %outcome.filename, "Run cancelled mid-document");
            return Err(CoreError::Cancelled);
        }

        let failed_docs: Vec<&DocumentOutcome> =
            outcomes.iter().filter(|o| o.result.is_err()).collect();
        if failed_docs.len() == outcomes.len() {
            let detail: Vec<String> = failed_docs
                .iter()
                .map(|o| {
                    format!(
                        "{}: {}",
                        o.filename,
                        o.result.as_ref().err().map(|e| e.to_string()).unwrap_or_default()
                    )
                })
                .collect();
            return Err(CoreError::Internal(anyhow::anyhow!(
                "all documents failed: {}",
                detail.join("; ")
            )));
        }

        if cancel.is_cancelled() {
            return Err(CoreError::Cancelled);
        }

        // Barrier: every surviving document has completed Chunking
        let embedding_output = self.run_embedding(run_id, &config_hash, cancel).await?;

        let total_chunks: usize = outcomes
            .iter()
            .filter_map(|o| o.result.as_ref().ok())
            .sum();

        let mut warnings: Vec<String> = Vec::new();
        if !failed_docs.is_empty() {
            let names: Vec<&str> = failed_docs.iter().map(|o| o.filename.as_str()).collect();
            warnings.push(format!(
                "{} document(s) failed: {}",
                failed_docs.len(),
                names.join(", ")
            ));
        }
        if embedding_output.embeddings_failed > 0 {
            warnings.push(format!(
                "{} chunk(s) could not be embedded",
                embedding_output.embeddings_failed
            ));
        }
        if total_chunks == 0 {
            warnings.push("document contained no extractable content".to_string());
        }

        if warnings.is_empty() {
            Ok((RunStatus::Completed, None))
        } else {
            Ok((RunStatus::CompletedWithWarnings, Some(warnings.join("; "))))
        }
    }

    /// The four per-document stages, in order, with stage-level caching.
    async fn process_document(
        &self,
        run_id: Uuid,
        document: &Document,
        config_hash: &str,
        cancel: &CancellationToken,
    ) -> DocumentOutcome {
        let result = self
            .document_stages(run_id, document, config_hash, cancel)
            .await;
        if let Err(e) = &result {
            tracing::error!(
                document = %document.filename,
                error = %e,
                "Document pipeline failed"
            );
        }
        DocumentOutcome {
            filename: document.filename.clone(),
            result,
        }
    }

    async fn document_stages(
        &self,
        run_id: Uuid,
        document: &Document,
        config_hash: &str,
        cancel: &CancellationToken,
    ) -> Result<usize> {
        let doc_id = Some(document.id);

        // ---- Partition ----
        if cancel.is_cancelled() {
            return Err(CoreError::Cancelled);
        }
        let partition_output: PartitionOutput =
            match self.cached(run_id, doc_id, Stage::Partition, config_hash).await? {
                Some(StageData::Partition(output)) => output,
                _ => {
                    let stage = PartitionStage {
                        objects: self.objects.as_ref(),
                        partition_client: self.partition_client.as_ref(),
                        limiters: &self.limiters,
                        timeouts: &self.config.timeouts,
                        config: &self.config.indexing.partition,
                    };
                    let output = self
                        .record(run_id, doc_id, Stage::Partition, config_hash, async {
                            stage.run(run_id, document).await
                        })
                        .await?;
                    self.store
                        .update_document_page_count(
                            document.id,
                            output.document_metadata.page_count,
                        )
                        .await?;
                    output
                }
            };

        // ---- Metadata ----
        if cancel.is_cancelled() {
            return Err(CoreError::Cancelled);
        }
        let metadata_output: MetadataOutput =
            match self.cached(run_id, doc_id, Stage::Metadata, config_hash).await? {
                Some(StageData::Metadata(output)) => output,
                _ => {
                    self.record(run_id, doc_id, Stage::Metadata, config_hash, async {
                        metadata::run_metadata(partition_output)
                    })
                    .await?
                }
            };

        // ---- Enrichment ----
        if cancel.is_cancelled() {
            return Err(CoreError::Cancelled);
        }
        let language = self
            .config
            .indexing
            .enrichment
            .caption_language
            .clone()
            .unwrap_or_else(|| self.config.defaults.language.clone());
        let enrichment_output: EnrichmentOutput = match self
            .cached(run_id, doc_id, Stage::Enrichment, config_hash)
            .await?
        {
            Some(StageData::Enrichment(output)) => output,
            _ => {
                let stage = EnrichmentStage {
                    objects: self.objects.as_ref(),
                    vlm: self.vlm.as_ref(),
                    limiters: &self.limiters,
                    timeouts: &self.config.timeouts,
                    config: &self.config.indexing.enrichment,
                    language: &language,
                };
                self.record(run_id, doc_id, Stage::Enrichment, config_hash, async {
                    stage.run(metadata_output).await
                })
                .await?
            }
        };

        // ---- Chunking ----
        if cancel.is_cancelled() {
            return Err(CoreError::Cancelled);
        }
        let (chunking_output, freshly_chunked): (ChunkingOutput, bool) =
            match self.cached(run_id, doc_id, Stage::Chunking, config_hash).await? {
                Some(StageData::Chunking(output)) => (output, false),
                _ => {
                    let output = self
                        .record(run_id, doc_id, Stage::Chunking, config_hash, async {
                            chunking::run_chunking(
                                enrichment_output,
                                &self.config.indexing.chunking,
                                run_id,
                            )
                        })
                        .await?;
                    (output, true)
                }
            };

        // Fresh chunks land in the store now; the Embedding barrier picks
        // them up. A cached Chunking result means the stored rows (and any
        // embeddings they already carry) are current.
        if freshly_chunked {
            self.store
                .delete_chunks_for_document(run_id, document.id)
                .await?;
            self.store.insert_chunks(&chunking_output.chunks).await?;
        }

        Ok(chunking_output.chunks.len())
    }

    async fn run_embedding(
        &self,
        run_id: Uuid,
        config_hash: &str,
        cancel: &CancellationToken,
    ) -> Result<crate::models::EmbeddingOutput> {
        if let Some(StageData::Embedding(output)) =
            self.cached(run_id, None, Stage::Embedding, config_hash).await?
        {
            return Ok(output);
        }
        let stage = EmbeddingStage {
            store: self.store.as_ref(),
            embedder: self.embedder.as_ref(),
            limiters: &self.limiters,
            timeouts: &self.config.timeouts,
            config: &self.config.indexing.embedding,
            batch_concurrency: self.config.orchestrator.batch_concurrency,
        };
        self.record(run_id, None, Stage::Embedding, config_hash, async {
            stage.run(run_id, cancel).await
        })
        .await
    }

    /// Reuse a completed stage result when the config hash matches.
    async fn cached(
        &self,
        run_id: Uuid,
        document_id: Option<Uuid>,
        stage: Stage,
        config_hash: &str,
    ) -> Result<Option<StageData>> {
        let Some(existing) = self
            .store
            .get_stage_result(run_id, document_id, stage)
            .await?
        else {
            return Ok(None);
        };
        if existing.status == StageStatus::Completed
            && existing.config_hash.as_deref() == Some(config_hash)
        {
            tracing::info!(run = %run_id, stage = %stage, "Reusing completed stage result");
            return Ok(existing.data);
        }
        Ok(None)
    }

    /// Run one stage under StageResult persistence.
    ///
    /// The persisted rows double as the progress source: a fresh snapshot
    /// is published after each transition.
    async fn record<T, F>(
        &self,
        run_id: Uuid,
        document_id: Option<Uuid>,
        stage: Stage,
        config_hash: &str,
        work: F,
    ) -> Result<T>
    where
        T: Clone + Into<StageData>,
        F: std::future::Future<Output = Result<T>>,
    {
        let running =
            StageResult::running(run_id, document_id, stage, Some(config_hash.to_string()));
        self.store.upsert_stage_result(&running).await?;
        self.publish_progress(run_id).await;

        match work.await {
            Ok(output) => {
                let data: StageData = output.clone().into();
                let summary = data.summary();
                self.store
                    .upsert_stage_result(&running.complete(data, summary))
                    .await?;
                self.publish_progress(run_id).await;
                Ok(output)
            }
            Err(e) => {
                // failed StageResult persists before the error propagates
                self.store
                    .upsert_stage_result(&running.fail(e.to_string()))
                    .await?;
                self.publish_progress(run_id).await;
                Err(e)
            }
        }
    }

    /// Progress is best-effort: a snapshot failure never fails the stage.
    async fn publish_progress(&self, run_id: Uuid) {
        if let Err(e) = self.progress.publish(run_id).await {
            tracing::debug!(run = %run_id, error = %e, "Progress snapshot failed");
        }
    }
}

impl From<PartitionOutput> for StageData {
    fn from(value: PartitionOutput) -> Self {
        StageData::Partition(value)
    }
}
impl From<MetadataOutput> for StageData {
    fn from(value: MetadataOutput) -> Self {
        StageData::Metadata(value)
    }
}
impl From<EnrichmentOutput> for StageData {
    fn from(value: EnrichmentOutput) -> Self {
        StageData::Enrichment(value)
    }
}
impl From<ChunkingOutput> for StageData {
    fn from(value: ChunkingOutput) -> Self {
        StageData::Chunking(value)
    }
}
impl From<crate::models::EmbeddingOutput> for StageData {
    fn from(value: crate::models::EmbeddingOutput) -> Self {
        StageData::Embedding(value)
    }
}
