//! Checklist compliance pipeline.
//!
//! Four ordered stages sharing the retrieval core: Parse + Query Generation
//! → Batch Retrieval → Analysis → Structuring. Progress on the run advances
//! after every stage ({current}/4).

pub mod analyze;
pub mod parse;
pub mod structure;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::error::{CoreError, Result};
use crate::models::{
    ChecklistAnalysisOutput, ChecklistParseOutput, ChecklistResult, ChecklistRetrievalOutput,
    ChecklistRun, ChecklistStructureOutput, RunStatus, Stage, StageData, StageResult,
};
use crate::retrieval::RetrievalCore;
use crate::services::{ChatClient, ChatRunner, EmbeddingClient, RateLimiters};
use crate::store::DataStore;

/// Chunks kept per query in the batch retrieval
const TOP_K_PER_QUERY: usize = 5;

pub struct ChecklistOrchestrator {
    store: Arc<dyn DataStore>,
    chat: Arc<dyn ChatClient>,
    embedder: Arc<dyn EmbeddingClient>,
    limiters: RateLimiters,
    config: PipelineConfig,
}

impl ChecklistOrchestrator {
    pub fn new(
        store: Arc<dyn DataStore>,
        chat: Arc<dyn ChatClient>,
        embedder: Arc<dyn EmbeddingClient>,
        limiters: RateLimiters,
        config: PipelineConfig,
    ) -> Self {
        Self {
            store,
            chat,
            embedder,
            limiters,
            config,
        }
    }

    /// Run an already-created checklist analysis to a terminal status.
    pub async fn run(
        &self,
        analysis_run_id: Uuid,
        cancel: CancellationToken,
    ) -> Result<Vec<ChecklistResult>> {
        let mut run = self
            .store
            .get_checklist_run(analysis_run_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("checklist run {analysis_run_id}")))?;

        let parent = self
            .store
            .get_indexing_run(run.indexing_run_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("indexing run {}", run.indexing_run_id)))?;
        if !parent.status.is_terminal_success() {
            return Err(CoreError::Conflict(format!(
                "indexing run {} is {}, checklist analysis requires a completed run",
                parent.id, parent.status
            )));
        }

        run.status = RunStatus::Running;
        run.progress_current = 0;
        run.progress_total = 4;
        self.store.update_checklist_run(&run).await?;
        tracing::info!(run = %run.id, parent = %run.indexing_run_id, "Starting checklist analysis");

        match self.execute(&mut run, &cancel).await {
            Ok(results) => {
                self.store
                    .store_checklist_results(run.id, &results)
                    .await?;
                run.status = RunStatus::Completed;
                run.progress_current = 4;
                self.store.update_checklist_run(&run).await?;
                tracing::info!(run = %run.id, results = results.len(), "Checklist analysis finished");
                Ok(results)
            }
            Err(e) => {
                run.status = RunStatus::Failed;
                run.error_message = Some(if matches!(e, CoreError::Cancelled) {
                    "cancelled".to_string()
                } else {
                    e.to_string()
                });
                self.store.update_checklist_run(&run).await?;
                tracing::error!(run = %run.id, error = %e, "Checklist analysis failed");
                Err(e)
            }
        }
    }

    async fn execute(
        &self,
        run: &mut ChecklistRun,
        cancel: &CancellationToken,
    ) -> Result<Vec<ChecklistResult>> {
        let language = self.config.language().to_string();
        let model = if run.model_name.is_empty() {
            self.config.checklist.model.clone()
        } else {
            run.model_name.clone()
        };
        let chat = ChatRunner {
            client: self.chat.as_ref(),
            bucket: self.limiters.chat.as_ref(),
            timeout: self.config.timeouts.chat(),
            model,
        };
        let retrieval = RetrievalCore::new(
            self.store.clone(),
            self.embedder.clone(),
            self.config.query.retrieval.clone(),
            self.config.timeouts.clone(),
        );

        // 1. Parse + query generation
        self.check(cancel)?;
        let parsed: ChecklistParseOutput = self
            .record(run.id, Stage::ChecklistParse, async {
                parse::parse_checklist(&chat, &run.checklist_content, &language).await
            })
            .await?;
        self.advance(run, 1).await?;

        // 2. Batch retrieval
        self.check(cancel)?;
        let chunks = {
            let queries = parsed.queries.clone();
            let indexing_run_id = run.indexing_run_id;
            let retrieval = &retrieval;
            let language = language.clone();
            let result = self
                .record(run.id, Stage::ChecklistRetrieval, async move {
                    let chunks = retrieval
                        .retrieve_batch(&queries, indexing_run_id, &language, TOP_K_PER_QUERY)
                        .await?;
                    Ok(RecordedRetrieval {
                        output: ChecklistRetrievalOutput {
                            chunk_ids: chunks.iter().map(|c| c.id).collect(),
                            query_count: queries.len(),
                        },
                        chunks,
                    })
                })
                .await?;
            result.chunks
        };
        self.advance(run, 2).await?;

        // 3. Analysis
        self.check(cancel)?;
        let analysis: ChecklistAnalysisOutput = self
            .record(run.id, Stage::ChecklistAnalysis, async {
                let raw_analysis = analyze::analyze_checklist(
                    &chat,
                    &parsed.items,
                    &chunks,
                    &language,
                    self.config.checklist.max_analysis_chunks,
                )
                .await?;
                Ok(ChecklistAnalysisOutput { raw_analysis })
            })
            .await?;
        run.raw_analysis = Some(analysis.raw_analysis.clone());
        self.advance(run, 3).await?;

        // 4. Structuring
        self.check(cancel)?;
        let structured: ChecklistStructureOutput = self
            .record(run.id, Stage::ChecklistStructure, async {
                let results = structure::structure_analysis(
                    &chat,
                    &analysis.raw_analysis,
                    &parsed.items,
                    &language,
                )
                .await?;
                Ok(ChecklistStructureOutput { results })
            })
            .await?;

        Ok(structured.results)
    }

    fn check(&self, cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            Err(CoreError::Cancelled)
        } else {
            Ok(())
        }
    }

    async fn advance(&self, run: &mut ChecklistRun, current: u32) -> Result<()> {
        run.progress_current = current;
        self.store.update_checklist_run(run).await
    }

    async fn record<T, F>(&self, run_id: Uuid, stage: Stage, work: F) -> Result<T>
    where
        T: Clone + Into<StageData>,
        F: std::future::Future<Output = Result<T>>,
    {
        let running =
            StageResult::running(run_id, None, stage, Some(self.config.content_hash()));
        self.store.upsert_stage_result(&running).await?;
        match work.await {
            Ok(output) => {
                let data: StageData = output.clone().into();
                let summary = data.summary();
                self.store
                    .upsert_stage_result(&running.complete(data, summary))
                    .await?;
                Ok(output)
            }
            Err(e) => {
                self.store
                    .upsert_stage_result(&running.fail(e.to_string()))
                    .await?;
                Err(e)
            }
        }
    }
}

#[derive(Clone)]
struct RecordedRetrieval {
    output: ChecklistRetrievalOutput,
    chunks: Vec<crate::retrieval::RetrievedChunk>,
}
impl From<RecordedRetrieval> for StageData {
    fn from(value: RecordedRetrieval) -> Self {
        StageData::ChecklistRetrieval(value.output)
    }
}

impl From<ChecklistParseOutput> for StageData {
    fn from(value: ChecklistParseOutput) -> Self {
        StageData::ChecklistParse(value)
    }
}
impl From<ChecklistAnalysisOutput> for StageData {
    fn from(value: ChecklistAnalysisOutput) -> Self {
        StageData::ChecklistAnalysis(value)
    }
}
impl From<ChecklistStructureOutput> for StageData {
    fn from(value: ChecklistStructureOutput) -> Self {
        StageData::ChecklistStructure(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::models::{
        AccessLevel, ChecklistStatus, Chunk, ChunkMetadata, ElementCategory, IndexingRun,
        UploadKind,
    };
    use crate::services::{MockChatClient, MockEmbeddingClient};
    use crate::store::MemoryDataStore;

    const DIMS: usize = 4;

    struct Harness {
        store: Arc<MemoryDataStore>,
        chat: Arc<MockChatClient>,
        embedder: Arc<MockEmbeddingClient>,
        config: PipelineConfig,
    }

    impl Harness {
        fn new() -> Self {
            let mut config = PipelineConfig::default();
            config.query.retrieval.dimensions = DIMS;
            Self {
                store: Arc::new(MemoryDataStore::new()),
                chat: Arc::new(MockChatClient::new()),
                embedder: Arc::new(MockEmbeddingClient::new(DIMS)),
                config,
            }
        }

        fn orchestrator(&self) -> ChecklistOrchestrator {
            ChecklistOrchestrator::new(
                self.store.clone(),
                self.chat.clone(),
                self.embedder.clone(),
                RateLimiters::default(),
                self.config.clone(),
            )
        }

        async fn seed(&self, parent_status: RunStatus, checklist: &str) -> Uuid {
            let parent = IndexingRun::new(
                AccessLevel::Private,
                UploadKind::UserProject,
                serde_json::json!({}),
            );
            self.store.create_indexing_run(&parent).await.unwrap();
            if parent_status != RunStatus::Pending {
                self.store
                    .update_indexing_run_status(parent.id, parent_status, None)
                    .await
                    .unwrap();
            }

            self.embedder.pin("brandtætning", vec![1.0, 0.0, 0.0, 0.0]);
            self.store
                .insert_chunks(&[Chunk {
                    id: Uuid::new_v4(),
                    document_id: Uuid::nil(),
                    indexing_run_id: parent.id,
                    ordinal: 0,
                    content: "Brandtætninger udføres som EI60.".into(),
                    metadata: ChunkMetadata {
                        page_number: 7,
                        element_category: ElementCategory::NarrativeText,
                        source_filename: "brand.pdf".into(),
                        section_title_inherited: None,
                        element_id: None,
                        merged_from: vec![],
                        enrichment: None,
                    },
                    embedding: Some(vec![0.9, 0.44, 0.0, 0.0]),
                }])
                .await
                .unwrap();

            let run = ChecklistRun::new(parent.id, checklist, "", AccessLevel::Private);
            self.store.create_checklist_run(&run).await.unwrap();
            run.id
        }
    }

    fn parse_response() -> String {
        r#"{"items": [{"number": "1", "name": "Brandtætninger", "description": "Krav"}],
            "queries": ["brandtætning"]}"#
            .to_string()
    }

    fn structure_response() -> String {
        r#"{"results": [{"item_number": "1", "item_name": "Brandtætninger",
            "status": "found", "description": "Findes i brand.pdf, side 7",
            "confidence_score": 0.9,
            "sources": [{"document": "brand.pdf", "page": 7, "excerpt": "EI60"}]}]}"#
            .to_string()
    }

    #[tokio::test]
    async fn full_pipeline_stores_results_and_progress() {
        let harness = Harness::new();
        let run_id = harness.seed(RunStatus::Completed, "1. Brandtætninger").await;

        harness.chat.push_response(parse_response());
        harness.chat.push_response("Punkt 1: FOUND. Brandtætninger er beskrevet i brand.pdf, side 7.");
        harness.chat.push_response(structure_response());

        let results = harness
            .orchestrator()
            .run(run_id, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].status, ChecklistStatus::Found);

        let run = harness
            .store
            .get_checklist_run(run_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.progress_current, 4);
        assert_eq!(run.progress_total, 4);
        assert!(run.raw_analysis.unwrap().contains("FOUND"));

        let stored = harness
            .store
            .checklist_results_for_run(run_id)
            .await
            .unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(
            stored[0].primary_source.as_ref().unwrap().document,
            "brand.pdf"
        );

        // all four stage results persisted under the analysis run
        let stages = harness.store.stage_results_for_run(run_id).await.unwrap();
        assert_eq!(stages.len(), 4);
    }

    #[tokio::test]
    async fn refuses_unfinished_parent() {
        let harness = Harness::new();
        let run_id = harness.seed(RunStatus::Running, "1. A").await;
        let err = harness
            .orchestrator()
            .run(run_id, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn parse_failure_fails_the_run() {
        let harness = Harness::new();
        let run_id = harness.seed(RunStatus::Completed, "1. A").await;
        harness.chat.push_response("no json at all");

        let err = harness
            .orchestrator()
            .run(run_id, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::UpstreamMalformedResponse(_)));

        let run = harness
            .store
            .get_checklist_run(run_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert!(run.error_message.is_some());
    }

    #[tokio::test]
    async fn cancelled_before_start_is_recorded() {
        let harness = Harness::new();
        let run_id = harness.seed(RunStatus::Completed, "1. A").await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = harness
            .orchestrator()
            .run(run_id, cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Cancelled));
        let run = harness
            .store
            .get_checklist_run(run_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.error_message.as_deref(), Some("cancelled"));
    }
}
