//! Wiki generation pipeline.
//!
//! Six ordered stages over a completed indexing run's corpus:
//! Metadata Collect → Overview → Clustering → Structure → Page Retrieval →
//! Markdown. Every stage persists a typed StageResult under the wiki run's
//! id so a run can be inspected stage by stage afterwards.

pub mod clustering;
pub mod collect;
pub mod markdown;
pub mod overview;
pub mod pages;
pub mod structure;

use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::error::{CoreError, Result};
use crate::models::{
    ClusteringOutput, MarkdownOutput, MetadataCollectionOutput, OverviewOutput,
    PageRetrievalOutput, RunStatus, Stage, StageData, StageResult, WikiPageMeta, WikiRun,
    WikiStructure,
};
use crate::retrieval::RetrievalCore;
use crate::services::{ChatClient, ChatRunner, EmbeddingClient, RateLimiters};
use crate::store::{DataStore, ObjectStore};

pub struct WikiOrchestrator {
    store: Arc<dyn DataStore>,
    objects: Arc<dyn ObjectStore>,
    chat: Arc<dyn ChatClient>,
    embedder: Arc<dyn EmbeddingClient>,
    limiters: RateLimiters,
    config: PipelineConfig,
}

impl WikiOrchestrator {
    pub fn new(
        store: Arc<dyn DataStore>,
        objects: Arc<dyn ObjectStore>,
        chat: Arc<dyn ChatClient>,
        embedder: Arc<dyn EmbeddingClient>,
        limiters: RateLimiters,
        config: PipelineConfig,
    ) -> Self {
        Self {
            store,
            objects,
            chat,
            embedder,
            limiters,
            config,
        }
    }

    /// Generate a wiki for a completed indexing run.
    pub async fn run(
        &self,
        indexing_run_id: Uuid,
        cancel: CancellationToken,
    ) -> Result<WikiRun> {
        let parent = self
            .store
            .get_indexing_run(indexing_run_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("indexing run {indexing_run_id}")))?;
        if !parent.status.is_terminal_success() {
            return Err(CoreError::Conflict(format!(
                "indexing run {indexing_run_id} is {}, wiki generation requires a completed run",
                parent.status
            )));
        }

        let mut wiki_run = WikiRun::new(indexing_run_id);
        self.store.create_wiki_run(&wiki_run).await?;
        wiki_run.status = RunStatus::Running;
        self.store.update_wiki_run(&wiki_run).await?;
        tracing::info!(wiki_run = %wiki_run.id, parent = %indexing_run_id, "Starting wiki generation");

        match self.execute(&wiki_run, &cancel).await {
            Ok(pages_metadata) => {
                wiki_run.status = RunStatus::Completed;
                wiki_run.pages_metadata = pages_metadata;
                wiki_run.completed_at = Some(Utc::now());
                self.store.update_wiki_run(&wiki_run).await?;
                tracing::info!(
                    wiki_run = %wiki_run.id,
                    pages = wiki_run.pages_metadata.len(),
                    "Wiki generation finished"
                );
                Ok(wiki_run)
            }
            Err(e) => {
                wiki_run.status = RunStatus::Failed;
                wiki_run.error_message = Some(if matches!(e, CoreError::Cancelled) {
                    "cancelled".to_string()
                } else {
                    e.to_string()
                });
                wiki_run.completed_at = Some(Utc::now());
                self.store.update_wiki_run(&wiki_run).await?;
                tracing::error!(wiki_run = %wiki_run.id, error = %e, "Wiki generation failed");
                Err(e)
            }
        }
    }

    async fn execute(
        &self,
        wiki_run: &WikiRun,
        cancel: &CancellationToken,
    ) -> Result<Vec<WikiPageMeta>> {
        let language = self.config.language().to_string();
        let retrieval = RetrievalCore::new(
            self.store.clone(),
            self.embedder.clone(),
            self.config.query.retrieval.clone(),
            self.config.timeouts.clone(),
        );
        let chat = ChatRunner {
            client: self.chat.as_ref(),
            bucket: self.limiters.chat.as_ref(),
            timeout: self.config.timeouts.chat(),
            model: self.config.wiki.model.clone(),
        };
        let indexing_run_id = wiki_run.indexing_run_id;

        // 1. Metadata collection
        self.check(cancel)?;
        let metadata: MetadataCollectionOutput = self
            .record(wiki_run.id, Stage::MetadataCollection, async {
                collect::collect_metadata(self.store.as_ref(), indexing_run_id).await
            })
            .await?;

        // 2. Overview
        self.check(cancel)?;
        let (overview, _overview_chunks): (OverviewOutput, _) = {
            let result = self
                .record(wiki_run.id, Stage::Overview, async {
                    overview::generate_overview(
                        &retrieval,
                        &chat,
                        &metadata,
                        indexing_run_id,
                        &language,
                        self.config.wiki.overview_query_count,
                    )
                    .await
                    .map(RecordedOverview)
                })
                .await?;
            (result.0 .0, result.0 .1)
        };

        // 3. Semantic clustering (skippable via config)
        self.check(cancel)?;
        let cluster_summaries = if self.config.wiki.semantic_clusters.enabled {
            let chunks = self.store.chunks_for_run(indexing_run_id, true).await?;
            let output: ClusteringOutput = self
                .record(wiki_run.id, Stage::Clustering, async {
                    clustering::cluster_corpus(
                        &chat,
                        &chunks,
                        &self.config.wiki.semantic_clusters,
                        &language,
                    )
                    .await
                })
                .await?;
            output.cluster_summaries
        } else {
            tracing::info!(wiki_run = %wiki_run.id, "Semantic clustering disabled, skipping");
            vec![]
        };

        // 4. Structure
        self.check(cancel)?;
        let structure: WikiStructure = self
            .record(wiki_run.id, Stage::Structure, async {
                structure::generate_structure(
                    &chat,
                    &overview.project_overview,
                    &cluster_summaries,
                    &metadata.section_headers_distribution,
                    &self.config.wiki.generation,
                    &language,
                )
                .await
            })
            .await?;

        // 5. Page content retrieval
        self.check(cancel)?;
        let page_chunks = {
            let result = self
                .record(wiki_run.id, Stage::PageRetrieval, async {
                    pages::retrieve_page_contents(
                        &retrieval,
                        &structure,
                        indexing_run_id,
                        &language,
                    )
                    .await
                    .map(RecordedPages)
                })
                .await?;
            result.0 .1
        };

        // 6. Markdown
        self.check(cancel)?;
        let (markdown_output, _pages): (MarkdownOutput, _) = {
            let result = self
                .record(wiki_run.id, Stage::Markdown, async {
                    markdown::generate_markdown(
                        &chat,
                        self.objects.as_ref(),
                        wiki_run,
                        &structure,
                        &page_chunks,
                        &language,
                    )
                    .await
                    .map(RecordedMarkdown)
                })
                .await?;
            (result.0 .0, result.0 .1)
        };

        Ok(markdown_output.pages)
    }

    fn check(&self, cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            Err(CoreError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Run a stage with StageResult persistence, as the indexing pipeline
    /// does, keyed by the wiki run id.
    async fn record<T, F>(&self, wiki_run_id: Uuid, stage: Stage, work: F) -> Result<T>
    where
        T: Clone + Into<StageData>,
        F: std::future::Future<Output = Result<T>>,
    {
        let running = StageResult::running(
            wiki_run_id,
            None,
            stage,
            Some(self.config.content_hash()),
        );
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

// Stage outputs that carry extra in-memory state alongside the persisted
// payload wrap it so `record` can still persist the typed part.

#[derive(Clone)]
struct RecordedOverview(
    (
        OverviewOutput,
        Vec<crate::retrieval::RetrievedChunk>,
    ),
);
impl From<RecordedOverview> for StageData {
    fn from(value: RecordedOverview) -> Self {
        StageData::Overview(value.0 .0)
    }
}

#[derive(Clone)]
struct RecordedPages(
    (
        PageRetrievalOutput,
        std::collections::BTreeMap<String, Vec<crate::retrieval::RetrievedChunk>>,
    ),
);
impl From<RecordedPages> for StageData {
    fn from(value: RecordedPages) -> Self {
        StageData::PageRetrieval(value.0 .0)
    }
}

#[derive(Clone)]
struct RecordedMarkdown((MarkdownOutput, Vec<crate::models::WikiPage>));
impl From<RecordedMarkdown> for StageData {
    fn from(value: RecordedMarkdown) -> Self {
        StageData::Markdown(value.0 .0)
    }
}

impl From<MetadataCollectionOutput> for StageData {
    fn from(value: MetadataCollectionOutput) -> Self {
        StageData::MetadataCollection(value)
    }
}
impl From<ClusteringOutput> for StageData {
    fn from(value: ClusteringOutput) -> Self {
        StageData::Clustering(value)
    }
}
impl From<WikiStructure> for StageData {
    fn from(value: WikiStructure) -> Self {
        StageData::Structure(value)
    }
}
