//! Retrieval core: query embedding, HNSW-backed primary search, scan
//! fallback, and language-tuned post-processing.
//!
//! Shared by the answer service, the wiki pipeline and (in batch mode) the
//! checklist pipeline.

pub mod similarity;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::{RetrievalConfig, TimeoutConfig};
use crate::error::{CoreError, Result};
use crate::models::{ChunkMatch, ChunkMetadata};
use crate::services::{with_retry, with_timeout, EmbeddingClient};
use crate::store::DataStore;
use similarity::{cosine_similarity, deduplicate_by_content, quality_band, QualityBand};

/// A chunk returned to callers, scored and banded
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievedChunk {
    pub id: Uuid,
    pub document_id: Uuid,
    pub indexing_run_id: Uuid,
    pub content: String,
    pub metadata: ChunkMetadata,
    pub similarity: f32,
    pub quality: QualityBand,
}

impl RetrievedChunk {
    pub fn source_filename(&self) -> &str {
        &self.metadata.source_filename
    }

    pub fn page_number(&self) -> u32 {
        self.metadata.page_number
    }
}

/// One retrieval request
#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub query: String,
    pub indexing_run_id: Option<Uuid>,
    pub allowed_document_ids: Option<Vec<Uuid>>,
    pub language: String,
    pub top_k: Option<usize>,
}

impl SearchRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            indexing_run_id: None,
            allowed_document_ids: None,
            language: "danish".to_string(),
            top_k: None,
        }
    }

    pub fn in_run(mut self, run_id: Uuid) -> Self {
        self.indexing_run_id = Some(run_id);
        self
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = language.into();
        self
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = Some(top_k);
        self
    }
}

pub struct RetrievalCore {
    store: Arc<dyn DataStore>,
    embedder: Arc<dyn EmbeddingClient>,
    config: RetrievalConfig,
    timeouts: TimeoutConfig,
}

impl RetrievalCore {
    pub fn new(
        store: Arc<dyn DataStore>,
        embedder: Arc<dyn EmbeddingClient>,
        config: RetrievalConfig,
        timeouts: TimeoutConfig,
    ) -> Self {
        Self {
            store,
            embedder,
            config,
            timeouts,
        }
    }

    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    /// Embed a single query, validating the output dimension.
    pub async fn embed_query(&self, query: &str) -> Result<Vec<f32>> {
        let texts = vec![query.to_string()];
        let model = self.config.embedding_model.clone();
        let vectors = with_retry("embed_query", || {
            with_timeout(
                "embedding",
                self.timeouts.embed(),
                self.embedder.embed(&texts, &model),
            )
        })
        .await?;
        let embedding = vectors
            .into_iter()
            .next()
            .ok_or_else(|| CoreError::UpstreamMalformedResponse("empty embedding batch".into()))?;
        if embedding.len() != self.config.dimensions {
            tracing::warn!(
                got = embedding.len(),
                expected = self.config.dimensions,
                "Query embedding dimension mismatch"
            );
        }
        Ok(embedding)
    }

    /// Retrieve the `top_k` most relevant chunks for a query.
    pub async fn retrieve(&self, request: &SearchRequest) -> Result<Vec<RetrievedChunk>> {
        let top_k = request.top_k.unwrap_or(self.config.top_k);
        let query_embedding = self.embed_query(&request.query).await?;

        let primary = self.primary_search(&query_embedding, request, top_k).await;

        let scored = match primary {
            Ok(results) if !results.is_empty() => results,
            Ok(_) => {
                tracing::warn!(query = %request.query, "Primary search found no results, trying scan fallback");
                self.fallback_scan(&query_embedding, request, top_k).await?
            }
            Err(e) => {
                tracing::warn!(query = %request.query, error = %e, "Primary search failed, trying scan fallback");
                self.fallback_scan(&query_embedding, request, top_k).await?
            }
        };

        Ok(self.post_process(scored, &request.language, top_k))
    }

    /// Batch mode used by the checklist pipeline: one embedding call for all
    /// queries, one candidate fetch, per-chunk max-score deduplication.
    pub async fn retrieve_batch(
        &self,
        queries: &[String],
        indexing_run_id: Uuid,
        language: &str,
        top_k_per_query: usize,
    ) -> Result<Vec<RetrievedChunk>> {
        if queries.is_empty() {
            return Ok(vec![]);
        }

        let model = self.config.embedding_model.clone();
        let owned: Vec<String> = queries.to_vec();
        let query_embeddings = with_retry("embed_batch", || {
            with_timeout(
                "embedding",
                self.timeouts.embed(),
                self.embedder.embed(&owned, &model),
            )
        })
        .await?;

        let candidates = with_timeout(
            "datastore",
            self.timeouts.datastore(),
            self.store.chunks_for_run(indexing_run_id, true),
        )
        .await?;

        let min_threshold = self.config.minimum_threshold(language);
        let thresholds = self.config.thresholds_for_language(language);

        // CPU-bound scoring of every query against every candidate
        let scored = tokio::task::spawn_blocking(move || {
            let mut best: std::collections::HashMap<Uuid, (f32, usize)> = Default::default();
            for query_embedding in &query_embeddings {
                let mut per_query: Vec<(usize, f32)> = candidates
                    .iter()
                    .enumerate()
                    .filter_map(|(idx, chunk)| {
                        let embedding = chunk.embedding.as_ref()?;
                        let score = cosine_similarity(query_embedding, embedding);
                        (score >= min_threshold).then_some((idx, score))
                    })
                    .collect();
                per_query
                    .sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
                for (idx, score) in per_query.into_iter().take(top_k_per_query) {
                    let id = candidates[idx].id;
                    let entry = best.entry(id).or_insert((score, idx));
                    if score > entry.0 {
                        *entry = (score, idx);
                    }
                }
            }
            let mut union: Vec<(f32, usize)> = best.into_values().collect();
            union.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
            union
                .into_iter()
                .map(|(score, idx)| {
                    let chunk = &candidates[idx];
                    (chunk.clone(), score)
                })
                .collect::<Vec<_>>()
        })
        .await
        .map_err(|e| CoreError::Internal(anyhow::anyhow!("batch scoring task panicked: {e}")))?;

        Ok(scored
            .into_iter()
            .map(|(chunk, score)| RetrievedChunk {
                id: chunk.id,
                document_id: chunk.document_id,
                indexing_run_id: chunk.indexing_run_id,
                content: chunk.content,
                metadata: chunk.metadata,
                similarity: score,
                quality: quality_band(score, &thresholds),
            })
            .collect())
    }

    async fn primary_search(
        &self,
        query_embedding: &[f32],
        request: &SearchRequest,
        top_k: usize,
    ) -> Result<Vec<(ChunkMatch, f32)>> {
        let matches = with_timeout(
            "datastore",
            self.timeouts.datastore(),
            self.store.match_chunks(
                query_embedding,
                0.0,
                top_k * 2,
                request.indexing_run_id,
            ),
        )
        .await?;

        let filtered: Vec<ChunkMatch> = match &request.allowed_document_ids {
            Some(allowed) => matches
                .into_iter()
                .filter(|m| allowed.contains(&m.document_id))
                .collect(),
            None => matches,
        };

        // Recompute similarity locally where the stored embedding came back;
        // otherwise derive a rank-based pseudo-score.
        Ok(filtered
            .into_iter()
            .enumerate()
            .map(|(rank, m)| {
                let score = match &m.embedding {
                    Some(embedding) => cosine_similarity(query_embedding, embedding).max(0.0),
                    None => (1.0 - rank as f32 * 0.05).max(0.1),
                };
                (m, score)
            })
            .collect())
    }

    /// Scan every embedded chunk of the run and score client-side.
    async fn fallback_scan(
        &self,
        query_embedding: &[f32],
        request: &SearchRequest,
        top_k: usize,
    ) -> Result<Vec<(ChunkMatch, f32)>> {
        let Some(run_id) = request.indexing_run_id else {
            // nothing to scan without a run scope
            return Ok(vec![]);
        };

        let chunks = with_timeout(
            "datastore",
            self.timeouts.datastore(),
            self.store.chunks_for_run(run_id, true),
        )
        .await?;

        let allowed = request.allowed_document_ids.clone();
        let query_embedding = query_embedding.to_vec();
        let keep = top_k * 2;

        let scored = tokio::task::spawn_blocking(move || {
            let mut scored: Vec<(ChunkMatch, f32)> = chunks
                .into_iter()
                .filter(|c| {
                    allowed
                        .as_ref()
                        .map_or(true, |ids| ids.contains(&c.document_id))
                })
                .filter_map(|c| {
                    let embedding = c.embedding.clone()?;
                    let score = cosine_similarity(&query_embedding, &embedding);
                    Some((
                        ChunkMatch {
                            id: c.id,
                            document_id: c.document_id,
                            indexing_run_id: c.indexing_run_id,
                            content: c.content,
                            metadata: c.metadata,
                            embedding: Some(embedding),
                        },
                        score,
                    ))
                })
                .collect();
            scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
            scored.truncate(keep);
            scored
        })
        .await
        .map_err(|e| CoreError::Internal(anyhow::anyhow!("scan task panicked: {e}")))?;

        Ok(scored)
    }

    /// Threshold filter, content dedupe, sort, truncate.
    fn post_process(
        &self,
        scored: Vec<(ChunkMatch, f32)>,
        language: &str,
        top_k: usize,
    ) -> Vec<RetrievedChunk> {
        let min_threshold = self.config.minimum_threshold(language);
        let thresholds = self.config.thresholds_for_language(language);

        let filtered: Vec<(ChunkMatch, f32)> = scored
            .into_iter()
            .filter(|(_, score)| *score >= min_threshold)
            .collect();

        let deduped = deduplicate_by_content(filtered, |(m, _)| m.content.as_str());

        let mut results: Vec<RetrievedChunk> = deduped
            .into_iter()
            .map(|(m, score)| RetrievedChunk {
                id: m.id,
                document_id: m.document_id,
                indexing_run_id: m.indexing_run_id,
                content: m.content,
                metadata: m.metadata,
                similarity: score,
                quality: quality_band(score, &thresholds),
            })
            .collect();
        results.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        results.truncate(top_k);
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Chunk, ElementCategory};
    use crate::services::MockEmbeddingClient;
    use crate::store::{DataStore, MemoryDataStore};

    const DIMS: usize = 4;

    fn metadata(filename: &str, page: u32) -> ChunkMetadata {
        ChunkMetadata {
            page_number: page,
            element_category: ElementCategory::NarrativeText,
            source_filename: filename.to_string(),
            section_title_inherited: None,
            element_id: None,
            merged_from: vec![],
            enrichment: None,
        }
    }

    fn chunk(run: Uuid, ordinal: u32, content: &str, embedding: Vec<f32>) -> Chunk {
        Chunk {
            id: Uuid::new_v4(),
            document_id: Uuid::nil(),
            indexing_run_id: run,
            ordinal,
            content: content.to_string(),
            metadata: metadata("fag.pdf", 1),
            embedding: Some(embedding),
        }
    }

    fn core(
        store: Arc<MemoryDataStore>,
        embedder: Arc<MockEmbeddingClient>,
    ) -> RetrievalCore {
        let mut config = RetrievalConfig::default();
        config.dimensions = DIMS;
        RetrievalCore::new(store, embedder, config, TimeoutConfig::default())
    }

    /// Scenario: one strong Danish match at ~0.62, noise below 0.20.
    #[tokio::test]
    async fn danish_threshold_keeps_only_the_strong_match() {
        let store = Arc::new(MemoryDataStore::new());
        let embedder = Arc::new(MockEmbeddingClient::new(DIMS));
        let run = Uuid::new_v4();

        let query = "Hvor skal føringsvejene være?";
        embedder.pin(query, vec![1.0, 0.0, 0.0, 0.0]);

        // cos = 0.62 against the query direction
        let strong = vec![0.62, (1.0f32 - 0.62 * 0.62).sqrt(), 0.0, 0.0];
        // cos = 0.19, below the Danish minimum of 0.20
        let noise = vec![0.19, (1.0f32 - 0.19 * 0.19).sqrt(), 0.0, 0.0];

        store
            .insert_chunks(&[
                chunk(run, 0, "Føringsveje skal placeres over loft.", strong),
                chunk(run, 1, "Uvedkommende støj i bilag 7.", noise),
            ])
            .await
            .unwrap();

        let core = core(store, embedder);
        let request = SearchRequest::new(query).in_run(run).with_top_k(5);
        let results = core.retrieve(&request).await.unwrap();

        assert_eq!(results.len(), 1);
        assert!(results[0].content.contains("Føringsveje"));
        assert!((results[0].similarity - 0.62).abs() < 0.01);
        assert_eq!(results[0].quality, QualityBand::Good);
    }

    #[tokio::test]
    async fn retrieval_is_deterministic() {
        let store = Arc::new(MemoryDataStore::new());
        let embedder = Arc::new(MockEmbeddingClient::new(DIMS));
        let run = Uuid::new_v4();
        embedder.pin("q", vec![1.0, 0.0, 0.0, 0.0]);
        store
            .insert_chunks(&[
                chunk(run, 0, "alpha content", vec![0.9, 0.1, 0.0, 0.0]),
                chunk(run, 1, "beta content", vec![0.5, 0.5, 0.0, 0.0]),
            ])
            .await
            .unwrap();

        let core = core(store, embedder);
        let request = SearchRequest::new("q").in_run(run);
        let first = core.retrieve(&request).await.unwrap();
        let second = core.retrieve(&request).await.unwrap();
        assert_eq!(
            first.iter().map(|r| r.id).collect::<Vec<_>>(),
            second.iter().map(|r| r.id).collect::<Vec<_>>()
        );
    }

    #[tokio::test]
    async fn fallback_scan_runs_when_primary_fails() {
        let store = Arc::new(MemoryDataStore::new());
        let embedder = Arc::new(MockEmbeddingClient::new(DIMS));
        let run = Uuid::new_v4();
        embedder.pin("q", vec![1.0, 0.0, 0.0, 0.0]);
        store
            .insert_chunks(&[chunk(run, 0, "relevant", vec![0.8, 0.6, 0.0, 0.0])])
            .await
            .unwrap();
        store.set_match_chunks_failure(true);

        let core = core(store.clone(), embedder);
        let request = SearchRequest::new("q").in_run(run);
        let results = core.retrieve(&request).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].content, "relevant");
    }

    #[tokio::test]
    async fn duplicate_content_is_collapsed() {
        let store = Arc::new(MemoryDataStore::new());
        let embedder = Arc::new(MockEmbeddingClient::new(DIMS));
        let run = Uuid::new_v4();
        embedder.pin("q", vec![1.0, 0.0, 0.0, 0.0]);
        store
            .insert_chunks(&[
                chunk(run, 0, "same text appears twice", vec![0.9, 0.44, 0.0, 0.0]),
                chunk(run, 1, "same text appears twice", vec![0.8, 0.6, 0.0, 0.0]),
            ])
            .await
            .unwrap();

        let core = core(store, embedder);
        let results = core
            .retrieve(&SearchRequest::new("q").in_run(run))
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        // the higher-scored copy survives
        assert!((results[0].similarity - 0.9).abs() < 0.02);
    }

    #[tokio::test]
    async fn document_filter_applies_post_query() {
        let store = Arc::new(MemoryDataStore::new());
        let embedder = Arc::new(MockEmbeddingClient::new(DIMS));
        let run = Uuid::new_v4();
        let allowed_doc = Uuid::new_v4();
        embedder.pin("q", vec![1.0, 0.0, 0.0, 0.0]);

        let mut in_scope = chunk(run, 0, "in scope", vec![0.9, 0.44, 0.0, 0.0]);
        in_scope.document_id = allowed_doc;
        let out_of_scope = chunk(run, 1, "out of scope", vec![0.95, 0.31, 0.0, 0.0]);
        store.insert_chunks(&[in_scope, out_of_scope]).await.unwrap();

        let core = core(store, embedder);
        let mut request = SearchRequest::new("q").in_run(run);
        request.allowed_document_ids = Some(vec![allowed_doc]);
        let results = core.retrieve(&request).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].content, "in scope");
    }

    #[tokio::test]
    async fn batch_mode_unions_and_keeps_max_score() {
        let store = Arc::new(MemoryDataStore::new());
        let embedder = Arc::new(MockEmbeddingClient::new(DIMS));
        let run = Uuid::new_v4();
        embedder.pin("query one", vec![1.0, 0.0, 0.0, 0.0]);
        embedder.pin("query two", vec![0.0, 1.0, 0.0, 0.0]);

        store
            .insert_chunks(&[
                // matched by both queries, better under query two
                chunk(run, 0, "shared hit", vec![0.5, 0.86, 0.0, 0.0]),
                chunk(run, 1, "only query one", vec![0.99, 0.1, 0.0, 0.0]),
            ])
            .await
            .unwrap();

        let core = core(store, embedder);
        let results = core
            .retrieve_batch(
                &["query one".to_string(), "query two".to_string()],
                run,
                "danish",
                5,
            )
            .await
            .unwrap();

        assert_eq!(results.len(), 2);
        let shared = results.iter().find(|r| r.content == "shared hit").unwrap();
        assert!(shared.similarity > 0.8, "kept max score: {}", shared.similarity);
    }

    #[tokio::test]
    async fn empty_corpus_returns_empty() {
        let store = Arc::new(MemoryDataStore::new());
        let embedder = Arc::new(MockEmbeddingClient::new(DIMS));
        let core = core(store, embedder);
        let results = core
            .retrieve(&SearchRequest::new("anything").in_run(Uuid::new_v4()))
            .await
            .unwrap();
        assert!(results.is_empty());
    }
}
