//! Embedding stage: the run-wide barrier that vectorizes every chunk.
//!
//! Runs only after all documents finished Chunking. Batches run concurrently
//! up to `batch_concurrency`; a failed batch is retried once whole, then its
//! chunks stay null-embedded and the run completes with warnings. Retrieval
//! excludes null embeddings, so a partial failure degrades recall, not
//! correctness.

use std::time::Instant;

use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::{EmbeddingConfig, TimeoutConfig};
use crate::error::{CoreError, Result};
use crate::models::{Chunk, EmbeddingOutput};
use crate::services::{with_timeout, EmbeddingClient, RateLimiters};
use crate::store::DataStore;

pub struct EmbeddingStage<'a> {
    pub store: &'a dyn DataStore,
    pub embedder: &'a dyn EmbeddingClient,
    pub limiters: &'a RateLimiters,
    pub timeouts: &'a TimeoutConfig,
    pub config: &'a EmbeddingConfig,
    pub batch_concurrency: usize,
}

enum BatchOutcome {
    Embedded { count: usize, elapsed_secs: f64 },
    Failed { chunk_ids: Vec<Uuid> },
}

impl EmbeddingStage<'_> {
    pub async fn run(
        &self,
        run_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<EmbeddingOutput> {
        let chunks = with_timeout(
            "datastore",
            self.timeouts.datastore(),
            self.store.chunks_for_run(run_id, false),
        )
        .await?;
        let pending: Vec<Chunk> = chunks.into_iter().filter(|c| c.embedding.is_none()).collect();

        if pending.is_empty() {
            return Ok(EmbeddingOutput {
                embeddings_generated: 0,
                embeddings_failed: 0,
                embedding_model: self.config.model.clone(),
                embedding_dimensions: self.config.dimensions,
                batch_size_used: self.config.batch_size,
                average_embedding_time_seconds: 0.0,
            });
        }

        let batch_size = self.config.batch_size.max(1);
        let batches: Vec<Vec<Chunk>> = pending
            .chunks(batch_size)
            .map(|batch| batch.to_vec())
            .collect();
        let batch_count = batches.len();

        let outcomes: Vec<Result<BatchOutcome>> = stream::iter(
            batches
                .into_iter()
                .map(|batch| self.embed_batch(batch, cancel)),
        )
        .buffer_unordered(self.batch_concurrency.max(1))
        .collect()
        .await;

        let mut generated = 0usize;
        let mut failed_ids: Vec<Uuid> = Vec::new();
        let mut total_elapsed = 0.0f64;
        for outcome in outcomes {
            match outcome? {
                BatchOutcome::Embedded {
                    count,
                    elapsed_secs,
                } => {
                    generated += count;
                    total_elapsed += elapsed_secs;
                }
                BatchOutcome::Failed { chunk_ids } => failed_ids.extend(chunk_ids),
            }
        }

        if generated == 0 && !failed_ids.is_empty() {
            // every batch failed twice: the stage is lost, the run fails
            return Err(CoreError::UpstreamUnavailable(format!(
                "embedding failed for all {} chunks",
                failed_ids.len()
            )));
        }

        tracing::info!(
            run = %run_id,
            generated,
            failed = failed_ids.len(),
            batches = batch_count,
            "Embedding stage finished"
        );

        Ok(EmbeddingOutput {
            embeddings_generated: generated,
            embeddings_failed: failed_ids.len(),
            embedding_model: self.config.model.clone(),
            embedding_dimensions: self.config.dimensions,
            batch_size_used: batch_size,
            average_embedding_time_seconds: if batch_count == 0 {
                0.0
            } else {
                total_elapsed / batch_count as f64
            },
        })
    }

    async fn embed_batch(
        &self,
        batch: Vec<Chunk>,
        cancel: &CancellationToken,
    ) -> Result<BatchOutcome> {
        if cancel.is_cancelled() {
            return Err(CoreError::Cancelled);
        }

        let texts: Vec<String> = batch.iter().map(|c| c.content.clone()).collect();
        let start = Instant::now();

        // one retry of the whole batch, then give up on it
        let mut vectors = None;
        for attempt in 0..2 {
            self.limiters.embedding.acquire().await;
            match with_timeout(
                "embedding",
                self.timeouts.embed(),
                self.embedder.embed(&texts, &self.config.model),
            )
            .await
            {
                Ok(embedded) => {
                    vectors = Some(embedded);
                    break;
                }
                Err(e) => {
                    tracing::warn!(
                        attempt,
                        batch_size = batch.len(),
                        error = %e,
                        "Embedding batch failed"
                    );
                }
            }
        }

        let Some(vectors) = vectors else {
            return Ok(BatchOutcome::Failed {
                chunk_ids: batch.iter().map(|c| c.id).collect(),
            });
        };

        if vectors.len() != batch.len()
            || vectors.iter().any(|v| v.len() != self.config.dimensions)
        {
            tracing::error!(
                expected = batch.len(),
                got = vectors.len(),
                "Embedding batch shape mismatch, leaving chunks null"
            );
            return Ok(BatchOutcome::Failed {
                chunk_ids: batch.iter().map(|c| c.id).collect(),
            });
        }

        let updates: Vec<(Uuid, Vec<f32>)> = batch
            .iter()
            .map(|c| c.id)
            .zip(vectors.into_iter())
            .collect();
        with_timeout(
            "datastore",
            self.timeouts.datastore(),
            self.store.update_chunk_embeddings(&updates),
        )
        .await?;

        Ok(BatchOutcome::Embedded {
            count: updates.len(),
            elapsed_secs: start.elapsed().as_secs_f64(),
        })
    }
}
