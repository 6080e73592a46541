//! Answer service: retrieval plus answer synthesis.
//!
//! Retrieves the top chunks for a natural-language question and asks the
//! chat model for an answer with `filename, page N` citations. An empty
//! retrieval still produces an answer that says nothing relevant was found.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::PipelineConfig;
use crate::error::Result;
use crate::retrieval::similarity::QualityBand;
use crate::retrieval::{RetrievalCore, RetrievedChunk, SearchRequest};
use crate::services::{ChatClient, ChatRunner, EmbeddingClient, RateLimiters};
use crate::store::DataStore;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryAnswer {
    pub answer: String,
    pub chunks: Vec<RetrievedChunk>,
    /// Best quality band among the retrieved chunks, if any
    pub best_quality: Option<QualityBand>,
}

pub struct QueryService {
    retrieval: RetrievalCore,
    chat: Arc<dyn ChatClient>,
    limiters: RateLimiters,
    config: PipelineConfig,
}

impl QueryService {
    pub fn new(
        store: Arc<dyn DataStore>,
        embedder: Arc<dyn EmbeddingClient>,
        chat: Arc<dyn ChatClient>,
        limiters: RateLimiters,
        config: PipelineConfig,
    ) -> Self {
        let retrieval = RetrievalCore::new(
            store,
            embedder,
            config.query.retrieval.clone(),
            config.timeouts.clone(),
        );
        Self {
            retrieval,
            chat,
            limiters,
            config,
        }
    }

    pub fn retrieval(&self) -> &RetrievalCore {
        &self.retrieval
    }

    pub async fn answer(&self, request: &SearchRequest) -> Result<QueryAnswer> {
        let chunks = self.retrieval.retrieve(request).await?;

        let runner = ChatRunner {
            client: self.chat.as_ref(),
            bucket: self.limiters.chat.as_ref(),
            timeout: self.config.timeouts.chat(),
            model: self.config.query.model.clone(),
        };
        let prompt = answer_prompt(&request.query, &chunks, &request.language);
        let answer = runner.run(&prompt, 2000).await?;

        let best_quality = chunks.first().map(|c| c.quality);
        tracing::info!(
            query = %request.query,
            chunks = chunks.len(),
            answer_len = answer.len(),
            "Answered query"
        );
        Ok(QueryAnswer {
            answer,
            chunks,
            best_quality,
        })
    }
}

fn answer_prompt(query: &str, chunks: &[RetrievedChunk], language: &str) -> String {
    let excerpts = if chunks.is_empty() {
        "No relevant excerpts were found in the indexed documents.".to_string()
    } else {
        chunks
            .iter()
            .map(|c| {
                let body: String = c.content.chars().take(800).collect();
                format!("From {}, page {}:\n{}", c.source_filename(), c.page_number(), body)
            })
            .collect::<Vec<_>>()
            .join("\n\n")
    };

    format!(
        "Answer this question about a construction project using only the excerpts \
         below.\n\n\
         Question: {query}\n\n\
         Excerpts:\n{excerpts}\n\n\
         Cite sources as \"filename, page N\" after each claim. If the excerpts do not \
         contain the answer, say so plainly instead of guessing. Answer in {language}."
    )
}
