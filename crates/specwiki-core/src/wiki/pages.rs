//! Wiki stage 5: per-page content retrieval.
//!
//! Every page runs its planned queries against the retrieval core; results
//! union per page with max-score dedupe and the top 10 survive.

use std::collections::BTreeMap;

use uuid::Uuid;

use crate::error::Result;
use crate::models::{PageContent, PageRetrievalOutput, WikiStructure};
use crate::retrieval::{RetrievalCore, RetrievedChunk, SearchRequest};

/// Chunks kept per page after the union
const CHUNKS_PER_PAGE: usize = 10;

pub async fn retrieve_page_contents(
    retrieval: &RetrievalCore,
    structure: &WikiStructure,
    indexing_run_id: Uuid,
    language: &str,
) -> Result<(PageRetrievalOutput, BTreeMap<String, Vec<RetrievedChunk>>)> {
    let mut page_contents = BTreeMap::new();
    let mut page_chunks = BTreeMap::new();

    for page in &structure.pages {
        let mut union: Vec<RetrievedChunk> = Vec::new();
        for query in &page.queries {
            let request = SearchRequest::new(query.clone())
                .in_run(indexing_run_id)
                .with_language(language.to_string());
            for result in retrieval.retrieve(&request).await? {
                match union.iter_mut().find(|c| c.id == result.id) {
                    Some(existing) => {
                        if result.similarity > existing.similarity {
                            *existing = result;
                        }
                    }
                    None => union.push(result),
                }
            }
        }
        union.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        union.truncate(CHUNKS_PER_PAGE);

        let mut source_documents: Vec<String> = union
            .iter()
            .map(|c| c.source_filename().to_string())
            .collect();
        source_documents.sort();
        source_documents.dedup();

        tracing::debug!(
            page = %page.id,
            queries = page.queries.len(),
            chunks = union.len(),
            "Retrieved page content"
        );

        page_contents.insert(
            page.id.clone(),
            PageContent {
                retrieved_chunks: union.iter().map(|c| c.id).collect(),
                source_documents,
            },
        );
        page_chunks.insert(page.id.clone(), union);
    }

    Ok((PageRetrievalOutput { page_contents }, page_chunks))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::config::{RetrievalConfig, TimeoutConfig};
    use crate::models::{Chunk, ChunkMetadata, ElementCategory, WikiPagePlan};
    use crate::services::MockEmbeddingClient;
    use crate::store::{DataStore, MemoryDataStore};

    const DIMS: usize = 4;

    fn chunk(run: Uuid, ordinal: u32, content: &str, embedding: Vec<f32>) -> Chunk {
        Chunk {
            id: Uuid::new_v4(),
            document_id: Uuid::nil(),
            indexing_run_id: run,
            ordinal,
            content: content.to_string(),
            metadata: ChunkMetadata {
                page_number: 1,
                element_category: ElementCategory::NarrativeText,
                source_filename: "el.pdf".into(),
                section_title_inherited: None,
                element_id: None,
                merged_from: vec![],
                enrichment: None,
            },
            embedding: Some(embedding),
        }
    }

    #[tokio::test]
    async fn pages_get_unioned_deduped_content() {
        let store = Arc::new(MemoryDataStore::new());
        let embedder = Arc::new(MockEmbeddingClient::new(DIMS));
        let run = Uuid::new_v4();
        embedder.pin("tavler", vec![1.0, 0.0, 0.0, 0.0]);
        embedder.pin("kabler", vec![0.0, 1.0, 0.0, 0.0]);

        store
            .insert_chunks(&[
                chunk(run, 0, "Tavleanlæg i kælder.", vec![0.95, 0.31, 0.0, 0.0]),
                chunk(run, 1, "Kabler på bakker.", vec![0.31, 0.95, 0.0, 0.0]),
            ])
            .await
            .unwrap();

        let mut config = RetrievalConfig::default();
        config.dimensions = DIMS;
        let retrieval =
            RetrievalCore::new(store, embedder, config, TimeoutConfig::default());

        let structure = WikiStructure {
            title: "T".into(),
            description: "".into(),
            pages: vec![WikiPagePlan {
                id: "el".into(),
                title: "El".into(),
                description: "".into(),
                queries: vec!["tavler".into(), "kabler".into()],
                relevance_score: None,
            }],
        };

        let (output, chunks) =
            retrieve_page_contents(&retrieval, &structure, run, "danish")
                .await
                .unwrap();
        let content = &output.page_contents["el"];
        assert_eq!(content.retrieved_chunks.len(), 2);
        assert_eq!(content.source_documents, vec!["el.pdf".to_string()]);
        assert_eq!(chunks["el"].len(), 2);
        // both chunks matched both queries; each keeps its best score
        assert!(chunks["el"].iter().all(|c| c.similarity > 0.9));
    }
}
