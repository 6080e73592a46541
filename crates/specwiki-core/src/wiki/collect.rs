//! Wiki stage 1: metadata collection over the run's corpus.

use std::collections::BTreeMap;

use uuid::Uuid;

use crate::error::Result;
use crate::models::{MetadataCollectionOutput, WikiDocumentSummary};
use crate::store::DataStore;

pub async fn collect_metadata(
    store: &dyn DataStore,
    indexing_run_id: Uuid,
) -> Result<MetadataCollectionOutput> {
    let documents = store.documents_for_run(indexing_run_id).await?;
    let chunks = store.chunks_for_run(indexing_run_id, false).await?;

    let chunks_with_embeddings: Vec<Uuid> = chunks
        .iter()
        .filter(|c| c.embedding.is_some())
        .map(|c| c.id)
        .collect();

    let mut section_headers_distribution: BTreeMap<String, usize> = BTreeMap::new();
    for chunk in &chunks {
        if let Some(section) = &chunk.metadata.section_title_inherited {
            *section_headers_distribution
                .entry(section.clone())
                .or_insert(0) += 1;
        }
    }

    let output = MetadataCollectionOutput {
        indexing_run_id,
        total_documents: documents.len(),
        total_chunks: chunks.len(),
        documents: documents
            .into_iter()
            .map(|d| WikiDocumentSummary {
                id: d.id,
                filename: d.filename,
                size: d.byte_size,
                page_count: d.page_count,
            })
            .collect(),
        chunks_with_embeddings,
        section_headers_distribution,
    };

    tracing::info!(
        run = %indexing_run_id,
        documents = output.total_documents,
        chunks = output.total_chunks,
        embedded = output.chunks_with_embeddings.len(),
        sections = output.section_headers_distribution.len(),
        "Collected corpus metadata"
    );
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Chunk, ChunkMetadata, Document, ElementCategory};
    use crate::store::MemoryDataStore;

    fn chunk(run: Uuid, doc: Uuid, ordinal: u32, section: Option<&str>, embedded: bool) -> Chunk {
        Chunk {
            id: Uuid::new_v4(),
            document_id: doc,
            indexing_run_id: run,
            ordinal,
            content: format!("indhold {ordinal}"),
            metadata: ChunkMetadata {
                page_number: 1,
                element_category: ElementCategory::NarrativeText,
                source_filename: "doc.pdf".into(),
                section_title_inherited: section.map(String::from),
                element_id: None,
                merged_from: vec![],
                enrichment: None,
            },
            embedding: embedded.then(|| vec![0.1, 0.2]),
        }
    }

    #[tokio::test]
    async fn aggregates_documents_chunks_and_sections() {
        let store = MemoryDataStore::new();
        let run = Uuid::new_v4();
        let doc = Uuid::new_v4();
        store
            .upsert_document(&Document {
                id: doc,
                filename: "el-plan.pdf".into(),
                blob_key: "k".into(),
                page_count: Some(12),
                byte_size: 4096,
                owner_id: None,
            })
            .await
            .unwrap();
        // the junction drives document listing
        let parent = crate::models::IndexingRun::new(
            crate::models::AccessLevel::Private,
            crate::models::UploadKind::UserProject,
            serde_json::json!({}),
        );
        let parent = crate::models::IndexingRun { id: run, ..parent };
        store.create_indexing_run(&parent).await.unwrap();
        store.link_document_to_run(run, doc).await.unwrap();
        store
            .insert_chunks(&[
                chunk(run, doc, 0, Some("El-arbejde"), true),
                chunk(run, doc, 1, Some("El-arbejde"), true),
                chunk(run, doc, 2, Some("VVS"), false),
            ])
            .await
            .unwrap();

        let output = collect_metadata(&store, run).await.unwrap();
        assert_eq!(output.total_documents, 1);
        assert_eq!(output.total_chunks, 3);
        assert_eq!(output.chunks_with_embeddings.len(), 2);
        assert_eq!(output.section_headers_distribution["El-arbejde"], 2);
        assert_eq!(output.section_headers_distribution["VVS"], 1);
        assert_eq!(output.documents[0].filename, "el-plan.pdf");
    }
}
