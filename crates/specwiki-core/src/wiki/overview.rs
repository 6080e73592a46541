//! Wiki stage 2: overview generation.
//!
//! A fixed set of domain queries sweeps the corpus; the union of retrieved
//! chunks plus the document list feeds one chat call that writes a 2-4
//! paragraph project summary.

use std::collections::BTreeMap;

use uuid::Uuid;

use crate::error::Result;
use crate::models::{MetadataCollectionOutput, OverviewData, OverviewOutput};
use crate::retrieval::{RetrievalCore, RetrievedChunk, SearchRequest};
use crate::services::ChatRunner;

/// Domain queries driving the overview sweep, per language.
///
/// Order matters: the list is truncated to `overview_query_count`.
pub fn overview_queries(language: &str, count: usize) -> Vec<String> {
    let queries: &[&str] = if language.eq_ignore_ascii_case("danish") {
        &[
            "Hvad handler projektet om?",
            "Hvilke bygninger eller anlæg indgår i byggeriet?",
            "Hvilke tekniske installationer indgår?",
            "Hvad er tidsplanen for projektet?",
            "Hvilke entreprenører og fagområder er involveret?",
            "Hvilke krav stilles til sikkerhed og arbejdsmiljø?",
            "Hvilke materialer og produkter foreskrives?",
            "Hvilke standarder og normer henvises der til?",
            "Hvordan er kvalitetssikringen organiseret?",
            "Hvad omfatter el-arbejdet?",
            "Hvad omfatter VVS- og ventilationsarbejdet?",
            "Hvilke særlige betingelser gælder for byggepladsen?",
        ]
    } else {
        &[
            "What is the project about?",
            "Which buildings or structures are part of the construction?",
            "Which technical systems are included?",
            "What is the project schedule?",
            "Which contractors and trades are involved?",
            "What are the safety and working environment requirements?",
            "Which materials and products are specified?",
            "Which standards and codes are referenced?",
            "How is quality assurance organized?",
            "What does the electrical work comprise?",
            "What does the plumbing and ventilation work comprise?",
            "Which special conditions apply to the site?",
        ]
    };
    queries
        .iter()
        .take(count.max(1))
        .map(|q| q.to_string())
        .collect()
}

pub async fn generate_overview(
    retrieval: &RetrievalCore,
    chat: &ChatRunner<'_>,
    metadata: &MetadataCollectionOutput,
    indexing_run_id: Uuid,
    language: &str,
    query_count: usize,
) -> Result<(OverviewOutput, Vec<RetrievedChunk>)> {
    let queries = overview_queries(language, query_count);

    let mut union: Vec<RetrievedChunk> = Vec::new();
    let mut query_results: BTreeMap<String, usize> = BTreeMap::new();
    for query in &queries {
        let request = SearchRequest::new(query.clone())
            .in_run(indexing_run_id)
            .with_language(language.to_string());
        let results = retrieval.retrieve(&request).await?;
        query_results.insert(query.clone(), results.len());
        for result in results {
            if !union.iter().any(|c| c.id == result.id) {
                union.push(result);
            }
        }
    }

    let prompt = overview_prompt(metadata, &union, language);
    let project_overview = chat.run(&prompt, 2000).await?;

    tracing::info!(
        run = %indexing_run_id,
        queries = queries.len(),
        chunks = union.len(),
        overview_len = project_overview.len(),
        "Generated project overview"
    );

    Ok((
        OverviewOutput {
            project_overview,
            overview_queries: queries,
            overview_data: OverviewData {
                retrieved_chunks: union.len(),
                query_results,
            },
        },
        union,
    ))
}

fn overview_prompt(
    metadata: &MetadataCollectionOutput,
    chunks: &[RetrievedChunk],
    language: &str,
) -> String {
    let document_list: Vec<String> = metadata
        .documents
        .iter()
        .map(|d| {
            format!(
                "- {} ({} pages)",
                d.filename,
                d.page_count.map_or("?".to_string(), |n| n.to_string())
            )
        })
        .collect();

    let excerpts = if chunks.is_empty() {
        "No relevant content could be retrieved from the documents.".to_string()
    } else {
        chunks
            .iter()
            .take(20)
            .map(|c| {
                let body: String = c.content.chars().take(500).collect();
                format!("From {}, page {}:\n{}", c.source_filename(), c.page_number(), body)
            })
            .collect::<Vec<_>>()
            .join("\n\n")
    };

    format!(
        "You are summarizing a construction project from its tender documents.\n\n\
         Documents in the project:\n{}\n\n\
         Representative excerpts:\n{}\n\n\
         Write a 2-4 paragraph overview of the project: what is being built, the main \
         technical scopes, the parties involved and the overall schedule, as far as the \
         material shows. If the excerpts contain no usable content, say so explicitly and \
         describe what the document list suggests instead. Write in {}.",
        document_list.join("\n"),
        excerpts,
        language
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_list_is_language_dependent_and_truncated() {
        let danish = overview_queries("danish", 5);
        assert_eq!(danish.len(), 5);
        assert!(danish[0].contains("projektet"));

        let english = overview_queries("english", 12);
        assert_eq!(english.len(), 12);
        assert!(english[0].contains("project"));
    }

    #[test]
    fn empty_corpus_prompt_acknowledges_absence() {
        let metadata = MetadataCollectionOutput {
            indexing_run_id: Uuid::new_v4(),
            total_documents: 1,
            total_chunks: 0,
            documents: vec![],
            chunks_with_embeddings: vec![],
            section_headers_distribution: Default::default(),
        };
        let prompt = overview_prompt(&metadata, &[], "danish");
        assert!(prompt.contains("No relevant content could be retrieved"));
    }
}
