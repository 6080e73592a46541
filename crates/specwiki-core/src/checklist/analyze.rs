//! Checklist stage 3: free-form analysis of retrieved chunks against the
//! checklist items.

use crate::error::Result;
use crate::models::ChecklistItem;
use crate::retrieval::RetrievedChunk;
use crate::services::ChatRunner;

/// Character budget per chunk excerpt in the prompt
const EXCERPT_LEN: usize = 800;

pub async fn analyze_checklist(
    chat: &ChatRunner<'_>,
    items: &[ChecklistItem],
    chunks: &[RetrievedChunk],
    language: &str,
    max_chunks: usize,
) -> Result<String> {
    let prompt = analysis_prompt(items, chunks, language, max_chunks);
    let analysis = chat.run(&prompt, 4000).await?;
    tracing::info!(
        items = items.len(),
        chunks = chunks.len().min(max_chunks),
        analysis_len = analysis.len(),
        "Checklist analysis complete"
    );
    Ok(analysis)
}

fn analysis_prompt(
    items: &[ChecklistItem],
    chunks: &[RetrievedChunk],
    language: &str,
    max_chunks: usize,
) -> String {
    let items_text: Vec<String> = items
        .iter()
        .map(|item| format!("{}. {}: {}", item.number, item.name, item.description))
        .collect();

    let chunks_text = if chunks.is_empty() {
        "No relevant excerpts were retrieved from the documents.".to_string()
    } else {
        chunks
            .iter()
            .take(max_chunks)
            .map(|chunk| {
                let body: String = chunk.content.chars().take(EXCERPT_LEN).collect();
                format!(
                    "From {}, Page {}:\n{}",
                    chunk.source_filename(),
                    chunk.page_number(),
                    body
                )
            })
            .collect::<Vec<_>>()
            .join("\n\n")
    };

    format!(
        "You are a construction professional reviewing project documents to verify \
         compliance with a checklist.\n\n\
         For each checklist item, state a status:\n\
         - FOUND: the information is present and complete in the documents.\n\
         - MISSING: the required information is absent.\n\
         - RISK: information exists but presents risks or concerns.\n\
         - CONDITIONS: requirements are met only under stated conditions.\n\n\
         For each item, also describe what was found or what is missing, answering the \
         item where possible.\n\n\
         IMPORTANT: cite the actual document name and page number directly (e.g. \"as \
         specified in drawings.pdf, page 5\"). Never write \"Document Excerpt\" or \
         \"Excerpt 1\".\n\n\
         Write the analysis in {language} as detailed text, going through each checklist \
         item in order.\n\n\
         Checklist items to analyze:\n{}\n\n\
         Retrieved document excerpts:\n{}",
        items_text.join("\n"),
        chunks_text,
    )
}
