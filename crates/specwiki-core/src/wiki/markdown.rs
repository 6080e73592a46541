//! Wiki stage 6: markdown generation and persistence.
//!
//! One chat call per page; markdown lands in the object store under the
//! wiki run's prefix, and the page metadata (kebab filenames, unique within
//! the run) is recorded on the run.

use std::collections::BTreeMap;

use bytes::Bytes;

use crate::error::Result;
use crate::models::{MarkdownOutput, WikiPage, WikiPageMeta, WikiRun, WikiStructure};
use crate::retrieval::RetrievedChunk;
use crate::services::ChatRunner;
use crate::store::{wiki_page_key, ObjectStore};

pub async fn generate_markdown(
    chat: &ChatRunner<'_>,
    objects: &dyn ObjectStore,
    wiki_run: &WikiRun,
    structure: &WikiStructure,
    page_chunks: &BTreeMap<String, Vec<RetrievedChunk>>,
    language: &str,
) -> Result<(MarkdownOutput, Vec<WikiPage>)> {
    let mut pages_meta = Vec::with_capacity(structure.pages.len());
    let mut pages = Vec::with_capacity(structure.pages.len());
    let mut used_filenames = std::collections::HashSet::new();

    for (index, plan) in structure.pages.iter().enumerate() {
        let chunks = page_chunks.get(&plan.id).map(Vec::as_slice).unwrap_or(&[]);
        let prompt = page_prompt(plan.title.as_str(), &plan.description, chunks, language);
        let markdown = chat.run(&prompt, 6000).await?;

        let storage_key = wiki_page_key(wiki_run.id, index);
        objects
            .put(&storage_key, Bytes::from(markdown.clone()), "text/markdown")
            .await?;

        let filename = unique_filename(&plan.title, &mut used_filenames);
        tracing::info!(
            page = %plan.id,
            filename = %filename,
            markdown_len = markdown.len(),
            "Generated wiki page"
        );

        pages_meta.push(WikiPageMeta {
            id: plan.id.clone(),
            title: plan.title.clone(),
            description: plan.description.clone(),
            filename,
            storage_key: storage_key.clone(),
        });
        pages.push(WikiPage {
            id: plan.id.clone(),
            wiki_run_id: wiki_run.id,
            title: plan.title.clone(),
            description: plan.description.clone(),
            queries: plan.queries.clone(),
            markdown,
            storage_key,
        });
    }

    Ok((MarkdownOutput { pages: pages_meta }, pages))
}

fn page_prompt(
    title: &str,
    description: &str,
    chunks: &[RetrievedChunk],
    language: &str,
) -> String {
    let sources: Vec<String> = {
        let mut names: Vec<String> = chunks
            .iter()
            .map(|c| c.source_filename().to_string())
            .collect();
        names.sort();
        names.dedup();
        names
    };

    let excerpts = if chunks.is_empty() {
        "No relevant content was retrieved for this page.".to_string()
    } else {
        chunks
            .iter()
            .map(|c| {
                let body: String = c.content.chars().take(800).collect();
                format!("[{}, page {}]\n{}", c.source_filename(), c.page_number(), body)
            })
            .collect::<Vec<_>>()
            .join("\n\n")
    };

    format!(
        "Write the wiki page \"{title}\" for a construction project.\n\
         Page scope: {description}\n\n\
         Source documents: {}\n\n\
         Retrieved excerpts:\n{excerpts}\n\n\
         Requirements:\n\
         - Write in {language}, in markdown with clear headings.\n\
         - Cite every factual claim as [filename, page_number], e.g. [spec.pdf, 12].\n\
         - Add a Mermaid diagram where a process or hierarchy makes one useful.\n\
         - If no content was retrieved, write a short page stating that the source \
         material contains nothing on this topic; do not invent facts.",
        sources.join(", "),
    )
}

/// lowercase-kebab filename, unique within the run
fn unique_filename(
    title: &str,
    used: &mut std::collections::HashSet<String>,
) -> String {
    let base = kebab(title);
    let mut candidate = format!("{base}.md");
    let mut n = 2;
    while !used.insert(candidate.clone()) {
        candidate = format!("{base}-{n}.md");
        n += 1;
    }
    candidate
}

fn kebab(title: &str) -> String {
    let mut out = String::with_capacity(title.len());
    let mut last_dash = true;
    for c in title.to_lowercase().chars() {
        if c.is_alphanumeric() {
            out.push(c);
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    let trimmed = out.trim_end_matches('-');
    if trimmed.is_empty() {
        "page".to_string()
    } else {
        trimmed.to_string()
    }
}
