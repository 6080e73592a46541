//! Wiki stage 4: structure generation.
//!
//! One chat call plans the wiki: title, description and a page list with
//! retrieval queries. The response goes through the full JSON repair ladder,
//! and validation guarantees an overview page leads the structure.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::config::WikiGenerationConfig;
use crate::error::{CoreError, Result};
use crate::json_repair::extract_json_object;
use crate::models::{ClusterSummary, WikiPagePlan, WikiStructure};
use crate::services::ChatRunner;

pub async fn generate_structure(
    chat: &ChatRunner<'_>,
    overview: &str,
    cluster_summaries: &[ClusterSummary],
    section_headers: &BTreeMap<String, usize>,
    config: &WikiGenerationConfig,
    language: &str,
) -> Result<WikiStructure> {
    let prompt = structure_prompt(overview, cluster_summaries, section_headers, config, language);
    let response = chat.run(&prompt, 4000).await?;

    let value = extract_json_object(&response)?;
    let mut structure = parse_structure(value)?;
    validate_structure(&mut structure, config, language);
    Ok(structure)
}

fn structure_prompt(
    overview: &str,
    cluster_summaries: &[ClusterSummary],
    section_headers: &BTreeMap<String, usize>,
    config: &WikiGenerationConfig,
    language: &str,
) -> String {
    let clusters = if cluster_summaries.is_empty() {
        "(no clustering available)".to_string()
    } else {
        cluster_summaries
            .iter()
            .map(|c| format!("- {} ({} chunks)", c.cluster_name, c.chunk_count))
            .collect::<Vec<_>>()
            .join("\n")
    };
    let sections = section_headers
        .iter()
        .take(30)
        .map(|(title, count)| format!("- {title} ({count})"))
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        "Plan a documentation wiki for this construction project.\n\n\
         Project overview:\n{overview}\n\n\
         Thematic clusters in the corpus:\n{clusters}\n\n\
         Section headers found in the documents:\n{sections}\n\n\
         Produce at most {max_pages} pages; the first page must be a project overview. \
         For each page give up to {queries_per_page} search queries that would retrieve \
         its content from the documents. Write titles, descriptions and queries in \
         {language}.\n\n\
         Respond with JSON only:\n\
         {{\n  \"title\": \"...\",\n  \"description\": \"...\",\n  \"pages\": [\n    \
         {{\"id\": \"page-id\", \"title\": \"...\", \"description\": \"...\", \
         \"queries\": [\"...\"], \"relevance_score\": 0.9}}\n  ]\n}}",
        max_pages = config.max_pages,
        queries_per_page = config.queries_per_page,
    )
}

fn parse_structure(value: Value) -> Result<WikiStructure> {
    let title = value
        .get("title")
        .and_then(Value::as_str)
        .unwrap_or("Project Wiki")
        .to_string();
    let description = value
        .get("description")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let pages_value = value
        .get("pages")
        .and_then(Value::as_array)
        .ok_or_else(|| {
            CoreError::UpstreamMalformedResponse("structure response has no pages array".into())
        })?;

    let mut pages = Vec::new();
    for (idx, page) in pages_value.iter().enumerate() {
        let Some(title) = page.get("title").and_then(Value::as_str) else {
            continue; // a truncated trailing page commonly lacks fields
        };
        let id = page
            .get("id")
            .and_then(Value::as_str)
            .map(|s| s.to_string())
            .unwrap_or_else(|| format!("page-{}", idx + 1));
        let queries = page
            .get("queries")
            .and_then(Value::as_array)
            .map(|qs| {
                qs.iter()
                    .filter_map(Value::as_str)
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();
        pages.push(WikiPagePlan {
            id,
            title: title.to_string(),
            description: page
                .get("description")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            queries,
            relevance_score: page
                .get("relevance_score")
                .and_then(Value::as_f64)
                .map(|v| v as f32),
        });
    }

    Ok(WikiStructure {
        title,
        description,
        pages,
    })
}

/// Enforce the structural guarantees the rest of the pipeline relies on:
/// an overview page leads, budgets hold, and every page can retrieve.
fn validate_structure(structure: &mut WikiStructure, config: &WikiGenerationConfig, language: &str) {
    let has_overview = structure.pages.iter().any(|p| {
        let title = p.title.to_lowercase();
        title.contains("overview") || title.contains("oversigt")
    });
    if !has_overview {
        tracing::warn!("Structure has no overview page, synthesizing one");
        structure.pages.insert(0, synthesized_overview(language));
    }

    structure.pages.truncate(config.max_pages.max(1));

    for page in &mut structure.pages {
        page.queries.truncate(config.queries_per_page.max(1));
        if page.queries.is_empty() {
            // a page must be able to retrieve something
            page.queries.push(page.title.clone());
        }
    }

    // page ids must be unique; later duplicates get a suffix
    let mut seen = std::collections::HashSet::new();
    for page in &mut structure.pages {
        let mut candidate = page.id.clone();
        let mut n = 2;
        while !seen.insert(candidate.clone()) {
            candidate = format!("{}-{n}", page.id);
            n += 1;
        }
        page.id = candidate;
    }
}

fn synthesized_overview(language: &str) -> WikiPagePlan {
    if language.eq_ignore_ascii_case("danish") {
        WikiPagePlan {
            id: "oversigt".into(),
            title: "Projektoversigt".into(),
            description: "Overordnet oversigt over projektet og dets dokumenter.".into(),
            queries: vec![
                "Hvad handler projektet om?".into(),
                "Hvilke arbejder indgår i projektet?".into(),
            ],
            relevance_score: Some(1.0),
        }
    } else {
        WikiPagePlan {
            id: "overview".into(),
            title: "Project Overview".into(),
            description: "High-level overview of the project and its documents.".into(),
            queries: vec![
                "What is the project about?".into(),
                "What work is included in the project?".into(),
            ],
            relevance_score: Some(1.0),
        }
    }
}
