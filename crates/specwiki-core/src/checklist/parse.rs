//! Checklist stage 1: parse the raw checklist and generate search queries.

use serde_json::Value;

use crate::error::{CoreError, Result};
use crate::json_repair::extract_json_object;
use crate::models::{ChecklistItem, ChecklistParseOutput};
use crate::services::ChatRunner;

pub async fn parse_checklist(
    chat: &ChatRunner<'_>,
    checklist_content: &str,
    language: &str,
) -> Result<ChecklistParseOutput> {
    if checklist_content.trim().is_empty() {
        return Err(CoreError::InvalidInput("checklist is empty".into()));
    }

    let prompt = parse_prompt(checklist_content, language);
    let response = chat.run(&prompt, 2000).await?;
    let value = extract_json_object(&response)?;

    let items = parse_items(&value)?;
    let queries: Vec<String> = value
        .get("queries")
        .and_then(Value::as_array)
        .map(|qs| {
            qs.iter()
                .filter_map(Value::as_str)
                .map(String::from)
                .filter(|q| !q.trim().is_empty())
                .collect()
        })
        .unwrap_or_default();

    if queries.is_empty() {
        return Err(CoreError::UpstreamMalformedResponse(
            "checklist parse produced no search queries".into(),
        ));
    }

    tracing::info!(
        items = items.len(),
        queries = queries.len(),
        "Parsed checklist"
    );
    Ok(ChecklistParseOutput { items, queries })
}

fn parse_items(value: &Value) -> Result<Vec<ChecklistItem>> {
    let raw_items = value
        .get("items")
        .and_then(Value::as_array)
        .ok_or_else(|| {
            CoreError::UpstreamMalformedResponse("checklist parse response has no items".into())
        })?;

    let items: Vec<ChecklistItem> = raw_items
        .iter()
        .enumerate()
        .filter_map(|(idx, item)| {
            let name = item.get("name").and_then(Value::as_str)?;
            Some(ChecklistItem {
                number: item
                    .get("number")
                    .map(|n| match n {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .unwrap_or_else(|| (idx + 1).to_string()),
                name: name.to_string(),
                description: item
                    .get("description")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            })
        })
        .collect();

    if items.is_empty() {
        return Err(CoreError::UpstreamMalformedResponse(
            "checklist parse produced no items".into(),
        ));
    }
    Ok(items)
}

fn parse_prompt(checklist_content: &str, language: &str) -> String {
    format!(
        "Parse this construction checklist and generate search queries.\n\n\
         For each checklist item, create 1-3 specific search queries that would find \
         relevant information in construction documents. Simple items get 1 query, broad \
         items get up to 3. Queries should target technical specifications, requirements \
         and standards, installation details, safety and compliance, material properties \
         and quality control.\n\n\
         Checklist:\n{checklist_content}\n\n\
         Output in {language} as JSON:\n\
         {{\n  \"items\": [\n    {{\"number\": \"1\", \"name\": \"Item name\", \
         \"description\": \"What to look for\"}}\n  ],\n  \"queries\": [\"query 1\", \
         \"query 2\"]\n}}\n\n\
         Item numbers must match the checklist structure (plain numbers or nested like \
         1.1). Output valid JSON only."
    )
}
