//! Checklist stage 4: structure the free-form analysis into typed results.
//!
//! Three tiers: structured-output mode with a JSON schema, then plain JSON
//! extraction with field cleaning, then a `pending_clarification` record per
//! item. Whatever happens, every parsed item appears in the output exactly
//! once.

use std::collections::HashMap;

use serde_json::{json, Value};

use crate::error::Result;
use crate::json_repair::extract_json_array;
use crate::models::{ChecklistItem, ChecklistResult, ChecklistSource, ChecklistStatus};
use crate::services::{ChatOptions, ChatRunner};

pub async fn structure_analysis(
    chat: &ChatRunner<'_>,
    raw_analysis: &str,
    items: &[ChecklistItem],
    language: &str,
) -> Result<Vec<ChecklistResult>> {
    // Tier 1: structured output mode
    let schema_options = ChatOptions::new(chat.model.clone())
        .with_max_tokens(8000)
        .with_json_schema("checklist_results", results_schema());
    let prompt = structure_prompt(raw_analysis, items, language);

    let parsed = match chat.run_with_options(&prompt, &schema_options).await {
        Ok(response) => match parse_results(&response) {
            Ok(results) => Some(results),
            Err(e) => {
                tracing::warn!(error = %e, "Structured output unparseable, retrying plain");
                None
            }
        },
        Err(e) => {
            tracing::warn!(error = %e, "Structured output mode failed, retrying plain");
            None
        }
    };

    // Tier 2: plain completion + JSON extraction
    let parsed = match parsed {
        Some(results) => Some(results),
        None => match chat.run(&prompt, 8000).await {
            Ok(response) => match parse_results(&response) {
                Ok(results) => Some(results),
                Err(e) => {
                    tracing::warn!(error = %e, "Plain structuring unparseable, using fallback records");
                    None
                }
            },
            Err(e) => {
                tracing::warn!(error = %e, "Plain structuring failed, using fallback records");
                None
            }
        },
    };

    // Tier 3 + coverage guarantee: one record per parsed item, no more
    Ok(align_with_items(parsed.unwrap_or_default(), items))
}

/// Every checklist item appears exactly once; model-invented extras are
/// dropped, model-omitted items get a pending record with empty sources.
fn align_with_items(
    results: Vec<ChecklistResult>,
    items: &[ChecklistItem],
) -> Vec<ChecklistResult> {
    let mut by_number: HashMap<String, ChecklistResult> = HashMap::new();
    for result in results {
        by_number.entry(result.item_number.clone()).or_insert(result);
    }

    items
        .iter()
        .map(|item| {
            by_number.remove(&item.number).unwrap_or_else(|| {
                tracing::warn!(item = %item.number, "Analysis omitted item, marking pending");
                ChecklistResult {
                    item_number: item.number.clone(),
                    item_name: item.name.clone(),
                    status: ChecklistStatus::PendingClarification,
                    description: "The analysis did not address this item; manual review needed."
                        .to_string(),
                    confidence: Some(0.0),
                    primary_source: None,
                    sources: vec![],
                }
            })
        })
        .collect()
}

fn parse_results(response: &str) -> Result<Vec<ChecklistResult>> {
    let value = extract_json_array(response)?;
    let rows = match &value {
        Value::Array(rows) => rows.clone(),
        Value::Object(map) => map
            .get("results")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default(),
        _ => vec![],
    };
    Ok(rows.iter().filter_map(clean_result_item).collect())
}

/// Field cleaning: invalid status degrades to missing, confidence clamps to
/// [0, 1], null-ish strings drop.
fn clean_result_item(item: &Value) -> Option<ChecklistResult> {
    let item = item.as_object()?;

    let item_number = match item.get("item_number") {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => return None,
    };
    let status = item
        .get("status")
        .and_then(Value::as_str)
        .and_then(ChecklistStatus::parse)
        .unwrap_or(ChecklistStatus::Missing);
    let confidence = item
        .get("confidence_score")
        .or_else(|| item.get("confidence"))
        .and_then(Value::as_f64)
        .map(|v| (v as f32).clamp(0.0, 1.0));

    let sources: Vec<ChecklistSource> = item
        .get("sources")
        .and_then(Value::as_array)
        .map(|rows| rows.iter().filter_map(clean_source).collect())
        .unwrap_or_default();

    Some(ChecklistResult {
        item_number,
        item_name: clean_string(item.get("item_name")).unwrap_or_else(|| "Unknown".to_string()),
        status,
        description: clean_string(item.get("description"))
            .unwrap_or_else(|| "No description available".to_string()),
        confidence,
        primary_source: sources.first().cloned(),
        sources,
    })
}

fn clean_source(value: &Value) -> Option<ChecklistSource> {
    let source = value.as_object()?;
    let document = clean_string(source.get("document"))?;
    Some(ChecklistSource {
        document,
        page: source
            .get("page")
            .and_then(Value::as_i64)
            .and_then(|p| u32::try_from(p).ok()),
        excerpt: clean_string(source.get("excerpt")),
    })
}

fn clean_string(value: Option<&Value>) -> Option<String> {
    match value {
        Some(Value::String(s)) => {
            let trimmed = s.trim();
            if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("null") {
                None
            } else {
                Some(trimmed.to_string())
            }
        }
        _ => None,
    }
}

fn structure_prompt(raw_analysis: &str, items: &[ChecklistItem], language: &str) -> String {
    let items_text: Vec<String> = items
        .iter()
        .map(|item| format!("{}. {}", item.number, item.name))
        .collect();
    format!(
        "Convert this checklist analysis into a JSON array. One object per checklist \
         item, matching the item numbers exactly.\n\n\
         Checklist items:\n{}\n\n\
         Analysis:\n{raw_analysis}\n\n\
         Each object:\n\
         {{\"item_number\": \"1\", \"item_name\": \"...\", \"status\": \"found\", \
         \"description\": \"...\", \"confidence_score\": 0.8, \"sources\": \
         [{{\"document\": \"spec.pdf\", \"page\": 12, \"excerpt\": \"...\"}}]}}\n\n\
         status is exactly one of: found, missing, risk, conditions, \
         pending_clarification. Descriptions stay in {language}. Respond with the JSON \
         array only.",
        items_text.join("\n"),
    )
}

fn results_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "results": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "item_number": { "type": "string" },
                        "item_name": { "type": "string" },
                        "status": {
                            "type": "string",
                            "enum": ["found", "missing", "risk", "conditions", "pending_clarification"]
                        },
                        "description": { "type": "string" },
                        "confidence_score": { "type": "number" },
                        "sources": {
                            "type": "array",
                            "items": {
                                "type": "object",
                                "properties": {
                                    "document": { "type": "string" },
                                    "page": { "type": "integer" },
                                    "excerpt": { "type": "string" }
                                },
                                "required": ["document"]
                            }
                        }
                    },
                    "required": ["item_number", "item_name", "status", "description"]
                }
            }
        },
        "required": ["results"]
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TimeoutConfig;
    use crate::services::{MockChatClient, TokenBucket};

    fn runner(client: &MockChatClient) -> ChatRunner<'_> {
        ChatRunner {
            client,
            bucket: Box::leak(Box::new(TokenBucket::new(100.0, 100.0))),
            timeout: TimeoutConfig::default().chat(),
            model: "m".into(),
        }
    }

    fn items(n: usize) -> Vec<ChecklistItem> {
        (1..=n)
            .map(|i| ChecklistItem {
                number: i.to_string(),
                name: format!("Item {i}"),
                description: String::new(),
            })
            .collect()
    }

    #[tokio::test]
    async fn structured_output_parses_directly() {
        let client = MockChatClient::with_responses([r#"{"results": [
            {"item_number": "1", "item_name": "Item 1", "status": "found",
             "description": "Findes i spec.pdf", "confidence_score": 0.9,
             "sources": [{"document": "spec.pdf", "page": 3, "excerpt": "..."}]},
            {"item_number": "2", "item_name": "Item 2", "status": "missing",
             "description": "Ikke fundet", "confidence_score": 0.7, "sources": []}
        ]}"#]);
        let results = structure_analysis(&runner(&client), "analysis", &items(2), "danish")
            .await
            .unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].status, ChecklistStatus::Found);
        assert_eq!(results[0].primary_source.as_ref().unwrap().document, "spec.pdf");
        assert_eq!(results[0].primary_source.as_ref().unwrap().page, Some(3));
        assert_eq!(results[1].status, ChecklistStatus::Missing);
        // only one chat call: tier 1 sufficed
        assert_eq!(client.call_count(), 1);
    }

    /// Scenario: 7 items, the analysis covers only 5. The two omitted
    /// items come back pending with empty sources.
    #[tokio::test]
    async fn omitted_items_become_pending_clarification() {
        let covered: Vec<String> = (1..=5)
            .map(|i| {
                format!(
                    r#"{{"item_number": "{i}", "item_name": "Item {i}", "status": "found", "description": "ok"}}"#
                )
            })
            .collect();
        let response = format!(r#"{{"results": [{}]}}"#, covered.join(","));
        let client = MockChatClient::with_responses([response]);

        let results = structure_analysis(&runner(&client), "analysis", &items(7), "danish")
            .await
            .unwrap();
        assert_eq!(results.len(), 7);
        for result in &results[..5] {
            assert_eq!(result.status, ChecklistStatus::Found);
        }
        for result in &results[5..] {
            assert_eq!(result.status, ChecklistStatus::PendingClarification);
            assert!(result.sources.is_empty());
        }
    }

    #[tokio::test]
    async fn tier_two_extracts_json_from_prose() {
        let client = MockChatClient::with_responses([
            // tier 1: no JSON at all
            "I could not produce the structured format.",
            // tier 2: array embedded in prose
            r#"Here are the results: [{"item_number": "1", "item_name": "Item 1", "status": "RISK", "description": "d"}]"#,
        ]);
        let results = structure_analysis(&runner(&client), "analysis", &items(1), "english")
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        // status parsing is case-insensitive via cleaning
        assert_eq!(results[0].status, ChecklistStatus::Risk);
        assert_eq!(client.call_count(), 2);
    }

    #[tokio::test]
    async fn total_failure_yields_fallback_records() {
        let client = MockChatClient::with_responses(["garbage", "more garbage"]);
        let results = structure_analysis(&runner(&client), "analysis", &items(3), "english")
            .await
            .unwrap();
        assert_eq!(results.len(), 3);
        assert!(results
            .iter()
            .all(|r| r.status == ChecklistStatus::PendingClarification));
    }

    #[tokio::test]
    async fn invalid_status_degrades_to_missing_and_confidence_clamps() {
        let client = MockChatClient::with_responses([r#"{"results": [
            {"item_number": "1", "item_name": "Item 1", "status": "PARTIALLY_FOUND",
             "description": "d", "confidence_score": 1.7}
        ]}"#]);
        let results = structure_analysis(&runner(&client), "analysis", &items(1), "english")
            .await
            .unwrap();
        assert_eq!(results[0].status, ChecklistStatus::Missing);
        assert_eq!(results[0].confidence, Some(1.0));
    }

    #[tokio::test]
    async fn duplicate_and_extra_items_are_dropped() {
        let client = MockChatClient::with_responses([r#"{"results": [
            {"item_number": "1", "item_name": "Item 1", "status": "found", "description": "first"},
            {"item_number": "1", "item_name": "Item 1", "status": "missing", "description": "dup"},
            {"item_number": "99", "item_name": "Invented", "status": "found", "description": "x"}
        ]}"#]);
        let results = structure_analysis(&runner(&client), "analysis", &items(1), "english")
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].description, "first");
    }
}
