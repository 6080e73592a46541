//! Chunking stage: retrieval-friendly chunks without fragmentation or
//! oversized blocks.
//!
//! Base candidates come one-per-element (captions prepended for tables and
//! page images), oversized candidates are split on semantic boundaries with
//! overlap, and runs of small adjacent candidates in the same section merge
//! forward. Ordinals follow stable reading order.

use text_splitter::{ChunkConfig, TextSplitter};
use uuid::Uuid;

use crate::config::ChunkingConfig;
use crate::error::{CoreError, Result};
use crate::models::{
    Chunk, ChunkMetadata, ChunkingOutput, ChunkingStats, Element, ElementCategory,
    EnrichmentOutput, MergingStats, SplittingStats,
};

/// How many chunk bodies go into `sample_chunks`
const SAMPLE_COUNT: usize = 3;
const SAMPLE_LEN: usize = 200;

struct Candidate {
    content: String,
    page: u32,
    category: ElementCategory,
    source_filename: String,
    section: Option<String>,
    element_id: String,
    merged_from: Vec<String>,
    enrichment: Option<crate::models::EnrichmentMetadata>,
}

impl Candidate {
    fn char_len(&self) -> usize {
        self.content.chars().count()
    }

    fn is_mergeable(&self) -> bool {
        matches!(
            self.category,
            ElementCategory::NarrativeText
                | ElementCategory::ListItem
                | ElementCategory::UncategorizedText
                | ElementCategory::Title
        )
    }
}

pub fn run_chunking(
    input: EnrichmentOutput,
    config: &ChunkingConfig,
    indexing_run_id: Uuid,
) -> Result<ChunkingOutput> {
    if config.min_chunk_size >= config.max_chunk_size {
        return Err(CoreError::Config(format!(
            "min_chunk_size {} must be below max_chunk_size {}",
            config.min_chunk_size, config.max_chunk_size
        )));
    }

    let filename = input.document_metadata.filename.clone();
    let document_id = input.document_metadata.document_id;

    let candidates = base_candidates(&input, &filename);
    let (split, splitting_stats) = split_oversized(candidates, config)?;
    let (merged, merging_stats) = merge_small(split, config);

    let mut chunks = Vec::with_capacity(merged.len());
    for (ordinal, candidate) in merged.into_iter().enumerate() {
        debug_assert!(!candidate.content.is_empty());
        chunks.push(Chunk {
            id: Uuid::new_v4(),
            document_id,
            indexing_run_id,
            ordinal: ordinal as u32,
            content: candidate.content,
            metadata: ChunkMetadata {
                page_number: candidate.page,
                element_category: candidate.category,
                source_filename: candidate.source_filename,
                section_title_inherited: candidate.section,
                element_id: Some(candidate.element_id),
                merged_from: candidate.merged_from,
                enrichment: candidate.enrichment,
            },
            embedding: None,
        });
    }

    let total = chunks.len();
    let average_chunk_size = if total == 0 {
        0.0
    } else {
        chunks.iter().map(|c| c.content.chars().count()).sum::<usize>() as f64 / total as f64
    };
    let sample_chunks = chunks
        .iter()
        .take(SAMPLE_COUNT)
        .map(|c| c.content.chars().take(SAMPLE_LEN).collect())
        .collect();

    tracing::info!(
        document = %filename,
        chunks = total,
        avg_size = average_chunk_size as u64,
        split = splitting_stats.elements_split,
        merged = merging_stats.elements_merged,
        "Chunking finished"
    );

    Ok(ChunkingOutput {
        chunks,
        stats: ChunkingStats {
            total_chunks_created: total,
            average_chunk_size,
            splitting_stats,
            merging_stats,
        },
        sample_chunks,
    })
}

/// One candidate per element, captions folded into content.
fn base_candidates(input: &EnrichmentOutput, filename: &str) -> Vec<Candidate> {
    let mut ordered: Vec<(u32, usize, bool)> = Vec::new();
    for (idx, element) in input.text_elements.iter().enumerate() {
        ordered.push((element.page, idx, false));
    }
    for (idx, table) in input.table_elements.iter().enumerate() {
        ordered.push((table.element.page, idx, true));
    }
    ordered.sort_by_key(|(page, idx, is_table)| (*page, *is_table as u8, *idx));

    let mut candidates = Vec::new();
    for (_, idx, is_table) in ordered {
        let (element, content) = if is_table {
            let table = &input.table_elements[idx];
            (&table.element, element_content(&table.element))
        } else {
            let element = &input.text_elements[idx];
            (element, element_content(element))
        };
        if content.trim().is_empty() {
            continue;
        }
        candidates.push(Candidate {
            content,
            page: element.page,
            category: element.category,
            source_filename: element
                .structural
                .as_ref()
                .map(|s| s.source_filename.clone())
                .unwrap_or_else(|| filename.to_string()),
            section: element
                .structural
                .as_ref()
                .and_then(|s| s.section_title_inherited.clone()),
            element_id: element.id.clone(),
            merged_from: vec![],
            enrichment: element.enrichment.clone(),
        });
    }
    candidates
}

/// Captions first, original text after.
fn element_content(element: &Element) -> String {
    let mut parts: Vec<&str> = Vec::new();
    if let Some(enrichment) = &element.enrichment {
        if let Some(caption) = enrichment.table_image_caption.as_deref() {
            parts.push(caption);
        }
        if let Some(caption) = enrichment.table_html_caption.as_deref() {
            parts.push(caption);
        }
        if let Some(caption) = enrichment.full_page_image_caption.as_deref() {
            parts.push(caption);
        }
    }
    let text = element.text.trim();
    if !text.is_empty() {
        parts.push(text);
    }
    parts.join("\n\n")
}

fn split_oversized(
    candidates: Vec<Candidate>,
    config: &ChunkingConfig,
) -> Result<(Vec<Candidate>, SplittingStats)> {
    let splitter_config = ChunkConfig::new(config.max_chunk_size)
        .with_overlap(config.overlap)
        .map_err(|e| CoreError::Config(format!("invalid chunking config: {e}")))?;
    let splitter = TextSplitter::new(splitter_config);

    let mut stats = SplittingStats::default();
    let mut out = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        if candidate.char_len() <= config.max_chunk_size {
            out.push(candidate);
            continue;
        }
        let parts: Vec<String> = splitter
            .chunks(&candidate.content)
            .map(|s| s.to_string())
            .filter(|s| !s.trim().is_empty())
            .collect();
        stats.elements_split += 1;
        stats.sub_chunks_created += parts.len();
        for part in parts {
            out.push(Candidate {
                content: part,
                page: candidate.page,
                category: candidate.category,
                source_filename: candidate.source_filename.clone(),
                section: candidate.section.clone(),
                element_id: candidate.element_id.clone(),
                merged_from: vec![],
                enrichment: candidate.enrichment.clone(),
            });
        }
    }
    Ok((out, stats))
}

/// Greedy forward merge of small adjacent candidates.
///
/// A group keeps the metadata of its first element and records the ids it
/// swallowed. Merging stops when the group crosses `min_chunk_size`, the
/// section changes, pages stop being adjacent, or the next candidate is
/// itself large enough.
fn merge_small(candidates: Vec<Candidate>, config: &ChunkingConfig) -> (Vec<Candidate>, MergingStats) {
    let mut stats = MergingStats::default();
    let mut out: Vec<Candidate> = Vec::with_capacity(candidates.len());
    let mut iter = candidates.into_iter().peekable();

    while let Some(mut current) = iter.next() {
        if current.is_mergeable() && current.char_len() < config.min_chunk_size {
            let mut group_size = 0usize;
            let mut last_page = current.page;
            while current.char_len() < config.min_chunk_size {
                let absorb = match iter.peek() {
                    Some(next)
                        if next.is_mergeable()
                            && next.char_len() < config.min_chunk_size
                            && next.section == current.section
                            && next.page.saturating_sub(last_page) <= 1
                            && current.char_len() + next.char_len() + 2
                                <= config.max_chunk_size =>
                    {
                        true
                    }
                    _ => false,
                };
                if !absorb {
                    break;
                }
                let next = iter.next().expect("peeked");
                last_page = next.page;
                current.content.push_str("\n\n");
                current.content.push_str(&next.content);
                current.merged_from.push(next.element_id);
                group_size += 1;
            }
            if group_size > 0 {
                stats.merge_groups += 1;
                stats.elements_merged += group_size + 1;
            }
        }
        out.push(current);
    }
    (out, stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DocumentInfo, EnrichmentMetadata};
    use std::collections::BTreeMap;

    fn enrichment_output(text_elements: Vec<Element>) -> EnrichmentOutput {
        EnrichmentOutput {
            text_elements,
            table_elements: vec![],
            extracted_pages: BTreeMap::new(),
            document_metadata: DocumentInfo {
                document_id: Uuid::new_v4(),
                filename: "spec.pdf".into(),
                page_count: 3,
                byte_size: 10,
                content_hash: "h".into(),
            },
            page_sections: BTreeMap::new(),
            captions_generated: 0,
            captions_failed: 0,
        }
    }

    fn narrative(page: u32, text: &str) -> Element {
        Element::new(page, text, ElementCategory::NarrativeText)
    }

    fn config() -> ChunkingConfig {
        ChunkingConfig {
            min_chunk_size: 50,
            max_chunk_size: 200,
            overlap: 20,
            ..Default::default()
        }
    }

    #[test]
    fn no_chunk_is_empty_or_oversized() {
        let long = "En meget lang sætning om føringsveje og kabelbakker. ".repeat(20);
        let input = enrichment_output(vec![
            narrative(1, &long),
            narrative(1, ""),
            narrative(2, "Kort tekst."),
        ]);
        let config = config();
        let output = run_chunking(input, &config, Uuid::new_v4()).unwrap();

        assert!(!output.chunks.is_empty());
        for chunk in &output.chunks {
            let len = chunk.content.chars().count();
            assert!(len >= 1);
            assert!(len <= config.max_chunk_size + config.overlap, "{len}");
        }
        assert!(output.stats.splitting_stats.elements_split >= 1);
    }

    #[test]
    fn chunk_exactly_at_max_is_not_split() {
        let config = config();
        let exact = "x".repeat(config.max_chunk_size);
        let input = enrichment_output(vec![narrative(1, &exact)]);
        let output = run_chunking(input, &config, Uuid::new_v4()).unwrap();
        assert_eq!(output.chunks.len(), 1);
        assert_eq!(output.stats.splitting_stats.elements_split, 0);
    }

    #[test]
    fn single_small_chunk_is_emitted_as_is() {
        let input = enrichment_output(vec![narrative(1, "Kort.")]);
        let output = run_chunking(input, &config(), Uuid::new_v4()).unwrap();
        assert_eq!(output.chunks.len(), 1);
        assert_eq!(output.chunks[0].content, "Kort.");
        assert_eq!(output.stats.merging_stats.merge_groups, 0);
    }

    #[test]
    fn adjacent_small_chunks_merge_within_section() {
        let mut a = narrative(1, "Første korte del.");
        let mut b = narrative(1, "Anden korte del.");
        let mut c = narrative(2, "Tredje korte del.");
        for (el, section) in [(&mut a, "S1"), (&mut b, "S1"), (&mut c, "S1")] {
            el.structural = Some(crate::models::StructuralMetadata {
                source_filename: "spec.pdf".into(),
                page_number: el.page,
                content_type: "text".into(),
                element_category: el.category,
                element_id: el.id.clone(),
                has_numbers: false,
                text_complexity: crate::models::TextComplexity::Simple,
                section_title_inherited: Some(section.to_string()),
            });
        }
        let ids = vec![b.id.clone(), c.id.clone()];
        let input = enrichment_output(vec![a, b, c]);
        let output = run_chunking(input, &config(), Uuid::new_v4()).unwrap();

        assert_eq!(output.chunks.len(), 1);
        let merged = &output.chunks[0];
        assert!(merged.content.contains("Første"));
        assert!(merged.content.contains("Tredje"));
        assert_eq!(merged.metadata.merged_from, ids);
        assert_eq!(output.stats.merging_stats.merge_groups, 1);
        assert_eq!(output.stats.merging_stats.elements_merged, 3);
    }

    #[test]
    fn section_boundary_stops_merging() {
        let mut a = narrative(1, "Kort tekst i sektion et.");
        let mut b = narrative(1, "Kort tekst i sektion to.");
        for (el, section) in [(&mut a, "S1"), (&mut b, "S2")] {
            el.structural = Some(crate::models::StructuralMetadata {
                source_filename: "spec.pdf".into(),
                page_number: 1,
                content_type: "text".into(),
                element_category: ElementCategory::NarrativeText,
                element_id: el.id.clone(),
                has_numbers: false,
                text_complexity: crate::models::TextComplexity::Simple,
                section_title_inherited: Some(section.to_string()),
            });
        }
        let input = enrichment_output(vec![a, b]);
        let output = run_chunking(input, &config(), Uuid::new_v4()).unwrap();
        assert_eq!(output.chunks.len(), 2);
    }

    #[test]
    fn table_chunk_concatenates_captions_and_text() {
        let mut table_element = Element::new(2, "100 | 200", ElementCategory::Table);
        table_element.enrichment = Some(EnrichmentMetadata {
            vlm_model: "m".into(),
            table_image_caption: Some("Billedtekst for tabel.".into()),
            table_html_caption: Some("HTML-tekst for tabel.".into()),
            ..Default::default()
        });
        let mut input = enrichment_output(vec![]);
        input.table_elements.push(crate::models::TableElement {
            element: table_element,
            html: "<table/>".into(),
            image_key: None,
        });
        let output = run_chunking(input, &config(), Uuid::new_v4()).unwrap();

        assert_eq!(output.chunks.len(), 1);
        let content = &output.chunks[0].content;
        assert!(content.starts_with("Billedtekst for tabel."));
        assert!(content.contains("HTML-tekst for tabel."));
        assert!(content.ends_with("100 | 200"));
        assert_eq!(
            output.chunks[0].metadata.element_category,
            ElementCategory::Table
        );
    }

    #[test]
    fn extracted_page_chunk_is_the_caption() {
        let mut page_element = Element::new(1, "", ElementCategory::ExtractedPage);
        page_element.enrichment = Some(EnrichmentMetadata {
            vlm_model: "m".into(),
            full_page_image_caption: Some("Plantegning: mål, noter, legende.".into()),
            ..Default::default()
        });
        let input = enrichment_output(vec![page_element]);
        let output = run_chunking(input, &config(), Uuid::new_v4()).unwrap();
        assert_eq!(output.chunks.len(), 1);
        assert_eq!(output.chunks[0].content, "Plantegning: mål, noter, legende.");
    }

    #[test]
    fn ordinals_are_stable_reading_order() {
        let input = enrichment_output(vec![
            narrative(2, &"b".repeat(60)),
            narrative(1, &"a".repeat(60)),
            narrative(3, &"c".repeat(60)),
        ]);
        let output = run_chunking(input, &config(), Uuid::new_v4()).unwrap();
        let pages: Vec<u32> = output.chunks.iter().map(|c| c.metadata.page_number).collect();
        assert_eq!(pages, vec![1, 2, 3]);
        let ordinals: Vec<u32> = output.chunks.iter().map(|c| c.ordinal).collect();
        assert_eq!(ordinals, vec![0, 1, 2]);
    }

    #[test]
    fn empty_element_stream_yields_zero_chunks() {
        let input = enrichment_output(vec![]);
        let output = run_chunking(input, &config(), Uuid::new_v4()).unwrap();
        assert!(output.chunks.is_empty());
        assert_eq!(output.stats.total_chunks_created, 0);
    }
}
