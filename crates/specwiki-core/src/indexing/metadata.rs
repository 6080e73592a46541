//! Metadata stage: structural metadata and section-title inheritance.
//!
//! Elements are swept in reading order; a Title-like element becomes the
//! inherited section for everything after it, across page boundaries, until
//! the next Title shows up.

use std::collections::BTreeMap;

use regex::Regex;

use crate::error::Result;
use crate::models::{
    Element, ElementCategory, MetadataOutput, PartitionOutput, StructuralMetadata, TextComplexity,
};

/// Longest section title carried forward
const MAX_SECTION_TITLE_LEN: usize = 200;

pub fn run_metadata(input: PartitionOutput) -> Result<MetadataOutput> {
    if input.text_elements.is_empty()
        && input.table_elements.is_empty()
        && input.document_metadata.page_count > 0
    {
        tracing::warn!(
            document = %input.document_metadata.filename,
            "Metadata stage received no elements"
        );
    }

    let filename = input.document_metadata.filename.clone();
    let has_numbers_re = Regex::new(r"\d").expect("static regex");

    let mut text_elements = input.text_elements;
    let mut table_elements = input.table_elements;

    // Sweep in reading order over text and table elements together
    let mut order: Vec<(u32, usize, bool)> = Vec::new();
    for (idx, element) in text_elements.iter().enumerate() {
        order.push((element.page, idx, false));
    }
    for (idx, table) in table_elements.iter().enumerate() {
        order.push((table.element.page, idx, true));
    }
    order.sort_by_key(|(page, idx, is_table)| (*page, *is_table as u8, *idx));

    let mut current_section: Option<String> = None;
    let mut page_sections: BTreeMap<u32, String> = BTreeMap::new();

    for (page, idx, is_table) in order {
        let element = if is_table {
            &mut table_elements[idx].element
        } else {
            &mut text_elements[idx]
        };

        if element.category == ElementCategory::Title && !element.text.trim().is_empty() {
            let mut title: String = element.text.trim().chars().take(MAX_SECTION_TITLE_LEN).collect();
            title = title.trim().to_string();
            current_section = Some(title);
        }

        if let Some(section) = &current_section {
            page_sections.entry(page).or_insert_with(|| section.clone());
        }

        element.structural = Some(build_structural(
            element,
            &filename,
            &has_numbers_re,
            current_section.clone(),
        ));
    }

    Ok(MetadataOutput {
        text_elements,
        table_elements,
        extracted_pages: input.extracted_pages,
        document_metadata: input.document_metadata,
        page_sections,
    })
}

fn build_structural(
    element: &Element,
    filename: &str,
    has_numbers_re: &Regex,
    section: Option<String>,
) -> StructuralMetadata {
    StructuralMetadata {
        source_filename: filename.to_string(),
        page_number: element.page,
        content_type: content_type_of(element.category).to_string(),
        element_category: element.category,
        element_id: element.id.clone(),
        has_numbers: has_numbers_re.is_match(&element.text),
        text_complexity: complexity_of(&element.text),
        section_title_inherited: section,
    }
}

fn content_type_of(category: ElementCategory) -> &'static str {
    match category {
        ElementCategory::Table => "table",
        ElementCategory::ExtractedPage => "page_image",
        _ => "text",
    }
}

/// Simple vs complex: long passages and number-dense technical text read as
/// complex, short prose as simple.
fn complexity_of(text: &str) -> TextComplexity {
    let char_count = text.chars().count();
    if char_count > 300 {
        return TextComplexity::Complex;
    }
    if char_count > 0 {
        let digits = text.chars().filter(|c| c.is_ascii_digit()).count();
        if digits as f32 / char_count as f32 > 0.2 {
            return TextComplexity::Complex;
        }
    }
    TextComplexity::Simple
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DocumentInfo, Element};
    use uuid::Uuid;

    fn partition_output(elements: Vec<Element>) -> PartitionOutput {
        PartitionOutput {
            text_elements: elements,
            table_elements: vec![],
            extracted_pages: Default::default(),
            page_analysis: vec![],
            document_metadata: DocumentInfo {
                document_id: Uuid::new_v4(),
                filename: "spec.pdf".into(),
                page_count: 3,
                byte_size: 100,
                content_hash: "abc".into(),
            },
        }
    }

    #[test]
    fn section_titles_inherit_across_pages() {
        let elements = vec![
            Element::new(1, "3.2 Føringsveje", ElementCategory::Title),
            Element::new(1, "Kabler føres i bakker.", ElementCategory::NarrativeText),
            Element::new(2, "Fortsat tekst om føringsveje.", ElementCategory::NarrativeText),
            Element::new(3, "4.1 Belysning", ElementCategory::Title),
            Element::new(3, "Armaturer monteres i loft.", ElementCategory::NarrativeText),
        ];
        let output = run_metadata(partition_output(elements)).unwrap();

        let sections: Vec<Option<&str>> = output
            .text_elements
            .iter()
            .map(|e| {
                e.structural
                    .as_ref()
                    .unwrap()
                    .section_title_inherited
                    .as_deref()
            })
            .collect();
        assert_eq!(
            sections,
            vec![
                Some("3.2 Føringsveje"),
                Some("3.2 Føringsveje"),
                Some("3.2 Føringsveje"),
                Some("4.1 Belysning"),
                Some("4.1 Belysning"),
            ]
        );
        assert_eq!(output.page_sections[&1], "3.2 Føringsveje");
        assert_eq!(output.page_sections[&2], "3.2 Føringsveje");
        assert_eq!(output.page_sections[&3], "4.1 Belysning");
    }

    #[test]
    fn elements_before_any_title_have_no_section() {
        let elements = vec![
            Element::new(1, "Indledende tekst.", ElementCategory::NarrativeText),
            Element::new(1, "OVERSIGT", ElementCategory::Title),
            Element::new(1, "Efterfølgende tekst.", ElementCategory::NarrativeText),
        ];
        let output = run_metadata(partition_output(elements)).unwrap();
        let first = output.text_elements[0].structural.as_ref().unwrap();
        assert!(first.section_title_inherited.is_none());
        let last = output.text_elements[2].structural.as_ref().unwrap();
        assert_eq!(last.section_title_inherited.as_deref(), Some("OVERSIGT"));
    }

    #[test]
    fn number_flag_and_complexity() {
        let elements = vec![
            Element::new(1, "Spænding 400 V, 50 Hz, 3x25 A.", ElementCategory::NarrativeText),
            Element::new(1, "Kort prosa uden tal.", ElementCategory::NarrativeText),
        ];
        let output = run_metadata(partition_output(elements)).unwrap();
        let technical = output.text_elements[0].structural.as_ref().unwrap();
        assert!(technical.has_numbers);
        assert_eq!(technical.text_complexity, TextComplexity::Complex);
        let prose = output.text_elements[1].structural.as_ref().unwrap();
        assert!(!prose.has_numbers);
        assert_eq!(prose.text_complexity, TextComplexity::Simple);
    }
}
