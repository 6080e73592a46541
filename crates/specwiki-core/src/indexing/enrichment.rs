//! Enrichment stage: VLM captions for tables and full-page images.
//!
//! Captions are what make visual regions retrievable by text embedding.
//! Tables get captioned twice (rendered image and HTML); rendered pages get
//! one caption that must transcribe the page, since text extraction was
//! skipped there. Failures stay per-element: the element keeps its original
//! text and records the error.

use std::time::Duration;

use crate::config::{EnrichmentConfig, TimeoutConfig};
use crate::error::Result;
use crate::models::{
    Element, ElementCategory, EnrichmentMetadata, EnrichmentOutput, MetadataOutput,
};
use crate::services::{with_retry, with_timeout, RateLimiters, VlmClient, VlmInput};
use crate::store::ObjectStore;

pub struct EnrichmentStage<'a> {
    pub objects: &'a dyn ObjectStore,
    pub vlm: &'a dyn VlmClient,
    pub limiters: &'a RateLimiters,
    pub timeouts: &'a TimeoutConfig,
    pub config: &'a EnrichmentConfig,
    /// Output language for captions (defaults.language unless overridden)
    pub language: &'a str,
}

impl EnrichmentStage<'_> {
    pub async fn run(&self, input: MetadataOutput) -> Result<EnrichmentOutput> {
        let mut text_elements = input.text_elements;
        let mut table_elements = input.table_elements;
        let mut generated = 0usize;
        let mut failed = 0usize;

        // Tables: caption the rendered image and the HTML independently
        for table in table_elements.iter_mut() {
            let context = page_context(&text_elements, table.element.page, self.config);
            let prompt = table_prompt(&context);
            let mut meta = EnrichmentMetadata {
                vlm_model: self.config.vlm_model.clone(),
                vlm_processed: true,
                ..Default::default()
            };
            let mut duration = Duration::ZERO;

            if let Some(image_key) = &table.image_key {
                match self.caption_image(image_key, &prompt).await {
                    Ok(caption) => {
                        duration += caption.duration;
                        meta.table_image_caption = Some(caption.caption);
                    }
                    Err(e) => record_failure(&mut meta, &e.to_string()),
                }
            }
            if !table.html.is_empty() {
                match self
                    .caption(VlmInput::Html(table.html.clone()), &prompt)
                    .await
                {
                    Ok(caption) => {
                        duration += caption.duration;
                        meta.table_html_caption = Some(caption.caption);
                    }
                    Err(e) => record_failure(&mut meta, &e.to_string()),
                }
            }

            finish_meta(&mut meta, duration);
            if meta.vlm_processed {
                generated += 1;
            } else {
                failed += 1;
            }
            table.element.enrichment = Some(meta);
        }

        // Full pages: the render is the primary text source for its page
        for element in text_elements
            .iter_mut()
            .filter(|e| e.category == ElementCategory::ExtractedPage)
        {
            let Some(image) = input.extracted_pages.get(&element.page) else {
                continue;
            };
            let mut meta = EnrichmentMetadata {
                vlm_model: self.config.vlm_model.clone(),
                vlm_processed: true,
                ..Default::default()
            };
            let prompt = full_page_prompt(element.page);
            let mut duration = Duration::ZERO;
            match self.caption_image(&image.storage_key, &prompt).await {
                Ok(caption) => {
                    duration = caption.duration;
                    meta.full_page_image_caption = Some(caption.caption);
                }
                Err(e) => record_failure(&mut meta, &e.to_string()),
            }
            finish_meta(&mut meta, duration);
            if meta.vlm_processed {
                generated += 1;
            } else {
                failed += 1;
            }
            element.enrichment = Some(meta);
        }

        tracing::info!(
            document = %input.document_metadata.filename,
            captions = generated,
            failures = failed,
            "Enrichment finished"
        );

        Ok(EnrichmentOutput {
            text_elements,
            table_elements,
            extracted_pages: input.extracted_pages,
            document_metadata: input.document_metadata,
            page_sections: input.page_sections,
            captions_generated: generated,
            captions_failed: failed,
        })
    }

    async fn caption_image(&self, key: &str, prompt: &str) -> Result<crate::services::Caption> {
        let bytes = with_timeout(
            "objectstore",
            self.timeouts.objectstore(),
            self.objects.get(key),
        )
        .await?;
        self.caption(
            VlmInput::Image {
                bytes,
                content_type: "image/png".into(),
            },
            prompt,
        )
        .await
    }

    async fn caption(&self, input: VlmInput, prompt: &str) -> Result<crate::services::Caption> {
        self.limiters.vlm.acquire().await;
        with_retry("vlm_caption", || {
            with_timeout(
                "vlm",
                self.timeouts.vlm(),
                self.vlm
                    .caption(&input, prompt, self.language, &self.config.vlm_model),
            )
        })
        .await
    }
}

fn record_failure(meta: &mut EnrichmentMetadata, error: &str) {
    meta.vlm_processed = false;
    meta.vlm_processing_error = Some(error.to_string());
}

fn finish_meta(meta: &mut EnrichmentMetadata, duration: Duration) {
    meta.processing_duration_seconds = duration.as_secs_f64();
    meta.caption_word_count = [
        &meta.table_image_caption,
        &meta.table_html_caption,
        &meta.full_page_image_caption,
    ]
    .iter()
    .filter_map(|c| c.as_deref())
    .map(|c| c.split_whitespace().count())
    .sum();
}

/// Up to `max_page_text_elements` snippets of surrounding text from the
/// page, bounded by `max_text_context_length` characters in total.
fn page_context(elements: &[Element], page: u32, config: &EnrichmentConfig) -> String {
    let mut context = String::new();
    let mut used = 0usize;
    for element in elements
        .iter()
        .filter(|e| e.page == page && e.category != ElementCategory::ExtractedPage)
        .filter(|e| !e.text.trim().is_empty())
        .take(config.max_page_text_elements)
    {
        let remaining = config.max_text_context_length.saturating_sub(context.len());
        if remaining == 0 {
            break;
        }
        used += 1;
        let snippet: String = element.text.trim().chars().take(remaining).collect();
        if !context.is_empty() {
            context.push('\n');
        }
        context.push_str(&snippet);
    }
    tracing::debug!(page, snippets = used, chars = context.len(), "Built caption context");
    context
}

fn table_prompt(context: &str) -> String {
    let mut prompt = String::from(
        "Describe this table from a construction document. Your description must include:\n\
         1. A complete transcription of all text and values in the table.\n\
         2. The table structure: columns, rows, headers and units.\n\
         3. Any labels, notes or references surrounding the table.\n\
         4. All technical details: dimensions, materials, standards, tolerances.",
    );
    if !context.is_empty() {
        prompt.push_str("\n\nText near the table on the same page:\n");
        prompt.push_str(context);
    }
    prompt
}

fn full_page_prompt(page: u32) -> String {
    format!(
        "This image is page {page} of a construction document. Text extraction was skipped \
         for this page, so this image is the PRIMARY source of all its text. Transcribe all \
         visible text verbatim - headings, labels, dimensions, notes and legends - then \
         describe the drawings, diagrams or photos and how the text relates to them."
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DocumentInfo, TableElement};
    use bytes::Bytes;
    use std::collections::BTreeMap;
    use uuid::Uuid;

    use crate::services::MockVlmClient;
    use crate::store::{MemoryObjectStore, ObjectStore as _};

    fn base_input(
        text_elements: Vec<Element>,
        table_elements: Vec<TableElement>,
        extracted_pages: BTreeMap<u32, crate::models::PageImage>,
    ) -> MetadataOutput {
        MetadataOutput {
            text_elements,
            table_elements,
            extracted_pages,
            document_metadata: DocumentInfo {
                document_id: Uuid::new_v4(),
                filename: "spec.pdf".into(),
                page_count: 2,
                byte_size: 10,
                content_hash: "h".into(),
            },
            page_sections: BTreeMap::new(),
        }
    }

    fn table_with_image(page: u32, image_key: &str) -> TableElement {
        TableElement {
            element: Element::new(page, "100 | 200", ElementCategory::Table),
            html: "<table><tr><td>100</td><td>200</td></tr></table>".into(),
            image_key: Some(image_key.to_string()),
        }
    }

    #[tokio::test]
    async fn table_is_captioned_twice() {
        let objects = MemoryObjectStore::new();
        objects
            .put("tables/t1.png", Bytes::from_static(b"png"), "image/png")
            .await
            .unwrap();
        let vlm = MockVlmClient::new();
        vlm.push_caption("Image caption: dimensions table");
        vlm.push_caption("HTML caption: two columns");

        let limiters = RateLimiters::default();
        let timeouts = TimeoutConfig::default();
        let config = EnrichmentConfig::default();
        let stage = EnrichmentStage {
            objects: &objects,
            vlm: &vlm,
            limiters: &limiters,
            timeouts: &timeouts,
            config: &config,
            language: "danish",
        };

        let input = base_input(vec![], vec![table_with_image(2, "tables/t1.png")], BTreeMap::new());
        let output = stage.run(input).await.unwrap();

        let meta = output.table_elements[0].element.enrichment.as_ref().unwrap();
        assert_eq!(
            meta.table_image_caption.as_deref(),
            Some("Image caption: dimensions table")
        );
        assert_eq!(
            meta.table_html_caption.as_deref(),
            Some("HTML caption: two columns")
        );
        assert!(meta.vlm_processed);
        assert!(meta.caption_word_count > 0);
        assert_eq!(output.captions_generated, 1);
        assert_eq!(output.captions_failed, 0);
        assert_eq!(vlm.call_count(), 2);
    }

    #[tokio::test]
    async fn full_page_caption_lands_on_extracted_page_element() {
        let objects = MemoryObjectStore::new();
        objects
            .put("pages/page_1.png", Bytes::from_static(b"png"), "image/png")
            .await
            .unwrap();
        let vlm = MockVlmClient::new();
        vlm.push_caption("Plantegning med mål og noter.");

        let limiters = RateLimiters::default();
        let timeouts = TimeoutConfig::default();
        let config = EnrichmentConfig::default();
        let stage = EnrichmentStage {
            objects: &objects,
            vlm: &vlm,
            limiters: &limiters,
            timeouts: &timeouts,
            config: &config,
            language: "danish",
        };

        let mut pages = BTreeMap::new();
        pages.insert(
            1,
            crate::models::PageImage {
                page: 1,
                storage_key: "pages/page_1.png".into(),
                width: 100,
                height: 100,
            },
        );
        let input = base_input(
            vec![Element::new(1, "", ElementCategory::ExtractedPage)],
            vec![],
            pages,
        );
        let output = stage.run(input).await.unwrap();

        let element = &output.text_elements[0];
        let meta = element.enrichment.as_ref().unwrap();
        assert_eq!(
            meta.full_page_image_caption.as_deref(),
            Some("Plantegning med mål og noter.")
        );
        // the prompt declares the image the primary text source
        let calls = vlm.calls.lock().unwrap();
        assert!(calls[0].contains("image"));
    }

    #[tokio::test]
    async fn vlm_failure_is_per_element() {
        let objects = MemoryObjectStore::new();
        let vlm = MockVlmClient::new();
        // html captioning fails twice: initial call + the one retry
        vlm.push_failure("model offline");
        vlm.push_failure("model offline");

        let limiters = RateLimiters::default();
        let timeouts = TimeoutConfig::default();
        let config = EnrichmentConfig::default();
        let stage = EnrichmentStage {
            objects: &objects,
            vlm: &vlm,
            limiters: &limiters,
            timeouts: &timeouts,
            config: &config,
            language: "english",
        };

        let table = TableElement {
            element: Element::new(1, "original table text", ElementCategory::Table),
            html: "<table/>".into(),
            image_key: None,
        };
        let input = base_input(vec![], vec![table], BTreeMap::new());
        let output = stage.run(input).await.unwrap();

        let table = &output.table_elements[0];
        let meta = table.element.enrichment.as_ref().unwrap();
        assert!(!meta.vlm_processed);
        assert!(meta.vlm_processing_error.is_some());
        // original text stays intact for chunking
        assert_eq!(table.element.text, "original table text");
        assert_eq!(output.captions_failed, 1);
    }

    #[test]
    fn context_respects_budgets() {
        let mut config = EnrichmentConfig::default();
        config.max_page_text_elements = 2;
        config.max_text_context_length = 30;
        let elements = vec![
            Element::new(1, "First snippet of text", ElementCategory::NarrativeText),
            Element::new(1, "Second snippet of text", ElementCategory::NarrativeText),
            Element::new(1, "Third never included", ElementCategory::NarrativeText),
        ];
        let context = page_context(&elements, 1, &config);
        assert!(context.contains("First"));
        assert!(!context.contains("Third"));
        assert!(context.len() <= 31, "{}", context.len());
    }
}
