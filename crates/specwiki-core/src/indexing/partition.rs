//! Partition stage: one PDF in, a normalized element stream out.
//!
//! Two-step algorithm:
//! 1. Page analysis (always local): count meaningful raster images and
//!    vector drawings per page.
//! 2. Extraction: local per-page text runs in `fast` mode; the remote
//!    partitioner's category-labelled elements (including table HTML) in
//!    `auto`/`hi_res`. Pages flagged `needs_extraction` keep only their
//!    Table elements; the page itself becomes an `ExtractedPage` element
//!    backed by a full-page render.

use std::collections::{BTreeMap, HashMap, HashSet};

use bytes::Bytes;
use uuid::Uuid;

use crate::config::{OcrStrategy, PartitionConfig, TimeoutConfig};
use crate::error::{CoreError, Result};
use crate::models::{
    Bbox, Document, DocumentInfo, Element, ElementCategory, PageAnalysis, PageImage,
    PartitionOutput, TableElement,
};
use crate::pdf::render::RENDER_SCALE;
use crate::pdf::{analyze_pages, crop_region, extract_page_texts, render_pages, validate_pdf};
use crate::services::{
    with_retry, with_timeout, PartitionClient, RateLimiters, RawElement, RawPartition,
};
use crate::store::{page_image_key, table_image_key, ObjectStore};

pub struct PartitionStage<'a> {
    pub objects: &'a dyn ObjectStore,
    pub partition_client: &'a dyn PartitionClient,
    pub limiters: &'a RateLimiters,
    pub timeouts: &'a TimeoutConfig,
    pub config: &'a PartitionConfig,
}

impl PartitionStage<'_> {
    /// Partition one document of a run.
    ///
    /// Fails the document (`InvalidInput`) when the PDF cannot be opened;
    /// individual page trouble degrades to text-only best effort.
    pub async fn run(&self, run_id: Uuid, document: &Document) -> Result<PartitionOutput> {
        let pdf_bytes = with_timeout(
            "objectstore",
            self.timeouts.objectstore(),
            self.objects.get(&document.blob_key),
        )
        .await?;

        let content_hash = blake3::hash(&pdf_bytes).to_hex().to_string();

        // Local analysis and text extraction are CPU work
        let min_image_area = self.config.min_image_area;
        let analysis_bytes = pdf_bytes.clone();
        let (page_texts, page_facts, page_count) = tokio::task::spawn_blocking(move || {
            let doc = validate_pdf(&analysis_bytes)?;
            let texts = extract_page_texts(&doc);
            let facts = analyze_pages(&doc, min_image_area);
            let page_count = texts.len() as u32;
            Ok::<_, CoreError>((texts, facts, page_count))
        })
        .await
        .map_err(|e| CoreError::Internal(anyhow::anyhow!("partition task panicked: {e}")))??;

        if page_count == 0 {
            tracing::warn!(document = %document.filename, "PDF has no pages");
            return Ok(PartitionOutput {
                text_elements: vec![],
                table_elements: vec![],
                extracted_pages: BTreeMap::new(),
                page_analysis: vec![],
                document_metadata: DocumentInfo {
                    document_id: document.id,
                    filename: document.filename.clone(),
                    page_count: 0,
                    byte_size: pdf_bytes.len() as u64,
                    content_hash,
                },
            });
        }

        // Remote partitioner supplies categories and table HTML outside fast mode
        let raw = match self.config.ocr_strategy {
            OcrStrategy::Fast => RawPartition::default(),
            OcrStrategy::Auto | OcrStrategy::HiRes => {
                self.limiters.partition.acquire().await;
                let bytes_for_call = pdf_bytes.clone();
                with_retry("partition", || {
                    with_timeout(
                        "partition",
                        self.timeouts.partition(),
                        self.partition_client
                            .analyze(bytes_for_call.clone(), self.config),
                    )
                })
                .await?
            }
        };

        let table_pages: HashSet<u32> = raw
            .elements
            .iter()
            .filter(|e| e.category == "Table")
            .map(|e| e.page)
            .collect();

        let page_analysis: Vec<PageAnalysis> = (1..=page_count)
            .map(|page| {
                let facts = page_facts.get(&page).cloned().unwrap_or_default();
                let has_drawings = facts.drawing_count >= self.config.min_drawing_count;
                let has_images = facts.meaningful_image_count > 0;
                let has_tables = table_pages.contains(&page);
                PageAnalysis {
                    page,
                    meaningful_image_count: facts.meaningful_image_count,
                    drawing_count: facts.drawing_count,
                    has_tables,
                    needs_extraction: has_images || has_tables || has_drawings,
                }
            })
            .collect();

        // Pages rendered whole: visual content beyond tables
        let visual_pages: Vec<u32> = page_analysis
            .iter()
            .filter(|p| {
                p.meaningful_image_count > 0 || p.drawing_count >= self.config.min_drawing_count
            })
            .map(|p| p.page)
            .collect();
        let skip_text_pages: HashSet<u32> = page_analysis
            .iter()
            .filter(|p| p.needs_extraction)
            .map(|p| p.page)
            .collect();

        let mut text_elements = match self.config.ocr_strategy {
            OcrStrategy::Fast => local_elements(&page_texts, &skip_text_pages),
            _ => remote_elements(&raw.elements, &skip_text_pages),
        };

        let mut table_elements = build_tables(&raw.elements, self.config.extract_tables);

        // Render page images and crop table regions
        let extracted_pages = self
            .render_and_store(
                run_id,
                document,
                &pdf_bytes,
                &visual_pages,
                &mut table_elements,
            )
            .await?;

        // Every rendered page enters the element stream as ExtractedPage
        for image in extracted_pages.values() {
            text_elements.push(Element::new(image.page, "", ElementCategory::ExtractedPage));
        }
        text_elements.sort_by_key(|e| e.page);

        tracing::info!(
            document = %document.filename,
            pages = page_count,
            text_elements = text_elements.len(),
            tables = table_elements.len(),
            page_images = extracted_pages.len(),
            "Partitioned document"
        );

        Ok(PartitionOutput {
            text_elements,
            table_elements,
            extracted_pages,
            page_analysis,
            document_metadata: DocumentInfo {
                document_id: document.id,
                filename: document.filename.clone(),
                page_count,
                byte_size: pdf_bytes.len() as u64,
                content_hash,
            },
        })
    }

    async fn render_and_store(
        &self,
        run_id: Uuid,
        document: &Document,
        pdf_bytes: &Bytes,
        visual_pages: &[u32],
        table_elements: &mut [TableElement],
    ) -> Result<BTreeMap<u32, PageImage>> {
        let mut pages_to_render: Vec<u32> = Vec::new();
        if self.config.extract_images {
            pages_to_render.extend_from_slice(visual_pages);
        }
        if self.config.extract_tables {
            pages_to_render.extend(
                table_elements
                    .iter()
                    .filter(|t| t.element.coordinates.is_some())
                    .map(|t| t.element.page),
            );
        }
        pages_to_render.sort_unstable();
        pages_to_render.dedup();

        if pages_to_render.is_empty() {
            return Ok(BTreeMap::new());
        }

        let rendered = render_pages(pdf_bytes.clone(), pages_to_render, RENDER_SCALE).await?;
        let rendered_by_page: HashMap<u32, _> =
            rendered.into_iter().map(|r| (r.page, r)).collect();

        let mut extracted_pages = BTreeMap::new();
        if self.config.extract_images {
            for &page in visual_pages {
                let Some(render) = rendered_by_page.get(&page) else {
                    continue;
                };
                let key = page_image_key(run_id, document.id, page);
                with_timeout(
                    "objectstore",
                    self.timeouts.objectstore(),
                    self.objects
                        .put(&key, Bytes::from(render.png.clone()), "image/png"),
                )
                .await?;
                extracted_pages.insert(
                    page,
                    PageImage {
                        page,
                        storage_key: key,
                        width: render.width,
                        height: render.height,
                    },
                );
            }
        }

        if self.config.extract_tables {
            for table in table_elements.iter_mut() {
                let Some(bbox) = table.element.coordinates else {
                    continue;
                };
                let Some(render) = rendered_by_page.get(&table.element.page) else {
                    continue;
                };
                match crop_table(&render.png, &bbox) {
                    Ok(cropped) => {
                        let key = table_image_key(run_id, document.id, &table.element.id);
                        with_timeout(
                            "objectstore",
                            self.timeouts.objectstore(),
                            self.objects.put(&key, Bytes::from(cropped), "image/png"),
                        )
                        .await?;
                        table.image_key = Some(key);
                    }
                    Err(e) => {
                        tracing::warn!(
                            table = %table.element.id,
                            error = %e,
                            "Table region crop failed"
                        );
                    }
                }
            }
        }

        Ok(extracted_pages)
    }
}

fn crop_table(page_png: &[u8], bbox: &Bbox) -> Result<Vec<u8>> {
    crop_region(page_png, bbox, RENDER_SCALE)
}

/// Fast mode: paragraph elements out of locally extracted page text.
fn local_elements(
    page_texts: &[crate::pdf::ExtractedPage],
    skip_pages: &HashSet<u32>,
) -> Vec<Element> {
    let mut elements = Vec::new();
    for page in page_texts {
        if skip_pages.contains(&page.page) {
            continue;
        }
        for paragraph in split_paragraphs(&page.text) {
            let category = categorize_paragraph(&paragraph);
            elements.push(Element::new(page.page, paragraph, category));
        }
    }
    elements
}

/// Remote elements, normalized; fragmented text is dropped on skip pages.
fn remote_elements(raw: &[RawElement], skip_pages: &HashSet<u32>) -> Vec<Element> {
    raw.iter()
        .filter(|e| e.category != "Table")
        .filter(|e| !skip_pages.contains(&e.page))
        .filter(|e| !e.text.trim().is_empty())
        .map(|e| {
            let mut element = Element::new(e.page, e.text.trim(), map_category(&e.category));
            if !e.id.is_empty() {
                element.id = e.id.clone();
            }
            element.coordinates = e.coordinates;
            element
        })
        .collect()
}

fn build_tables(raw: &[RawElement], extract_tables: bool) -> Vec<TableElement> {
    if !extract_tables {
        return vec![];
    }
    raw.iter()
        .filter(|e| e.category == "Table")
        .map(|e| {
            let mut element = Element::new(e.page, e.text.trim(), ElementCategory::Table);
            if !e.id.is_empty() {
                element.id = e.id.clone();
            }
            element.coordinates = e.coordinates;
            TableElement {
                element,
                html: e.html.clone().unwrap_or_default(),
                image_key: None,
            }
        })
        .collect()
}

fn map_category(category: &str) -> ElementCategory {
    match category {
        "NarrativeText" | "Text" => ElementCategory::NarrativeText,
        "Title" | "Header" | "Headline" => ElementCategory::Title,
        "ListItem" => ElementCategory::ListItem,
        "Table" => ElementCategory::Table,
        _ => ElementCategory::UncategorizedText,
    }
}

fn split_paragraphs(text: &str) -> Vec<String> {
    text.split("\n\n")
        .flat_map(|block| {
            // extract_text output is newline-heavy; collapse single breaks
            block.split('\n').map(str::trim).filter(|l| !l.is_empty())
        })
        .map(|line| line.to_string())
        .collect()
}

/// Title heuristic for locally extracted lines: short, no terminal
/// punctuation, numbered or mostly uppercase.
fn categorize_paragraph(text: &str) -> ElementCategory {
    let trimmed = text.trim();
    if trimmed.len() < 80 && !trimmed.ends_with('.') {
        let starts_numbered = trimmed
            .split_whitespace()
            .next()
            .map(|w| w.chars().next().is_some_and(|c| c.is_ascii_digit()) && w.contains('.'))
            .unwrap_or(false);
        let letters: Vec<char> = trimmed.chars().filter(|c| c.is_alphabetic()).collect();
        let uppercase_ratio = if letters.is_empty() {
            0.0
        } else {
            letters.iter().filter(|c| c.is_uppercase()).count() as f32 / letters.len() as f32
        };
        if starts_numbered || uppercase_ratio > 0.8 {
            return ElementCategory::Title;
        }
    }
    ElementCategory::NarrativeText
}
