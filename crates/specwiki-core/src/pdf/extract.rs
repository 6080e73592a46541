//! PDF validation and per-page text extraction (lopdf).

use lopdf::Document;

use crate::error::{CoreError, Result};

/// Text content of one page
#[derive(Debug, Clone)]
pub struct ExtractedPage {
    /// 1-indexed page number
    pub page: u32,
    pub text: String,
}

/// Parse and validate PDF bytes before any pipeline work.
///
/// Rejects empty files, unparseable files and encrypted documents with
/// `InvalidInput`; a valid 0-page document passes (the run completes with a
/// no-content warning downstream).
pub fn validate_pdf(pdf_bytes: &[u8]) -> Result<Document> {
    if pdf_bytes.is_empty() {
        return Err(CoreError::InvalidInput("PDF file is empty".into()));
    }
    let doc = Document::load_mem(pdf_bytes)
        .map_err(|e| CoreError::InvalidInput(format!("failed to parse PDF: {e}")))?;
    if doc.trailer.get(b"Encrypt").is_ok() {
        return Err(CoreError::InvalidInput(
            "PDF is encrypted and cannot be processed".into(),
        ));
    }
    Ok(doc)
}

/// Extract text per page, in page order.
///
/// Pages whose extraction fails degrade to an empty string rather than
/// failing the document.
pub fn extract_page_texts(doc: &Document) -> Vec<ExtractedPage> {
    let mut pages: Vec<u32> = doc.get_pages().keys().cloned().collect();
    pages.sort();

    let extracted: Vec<ExtractedPage> = pages
        .into_iter()
        .map(|page_num| {
            let text = doc.extract_text(&[page_num]).unwrap_or_default();
            ExtractedPage {
                page: page_num,
                text,
            }
        })
        .collect();

    tracing::debug!(
        pages = extracted.len(),
        chars = extracted.iter().map(|p| p.text.len()).sum::<usize>(),
        "Extracted page texts"
    );
    extracted
}
