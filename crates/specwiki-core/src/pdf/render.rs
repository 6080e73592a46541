//! Page rasterization (mupdf) and table-region cropping (image).
//!
//! Rendering is CPU work and runs on the blocking pool; the async wrappers
//! are the only entry points the pipeline uses.

use bytes::Bytes;

use crate::error::{CoreError, Result};
use crate::models::Bbox;

/// Render scale applied to PDF user-space (1.0 = 72 dpi); 2.0 gives VLMs
/// enough resolution for small print on drawings.
pub const RENDER_SCALE: f32 = 2.0;

/// A rasterized page
#[derive(Debug, Clone)]
pub struct RenderedPage {
    /// 1-indexed page number
    pub page: u32,
    pub png: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// Render the given (1-indexed) pages to PNG at `scale`.
pub async fn render_pages(pdf: Bytes, pages: Vec<u32>, scale: f32) -> Result<Vec<RenderedPage>> {
    tokio::task::spawn_blocking(move || render_pages_blocking(&pdf, &pages, scale))
        .await
        .map_err(|e| CoreError::Internal(anyhow::anyhow!("render task panicked: {e}")))?
}

fn render_pages_blocking(pdf: &[u8], pages: &[u32], scale: f32) -> Result<Vec<RenderedPage>> {
    let doc = mupdf::Document::from_bytes(pdf, "document.pdf")
        .map_err(|e| CoreError::InvalidInput(format!("mupdf failed to open PDF: {e}")))?;

    let mut rendered = Vec::with_capacity(pages.len());
    for &page_no in pages {
        match render_one(&doc, page_no, scale) {
            Ok(page) => rendered.push(page),
            Err(e) => {
                // degrade per page; the pipeline falls back to text-only
                tracing::warn!(page = page_no, error = %e, "Page render failed");
            }
        }
    }
    Ok(rendered)
}

fn render_one(doc: &mupdf::Document, page_no: u32, scale: f32) -> Result<RenderedPage> {
    let page = doc
        .load_page(page_no as i32 - 1)
        .map_err(|e| CoreError::Internal(anyhow::anyhow!("load page {page_no}: {e}")))?;
    let matrix = mupdf::Matrix::new_scale(scale, scale);
    let pixmap = page
        .to_pixmap(&matrix, &mupdf::Colorspace::device_rgb(), 0.0, false)
        .map_err(|e| CoreError::Internal(anyhow::anyhow!("rasterize page {page_no}: {e}")))?;

    let tmp = std::env::temp_dir().join(format!("specwiki-render-{}.png", uuid::Uuid::new_v4()));
    let tmp_str = tmp
        .to_str()
        .ok_or_else(|| CoreError::Internal(anyhow::anyhow!("non-utf8 temp path")))?;
    pixmap
        .save_as(tmp_str, mupdf::ImageFormat::PNG)
        .map_err(|e| CoreError::Internal(anyhow::anyhow!("encode page {page_no}: {e}")))?;
    let png = std::fs::read(&tmp)?;
    let _ = std::fs::remove_file(&tmp);

    Ok(RenderedPage {
        page: page_no,
        png,
        width: pixmap.width() as u32,
        height: pixmap.height() as u32,
    })
}

/// Crop a PDF-space region out of a rendered page.
///
/// `bbox` is in PDF points; `scale` must match the render scale. The crop is
/// clamped to the image bounds and padded slightly so table borders survive.
pub fn crop_region(page_png: &[u8], bbox: &Bbox, scale: f32) -> Result<Vec<u8>> {
    const PAD: f32 = 4.0;

    let img = image::load_from_memory(page_png)
        .map_err(|e| CoreError::Internal(anyhow::anyhow!("decode page image: {e}")))?;
    let (img_w, img_h) = (img.width(), img.height());

    let x0 = (((bbox.x0 - PAD) * scale).max(0.0) as u32).min(img_w.saturating_sub(1));
    let y0 = (((bbox.y0 - PAD) * scale).max(0.0) as u32).min(img_h.saturating_sub(1));
    let x1 = (((bbox.x1 + PAD) * scale) as u32).clamp(x0 + 1, img_w);
    let y1 = (((bbox.y1 + PAD) * scale) as u32).clamp(y0 + 1, img_h);

    let cropped = img.crop_imm(x0, y0, x1 - x0, y1 - y0);
    let mut out = Vec::new();
    cropped
        .write_to(&mut std::io::Cursor::new(&mut out), image::ImageFormat::Png)
        .map_err(|e| CoreError::Internal(anyhow::anyhow!("encode crop: {e}")))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdf::test_support::create_multipage_pdf;

    #[tokio::test]
    async fn renders_requested_pages() {
        let pdf = Bytes::from(create_multipage_pdf(&["one", "two", "three"]));
        let rendered = render_pages(pdf, vec![1, 3], RENDER_SCALE).await.unwrap();
        assert_eq!(rendered.len(), 2);
        assert_eq!(rendered[0].page, 1);
        assert_eq!(rendered[1].page, 3);
        for page in &rendered {
            assert!(!page.png.is_empty());
            assert!(page.width > 0 && page.height > 0);
        }
    }

    #[tokio::test]
    async fn crop_stays_within_bounds() {
        let pdf = Bytes::from(create_multipage_pdf(&["content"]));
        let rendered = render_pages(pdf, vec![1], 1.0).await.unwrap();
        let bbox = Bbox {
            x0: 50.0,
            y0: 50.0,
            x1: 5000.0, // way past the page edge
            y1: 5000.0,
        };
        let cropped = crop_region(&rendered[0].png, &bbox, 1.0).unwrap();
        assert!(!cropped.is_empty());
        let img = image::load_from_memory(&cropped).unwrap();
        assert!(img.width() <= rendered[0].width);
        assert!(img.height() <= rendered[0].height);
    }

    #[tokio::test]
    async fn invalid_pdf_is_rejected() {
        let result = render_pages(Bytes::from_static(b"not a pdf"), vec![1], 1.0).await;
        assert!(result.is_err());
    }
}
