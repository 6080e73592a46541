//! PDF fixtures for pipeline tests.
//!
//! A fixture is described as a list of [`PageSpec`]s and lowered to a
//! minimal object graph. The pages-tree id is allocated up front so every
//! page can reference its parent directly, and each page carries its own
//! inline resource dictionary, which also exercises the resource resolution
//! in page analysis.

use lopdf::{dictionary, Document, Object, Stream};

/// Declarative description of one fixture page.
#[derive(Debug, Clone, Default)]
pub struct PageSpec {
    /// Text lines, rendered top-down
    pub lines: Vec<String>,
    /// Stroked rectangles drawn on the page; enough of them trips the
    /// drawing-detection threshold in page analysis
    pub drawing_ops: usize,
}

impl PageSpec {
    pub fn text(line: &str) -> Self {
        let lines = if line.is_empty() {
            vec![]
        } else {
            vec![line.to_string()]
        };
        Self {
            lines,
            drawing_ops: 0,
        }
    }

    pub fn with_drawings(mut self, ops: usize) -> Self {
        self.drawing_ops = ops;
        self
    }

    fn content_stream(&self) -> Vec<u8> {
        let mut ops = String::new();
        for (index, line) in self.lines.iter().enumerate() {
            let y = 780 - 16 * index as i32;
            ops.push_str(&format!(
                "BT /F0 11 Tf 72 {y} Td ({}) Tj ET\n",
                escape_literal(line)
            ));
        }
        for index in 0..self.drawing_ops {
            let x = 60 + (index % 8) as i32 * 60;
            let y = 40 + (index / 8) as i32 * 9;
            ops.push_str(&format!("{x} {y} 48 5 re S\n"));
        }
        ops.into_bytes()
    }
}

/// Escape the characters that delimit PDF literal strings.
fn escape_literal(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '(' | ')' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Lower page specs into PDF bytes.
pub fn build_pdf(pages: &[PageSpec]) -> Vec<u8> {
    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();

    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Helvetica",
    });

    let mut kids: Vec<Object> = Vec::with_capacity(pages.len());
    for page in pages {
        let content_id = doc.add_object(Stream::new(dictionary! {}, page.content_stream()));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "MediaBox" => vec![0.into(), 0.into(), 595.into(), 842.into()],
            "Contents" => content_id,
            "Resources" => dictionary! {
                "Font" => dictionary! { "F0" => font_id },
            },
        });
        kids.push(page_id.into());
    }

    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Count" => Object::Integer(pages.len() as i64),
            "Kids" => kids,
        }),
    );

    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);

    let mut bytes = Vec::new();
    doc.save_to(&mut bytes).expect("fixture PDF serializes");
    bytes
}

/// One page holding a single line of text
pub fn create_test_pdf(text: &str) -> Vec<u8> {
    build_pdf(&[PageSpec::text(text)])
}

/// One page per entry, each holding a single line of text
pub fn create_multipage_pdf(page_texts: &[&str]) -> Vec<u8> {
    let specs: Vec<PageSpec> = page_texts.iter().map(|text| PageSpec::text(text)).collect();
    build_pdf(&specs)
}

/// Like [`create_multipage_pdf`], with the listed (1-indexed) pages made
/// drawing-heavy.
pub fn create_pdf_with_drawings(page_texts: &[&str], drawing_pages: &[u32]) -> Vec<u8> {
    let specs: Vec<PageSpec> = page_texts
        .iter()
        .enumerate()
        .map(|(index, text)| {
            let spec = PageSpec::text(text);
            if drawing_pages.contains(&(index as u32 + 1)) {
                spec.with_drawings(120)
            } else {
                spec
            }
        })
        .collect();
    build_pdf(&specs)
}
