//! Per-page visual analysis over PDF content streams.
//!
//! Partitioning needs to know, per page, whether meaningful raster images or
//! dense vector drawings are present. Pages flagged here skip fragmented
//! text extraction and get captioned whole by the enrichment stage.

use std::collections::HashMap;

use lopdf::content::Content;
use lopdf::{Document, Object, ObjectId};

/// Raw visual facts about one page
#[derive(Debug, Clone, Default)]
pub struct PageFacts {
    /// Count of raster images with width*height >= the configured area
    pub meaningful_image_count: usize,
    /// Count of vector path-construction operators
    pub drawing_count: usize,
}

/// Analyze every page of the document.
///
/// Returns facts keyed by 1-indexed page number. Pages whose content stream
/// fails to decode are reported with zeroed counts rather than failing the
/// document.
pub fn analyze_pages(doc: &Document, min_image_area: u64) -> HashMap<u32, PageFacts> {
    let mut facts = HashMap::new();
    for (page_num, page_id) in doc.get_pages() {
        facts.insert(page_num, analyze_page(doc, page_id, min_image_area));
    }
    facts
}

fn analyze_page(doc: &Document, page_id: ObjectId, min_image_area: u64) -> PageFacts {
    let mut facts = PageFacts::default();

    let content_data = match doc.get_page_content(page_id) {
        Ok(data) => data,
        Err(e) => {
            tracing::warn!(page = ?page_id, error = %e, "Failed to read page content");
            return facts;
        }
    };
    let content = match Content::decode(&content_data) {
        Ok(content) => content,
        Err(e) => {
            tracing::warn!(page = ?page_id, error = %e, "Failed to decode content stream");
            return facts;
        }
    };

    let xobjects = page_xobjects(doc, page_id);

    for op in &content.operations {
        match op.operator.as_str() {
            // path construction
            "m" | "l" | "c" | "v" | "y" | "re" => facts.drawing_count += 1,
            // inline image: dimensions unknown, counted as meaningful
            "BI" => facts.meaningful_image_count += 1,
            "Do" => {
                if let Some(Object::Name(name)) = op.operands.first() {
                    if let Some(area) = xobjects.get(name.as_slice()) {
                        if *area >= min_image_area {
                            facts.meaningful_image_count += 1;
                        }
                    }
                }
            }
            _ => {}
        }
    }
    facts
}

/// Image XObject pixel areas keyed by resource name, for one page.
///
/// Resources may sit on the page or be inherited from an ancestor Pages
/// node; references are followed either way.
fn page_xobjects(doc: &Document, page_id: ObjectId) -> HashMap<Vec<u8>, u64> {
    let mut images = HashMap::new();

    let Some(resources) = find_resources(doc, page_id) else {
        return images;
    };
    let Some(xobject_dict) = resources
        .get(b"XObject")
        .ok()
        .map(|o| resolve(doc, o))
        .and_then(|o| o.as_dict().ok())
    else {
        return images;
    };

    for (name, value) in xobject_dict.iter() {
        let Some(stream) = resolve(doc, value).as_stream().ok() else {
            continue;
        };
        let is_image = matches!(
            stream.dict.get(b"Subtype"),
            Ok(Object::Name(subtype)) if subtype.as_slice() == b"Image"
        );
        if !is_image {
            continue;
        }
        let width = stream
            .dict
            .get(b"Width")
            .ok()
            .and_then(|o| resolve(doc, o).as_i64().ok())
            .unwrap_or(0);
        let height = stream
            .dict
            .get(b"Height")
            .ok()
            .and_then(|o| resolve(doc, o).as_i64().ok())
            .unwrap_or(0);
        images.insert(name.clone(), (width.max(0) as u64) * (height.max(0) as u64));
    }
    images
}

/// Walk up from the page through Parent links until a Resources entry shows.
fn find_resources(doc: &Document, page_id: ObjectId) -> Option<&lopdf::Dictionary> {
    let mut current = page_id;
    for _ in 0..16 {
        let dict = doc.get_object(current).ok()?.as_dict().ok()?;
        if let Ok(resources) = dict.get(b"Resources") {
            return resolve(doc, resources).as_dict().ok();
        }
        match dict.get(b"Parent") {
            Ok(parent) => current = parent.as_reference().ok()?,
            Err(_) => return None,
        }
    }
    None
}

fn resolve<'a>(doc: &'a Document, object: &'a Object) -> &'a Object {
    let mut current = object;
    for _ in 0..16 {
        match current {
            Object::Reference(id) => match doc.get_object(*id) {
                Ok(next) => current = next,
                Err(_) => return current,
            },
            _ => return current,
        }
    }
    current
}
