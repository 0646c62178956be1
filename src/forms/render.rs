//! PDF output with lopdf: AcroForm template filling and generated pages.

use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Dictionary, Document, Object, ObjectId, Stream};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tracing::{debug, warn};

use super::{FormError, FormLayout};

const PAGE_WIDTH: i64 = 612;
const PAGE_HEIGHT: i64 = 792;
const MARGIN_LEFT: i64 = 50;
const VALUE_COLUMN: i64 = 440;
const TOP: i64 = 740;
const LEADING: i64 = 18;
const LINES_PER_PAGE: usize = 36;

/// Fill a template's AcroForm fields named after the layout keys.
pub fn fill_template(path: &Path, layout: &FormLayout) -> Result<Vec<u8>, FormError> {
    let mut doc = Document::load(path).map_err(|source| FormError::Template {
        path: path.to_path_buf(),
        source,
    })?;

    let values: HashMap<&str, &str> = layout
        .lines
        .iter()
        .map(|l| (l.key.as_str(), l.value.as_str()))
        .collect();

    let root_id = doc.trailer.get(b"Root")?.as_reference()?;
    let acroform = doc.get_object(root_id)?.as_dict()?.get(b"AcroForm")?.clone();
    let acroform_ref = acroform.as_reference().ok();

    let field_ids: Vec<ObjectId> = {
        let dict = match acroform_ref {
            Some(id) => doc.get_object(id)?.as_dict()?,
            None => acroform.as_dict()?,
        };
        references(dict.get(b"Fields")?)
    };

    let mut filled = 0;
    let mut visited = HashSet::new();
    for id in field_ids {
        filled += fill_field(&mut doc, id, "", &values, &mut visited)?;
    }

    // Let viewers rebuild appearance streams for the new values.
    match acroform_ref {
        Some(id) => doc
            .get_object_mut(id)?
            .as_dict_mut()?
            .set("NeedAppearances", true),
        None => doc
            .get_object_mut(root_id)?
            .as_dict_mut()?
            .get_mut(b"AcroForm")?
            .as_dict_mut()?
            .set("NeedAppearances", true),
    }

    debug!("Filled {} of {} fields in {}", filled, values.len(), path.display());
    if filled == 0 {
        warn!("Template {} has no fields matching the form layout", path.display());
    }

    let mut out = Vec::new();
    doc.save_to(&mut out)?;
    Ok(out)
}

fn references(obj: &Object) -> Vec<ObjectId> {
    obj.as_array()
        .map(|items| items.iter().filter_map(|o| o.as_reference().ok()).collect())
        .unwrap_or_default()
}

/// Set `V` on a field (and its kids) whose full or partial name is a layout
/// key. Returns the number of fields set. Each object is visited once, so
/// malformed trees with cycles terminate.
fn fill_field(
    doc: &mut Document,
    id: ObjectId,
    parent: &str,
    values: &HashMap<&str, &str>,
    visited: &mut HashSet<ObjectId>,
) -> Result<usize, FormError> {
    if !visited.insert(id) {
        warn!("Field tree revisits object {:?}; skipping", id);
        return Ok(0);
    }

    let (partial, kids) = {
        let dict = doc.get_object(id)?.as_dict()?;
        let partial = dict
            .get(b"T")
            .and_then(Object::as_str)
            .map(|t| String::from_utf8_lossy(t).into_owned())
            .ok();
        let kids = dict.get(b"Kids").map(references).unwrap_or_default();
        (partial, kids)
    };

    let full_name = match (&partial, parent.is_empty()) {
        (Some(t), true) => t.clone(),
        (Some(t), false) => format!("{}.{}", parent, t),
        (None, _) => parent.to_string(),
    };

    let value = values
        .get(full_name.as_str())
        .or_else(|| partial.as_deref().and_then(|t| values.get(t)));

    let mut filled = 0;
    if let (Some(value), Some(_)) = (value, &partial) {
        let dict = doc.get_object_mut(id)?.as_dict_mut()?;
        dict.set("V", Object::string_literal(*value));
        filled += 1;
    }

    for kid in kids {
        filled += fill_field(doc, kid, &full_name, values, visited)?;
    }
    Ok(filled)
}

/// Generate a plain summary PDF listing every line of the layout.
pub fn generate(layout: &FormLayout) -> Result<Vec<u8>, FormError> {
    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();

    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Helvetica",
        "Encoding" => "WinAnsiEncoding",
    });
    let bold_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Helvetica-Bold",
        "Encoding" => "WinAnsiEncoding",
    });
    let resources_id = doc.add_object(dictionary! {
        "Font" => dictionary! {
            "F1" => font_id,
            "F2" => bold_id,
        },
    });

    let chunks: Vec<_> = if layout.lines.is_empty() {
        vec![&layout.lines[..]]
    } else {
        layout.lines.chunks(LINES_PER_PAGE).collect()
    };
    let page_count = chunks.len();

    let mut kids = Vec::with_capacity(page_count);
    for (index, lines) in chunks.into_iter().enumerate() {
        let mut ops = Vec::new();
        text(&mut ops, "F2", 14, MARGIN_LEFT, TOP + 2 * LEADING, &layout.title);
        if page_count > 1 {
            let footer = format!("Page {} of {}", index + 1, page_count);
            text(&mut ops, "F1", 9, MARGIN_LEFT, 40, &footer);
        }

        let mut y = TOP;
        for line in lines {
            text(&mut ops, "F1", 10, MARGIN_LEFT, y, &line.label);
            text(&mut ops, "F1", 10, VALUE_COLUMN, y, &line.value);
            y -= LEADING;
        }

        let content = Content { operations: ops };
        let content_id = doc.add_object(Stream::new(Dictionary::new(), content.encode()?));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "Contents" => content_id,
        });
        kids.push(Object::Reference(page_id));
    }

    let pages = dictionary! {
        "Type" => "Pages",
        "Kids" => kids,
        "Count" => page_count as i64,
        "Resources" => resources_id,
        "MediaBox" => vec![0.into(), 0.into(), PAGE_WIDTH.into(), PAGE_HEIGHT.into()],
    };
    doc.objects.insert(pages_id, Object::Dictionary(pages));

    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);

    let mut out = Vec::new();
    doc.save_to(&mut out)?;
    Ok(out)
}

fn text(ops: &mut Vec<Operation>, font: &str, size: i64, x: i64, y: i64, value: &str) {
    ops.push(Operation::new("BT", vec![]));
    ops.push(Operation::new("Tf", vec![font.into(), size.into()]));
    ops.push(Operation::new("Td", vec![x.into(), y.into()]));
    ops.push(Operation::new("Tj", vec![Object::string_literal(value)]));
    ops.push(Operation::new("ET", vec![]));
}
