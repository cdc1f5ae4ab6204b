//! Raw catalog records → [`NewItem`].
//!
//! The remote catalog has used two spellings for every field over time: the
//! upper-case originals (`IDX`, `TYPE_GBN_NM`, ...) and lower-case aliases.
//! Each field is read from its primary name and falls back to the alias when
//! the primary is absent, null or blank. Nothing is ever invented: a field
//! present under neither name stays `None`.

use serde_json::Value;

use crate::storage::{DictionaryType, NewItem};

/// `(primary, alias)` field names for each item column.
const ID: (&str, &str) = ("IDX", "id");
const NAME: (&str, &str) = ("NAME", "name");
const CONTENT: (&str, &str) = ("CONTENT", "content");
const REFERENCE: (&str, &str) = ("ETC", "reference");
const DICTIONARY_TYPE: (&str, &str) = ("GUBUN", "dictionary_type");
const TYPE_CODE: (&str, &str) = ("TYPE_GBN", "type_code");
const TYPE_NAME: (&str, &str) = ("TYPE_GBN_NM", "type_name");
const COPYRIGHT: (&str, &str) = ("COPYRIGHT", "copyright");
const DATA_LINK: (&str, &str) = ("DATA_LINK", "data_link");

/// Result of normalizing one page of records.
#[derive(Debug, Default)]
pub struct NormalizedPage {
    pub items: Vec<NewItem>,
    /// Records dropped because they carried no usable id
    pub skipped: usize,
}

/// Read a text field. Strings are taken verbatim, numbers are rendered as
/// text, anything else counts as absent. Blank strings count as absent so the
/// alias gets a chance.
fn text_value(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn field(record: &Value, (primary, alias): (&str, &str)) -> Option<String> {
    text_value(record.get(primary)).or_else(|| text_value(record.get(alias)))
}

/// Normalize a single record, or `None` if it has no usable id.
pub fn normalize_record(record: &Value) -> Option<NewItem> {
    let id = field(record, ID)?.trim().to_owned();

    let dictionary_type = field(record, DICTIONARY_TYPE).and_then(|raw| {
        raw.parse::<DictionaryType>()
            .map_err(|e| tracing::debug!(id = %id, error = %e, "Unrecognized dictionary type"))
            .ok()
    });

    Some(NewItem {
        name: field(record, NAME).unwrap_or_default(),
        content: field(record, CONTENT),
        reference: field(record, REFERENCE),
        dictionary_type,
        type_code: field(record, TYPE_CODE),
        type_name: field(record, TYPE_NAME),
        copyright: field(record, COPYRIGHT),
        data_link: field(record, DATA_LINK),
        id,
    })
}

/// Normalize a page of records, counting the ones skipped.
pub fn normalize_page(records: &[Value]) -> NormalizedPage {
    let mut page = NormalizedPage::default();
    for record in records {
        match normalize_record(record) {
            Some(item) => page.items.push(item),
            None => page.skipped += 1,
        }
    }

    if page.skipped > 0 {
        tracing::warn!(
            skipped = page.skipped,
            kept = page.items.len(),
            "Catalog records without an id skipped"
        );
    }
    page
}
