//! Field-level change application for `changed` messages.

use super::Document;

/// Apply a `changed` diff to a document in place: every key in `fields` is
/// set, every key in `cleared` is removed.
pub fn apply_changes(doc: &mut Document, fields: Option<&Document>, cleared: Option<&[String]>) {
    if let Some(fields) = fields {
        for (key, value) in fields {
            doc.insert(key.clone(), value.clone());
        }
    }
    if let Some(cleared) = cleared {
        for key in cleared {
            doc.remove(key);
        }
    }
}
