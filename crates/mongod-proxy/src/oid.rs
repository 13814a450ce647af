use mongodb::bson::oid::ObjectId;
use mongodb::bson::{Bson, Document};

/// Rewrite identifier fields of a query document in place so they carry the
/// database's native `ObjectId` representation instead of its textual form.
///
/// A key is identifier-bearing if it is named `_id` or if any ancestor key
/// was, so operator documents like `{_id: {$in: [...]}}` coerce all the way
/// down. Values that are not a syntactically valid ObjectId pass through
/// untouched. Depth-first and mutating; callers pass freshly constructed
/// query literals, never cyclic structures.
pub fn coerce_object_ids(doc: &mut Document) {
    walk(doc, false)
}

fn walk(doc: &mut Document, in_id_context: bool) {
    for (key, value) in doc.iter_mut() {
        coerce_value(value, in_id_context || key == "_id");
    }
}

fn coerce_value(value: &mut Bson, id_bearing: bool) {
    match value {
        Bson::String(repr) if id_bearing => {
            if let Ok(oid) = ObjectId::parse_str(repr) {
                *value = Bson::ObjectId(oid);
            }
        }
        Bson::Document(doc) => walk(doc, id_bearing),
        // Array positions are not key names: elements inherit the current
        // context unchanged.
        Bson::Array(items) => {
            for item in items {
                coerce_value(item, id_bearing);
            }
        }
        // Numbers and every other scalar can never be a valid ObjectId.
        _ => (),
    }
}
