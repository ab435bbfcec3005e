//! In-place edits of cached JSON payloads.
//!
//! Cached query results come in three shapes: a detail object (`{"id": ..}`),
//! a bare listing (`[{..}, ..]`), or a paged listing
//! (`{"items": [..], "total": n}`). Every helper returns `None` when the
//! entity is absent or nothing would change, so callers can skip the write.

use serde_json::{Map, Value};

/// Field holding the rows of a paged listing.
pub const ITEMS_FIELD: &str = "items";
/// Field holding the total row count of a paged listing.
pub const TOTAL_FIELD: &str = "total";

fn rows_mut(data: &mut Value) -> Option<&mut Vec<Value>> {
    match data {
        Value::Array(rows) => Some(rows),
        Value::Object(map) => map.get_mut(ITEMS_FIELD).and_then(Value::as_array_mut),
        _ => None,
    }
}

fn has_id(value: &Value, id: &Value) -> bool {
    value.get("id") == Some(id)
}

/// Merge `fields` into `target`, returning whether anything changed.
fn merge_fields(target: &mut Value, fields: &Map<String, Value>) -> bool {
    let Some(object) = target.as_object_mut() else {
        return false;
    };
    let mut changed = false;
    for (name, value) in fields {
        if object.get(name) != Some(value) {
            object.insert(name.clone(), value.clone());
            changed = true;
        }
    }
    changed
}

/// Merge `fields` into the entity with `id`, wherever it appears in `data`.
pub fn merge_entity(data: &Value, id: &Value, fields: &Map<String, Value>) -> Option<Value> {
    let mut next = data.clone();
    let changed = if has_id(&next, id) {
        merge_fields(&mut next, fields)
    } else {
        let rows = rows_mut(&mut next)?;
        let row = rows.iter_mut().find(|row| has_id(row, id))?;
        merge_fields(row, fields)
    };
    changed.then_some(next)
}

/// Remove the entity with `id` from a listing, decrementing `total` if present.
pub fn remove_entity(data: &Value, id: &Value) -> Option<Value> {
    let mut next = data.clone();
    let rows = rows_mut(&mut next)?;
    let position = rows.iter().position(|row| has_id(row, id))?;
    rows.remove(position);

    if let Some(total) = next.get_mut(TOTAL_FIELD)
        && let Some(n) = total.as_u64()
    {
        *total = Value::from(n.saturating_sub(1));
    }
    Some(next)
}
