//! Leaves touched by a JSON merge patch

use ditto_model::JsonPointer;
use serde_json::Value;

/// Pointers of every value a merge patch at `path` would write or delete.
///
/// Nested objects are descended into. Scalars, arrays, `null` (deletion) and
/// empty objects are leaves.
pub fn merge_leaves(path: &JsonPointer, patch: &Value) -> Vec<JsonPointer> {
    let mut leaves = Vec::new();
    collect(path, patch, &mut leaves);
    leaves
}

fn collect(path: &JsonPointer, patch: &Value, out: &mut Vec<JsonPointer>) {
    match patch {
        Value::Object(map) if !map.is_empty() => {
            for (key, value) in map {
                collect(&path.append(key.as_str()), value, out);
            }
        }
        _ => out.push(path.clone()),
    }
}
