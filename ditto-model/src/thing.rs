//! Helpers over Thing JSON documents

use crate::entity::{EntityId, InvalidEntityId};
use crate::pointer::JsonPointer;
use serde_json::{Map, Value};

/// `policyId` of a Thing document, if present
pub fn policy_id(thing: &Value) -> Result<Option<EntityId>, InvalidEntityId> {
    match thing.get("policyId") {
        Some(Value::String(raw)) => EntityId::new(raw.clone()).map(Some),
        Some(other) => Err(InvalidEntityId(other.to_string())),
        None => Ok(None),
    }
}

/// `thingId` of a Thing document, if present
pub fn thing_id(thing: &Value) -> Result<Option<EntityId>, InvalidEntityId> {
    match thing.get("thingId") {
        Some(Value::String(raw)) => EntityId::new(raw.clone()).map(Some),
        Some(other) => Err(InvalidEntityId(other.to_string())),
        None => Ok(None),
    }
}

/// Stamp `thingId` and `policyId` onto a Thing document
pub fn with_ids(mut thing: Value, thing_id: &EntityId, policy_id: &EntityId) -> Value {
    if !thing.is_object() {
        thing = Value::Object(Map::new());
    }
    if let Value::Object(map) = &mut thing {
        map.insert("thingId".into(), Value::String(thing_id.to_string()));
        map.insert("policyId".into(), Value::String(policy_id.to_string()));
    }
    thing
}

/// Project a document onto the selected fields. Missing fields are skipped.
pub fn select_fields(doc: &Value, fields: &[JsonPointer]) -> Value {
    let mut out = Value::Object(Map::new());
    for field in fields {
        if let Some(value) = field.get(doc) {
            field.set(&mut out, value.clone());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_ids() {
        let thing = json!({"thingId": "org.example:lamp", "policyId": "org.example:p"});
        assert_eq!(
            policy_id(&thing).unwrap().map(|id| id.to_string()),
            Some("org.example:p".to_string())
        );
        assert!(policy_id(&json!({"policyId": 4})).is_err());
        assert_eq!(thing_id(&json!({})).unwrap(), None);
    }

    #[test]
    fn test_select_fields() {
        let doc = json!({"thingId": "a:b", "attributes": {"x": 1, "y": 2}, "features": {}});
        let selected = select_fields(
            &doc,
            &[
                JsonPointer::parse("/thingId"),
                JsonPointer::parse("/attributes/x"),
                JsonPointer::parse("/nope"),
            ],
        );
        assert_eq!(selected, json!({"thingId": "a:b", "attributes": {"x": 1}}));
    }
}
