//! Accessors for opaque JSON-LD documents
//!
//! The engine never interprets activities and objects beyond a stable
//! identifier, an actor, attribution identifiers and the type tag; typed
//! vocabulary classes belong to the embedding application. Documents are
//! handled in compacted form and never mutated in place: stamping an
//! identifier clones with an override.

use serde_json::{Map, Value};
use url::Url;

fn id_of(value: &Value) -> Option<Url> {
    match value {
        Value::String(s) => Url::parse(s).ok(),
        Value::Object(map) => map.get("id").and_then(|id| id_of(id)),
        _ => None,
    }
}

/// The `id` of a document, when present and a valid URL.
pub fn object_id(document: &Value) -> Option<Url> {
    document.get("id").and_then(id_of)
}

/// All values of the `type` property, in document order.
pub fn object_types(document: &Value) -> Vec<String> {
    match document.get("type") {
        Some(Value::String(t)) => vec![t.clone()],
        Some(Value::Array(types)) => types
            .iter()
            .filter_map(|t| t.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    }
}

/// The `actor` of an activity. Accepts a plain identifier or an embedded
/// actor object with an `id`.
pub fn activity_actor(document: &Value) -> Option<Url> {
    document.get("actor").and_then(id_of)
}

/// All `attributedTo` identifiers of a document.
pub fn attribution_ids(document: &Value) -> Vec<Url> {
    match document.get("attributedTo") {
        Some(Value::Array(entries)) => entries.iter().filter_map(id_of).collect(),
        Some(single) => id_of(single).into_iter().collect(),
        None => Vec::new(),
    }
}

/// Clone `document` with its `id` set to `id`. The original is untouched.
pub fn with_id(document: &Value, id: &Url) -> Value {
    let mut map = match document {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };
    map.insert("id".to_string(), Value::String(id.to_string()));
    Value::Object(map)
}
