//! Store-merge payloads: method results the client folds into its mirrored store.
//!
//! A method whose handler returns cursors produces a JSON object mapping each
//! collection name to an array of documents, plus [`STORE_MERGE_MARKER`] set
//! to `true`. The marker is what tells the client to merge and cache the
//! result instead of handing it back verbatim.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::document::{Document, Fields};
use crate::error::ModelError;

/// Result key flagging a store-merge payload.
pub const STORE_MERGE_MARKER: &str = "cacheMethodResultInStore";

/// Documents grouped by collection name.
pub type DocumentsByCollection = BTreeMap<String, Vec<Document>>;

/// True if `value` is an object carrying a truthy [`STORE_MERGE_MARKER`].
pub fn has_store_merge_marker(value: &Value) -> bool {
    value
        .get(STORE_MERGE_MARKER)
        .is_some_and(|v| !matches!(v, Value::Null | Value::Bool(false)))
}

/// Encode documents as a marked store-merge payload.
pub fn encode_store_merge(data: &DocumentsByCollection) -> Value {
    let mut map = Fields::new();
    map.insert(STORE_MERGE_MARKER.to_string(), Value::Bool(true));
    for (collection, docs) in data {
        map.insert(
            collection.clone(),
            Value::Array(docs.iter().map(Document::to_value).collect()),
        );
    }
    Value::Object(map)
}

/// The payload with the marker removed, as the caller should see it.
pub fn without_marker(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut map = map.clone();
            map.remove(STORE_MERGE_MARKER);
            Value::Object(map)
        }
        other => other.clone(),
    }
}

/// Decode a collection → documents mapping, ignoring the marker key.
///
/// Every value must be an array of identified documents.
pub fn decode_documents_by_collection(value: &Value) -> Result<DocumentsByCollection, ModelError> {
    let Value::Object(map) = value else {
        return Err(ModelError::InvalidDocument(
            "expected an object of collection names to document arrays".into(),
        ));
    };

    let mut out = DocumentsByCollection::new();
    for (collection, docs) in map {
        if collection == STORE_MERGE_MARKER {
            continue;
        }
        let Value::Array(docs) = docs else {
            return Err(ModelError::InvalidDocument(format!(
                "'{collection}' must map to an array of documents"
            )));
        };
        let docs = docs
            .iter()
            .cloned()
            .map(Document::from_value)
            .collect::<Result<Vec<_>, _>>()?;
        out.insert(collection.clone(), docs);
    }
    Ok(out)
}
