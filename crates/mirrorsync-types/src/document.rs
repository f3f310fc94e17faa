//! Documents: an `_id` plus a flat map of top-level fields.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ModelError;
use crate::ids::DocId;

/// Top-level fields of a document, excluding `_id`.
pub type Fields = serde_json::Map<String, Value>;

/// A stored or mirrored document.
///
/// Serializes as a single flat JSON object with `_id` alongside the fields,
/// which is the shape documents take on the wire and in method results.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Document {
    #[serde(rename = "_id")]
    pub id: DocId,
    #[serde(flatten)]
    pub fields: Fields,
}

impl Document {
    pub fn new(id: impl Into<DocId>, fields: Fields) -> Self {
        Self { id: id.into(), fields }
    }

    /// Parse a JSON object carrying a string `_id`.
    pub fn from_value(value: Value) -> Result<Self, ModelError> {
        let Value::Object(mut map) = value else {
            return Err(ModelError::InvalidDocument("expected an object".into()));
        };
        let id = match map.remove("_id") {
            Some(Value::String(id)) => DocId::from(id),
            Some(other) => {
                return Err(ModelError::InvalidDocument(format!(
                    "_id must be a string, got {other}"
                )));
            }
            None => return Err(ModelError::InvalidDocument("missing _id".into())),
        };
        Ok(Self { id, fields: map })
    }

    /// Flat JSON form with `_id` included.
    pub fn to_value(&self) -> Value {
        let mut map = Fields::with_capacity(self.fields.len() + 1);
        map.insert("_id".to_string(), Value::String(self.id.to_string()));
        for (k, v) in &self.fields {
            map.insert(k.clone(), v.clone());
        }
        Value::Object(map)
    }

    /// Shallow merge: every top-level field in `other` overwrites ours.
    ///
    /// Fields absent from `other` are kept. An `_id` key inside `other` is
    /// ignored, identity never changes through a merge.
    pub fn shallow_merge(&mut self, other: &Fields) {
        for (k, v) in other {
            if k == "_id" {
                continue;
            }
            self.fields.insert(k.clone(), v.clone());
        }
    }

    /// Look up a top-level field.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// True if `value` looks like a document: an object with a string `_id`.
    pub fn is_identified(value: &Value) -> bool {
        value
            .as_object()
            .and_then(|m| m.get("_id"))
            .is_some_and(Value::is_string)
    }
}
