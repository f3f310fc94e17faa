//! Mutation modifiers and their classification.
//!
//! A modifier comes in one of three well-formed shapes:
//!
//! - **update-style**: every top-level key is an update operator (`$set`, `$inc`, ...)
//! - **replacement**: no top-level key is an operator, the object replaces the document
//! - **pipeline**: an array of aggregation stages
//!
//! An object mixing operator and plain keys is invalid. It is kept as
//! [`Modifier::Mixed`] and passed through untouched so the store rejects it
//! with its own error.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::document::{Document, Fields};
use crate::error::ModelError;
use crate::ids::DocId;

/// Update operators recognized when classifying a modifier.
pub const UPDATE_OPERATORS: &[&str] = &[
    "$currentDate",
    "$inc",
    "$min",
    "$max",
    "$mul",
    "$rename",
    "$set",
    "$setOnInsert",
    "$unset",
    "$addToSet",
    "$pop",
    "$pull",
    "$push",
    "$pushAll",
    "$bit",
];

/// True if `key` is one of [`UPDATE_OPERATORS`].
pub fn is_update_operator(key: &str) -> bool {
    UPDATE_OPERATORS.contains(&key)
}

/// A classified mutation modifier.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub enum Modifier {
    /// Every key is an update operator. An empty object lands here.
    Update(Fields),
    /// No key is an update operator.
    Replacement(Fields),
    /// Aggregation pipeline stages.
    Pipeline(Vec<Value>),
    /// Operator and plain keys mixed together; invalid, passed through.
    Mixed(Fields),
}

impl Modifier {
    /// Classify a raw JSON modifier.
    pub fn from_value(value: Value) -> Result<Self, ModelError> {
        match value {
            Value::Array(stages) => Ok(Self::Pipeline(stages)),
            Value::Object(map) => Ok(Self::classify(map)),
            other => Err(ModelError::InvalidModifier(format!(
                "expected an object or a stage array, got {other}"
            ))),
        }
    }

    fn classify(map: Fields) -> Self {
        if map.keys().all(|k| is_update_operator(k)) {
            Self::Update(map)
        } else if map.keys().all(|k| !is_update_operator(k)) {
            Self::Replacement(map)
        } else {
            Self::Mixed(map)
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Self::Update(m) | Self::Replacement(m) | Self::Mixed(m) => Value::Object(m.clone()),
            Self::Pipeline(stages) => Value::Array(stages.clone()),
        }
    }

    /// The document an upsert inserted, as far as the modifier alone tells us.
    ///
    /// Update-style modifiers contribute `$set` and `$setOnInsert` (other
    /// operators are not replayed); replacements contribute themselves.
    /// Returns `None` for pipelines, mixed modifiers, or an empty derivation.
    pub fn upserted_document(&self, inserted_id: &DocId) -> Option<Document> {
        let fields = match self {
            Self::Update(ops) => {
                let mut fields = Fields::new();
                for op in ["$set", "$setOnInsert"] {
                    if let Some(Value::Object(set)) = ops.get(op) {
                        for (k, v) in set {
                            fields.insert(k.clone(), v.clone());
                        }
                    }
                }
                fields
            }
            Self::Replacement(doc) => doc.clone(),
            Self::Pipeline(_) | Self::Mixed(_) => return None,
        };

        if fields.is_empty() {
            return None;
        }
        let mut doc = Document::new(inserted_id.clone(), fields);
        doc.fields.remove("_id");
        Some(doc)
    }
}

impl TryFrom<Value> for Modifier {
    type Error = ModelError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        Self::from_value(value)
    }
}

impl From<Modifier> for Value {
    fn from(modifier: Modifier) -> Self {
        match modifier {
            Modifier::Update(m) | Modifier::Replacement(m) | Modifier::Mixed(m) => Value::Object(m),
            Modifier::Pipeline(stages) => Value::Array(stages),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn classify(v: Value) -> Modifier {
        Modifier::from_value(v).unwrap()
    }

    #[test]
    fn test_classification() {
        assert!(matches!(classify(json!({"$set": {"a": 1}, "$inc": {"n": 1}})), Modifier::Update(_)));
        assert!(matches!(classify(json!({"a": 1, "b": 2})), Modifier::Replacement(_)));
        assert!(matches!(classify(json!({"$set": {"a": 1}, "b": 2})), Modifier::Mixed(_)));
        assert!(matches!(classify(json!([{"$set": {"a": 1}}])), Modifier::Pipeline(_)));
        assert!(matches!(classify(json!({})), Modifier::Update(_)));
        assert!(Modifier::from_value(json!("nope")).is_err());
    }

    #[test]
    fn test_unknown_dollar_key_is_not_an_operator() {
        // $where is not an update operator, so this is a replacement shape
        assert!(matches!(classify(json!({"$where": 1})), Modifier::Replacement(_)));
    }

    #[test]
    fn test_upserted_document_from_update() {
        let m = classify(json!({"$set": {"a": 1}, "$setOnInsert": {"b": 2}, "$inc": {"n": 1}}));
        let doc = m.upserted_document(&DocId::from("x")).unwrap();
        assert_eq!(doc.to_value(), json!({"_id": "x", "a": 1, "b": 2}));
    }

    #[test]
    fn test_upserted_document_from_replacement() {
        let m = classify(json!({"title": "hello"}));
        let doc = m.upserted_document(&DocId::from("x")).unwrap();
        assert_eq!(doc.to_value(), json!({"_id": "x", "title": "hello"}));
    }

    #[test]
    fn test_upserted_document_none_cases() {
        let id = DocId::from("x");
        assert!(classify(json!({"$inc": {"n": 1}})).upserted_document(&id).is_none());
        assert!(classify(json!([{"$set": {"a": 1}}])).upserted_document(&id).is_none());
        assert!(classify(json!({"$set": {"a": 1}, "b": 1})).upserted_document(&id).is_none());
    }

    #[test]
    fn test_serde_via_value() {
        let m: Modifier = serde_json::from_value(json!({"$set": {"a": 1}})).unwrap();
        assert!(matches!(m, Modifier::Update(_)));
        assert_eq!(serde_json::to_value(&m).unwrap(), json!({"$set": {"a": 1}}));
    }
}
