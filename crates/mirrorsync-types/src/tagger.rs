//! Correlation tagging of mutation modifiers.
//!
//! A mutating call stamps its [`OperationId`] into every document it touches
//! by extending its modifier with a write to [`OPERATION_ID_FIELD`]. The
//! change stream then reports the field back, which is how a change event is
//! attributed to the call that caused it.
//!
//! Internal code never spells the reserved field: it holds a
//! [`TaggedModifier`] and converts to the wire form only when handing the
//! modifier to the store. Documents coming back out go through
//! [`strip_tag`] before anyone else sees them.

use serde_json::{Value, json};

use crate::document::Fields;
use crate::ids::OperationId;
use crate::modifier::Modifier;

/// Reserved document field carrying the operation id of the last tagged write.
pub const OPERATION_ID_FIELD: &str = "__mirrorsync_operationId";

/// A modifier together with the operation that is about to apply it.
#[derive(Clone, Debug, PartialEq)]
pub struct TaggedModifier {
    original: Modifier,
    operation_id: OperationId,
}

impl TaggedModifier {
    pub fn new(original: Modifier, operation_id: OperationId) -> Self {
        Self { original, operation_id }
    }

    /// The modifier exactly as the caller wrote it.
    pub fn original(&self) -> &Modifier {
        &self.original
    }

    pub fn operation_id(&self) -> OperationId {
        self.operation_id
    }

    /// Store-facing form: the original modifier plus a write of the tag.
    ///
    /// - update-style: the tag is merged into `$set`
    /// - replacement: the tag becomes a top-level field
    /// - pipeline: an `$addFields` stage is prepended
    /// - mixed: returned untouched
    pub fn to_wire(&self) -> Modifier {
        let tag = Value::String(self.operation_id.to_hex());
        match &self.original {
            Modifier::Update(ops) => {
                let mut ops = ops.clone();
                let mut set = match ops.remove("$set") {
                    Some(Value::Object(set)) => set,
                    _ => Fields::new(),
                };
                set.insert(OPERATION_ID_FIELD.to_string(), tag);
                ops.insert("$set".to_string(), Value::Object(set));
                Modifier::Update(ops)
            }
            Modifier::Replacement(doc) => {
                let mut doc = doc.clone();
                doc.insert(OPERATION_ID_FIELD.to_string(), tag);
                Modifier::Replacement(doc)
            }
            Modifier::Pipeline(stages) => {
                let mut tagged = Vec::with_capacity(stages.len() + 1);
                tagged.push(json!({ "$addFields": { OPERATION_ID_FIELD: tag } }));
                tagged.extend(stages.iter().cloned());
                Modifier::Pipeline(tagged)
            }
            Modifier::Mixed(_) => self.original.clone(),
        }
    }

    /// Inverse of [`to_wire`](Self::to_wire).
    ///
    /// Returns the untagged modifier and the operation id that was embedded,
    /// if any. A modifier carrying no tag is returned as-is with `None`.
    pub fn from_wire(modifier: Modifier) -> (Modifier, Option<OperationId>) {
        match modifier {
            Modifier::Pipeline(mut stages) => {
                let tag = stages
                    .first()
                    .and_then(|s| s.get("$addFields"))
                    .and_then(|f| f.get(OPERATION_ID_FIELD))
                    .and_then(Value::as_str)
                    .and_then(|s| OperationId::parse(s).ok());
                if tag.is_some() {
                    stages.remove(0);
                }
                (Modifier::Pipeline(stages), tag)
            }
            Modifier::Update(mut ops) => {
                let mut tag = None;
                if let Some(Value::Object(set)) = ops.get_mut("$set") {
                    tag = strip_tag(set);
                    if set.is_empty() {
                        ops.remove("$set");
                    }
                }
                (Modifier::Update(ops), tag)
            }
            Modifier::Replacement(mut doc) => {
                let tag = strip_tag(&mut doc);
                (Modifier::Replacement(doc), tag)
            }
            mixed @ Modifier::Mixed(_) => (mixed, None),
        }
    }
}

/// Read the embedded operation id without removing it.
pub fn embedded_operation_id(fields: &Fields) -> Option<OperationId> {
    fields
        .get(OPERATION_ID_FIELD)
        .and_then(Value::as_str)
        .and_then(|s| OperationId::parse(s).ok())
}

/// Remove the reserved field, returning the operation id it carried.
///
/// The field is removed even when its value does not parse, so a malformed
/// tag never leaks to a caller either.
pub fn strip_tag(fields: &mut Fields) -> Option<OperationId> {
    fields
        .remove(OPERATION_ID_FIELD)
        .as_ref()
        .and_then(Value::as_str)
        .and_then(|s| OperationId::parse(s).ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn modifier(v: Value) -> Modifier {
        Modifier::from_value(v).unwrap()
    }

    #[test]
    fn test_update_style_tag_merges_into_set() {
        let op = OperationId::new();
        let tagged = TaggedModifier::new(modifier(json!({"$set": {"a": 1}, "$inc": {"n": 1}})), op);
        let wire = tagged.to_wire().to_value();

        assert_eq!(wire["$set"]["a"], json!(1));
        assert_eq!(wire["$set"][OPERATION_ID_FIELD], json!(op.to_hex()));
        assert_eq!(wire["$inc"], json!({"n": 1}));
    }

    #[test]
    fn test_update_without_set_gains_one() {
        let op = OperationId::new();
        let tagged = TaggedModifier::new(modifier(json!({"$unset": {"a": ""}})), op);
        let wire = tagged.to_wire();
        assert!(matches!(&wire, Modifier::Update(ops) if ops.contains_key("$set")));

        let (back, tag) = TaggedModifier::from_wire(wire);
        assert_eq!(tag, Some(op));
        assert_eq!(back, modifier(json!({"$unset": {"a": ""}})));
    }

    #[test]
    fn test_replacement_tag_is_top_level() {
        let op = OperationId::new();
        let tagged = TaggedModifier::new(modifier(json!({"title": "x"})), op);
        let wire = tagged.to_wire().to_value();
        assert_eq!(wire, json!({"title": "x", OPERATION_ID_FIELD: op.to_hex()}));

        let (back, tag) = TaggedModifier::from_wire(tagged.to_wire());
        assert_eq!(tag, Some(op));
        assert_eq!(&back, tagged.original());
    }

    #[test]
    fn test_pipeline_gets_prepended_stage() {
        let op = OperationId::new();
        let stages = json!([{"$set": {"a": 1}}]);
        let tagged = TaggedModifier::new(modifier(stages.clone()), op);
        let Modifier::Pipeline(wire) = tagged.to_wire() else {
            panic!("expected pipeline");
        };
        assert_eq!(wire.len(), 2);
        assert_eq!(wire[0]["$addFields"][OPERATION_ID_FIELD], json!(op.to_hex()));

        let (back, tag) = TaggedModifier::from_wire(Modifier::Pipeline(wire));
        assert_eq!(tag, Some(op));
        assert_eq!(back.to_value(), stages);
    }

    #[test]
    fn test_mixed_passes_through() {
        let op = OperationId::new();
        let mixed = modifier(json!({"$set": {"a": 1}, "b": 2}));
        let tagged = TaggedModifier::new(mixed.clone(), op);
        assert_eq!(tagged.to_wire(), mixed);
    }

    #[test]
    fn test_strip_tag_removes_field() {
        let op = OperationId::new();
        let mut fields = json!({"a": 1, OPERATION_ID_FIELD: op.to_hex()})
            .as_object()
            .cloned()
            .unwrap();
        assert_eq!(embedded_operation_id(&fields), Some(op));
        assert_eq!(strip_tag(&mut fields), Some(op));
        assert!(!fields.contains_key(OPERATION_ID_FIELD));
        assert_eq!(strip_tag(&mut fields), None);
    }

    #[test]
    fn test_strip_tag_removes_malformed_value() {
        let mut fields = json!({OPERATION_ID_FIELD: 12}).as_object().cloned().unwrap();
        assert_eq!(strip_tag(&mut fields), None);
        assert!(fields.is_empty());
    }
}
