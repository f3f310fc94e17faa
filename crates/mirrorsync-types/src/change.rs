//! Change-stream events as reported by the backing document store.

use serde::{Deserialize, Serialize};

use crate::document::{Document, Fields};
use crate::ids::DocId;

/// Kind of change a change-stream event describes.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum OperationType {
    Insert,
    Update,
    Replace,
    Delete,
}

/// Identity of the document a change applies to.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DocumentKey {
    #[serde(rename = "_id")]
    pub id: DocId,
}

/// Field-level diff carried by `update` events.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateDescription {
    #[serde(default)]
    pub updated_fields: Fields,
    #[serde(default)]
    pub removed_fields: Vec<String>,
}

/// One change-stream notification.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    pub operation_type: OperationType,
    /// Collection the change happened in.
    pub ns: String,
    pub document_key: DocumentKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_description: Option<UpdateDescription>,
    /// Post-image for `insert` and `replace` events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_document: Option<Document>,
}

impl ChangeEvent {
    pub fn update(ns: impl Into<String>, id: DocId, description: UpdateDescription) -> Self {
        Self {
            operation_type: OperationType::Update,
            ns: ns.into(),
            document_key: DocumentKey { id },
            update_description: Some(description),
            full_document: None,
        }
    }

    pub fn replace(ns: impl Into<String>, document: Document) -> Self {
        Self {
            operation_type: OperationType::Replace,
            ns: ns.into(),
            document_key: DocumentKey { id: document.id.clone() },
            update_description: None,
            full_document: Some(document),
        }
    }

    pub fn insert(ns: impl Into<String>, document: Document) -> Self {
        Self {
            operation_type: OperationType::Insert,
            ns: ns.into(),
            document_key: DocumentKey { id: document.id.clone() },
            update_description: None,
            full_document: Some(document),
        }
    }

    pub fn delete(ns: impl Into<String>, id: DocId) -> Self {
        Self {
            operation_type: OperationType::Delete,
            ns: ns.into(),
            document_key: DocumentKey { id },
            update_description: None,
            full_document: None,
        }
    }

    pub fn doc_id(&self) -> &DocId {
        &self.document_key.id
    }
}
