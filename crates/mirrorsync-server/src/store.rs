//! The document store seam.
//!
//! [`Store`] is the backing database as this layer sees it: CRUD plus the
//! ability to open change streams. Query execution is the store's business;
//! selectors here are plain top-level equality matches, enough to address
//! documents by id or by a field value.

use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;
use mirrorsync_types::{ChangeEvent, DocId, Document, Fields, Modifier, OperationType};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::error::StoreError;

/// Top-level equality selector. An empty selector matches every document.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Selector(Fields);

impl Selector {
    pub fn all() -> Self {
        Self(Fields::new())
    }

    pub fn id(id: impl Into<DocId>) -> Self {
        let mut fields = Fields::new();
        fields.insert("_id".to_string(), Value::String(id.into().to_string()));
        Self(fields)
    }

    pub fn eq(field: impl Into<String>, value: Value) -> Self {
        let mut fields = Fields::new();
        fields.insert(field.into(), value);
        Self(fields)
    }

    /// Add another equality condition.
    pub fn and(mut self, field: impl Into<String>, value: Value) -> Self {
        self.0.insert(field.into(), value);
        self
    }

    pub fn fields(&self) -> &Fields {
        &self.0
    }

    /// The `_id` this selector pins, if any.
    pub fn doc_id(&self) -> Option<DocId> {
        self.0.get("_id").and_then(Value::as_str).map(DocId::from)
    }

    pub fn matches(&self, doc: &Document) -> bool {
        self.0.iter().all(|(k, v)| {
            if k == "_id" {
                v.as_str() == Some(doc.id.as_str())
            } else {
                doc.fields.get(k) == Some(v)
            }
        })
    }
}

/// Field projection. Either inclusive (any `true`) or exclusive (all `false`).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Projection(IndexMap<String, bool>);

impl Projection {
    pub fn include(mut self, field: impl Into<String>) -> Self {
        self.0.insert(field.into(), true);
        self
    }

    pub fn exclude(mut self, field: impl Into<String>) -> Self {
        self.0.insert(field.into(), false);
        self
    }

    /// True if at least one field is explicitly included.
    pub fn has_inclusions(&self) -> bool {
        self.0.values().any(|v| *v)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Apply to a document. `_id` always survives.
    pub fn apply(&self, doc: &Document) -> Document {
        if self.0.is_empty() {
            return doc.clone();
        }
        let fields = if self.has_inclusions() {
            doc.fields
                .iter()
                .filter(|(k, _)| self.0.get(k.as_str()) == Some(&true))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        } else {
            doc.fields
                .iter()
                .filter(|(k, _)| !self.0.contains_key(k.as_str()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        };
        Document::new(doc.id.clone(), fields)
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct FindOptions {
    pub fields: Option<Projection>,
    pub limit: Option<usize>,
}

impl FindOptions {
    pub fn with_fields(mut self, projection: Projection) -> Self {
        self.fields = Some(projection);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UpdateOptions {
    /// Insert a document when nothing matches.
    pub upsert: bool,
    /// Update every match instead of the first one.
    pub multi: bool,
}

impl UpdateOptions {
    pub fn upsert() -> Self {
        Self { upsert: true, multi: false }
    }

    pub fn multi() -> Self {
        Self { upsert: false, multi: true }
    }
}

/// Outcome of an update.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UpdateResult {
    /// Number of documents matched and modified (1 for an upsert insert).
    pub number_affected: usize,
    /// Set when an upsert inserted a new document.
    pub inserted_id: Option<DocId>,
}

/// What the backing store reports about itself.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreCapabilities {
    /// Server version string, e.g. `"6.0.3"`.
    pub version: String,
    /// Change streams need a replica set (or equivalent).
    pub change_streams: bool,
    /// Connection pool size currently in effect, if known.
    pub pool_size: Option<usize>,
}

/// A live change stream on one collection.
///
/// Events are fanned out through a broadcast channel, so several consumers
/// can observe one stream.
#[async_trait]
pub trait ChangeStream: Send + Sync {
    /// Receive events published after this call.
    fn subscribe(&self) -> broadcast::Receiver<ChangeEvent>;

    /// Stop observing. Completes once the underlying cursor is gone.
    async fn close(&self) -> Result<(), StoreError>;
}

/// The backing document store.
#[async_trait]
pub trait Store: Send + Sync {
    /// Insert a document. A missing `_id` is generated.
    async fn insert(&self, collection: &str, doc: Fields) -> Result<DocId, StoreError>;

    async fn update(
        &self,
        collection: &str,
        selector: &Selector,
        modifier: &Modifier,
        options: UpdateOptions,
    ) -> Result<UpdateResult, StoreError>;

    /// Remove every matching document, returning how many went.
    async fn remove(&self, collection: &str, selector: &Selector) -> Result<usize, StoreError>;

    async fn find(
        &self,
        collection: &str,
        selector: &Selector,
        options: &FindOptions,
    ) -> Result<Vec<Document>, StoreError>;

    /// Open a change stream reporting only the given operation types.
    async fn watch(
        &self,
        collection: &str,
        operation_types: &[OperationType],
    ) -> Result<Arc<dyn ChangeStream>, StoreError>;

    async fn capabilities(&self) -> Result<StoreCapabilities, StoreError>;
}
