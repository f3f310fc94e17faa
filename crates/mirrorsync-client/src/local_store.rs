//! The mirrored local store.
//!
//! Holds the client's copy of server documents, one [`LocalCollection`] per
//! collection the client declared. Observers (the UI layer) subscribe to a
//! collection's [`LocalChange`] stream. While a collection is paused, changes
//! are applied but not announced; resuming announces one coalesced change per
//! affected document, so a batch merge never shows intermediate states.
//!
//! # Concurrency Model
//!
//! - DashMap of collections
//! - Documents behind a parking_lot RwLock, never held across `.await`
//! - Lock order: documents, then pause state
//! - broadcast channel per collection for observers

use std::sync::Arc;

use dashmap::DashMap;
use indexmap::IndexMap;
use mirrorsync_types::{DocId, Document, Fields};
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tracing::trace;

use crate::error::ClientError;

const OBSERVER_CAPACITY: usize = 1024;

/// A change announced to observers.
#[derive(Clone, Debug, PartialEq)]
pub enum LocalChange {
    Added(Document),
    Changed {
        id: DocId,
        /// New values of the fields that changed.
        fields: Fields,
        cleared: Vec<String>,
    },
    Removed(DocId),
}

#[derive(Default)]
struct PauseState {
    depth: usize,
    snapshot: IndexMap<DocId, Document>,
}

/// One mirrored collection.
pub struct LocalCollection {
    name: String,
    docs: RwLock<IndexMap<DocId, Document>>,
    observers: broadcast::Sender<LocalChange>,
    pause: Mutex<PauseState>,
}

impl LocalCollection {
    fn new(name: &str) -> Self {
        let (observers, _) = broadcast::channel(OBSERVER_CAPACITY);
        Self {
            name: name.to_string(),
            docs: RwLock::new(IndexMap::new()),
            observers,
            pause: Mutex::new(PauseState::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn observe(&self) -> broadcast::Receiver<LocalChange> {
        self.observers.subscribe()
    }

    pub fn get(&self, id: &DocId) -> Option<Document> {
        self.docs.read().get(id).cloned()
    }

    pub fn contains(&self, id: &DocId) -> bool {
        self.docs.read().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.docs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.read().is_empty()
    }

    pub fn all(&self) -> Vec<Document> {
        self.docs.read().values().cloned().collect()
    }

    /// Documents with the given ids, in the order asked for. Missing ids are skipped.
    pub fn find_by_ids<'a>(&self, ids: impl IntoIterator<Item = &'a DocId>) -> Vec<Document> {
        let docs = self.docs.read();
        ids.into_iter().filter_map(|id| docs.get(id).cloned()).collect()
    }

    pub fn insert(&self, doc: Document) -> Result<(), ClientError> {
        let mut docs = self.docs.write();
        if docs.contains_key(&doc.id) {
            return Err(ClientError::InvalidArgument(format!(
                "document {} already exists in {}",
                doc.id, self.name
            )));
        }
        docs.insert(doc.id.clone(), doc.clone());
        self.announce(LocalChange::Added(doc));
        Ok(())
    }

    /// Shallow-merge `fields` into an existing document and drop `cleared`.
    /// Returns false if the document is unknown.
    pub fn merge(&self, id: &DocId, fields: &Fields, cleared: &[String]) -> bool {
        let mut docs = self.docs.write();
        let Some(doc) = docs.get_mut(id) else {
            return false;
        };
        let changed: Fields = fields
            .iter()
            .filter(|(k, v)| k.as_str() != "_id" && doc.fields.get(k.as_str()) != Some(v))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let cleared: Vec<String> = cleared
            .iter()
            .filter(|k| doc.fields.contains_key(k.as_str()))
            .cloned()
            .collect();
        doc.shallow_merge(&changed);
        for k in &cleared {
            doc.fields.remove(k);
        }
        if !changed.is_empty() || !cleared.is_empty() {
            self.announce(LocalChange::Changed { id: id.clone(), fields: changed, cleared });
        }
        true
    }

    /// Insert the document, or shallow-merge it over the existing one.
    pub fn upsert(&self, doc: Document) {
        if !self.merge(&doc.id, &doc.fields, &[]) {
            // Lost a race with a concurrent insert: merge instead.
            if let Err(ClientError::InvalidArgument(_)) = self.insert(doc.clone()) {
                self.merge(&doc.id, &doc.fields, &[]);
            }
        }
    }

    pub fn remove(&self, id: &DocId) -> bool {
        let mut docs = self.docs.write();
        let removed = docs.shift_remove(id).is_some();
        if removed {
            self.announce(LocalChange::Removed(id.clone()));
        }
        removed
    }

    pub fn is_paused(&self) -> bool {
        self.pause.lock().depth > 0
    }

    /// Stop announcing changes until the matching [`resume_observers`](Self::resume_observers).
    /// Pauses nest.
    pub fn pause_observers(&self) {
        let docs = self.docs.read();
        let mut pause = self.pause.lock();
        if pause.depth == 0 {
            pause.snapshot = docs.clone();
        }
        pause.depth += 1;
    }

    /// Announce everything that changed since the outermost pause, one change
    /// per document.
    pub fn resume_observers(&self) {
        let docs = self.docs.read();
        let snapshot = {
            let mut pause = self.pause.lock();
            match pause.depth {
                0 => return,
                1 => {
                    pause.depth = 0;
                    std::mem::take(&mut pause.snapshot)
                }
                _ => {
                    pause.depth -= 1;
                    return;
                }
            }
        };

        let changes = diff_snapshot(&snapshot, &docs);
        trace!(collection = %self.name, changes = changes.len(), "observers resumed");
        for change in changes {
            let _ = self.observers.send(change);
        }
    }

    /// Callers hold the docs lock, and pause and resume take it before the
    /// pause state, so every change lands either in a pause snapshot diff or
    /// here.
    fn announce(&self, change: LocalChange) {
        if self.is_paused() {
            return;
        }
        // No observers is fine.
        let _ = self.observers.send(change);
    }
}

fn diff_snapshot(
    before: &IndexMap<DocId, Document>,
    after: &IndexMap<DocId, Document>,
) -> Vec<LocalChange> {
    let mut changes = Vec::new();
    for (id, doc) in after {
        match before.get(id) {
            None => changes.push(LocalChange::Added(doc.clone())),
            Some(old) if old != doc => {
                let fields: Fields = doc
                    .fields
                    .iter()
                    .filter(|(k, v)| old.fields.get(k.as_str()) != Some(v))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                let cleared = old
                    .fields
                    .keys()
                    .filter(|k| !doc.fields.contains_key(k.as_str()))
                    .cloned()
                    .collect();
                changes.push(LocalChange::Changed { id: id.clone(), fields, cleared });
            }
            Some(_) => {}
        }
    }
    for id in before.keys() {
        if !after.contains_key(id) {
            changes.push(LocalChange::Removed(id.clone()));
        }
    }
    changes
}

/// All mirrored collections of one client.
#[derive(Default)]
pub struct LocalStore {
    collections: DashMap<String, Arc<LocalCollection>>,
}

impl LocalStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a collection, returning the existing one if already declared.
    pub fn define(&self, name: &str) -> Arc<LocalCollection> {
        self.collections
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(LocalCollection::new(name)))
            .clone()
    }

    pub fn collection(&self, name: &str) -> Option<Arc<LocalCollection>> {
        self.collections.get(name).map(|c| c.value().clone())
    }

    pub fn has_collection(&self, name: &str) -> bool {
        self.collections.contains_key(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};

    fn doc(v: Value) -> Document {
        Document::from_value(v).unwrap()
    }

    fn fields(v: Value) -> Fields {
        match v {
            Value::Object(m) => m,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn test_insert_merge_remove() {
        let store = LocalStore::new();
        let posts = store.define("posts");
        let mut rx = posts.observe();

        posts.insert(doc(json!({"_id": "1", "a": 1}))).unwrap();
        assert!(posts.insert(doc(json!({"_id": "1"}))).is_err());
        assert!(posts.merge(&DocId::from("1"), &fields(json!({"b": 2})), &["a".into()]));
        assert!(!posts.merge(&DocId::from("9"), &fields(json!({"b": 2})), &[]));
        assert_eq!(posts.get(&DocId::from("1")).unwrap().to_value(), json!({"_id": "1", "b": 2}));
        assert!(posts.remove(&DocId::from("1")));
        assert!(!posts.remove(&DocId::from("1")));

        assert!(matches!(rx.try_recv(), Ok(LocalChange::Added(_))));
        assert_eq!(
            rx.try_recv().unwrap(),
            LocalChange::Changed {
                id: DocId::from("1"),
                fields: fields(json!({"b": 2})),
                cleared: vec!["a".into()],
            }
        );
        assert!(matches!(rx.try_recv(), Ok(LocalChange::Removed(_))));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_noop_merge_is_silent() {
        let store = LocalStore::new();
        let posts = store.define("posts");
        posts.insert(doc(json!({"_id": "1", "a": 1}))).unwrap();
        let mut rx = posts.observe();
        posts.merge(&DocId::from("1"), &fields(json!({"a": 1})), &["zzz".into()]);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_pause_coalesces_per_document() {
        let store = LocalStore::new();
        let posts = store.define("posts");
        posts.insert(doc(json!({"_id": "1", "a": 1}))).unwrap();
        posts.insert(doc(json!({"_id": "2"}))).unwrap();
        let mut rx = posts.observe();

        posts.pause_observers();
        posts.pause_observers();
        posts.upsert(doc(json!({"_id": "1", "a": 2})));
        posts.upsert(doc(json!({"_id": "1", "b": 3})));
        posts.upsert(doc(json!({"_id": "3", "c": 1})));
        posts.remove(&DocId::from("2"));
        posts.resume_observers();
        assert!(posts.is_paused());
        assert!(rx.try_recv().is_err());
        posts.resume_observers();
        assert!(!posts.is_paused());

        let changes: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert_eq!(
            changes,
            vec![
                LocalChange::Changed {
                    id: DocId::from("1"),
                    fields: fields(json!({"a": 2, "b": 3})),
                    cleared: vec![],
                },
                LocalChange::Added(doc(json!({"_id": "3", "c": 1}))),
                LocalChange::Removed(DocId::from("2")),
            ]
        );
    }

    #[test]
    fn test_no_change_lost_across_concurrent_pauses() {
        const DOCS: usize = 300;
        let store = LocalStore::new();
        let posts = store.define("posts");
        let mut rx = posts.observe();

        std::thread::scope(|s| {
            s.spawn(|| {
                for i in 0..DOCS {
                    posts.insert(doc(json!({"_id": i.to_string()}))).unwrap();
                }
            });
            s.spawn(|| {
                for _ in 0..DOCS {
                    posts.pause_observers();
                    std::thread::yield_now();
                    posts.resume_observers();
                }
            });
        });

        let mut announced = std::collections::HashSet::new();
        while let Ok(change) = rx.try_recv() {
            if let LocalChange::Added(d) = change {
                announced.insert(d.id);
            }
        }
        assert_eq!(announced.len(), DOCS);
    }

    #[test]
    fn test_find_by_ids_skips_missing() {
        let store = LocalStore::new();
        let posts = store.define("posts");
        posts.insert(doc(json!({"_id": "1"}))).unwrap();
        posts.insert(doc(json!({"_id": "2"}))).unwrap();
        let ids = [DocId::from("2"), DocId::from("9"), DocId::from("1")];
        let found: Vec<_> = posts.find_by_ids(&ids).into_iter().map(|d| d.id).collect();
        assert_eq!(found, vec![DocId::from("2"), DocId::from("1")]);
        assert!(Arc::ptr_eq(&posts, &store.define("posts")));
        assert!(store.collection("pages").is_none());
    }
}
