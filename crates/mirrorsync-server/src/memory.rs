//! In-memory [`Store`] with change streams.
//!
//! Backs tests and embedded use. It behaves like a single-node replica set:
//! writes are applied under a per-collection lock, then the resulting change
//! events are broadcast to every open stream on that collection whose filter
//! admits the event's operation type.
//!
//! # Concurrency Model
//!
//! - DashMap of collections, each behind a parking_lot RwLock
//! - Events are published after the write lock is dropped
//! - One broadcast channel per open stream

use std::cmp::Ordering as CmpOrdering;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use dashmap::DashMap;
use indexmap::IndexMap;
use mirrorsync_types::{
    ChangeEvent, DocId, Document, Fields, Modifier, OperationType, UpdateDescription,
};
use parking_lot::{Mutex, RwLock};
use serde_json::{Number, Value};
use tokio::sync::broadcast;
use tracing::{debug, trace};

use crate::error::StoreError;
use crate::store::{
    ChangeStream, FindOptions, Selector, Store, StoreCapabilities, UpdateOptions, UpdateResult,
};

/// Events buffered per stream before slow receivers start lagging.
const STREAM_CAPACITY: usize = 256;

type Collection = Arc<RwLock<IndexMap<DocId, Document>>>;

/// A change stream over one [`MemoryStore`] collection.
pub struct MemoryChangeStream {
    collection: String,
    operation_types: Vec<OperationType>,
    tx: Mutex<Option<broadcast::Sender<ChangeEvent>>>,
    closed: AtomicBool,
}

impl MemoryChangeStream {
    fn new(collection: &str, operation_types: &[OperationType]) -> Self {
        let (tx, _) = broadcast::channel(STREAM_CAPACITY);
        Self {
            collection: collection.to_string(),
            operation_types: operation_types.to_vec(),
            tx: Mutex::new(Some(tx)),
            closed: AtomicBool::new(false),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn admits(&self, event: &ChangeEvent) -> bool {
        self.operation_types.is_empty() || self.operation_types.contains(&event.operation_type)
    }

    fn publish(&self, event: &ChangeEvent) {
        if !self.admits(event) {
            return;
        }
        if let Some(tx) = self.tx.lock().as_ref() {
            // No receivers is fine; nobody is listening yet.
            let _ = tx.send(event.clone());
        }
    }
}

#[async_trait]
impl ChangeStream for MemoryChangeStream {
    fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        match self.tx.lock().as_ref() {
            Some(tx) => tx.subscribe(),
            None => {
                // Closed: hand out a receiver that reports Closed right away.
                let (_, rx) = broadcast::channel(1);
                rx
            }
        }
    }

    async fn close(&self) -> Result<(), StoreError> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            // Dropping the sender ends every receiver.
            self.tx.lock().take();
            debug!(collection = %self.collection, "change stream closed");
        }
        Ok(())
    }
}

/// A document store held entirely in memory.
pub struct MemoryStore {
    collections: DashMap<String, Collection>,
    streams: DashMap<String, Vec<Arc<MemoryChangeStream>>>,
    capabilities: RwLock<StoreCapabilities>,
    fail_watch: AtomicBool,
    watch_calls: AtomicUsize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            collections: DashMap::new(),
            streams: DashMap::new(),
            capabilities: RwLock::new(StoreCapabilities {
                version: "6.0.0".to_string(),
                change_streams: true,
                pool_size: Some(crate::config::DEFAULT_CONNECTION_POOL_SIZE),
            }),
            fail_watch: AtomicBool::new(false),
            watch_calls: AtomicUsize::new(0),
        }
    }

    /// Override what [`Store::capabilities`] reports.
    pub fn set_capabilities(&self, capabilities: StoreCapabilities) {
        *self.capabilities.write() = capabilities;
    }

    /// Make every subsequent `watch` fail.
    pub fn set_watch_failure(&self, fail: bool) {
        self.fail_watch.store(fail, Ordering::SeqCst);
    }

    /// How many times `watch` has been called.
    pub fn watch_calls(&self) -> usize {
        self.watch_calls.load(Ordering::SeqCst)
    }

    /// Streams on `collection` that have not been closed.
    pub fn open_stream_count(&self, collection: &str) -> usize {
        self.streams
            .get(collection)
            .map(|s| s.iter().filter(|s| !s.is_closed()).count())
            .unwrap_or(0)
    }

    fn collection(&self, name: &str) -> Collection {
        self.collections
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(IndexMap::new())))
            .clone()
    }

    fn publish(&self, collection: &str, events: Vec<ChangeEvent>) {
        if events.is_empty() {
            return;
        }
        let Some(mut streams) = self.streams.get_mut(collection) else {
            return;
        };
        streams.retain(|s| !s.is_closed());
        for event in &events {
            trace!(collection, op = %event.operation_type, id = %event.doc_id(), "publishing change");
            for stream in streams.iter() {
                stream.publish(event);
            }
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert(&self, collection: &str, mut doc: Fields) -> Result<DocId, StoreError> {
        if !doc.contains_key("_id") {
            doc.insert("_id".to_string(), Value::String(generate_id()));
        }
        let doc = Document::from_value(Value::Object(doc))
            .map_err(|e| StoreError::InvalidDocument(e.to_string()))?;
        let id = doc.id.clone();

        {
            let coll = self.collection(collection);
            let mut docs = coll.write();
            if docs.contains_key(&id) {
                return Err(StoreError::DuplicateId {
                    collection: collection.to_string(),
                    id: id.to_string(),
                });
            }
            docs.insert(id.clone(), doc.clone());
        }

        self.publish(collection, vec![ChangeEvent::insert(collection, doc)]);
        Ok(id)
    }

    async fn update(
        &self,
        collection: &str,
        selector: &Selector,
        modifier: &Modifier,
        options: UpdateOptions,
    ) -> Result<UpdateResult, StoreError> {
        if let Modifier::Mixed(_) = modifier {
            return Err(StoreError::InvalidModifier(
                "cannot mix update operators with plain fields".into(),
            ));
        }

        let mut events = Vec::new();
        let result = {
            let coll = self.collection(collection);
            let mut docs = coll.write();

            let mut ids: Vec<DocId> = docs
                .values()
                .filter(|d| selector.matches(d))
                .map(|d| d.id.clone())
                .collect();
            if !options.multi {
                ids.truncate(1);
            }

            if ids.is_empty() {
                if !options.upsert {
                    return Ok(UpdateResult::default());
                }
                let doc = upsert_document(selector, modifier)?;
                let id = doc.id.clone();
                docs.insert(id.clone(), doc.clone());
                events.push(ChangeEvent::insert(collection, doc));
                UpdateResult { number_affected: 1, inserted_id: Some(id) }
            } else {
                // Compute every new version first so a failing operator leaves
                // the collection untouched.
                let mut updated = Vec::with_capacity(ids.len());
                for id in &ids {
                    let Some(before) = docs.get(id) else { continue };
                    let after = apply_modifier(before, modifier, false)?;
                    updated.push((before.clone(), after));
                }
                for (before, after) in updated {
                    match modifier {
                        Modifier::Replacement(_) => {
                            events.push(ChangeEvent::replace(collection, after.clone()));
                        }
                        _ => {
                            let desc = diff(&before.fields, &after.fields);
                            if !desc.updated_fields.is_empty() || !desc.removed_fields.is_empty() {
                                events.push(ChangeEvent::update(collection, after.id.clone(), desc));
                            }
                        }
                    }
                    docs.insert(after.id.clone(), after);
                }
                UpdateResult { number_affected: ids.len(), inserted_id: None }
            }
        };

        self.publish(collection, events);
        Ok(result)
    }

    async fn remove(&self, collection: &str, selector: &Selector) -> Result<usize, StoreError> {
        let removed: Vec<DocId> = {
            let coll = self.collection(collection);
            let mut docs = coll.write();
            let ids: Vec<DocId> = docs
                .values()
                .filter(|d| selector.matches(d))
                .map(|d| d.id.clone())
                .collect();
            for id in &ids {
                docs.shift_remove(id);
            }
            ids
        };

        let count = removed.len();
        self.publish(
            collection,
            removed.into_iter().map(|id| ChangeEvent::delete(collection, id)).collect(),
        );
        Ok(count)
    }

    async fn find(
        &self,
        collection: &str,
        selector: &Selector,
        options: &FindOptions,
    ) -> Result<Vec<Document>, StoreError> {
        let coll = self.collection(collection);
        let docs = coll.read();
        let matched = docs.values().filter(|d| selector.matches(d));
        let limited: Vec<&Document> = match options.limit {
            Some(n) => matched.take(n).collect(),
            None => matched.collect(),
        };
        Ok(limited
            .into_iter()
            .map(|d| match &options.fields {
                Some(projection) => projection.apply(d),
                None => d.clone(),
            })
            .collect())
    }

    async fn watch(
        &self,
        collection: &str,
        operation_types: &[OperationType],
    ) -> Result<Arc<dyn ChangeStream>, StoreError> {
        self.watch_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_watch.load(Ordering::SeqCst) {
            return Err(StoreError::ChangeStreamsUnavailable("watch disabled".into()));
        }
        if !self.capabilities.read().change_streams {
            return Err(StoreError::ChangeStreamsUnavailable(
                "store is not a replica set".into(),
            ));
        }

        let stream = Arc::new(MemoryChangeStream::new(collection, operation_types));
        self.streams
            .entry(collection.to_string())
            .or_default()
            .push(stream.clone());
        debug!(collection, ?operation_types, "change stream opened");
        Ok(stream)
    }

    async fn capabilities(&self) -> Result<StoreCapabilities, StoreError> {
        Ok(self.capabilities.read().clone())
    }
}

fn generate_id() -> String {
    uuid::Uuid::new_v4().as_simple().to_string()
}

/// Build the document an upsert inserts: selector equality fields, then the
/// modifier applied as an insert.
fn upsert_document(selector: &Selector, modifier: &Modifier) -> Result<Document, StoreError> {
    let id = selector.doc_id().unwrap_or_else(|| DocId::new(generate_id()));
    let seed: Fields = match modifier {
        Modifier::Replacement(_) => Fields::new(),
        _ => selector
            .fields()
            .iter()
            .filter(|(k, _)| k.as_str() != "_id")
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
    };
    apply_modifier(&Document::new(id, seed), modifier, true)
}

fn apply_modifier(doc: &Document, modifier: &Modifier, inserting: bool) -> Result<Document, StoreError> {
    let fields = match modifier {
        Modifier::Replacement(replacement) => {
            let mut fields = replacement.clone();
            fields.remove("_id");
            fields
        }
        Modifier::Update(ops) => {
            let mut fields = doc.fields.clone();
            for (op, args) in ops {
                let Value::Object(args) = args else {
                    return Err(StoreError::InvalidModifier(format!("{op} expects an object")));
                };
                apply_operator(&mut fields, op, args, inserting)?;
            }
            fields
        }
        Modifier::Pipeline(stages) => {
            let mut fields = doc.fields.clone();
            for stage in stages {
                apply_stage(&mut fields, stage)?;
            }
            fields
        }
        Modifier::Mixed(_) => {
            return Err(StoreError::InvalidModifier(
                "cannot mix update operators with plain fields".into(),
            ));
        }
    };
    Ok(Document::new(doc.id.clone(), fields))
}

fn apply_operator(
    fields: &mut Fields,
    op: &str,
    args: &Fields,
    inserting: bool,
) -> Result<(), StoreError> {
    for (key, arg) in args {
        match op {
            "$set" => {
                fields.insert(key.clone(), arg.clone());
            }
            "$setOnInsert" => {
                if inserting {
                    fields.insert(key.clone(), arg.clone());
                }
            }
            "$unset" => {
                fields.remove(key);
            }
            "$inc" => {
                let current = fields.get(key).cloned().unwrap_or(Value::from(0));
                fields.insert(key.clone(), arith(&current, arg, op, |a, b| a.checked_add(b), |a, b| a + b)?);
            }
            "$mul" => {
                let current = fields.get(key).cloned().unwrap_or(Value::from(0));
                fields.insert(key.clone(), arith(&current, arg, op, |a, b| a.checked_mul(b), |a, b| a * b)?);
            }
            "$min" | "$max" => {
                let want = if op == "$min" { CmpOrdering::Less } else { CmpOrdering::Greater };
                let replace = match fields.get(key) {
                    None => true,
                    Some(current) => compare(arg, current) == Some(want),
                };
                if replace {
                    fields.insert(key.clone(), arg.clone());
                }
            }
            "$rename" => {
                let Value::String(to) = arg else {
                    return Err(StoreError::InvalidModifier("$rename target must be a string".into()));
                };
                if let Some(v) = fields.remove(key) {
                    fields.insert(to.clone(), v);
                }
            }
            "$currentDate" => {
                let millis = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_millis() as u64)
                    .unwrap_or(0);
                fields.insert(key.clone(), serde_json::json!({ "$date": millis }));
            }
            "$push" | "$pushAll" | "$addToSet" => {
                let items = match (op, arg) {
                    ("$pushAll", Value::Array(items)) => items.clone(),
                    ("$pushAll", _) => {
                        return Err(StoreError::InvalidModifier("$pushAll expects an array".into()));
                    }
                    (_, Value::Object(o)) if o.contains_key("$each") => match o.get("$each") {
                        Some(Value::Array(items)) => items.clone(),
                        _ => return Err(StoreError::InvalidModifier("$each expects an array".into())),
                    },
                    (_, v) => vec![v.clone()],
                };
                let array = array_field(fields, key, op)?;
                for item in items {
                    if op != "$addToSet" || !array.contains(&item) {
                        array.push(item);
                    }
                }
            }
            "$pop" | "$pull" if !fields.contains_key(key) => {}
            "$pop" => {
                let array = array_field(fields, key, op)?;
                if arg.as_i64().unwrap_or(1) < 0 {
                    if !array.is_empty() {
                        array.remove(0);
                    }
                } else {
                    array.pop();
                }
            }
            "$pull" => {
                let array = array_field(fields, key, op)?;
                array.retain(|v| v != arg);
            }
            other => return Err(StoreError::UnsupportedOperator(other.to_string())),
        }
    }
    Ok(())
}

fn apply_stage(fields: &mut Fields, stage: &Value) -> Result<(), StoreError> {
    let Value::Object(stage) = stage else {
        return Err(StoreError::InvalidModifier("pipeline stage must be an object".into()));
    };
    for (name, body) in stage {
        match (name.as_str(), body) {
            ("$set" | "$addFields", Value::Object(set)) => {
                for (k, v) in set {
                    fields.insert(k.clone(), v.clone());
                }
            }
            ("$unset", Value::String(k)) => {
                fields.remove(k);
            }
            ("$unset", Value::Array(keys)) => {
                for k in keys.iter().filter_map(Value::as_str) {
                    fields.remove(k);
                }
            }
            (other, _) => return Err(StoreError::UnsupportedOperator(other.to_string())),
        }
    }
    Ok(())
}

fn array_field<'a>(fields: &'a mut Fields, key: &str, op: &str) -> Result<&'a mut Vec<Value>, StoreError> {
    match fields
        .entry(key.to_string())
        .or_insert_with(|| Value::Array(Vec::new()))
    {
        Value::Array(a) => Ok(a),
        _ => Err(StoreError::InvalidModifier(format!("{op} on non-array field '{key}'"))),
    }
}

fn arith(
    current: &Value,
    arg: &Value,
    op: &str,
    int: impl Fn(i64, i64) -> Option<i64>,
    float: impl Fn(f64, f64) -> f64,
) -> Result<Value, StoreError> {
    let (Value::Number(a), Value::Number(b)) = (current, arg) else {
        return Err(StoreError::InvalidModifier(format!("{op} needs numeric operands")));
    };
    if let (Some(a), Some(b)) = (a.as_i64(), b.as_i64()) {
        if let Some(n) = int(a, b) {
            return Ok(Value::from(n));
        }
    }
    let (Some(a), Some(b)) = (a.as_f64(), b.as_f64()) else {
        return Err(StoreError::InvalidModifier(format!("{op} operand out of range")));
    };
    Number::from_f64(float(a, b))
        .map(Value::Number)
        .ok_or_else(|| StoreError::InvalidModifier(format!("{op} produced a non-finite number")))
}

fn compare(a: &Value, b: &Value) -> Option<CmpOrdering> {
    match (a, b) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

/// Field-level diff between two versions of a document.
fn diff(before: &Fields, after: &Fields) -> UpdateDescription {
    let updated_fields = after
        .iter()
        .filter(|(k, v)| before.get(k.as_str()) != Some(v))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    let removed_fields = before
        .keys()
        .filter(|k| !after.contains_key(k.as_str()))
        .cloned()
        .collect();
    UpdateDescription { updated_fields, removed_fields }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(v: Value) -> Fields {
        match v {
            Value::Object(m) => m,
            _ => panic!("expected object"),
        }
    }

    fn modifier(v: Value) -> Modifier {
        Modifier::from_value(v).unwrap()
    }

    async fn seeded() -> MemoryStore {
        let store = MemoryStore::new();
        store
            .insert("posts", fields(json!({"_id": "p1", "title": "a", "n": 1, "tags": ["x"]})))
            .await
            .unwrap();
        store
    }

    async fn get(store: &MemoryStore, id: &str) -> Value {
        store
            .find("posts", &Selector::id(id), &FindOptions::default())
            .await
            .unwrap()
            .first()
            .map(Document::to_value)
            .unwrap_or(Value::Null)
    }

    #[tokio::test]
    async fn test_insert_generates_id_and_rejects_duplicates() {
        let store = seeded().await;
        let id = store.insert("posts", fields(json!({"title": "b"}))).await.unwrap();
        assert_eq!(id.as_str().len(), 32);

        let dup = store.insert("posts", fields(json!({"_id": "p1"}))).await;
        assert!(matches!(dup, Err(StoreError::DuplicateId { .. })));
    }

    #[tokio::test]
    async fn test_update_operators() {
        let store = seeded().await;
        store
            .update(
                "posts",
                &Selector::id("p1"),
                &modifier(json!({
                    "$set": {"title": "b"},
                    "$inc": {"n": 2},
                    "$push": {"tags": {"$each": ["y", "z"]}},
                })),
                UpdateOptions::default(),
            )
            .await
            .unwrap();
        store
            .update(
                "posts",
                &Selector::id("p1"),
                &modifier(json!({"$rename": {"title": "heading"}})),
                UpdateOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(
            get(&store, "p1").await,
            json!({"_id": "p1", "heading": "b", "n": 3, "tags": ["x", "y", "z"]})
        );

        store
            .update(
                "posts",
                &Selector::id("p1"),
                &modifier(json!({"$pull": {"tags": "y"}, "$max": {"n": 10}, "$unset": {"heading": ""}})),
                UpdateOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(get(&store, "p1").await, json!({"_id": "p1", "n": 10, "tags": ["x", "z"]}));
    }

    #[tokio::test]
    async fn test_failed_operator_leaves_document_untouched() {
        let store = seeded().await;
        let err = store
            .update(
                "posts",
                &Selector::id("p1"),
                &modifier(json!({"$set": {"n": 5}, "$bit": {"n": {"and": 1}}})),
                UpdateOptions::default(),
            )
            .await;
        assert!(matches!(err, Err(StoreError::UnsupportedOperator(_))));
        assert_eq!(get(&store, "p1").await["n"], json!(1));
    }

    #[tokio::test]
    async fn test_upsert_seeds_from_selector() {
        let store = MemoryStore::new();
        let result = store
            .update(
                "posts",
                &Selector::id("new").and("kind", json!("draft")),
                &modifier(json!({"$set": {"t": 1}, "$setOnInsert": {"created": true}})),
                UpdateOptions::upsert(),
            )
            .await
            .unwrap();
        assert_eq!(result.inserted_id, Some(DocId::from("new")));
        assert_eq!(
            get(&store, "new").await,
            json!({"_id": "new", "kind": "draft", "t": 1, "created": true})
        );
    }

    #[tokio::test]
    async fn test_change_stream_events_and_filter() {
        let store = seeded().await;
        let stream = store
            .watch("posts", &[OperationType::Update, OperationType::Replace])
            .await
            .unwrap();
        let mut rx = stream.subscribe();

        store.insert("posts", fields(json!({"_id": "p2"}))).await.unwrap();
        store
            .update("posts", &Selector::id("p1"), &modifier(json!({"$set": {"n": 1}})), UpdateOptions::default())
            .await
            .unwrap();
        store
            .update("posts", &Selector::id("p1"), &modifier(json!({"$set": {"n": 2}, "$unset": {"tags": 1}})), UpdateOptions::default())
            .await
            .unwrap();
        store
            .update("posts", &Selector::id("p2"), &modifier(json!({"title": "r"})), UpdateOptions::default())
            .await
            .unwrap();

        // The insert is filtered out and the no-op $set produced no event
        let event = rx.recv().await.unwrap();
        assert_eq!(event.operation_type, OperationType::Update);
        let desc = event.update_description.unwrap();
        assert_eq!(desc.updated_fields, fields(json!({"n": 2})));
        assert_eq!(desc.removed_fields, vec!["tags".to_string()]);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.operation_type, OperationType::Replace);
        assert_eq!(event.full_document.unwrap().to_value(), json!({"_id": "p2", "title": "r"}));
    }

    #[tokio::test]
    async fn test_close_ends_receivers() {
        let store = MemoryStore::new();
        let stream = store.watch("posts", &[]).await.unwrap();
        let mut rx = stream.subscribe();
        assert_eq!(store.open_stream_count("posts"), 1);

        stream.close().await.unwrap();
        assert!(matches!(rx.recv().await, Err(broadcast::error::RecvError::Closed)));
        assert_eq!(store.open_stream_count("posts"), 0);
        assert!(matches!(
            stream.subscribe().recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_watch_failure_modes() {
        let store = MemoryStore::new();
        store.set_watch_failure(true);
        assert!(store.watch("posts", &[]).await.is_err());
        store.set_watch_failure(false);
        store.set_capabilities(StoreCapabilities {
            version: "3.4.0".into(),
            change_streams: false,
            pool_size: None,
        });
        assert!(matches!(
            store.watch("posts", &[]).await,
            Err(StoreError::ChangeStreamsUnavailable(_))
        ));
        assert_eq!(store.watch_calls(), 2);
    }
}
