//! Method-result cache.
//!
//! Entries hold either an opaque result or a result that was merged into the
//! mirrored store. Merged results are re-read from the store every time they
//! are served, so a cached result follows local edits and never resurrects a
//! document the store no longer has.

use std::sync::Arc;

use dashmap::DashMap;
use mirrorsync_types::{DocId, Document};
use serde_json::Value;
use tokio::time::Instant;
use tracing::trace;

use crate::config::{CacheControl, effective_duration, has_expired};
use crate::error::ClientError;
use crate::key::CacheKey;
use crate::local_store::{LocalCollection, LocalStore};

/// A cached method result.
#[derive(Clone, Debug, PartialEq)]
pub struct MethodCacheEntry {
    pub data: Value,
    /// Collection of `data` when it is one document or an array of documents.
    pub collection: Option<String>,
    /// True if `data` lives in the mirrored store.
    pub merged: bool,
    pub duration_ms: Option<u64>,
    last_called_at: Instant,
}

impl MethodCacheEntry {
    pub fn new(data: Value) -> Self {
        Self {
            data,
            collection: None,
            merged: false,
            duration_ms: None,
            last_called_at: Instant::now(),
        }
    }

    /// Mark the data as merged into the mirrored store.
    pub fn merged(mut self, collection: Option<String>) -> Self {
        self.merged = true;
        self.collection = collection;
        self
    }

    pub fn with_duration_ms(mut self, duration_ms: Option<u64>) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    pub fn last_called_at(&self) -> Instant {
        self.last_called_at
    }
}

pub struct MethodResultCache {
    entries: DashMap<CacheKey, MethodCacheEntry>,
    control: CacheControl,
    store: Arc<LocalStore>,
}

impl MethodResultCache {
    pub fn new(control: CacheControl, store: Arc<LocalStore>) -> Self {
        Self { entries: DashMap::new(), control, store }
    }

    /// The entry under `key` if the cache is on and the entry has not
    /// expired. Merged data is refreshed from the mirrored store first unless
    /// `skip_refresh` is set.
    pub fn get_active(
        &self,
        key: &CacheKey,
        override_ms: Option<u64>,
        skip_refresh: bool,
    ) -> Option<MethodCacheEntry> {
        if !self.control.method_cache_enabled() {
            return None;
        }
        let mut entry = self.entries.get_mut(key)?;
        if self.expired(&entry, override_ms) {
            drop(entry);
            // Re-checked under the shard lock: a concurrent add may have replaced it.
            if self.entries.remove_if(key, |_, e| self.expired(e, override_ms)).is_some() {
                trace!(key = ?key, "expired method cache entry dropped");
            }
            return None;
        }
        if !skip_refresh && entry.merged && !entry.data.is_null() {
            let refreshed = self.refresh(&entry.data, entry.collection.as_deref());
            if let Some(data) = refreshed {
                entry.data = data;
            }
        }
        Some(entry.clone())
    }

    /// Store an entry, replacing whatever was there.
    pub fn add(&self, key: CacheKey, entry: MethodCacheEntry) {
        trace!(key = ?key, merged = entry.merged, "method result cached");
        self.entries.insert(key, entry);
    }

    pub fn update_duration(&self, key: &CacheKey, duration_ms: Option<u64>) -> Result<(), ClientError> {
        let mut entry = self
            .entries
            .get_mut(key)
            .ok_or_else(|| ClientError::NotFound(format!("method cache entry {key:?}")))?;
        entry.duration_ms = duration_ms;
        Ok(())
    }

    pub fn remove(&self, key: &CacheKey) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Drop every entry past its own duration. Returns how many were dropped.
    pub fn prune_expired(&self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !self.expired(entry, None));
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn expired(&self, entry: &MethodCacheEntry, override_ms: Option<u64>) -> bool {
        let duration = effective_duration(
            override_ms,
            entry.duration_ms,
            self.control.method_cache_duration_ms(),
        );
        has_expired(entry.last_called_at, duration)
    }

    /// Re-read merged data from the mirrored store. `None` leaves the data as is.
    fn refresh(&self, data: &Value, collection: Option<&str>) -> Option<Value> {
        let local = |name: Option<&str>| name.and_then(|n| self.store.collection(n));
        match data {
            Value::Array(docs) => {
                let coll = local(collection)?;
                Some(docs_value(&coll, docs))
            }
            Value::Object(map) if Document::is_identified(data) => {
                let coll = local(collection)?;
                let id = map.get("_id").and_then(Value::as_str).map(DocId::from)?;
                Some(coll.get(&id).map_or(Value::Null, |d| d.to_value()))
            }
            Value::Object(map) => {
                let refreshed = map
                    .iter()
                    .filter_map(|(name, docs)| {
                        let coll = self.store.collection(name)?;
                        let docs = docs.as_array()?;
                        Some((name.clone(), docs_value(&coll, docs)))
                    })
                    .collect();
                Some(Value::Object(refreshed))
            }
            _ => None,
        }
    }
}

/// Current versions of `docs` in `coll`, dropping the ones that are gone.
fn docs_value(coll: &LocalCollection, docs: &[Value]) -> Value {
    let ids: Vec<DocId> = docs
        .iter()
        .filter_map(|d| d.get("_id").and_then(Value::as_str))
        .map(DocId::from)
        .collect();
    Value::Array(coll.find_by_ids(&ids).iter().map(Document::to_value).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn key(name: &str) -> CacheKey {
        CacheKey::new(name, &[]).unwrap()
    }

    fn setup() -> (Arc<LocalStore>, MethodResultCache, CacheControl) {
        let store = Arc::new(LocalStore::new());
        let posts = store.define("posts");
        for v in [json!({"_id": "41", "t": "a"}), json!({"_id": "42", "t": "b"})] {
            posts.insert(Document::from_value(v).unwrap()).unwrap();
        }
        let control = CacheControl::default();
        let cache = MethodResultCache::new(control.clone(), store.clone());
        (store, cache, control)
    }

    #[test]
    fn test_merged_array_drops_removed_docs() {
        let (store, cache, _) = setup();
        cache.add(
            key("recent"),
            MethodCacheEntry::new(json!([{"_id": "41", "t": "a"}, {"_id": "42", "t": "b"}]))
                .merged(Some("posts".into())),
        );

        store.collection("posts").unwrap().remove(&DocId::from("42"));
        let entry = cache.get_active(&key("recent"), None, false).unwrap();
        assert_eq!(entry.data, json!([{"_id": "41", "t": "a"}]));
    }

    #[test]
    fn test_merged_map_and_single_doc_refresh() {
        let (store, cache, _) = setup();
        cache.add(
            key("map"),
            MethodCacheEntry::new(json!({"posts": [{"_id": "42"}], "ghosts": [{"_id": "1"}]}))
                .merged(None),
        );
        cache.add(
            key("one"),
            MethodCacheEntry::new(json!({"_id": "41"})).merged(Some("posts".into())),
        );

        let posts = store.collection("posts").unwrap();
        posts.merge(&DocId::from("41"), &json!({"t": "edited"}).as_object().unwrap().clone(), &[]);
        posts.remove(&DocId::from("42"));

        // Undeclared collections drop out of the refreshed map
        assert_eq!(cache.get_active(&key("map"), None, false).unwrap().data, json!({"posts": []}));
        assert_eq!(
            cache.get_active(&key("one"), None, false).unwrap().data,
            json!({"_id": "41", "t": "edited"})
        );
        posts.remove(&DocId::from("41"));
        assert_eq!(cache.get_active(&key("one"), None, false).unwrap().data, Value::Null);
    }

    #[test]
    fn test_skip_refresh_and_opaque_data() {
        let (store, cache, _) = setup();
        cache.add(
            key("recent"),
            MethodCacheEntry::new(json!([{"_id": "42"}])).merged(Some("posts".into())),
        );
        cache.add(key("opaque"), MethodCacheEntry::new(json!([{"_id": "42"}])));
        store.collection("posts").unwrap().remove(&DocId::from("42"));

        assert_eq!(
            cache.get_active(&key("recent"), None, true).unwrap().data,
            json!([{"_id": "42"}])
        );
        assert_eq!(
            cache.get_active(&key("opaque"), None, false).unwrap().data,
            json!([{"_id": "42"}])
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_duration_update_and_override() {
        let (_store, cache, _) = setup();
        cache.add(key("m"), MethodCacheEntry::new(json!(1)).with_duration_ms(Some(1_000)));

        tokio::time::advance(Duration::from_millis(999)).await;
        cache.update_duration(&key("m"), Some(2_000)).unwrap();
        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(cache.get_active(&key("m"), None, false).is_some());
        assert!(cache.get_active(&key("m"), Some(10), false).is_none());
        assert!(matches!(
            cache.update_duration(&key("missing"), None),
            Err(ClientError::NotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entries_are_dropped() {
        let (_store, cache, _) = setup();
        cache.add(key("m"), MethodCacheEntry::new(json!(1)).with_duration_ms(Some(1_000)));
        cache.add(key("n"), MethodCacheEntry::new(json!(2)).with_duration_ms(Some(100)));
        cache.add(key("o"), MethodCacheEntry::new(json!(3)).with_duration_ms(Some(60_000)));

        tokio::time::advance(Duration::from_millis(1_000)).await;
        assert!(cache.get_active(&key("m"), None, false).is_none());
        assert_eq!(cache.len(), 2);
        assert!(matches!(
            cache.update_duration(&key("m"), Some(5_000)),
            Err(ClientError::NotFound(_))
        ));

        assert_eq!(cache.prune_expired(), 1);
        assert_eq!(cache.len(), 1);
        assert!(cache.get_active(&key("o"), None, false).is_some());
    }

    #[test]
    fn test_disabled_returns_none() {
        let (_store, cache, control) = setup();
        cache.add(key("m"), MethodCacheEntry::new(json!(1)));
        control.disable_method_result_cache();
        assert!(cache.get_active(&key("m"), None, false).is_none());
        assert!(cache.remove(&key("m")));
        assert!(cache.is_empty());
    }
}
