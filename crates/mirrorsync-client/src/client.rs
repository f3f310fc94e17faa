//! The client facade: cached subscriptions, enhanced calls, and manual caching.
//!
//! ```text
//! subscribe(name, args)
//!   ├── cached + fresh ─▶ same handle, no round-trip
//!   ├── fetch in flight ▶ same handle, no round-trip
//!   ├── cached + stale ─▶ same handle, ready=false, refetch
//!   └── miss ──────────▶ new handle, fetch
//!                          └─▶ merge into LocalStore ─▶ cache ─▶ ready=true
//! ```

use std::sync::Arc;

use mirrorsync_types::{
    Document, DocumentsByCollection, STORE_MERGE_MARKER, WireMessage,
    decode_documents_by_collection, has_store_merge_marker, without_marker,
};
use serde_json::Value;
use tracing::{debug, error, instrument, warn};

use crate::config::{CacheConfig, CacheControl};
use crate::error::ClientError;
use crate::key::CacheKey;
use crate::local_store::LocalStore;
use crate::method_cache::{MethodCacheEntry, MethodResultCache};
use crate::reconcile::{ReconcileOutcome, merge_into_store, reconcile_wire_message};
use crate::subs_cache::{SubscriptionCache, SubscriptionLookup};
use crate::subscribe::{SubscribeOptions, SubscriptionHandle};
use crate::transport::MethodTransport;

/// Per-call options for [`MirrorClient::call_enhanced`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallOptions {
    pub cache_duration_ms: Option<u64>,
}

impl CallOptions {
    pub fn cache_duration_ms(ms: u64) -> Self {
        Self { cache_duration_ms: Some(ms) }
    }
}

pub struct MirrorClient {
    transport: Arc<dyn MethodTransport>,
    store: Arc<LocalStore>,
    control: CacheControl,
    subs: SubscriptionCache,
    methods: MethodResultCache,
}

impl MirrorClient {
    pub fn new(transport: Arc<dyn MethodTransport>, config: CacheConfig) -> Arc<Self> {
        let control = CacheControl::new(config);
        let store = Arc::new(LocalStore::new());
        Arc::new(Self {
            transport,
            subs: SubscriptionCache::new(control.clone()),
            methods: MethodResultCache::new(control.clone(), store.clone()),
            store,
            control,
        })
    }

    pub fn store(&self) -> &Arc<LocalStore> {
        &self.store
    }

    /// Live cache settings. Changes apply to the next lookup.
    pub fn control(&self) -> &CacheControl {
        &self.control
    }

    pub fn subscriptions(&self) -> &SubscriptionCache {
        &self.subs
    }

    pub fn method_results(&self) -> &MethodResultCache {
        &self.methods
    }

    /// Subscribe to a lite publication.
    ///
    /// Returns immediately; the fetch runs on a spawned task, so this must be
    /// called from within a Tokio runtime. The handle turns ready once the
    /// documents are in the local store.
    pub fn subscribe(
        self: &Arc<Self>,
        name: &str,
        args: Vec<Value>,
        options: SubscribeOptions,
    ) -> Result<SubscriptionHandle, ClientError> {
        let key = CacheKey::new(name, &args)?;
        let create = || SubscriptionHandle::new(name, options.on_stop.clone());

        let handle = if self.control.subscription_cache_enabled() {
            match self.subs.begin(key.clone(), options.cache_duration_ms, create) {
                SubscriptionLookup::Reuse(handle) => {
                    debug!(subscription = %name, "reusing cached subscription");
                    return Ok(handle);
                }
                SubscriptionLookup::Refetch(handle) => {
                    handle.set_ready(false);
                    if let Some(on_stop) = &options.on_stop {
                        handle.set_on_stop(on_stop.clone());
                    }
                    handle
                }
                SubscriptionLookup::Created(handle) => handle,
            }
        } else {
            create()
        };

        let client = Arc::clone(self);
        let task_handle = handle.clone();
        let name = name.to_string();
        tokio::spawn(async move {
            client.fetch_subscription(key, &name, args, task_handle, options).await;
        });
        Ok(handle)
    }

    #[instrument(skip(self, key, args, handle, options), fields(subscription = %handle.id().short()))]
    async fn fetch_subscription(
        &self,
        key: CacheKey,
        name: &str,
        args: Vec<Value>,
        handle: SubscriptionHandle,
        options: SubscribeOptions,
    ) {
        let fetched = self
            .transport
            .call(name, args)
            .await
            .and_then(|value| decode_documents_by_collection(&value).map_err(ClientError::from));

        let data = match fetched {
            Ok(data) => data,
            Err(e) => {
                warn!(subscription = %name, error = %e, "subscription fetch failed");
                if let Some(on_stop) = &options.on_stop {
                    on_stop(Some(&e));
                }
                self.subs.remove(&key);
                return;
            }
        };

        if self.control.subscription_cache_enabled() {
            self.subs.put(key, handle.clone(), options.cache_duration_ms);
        } else {
            // Cache turned off mid-fetch: no in-flight entry may linger.
            self.subs.remove(&key);
        }
        let applied = merge_into_store(&self.store, &data);
        debug!(subscription = %name, documents = applied, "subscription ready");
        handle.set_ready(true);
        if let Some(on_ready) = &options.on_ready {
            on_ready();
        }
    }

    /// Call a method, serving and filling the method-result cache.
    ///
    /// A result carrying the store-merge marker is merged into the local
    /// store and cached; the caller gets it without the marker. Any other
    /// result is returned as is and not cached.
    #[instrument(skip(self, args), fields(method = %name))]
    pub async fn call_enhanced(
        &self,
        name: &str,
        args: Vec<Value>,
        options: CallOptions,
    ) -> Result<Value, ClientError> {
        let key = CacheKey::new(name, &args)?;
        let cache_enabled = self.control.method_cache_enabled();

        if cache_enabled {
            if let Some(entry) = self.methods.get_active(&key, options.cache_duration_ms, false) {
                if entry.duration_ms != options.cache_duration_ms {
                    self.methods.update_duration(&key, options.cache_duration_ms)?;
                }
                debug!("method result served from cache");
                return Ok(entry.data);
            }
        }

        let result = match self.transport.call(name, args).await {
            Ok(result) => result,
            Err(e) => {
                self.methods.remove(&key);
                return Err(e);
            }
        };

        if !has_store_merge_marker(&result) {
            return Ok(result);
        }

        let data = match self.mergeable_dictionary(&result) {
            Ok(data) => data,
            Err(e) => {
                error!(
                    error = %e,
                    "store-merge result must map declared collection names to arrays of documents; \
                     drop the '{STORE_MERGE_MARKER}' key and use cache_method_result to cache other shapes"
                );
                self.methods.remove(&key);
                return Err(e);
            }
        };
        merge_into_store(&self.store, &data);

        let stripped = without_marker(&result);
        if cache_enabled {
            self.methods.add(
                key,
                MethodCacheEntry::new(stripped.clone())
                    .merged(None)
                    .with_duration_ms(options.cache_duration_ms),
            );
        }
        Ok(stripped)
    }

    /// Cache an arbitrary method result without touching the local store.
    ///
    /// If an active entry already exists only its duration is updated.
    pub fn cache_method_result(
        &self,
        name: &str,
        args: &[Value],
        data: Value,
        duration_ms: Option<u64>,
    ) -> Result<(), ClientError> {
        if !self.control.method_cache_enabled() {
            return Ok(());
        }
        let key = CacheKey::new(name, args)?;
        reject_marker(name, &data)?;

        if self.refresh_active_duration(&key, duration_ms)? {
            return Ok(());
        }
        self.methods.add(key, MethodCacheEntry::new(data).with_duration_ms(duration_ms));
        Ok(())
    }

    /// Merge a method result into the local store and cache it.
    ///
    /// `data` is one document or an array of documents (both need
    /// `collection`), or an object mapping declared collection names to
    /// arrays of documents.
    pub fn cache_method_result_in_store(
        &self,
        name: &str,
        args: &[Value],
        data: Value,
        collection: Option<&str>,
        duration_ms: Option<u64>,
    ) -> Result<(), ClientError> {
        if !self.control.method_cache_enabled() {
            return Ok(());
        }
        let key = CacheKey::new(name, args)?;
        reject_marker(name, &data)?;

        let merge = match &data {
            Value::Array(docs) => {
                let docs = docs
                    .iter()
                    .cloned()
                    .map(Document::from_value)
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|e| ClientError::InvalidArgument(format!("'{name}' result: {e}")))?;
                self.single_collection(collection, docs)?
            }
            Value::Object(_) if Document::is_identified(&data) => {
                let doc = Document::from_value(data.clone())?;
                self.single_collection(collection, vec![doc])?
            }
            Value::Object(_) => self.mergeable_dictionary(&data)?,
            other => {
                return Err(ClientError::InvalidArgument(format!(
                    "'{name}' result must be a document, an array of documents, or a collection map, got {other}"
                )));
            }
        };

        if self.refresh_active_duration(&key, duration_ms)? {
            return Ok(());
        }
        merge_into_store(&self.store, &merge);
        self.methods.add(
            key,
            MethodCacheEntry::new(data)
                .merged(collection.map(str::to_string))
                .with_duration_ms(duration_ms),
        );
        Ok(())
    }

    /// Drop expired entries from both caches. Returns how many went.
    pub fn prune_caches(&self) -> usize {
        self.subs.prune_expired() + self.methods.prune_expired()
    }

    /// Apply a server-sent wire message to the local store.
    pub fn apply_wire_message(&self, message: WireMessage) -> ReconcileOutcome {
        reconcile_wire_message(&self.store, message)
    }

    /// Returns true if an active entry existed; its duration is brought in
    /// line with `duration_ms`.
    fn refresh_active_duration(&self, key: &CacheKey, duration_ms: Option<u64>) -> Result<bool, ClientError> {
        let Some(entry) = self.methods.get_active(key, duration_ms, true) else {
            return Ok(false);
        };
        if entry.duration_ms != duration_ms {
            self.methods.update_duration(key, duration_ms)?;
        }
        Ok(true)
    }

    fn single_collection(
        &self,
        collection: Option<&str>,
        docs: Vec<Document>,
    ) -> Result<DocumentsByCollection, ClientError> {
        let collection = collection
            .filter(|c| self.store.has_collection(c))
            .ok_or_else(|| {
                ClientError::InvalidArgument(
                    "a document result needs the name of a declared collection".into(),
                )
            })?;
        Ok(DocumentsByCollection::from([(collection.to_string(), docs)]))
    }

    fn mergeable_dictionary(&self, value: &Value) -> Result<DocumentsByCollection, ClientError> {
        let data = decode_documents_by_collection(value)
            .map_err(|e| ClientError::InvalidArgument(e.to_string()))?;
        if let Some(unknown) = data.keys().find(|c| !self.store.has_collection(c)) {
            return Err(ClientError::InvalidArgument(format!(
                "'{unknown}' is not a declared collection"
            )));
        }
        Ok(data)
    }
}

fn reject_marker(name: &str, data: &Value) -> Result<(), ClientError> {
    if has_store_merge_marker(data) {
        error!(method = %name, "result carries '{STORE_MERGE_MARKER}'; call_enhanced caches it already");
        return Err(ClientError::InvalidArgument(format!(
            "result of '{name}' unexpectedly carries '{STORE_MERGE_MARKER}'"
        )));
    }
    Ok(())
}
