//! Subscription cache: one live handle per (name, args) key.
//!
//! An entry is written when a subscribe starts its fetch, with no refresh
//! time yet. While that fetch is in flight the entry counts as fresh, so a
//! second subscribe for the same key gets the same handle instead of a second
//! round-trip. The refresh time is stamped when the fetch succeeds.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::time::Instant;
use tracing::trace;

use crate::config::{CacheControl, effective_duration, has_expired};
use crate::error::ClientError;
use crate::key::CacheKey;
use crate::subscribe::SubscriptionHandle;

#[derive(Clone, Debug)]
struct SubsCacheEntry {
    handle: SubscriptionHandle,
    duration_ms: Option<u64>,
    /// `None` while the fetch is in flight.
    refreshed_at: Option<Instant>,
}

/// What [`SubscriptionCache::begin`] decided for a subscribe.
#[derive(Clone, Debug)]
pub enum SubscriptionLookup {
    /// Fresh or still being fetched: hand it back, no round-trip.
    Reuse(SubscriptionHandle),
    /// Cached but stale: refetch into the same handle.
    Refetch(SubscriptionHandle),
    /// Nothing cached: a new handle, now recorded as in flight.
    Created(SubscriptionHandle),
}

pub struct SubscriptionCache {
    entries: DashMap<CacheKey, SubsCacheEntry>,
    control: CacheControl,
}

impl SubscriptionCache {
    pub fn new(control: CacheControl) -> Self {
        Self { entries: DashMap::new(), control }
    }

    pub fn get(&self, key: &CacheKey) -> Option<SubscriptionHandle> {
        self.entries.get(key).map(|e| e.handle.clone())
    }

    /// Whether the entry outlived its duration. An entry whose fetch is
    /// still in flight is never stale.
    ///
    /// Always true while the cache is disabled, without looking at entries.
    /// Otherwise a missing entry is [`ClientError::NotFound`].
    pub fn is_stale(&self, key: &CacheKey, override_ms: Option<u64>) -> Result<bool, ClientError> {
        if !self.control.subscription_cache_enabled() {
            return Ok(true);
        }
        let entry = self
            .entries
            .get(key)
            .ok_or_else(|| ClientError::NotFound(format!("subscription cache entry {key:?}")))?;
        Ok(self.expired(&entry, override_ms))
    }

    /// Look up `key` and claim a fetch if one is needed, in one step under
    /// the entry lock. Concurrent subscribes for one key see a single
    /// `Created` or `Refetch`; the rest get `Reuse`.
    pub fn begin(
        &self,
        key: CacheKey,
        override_ms: Option<u64>,
        create: impl FnOnce() -> SubscriptionHandle,
    ) -> SubscriptionLookup {
        match self.entries.entry(key) {
            Entry::Occupied(mut slot) => {
                if !self.expired(slot.get(), override_ms) {
                    return SubscriptionLookup::Reuse(slot.get().handle.clone());
                }
                trace!(key = ?slot.key(), "stale subscription, refetching");
                let entry = slot.get_mut();
                entry.refreshed_at = None;
                SubscriptionLookup::Refetch(entry.handle.clone())
            }
            Entry::Vacant(slot) => {
                let handle = create();
                slot.insert(SubsCacheEntry {
                    handle: handle.clone(),
                    duration_ms: override_ms,
                    refreshed_at: None,
                });
                SubscriptionLookup::Created(handle)
            }
        }
    }

    /// Store `handle` under `key` as freshly fetched, replacing whatever was there.
    pub fn put(&self, key: CacheKey, handle: SubscriptionHandle, duration_ms: Option<u64>) {
        trace!(key = ?key, subscription = %handle.name(), "subscription cached");
        self.entries.insert(
            key,
            SubsCacheEntry { handle, duration_ms, refreshed_at: Some(Instant::now()) },
        );
    }

    pub fn remove(&self, key: &CacheKey) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Drop every entry past its own duration. In-flight entries stay.
    /// Returns how many were dropped.
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

    fn expired(&self, entry: &SubsCacheEntry, override_ms: Option<u64>) -> bool {
        let Some(refreshed_at) = entry.refreshed_at else {
            return false;
        };
        let duration = effective_duration(
            override_ms,
            entry.duration_ms,
            self.control.subscription_cache_duration_ms(),
        );
        has_expired(refreshed_at, duration)
    }
}
