//! Client side of mirrorsync.
//!
//! Subscriptions here are one-shot fetches dressed up as subscriptions: the
//! documents a publication returns are merged into the mirrored
//! [`LocalStore`], and the [`SubscriptionHandle`] is cached so repeat
//! subscribes within the cache window skip the round-trip. Method results can
//! be cached the same way, and results merged into the store stay in sync
//! with it when served from cache.
//!
//! ```text
//! ┌──────────────┐   call    ┌─────────────────┐
//! │ MirrorClient │──────────▶│ MethodTransport │──▶ server
//! └──────┬───────┘           └─────────────────┘
//!        │ cache                     │ wire messages
//!        ▼                           ▼
//! ┌──────────────────┐       ┌──────────────┐
//! │ SubscriptionCache│       │  reconcile   │
//! │ MethodResultCache│──────▶│  LocalStore  │──▶ observers
//! └──────────────────┘ read  └──────────────┘
//! ```
//!
//! Cache behaviour is set with [`CacheConfig`] and adjusted at runtime
//! through [`CacheControl`].

pub mod client;
pub mod config;
pub mod error;
pub mod key;
pub mod local_store;
pub mod method_cache;
pub mod reconcile;
pub mod subs_cache;
pub mod subscribe;
pub mod transport;

pub use client::{CallOptions, MirrorClient};
pub use config::{CacheConfig, CacheControl, DEFAULT_CACHE_DURATION_MS};
pub use error::ClientError;
pub use key::CacheKey;
pub use local_store::{LocalChange, LocalCollection, LocalStore};
pub use method_cache::{MethodCacheEntry, MethodResultCache};
pub use reconcile::{DropReason, ReconcileOutcome, merge_into_store, reconcile_wire_message};
pub use subs_cache::{SubscriptionCache, SubscriptionLookup};
pub use subscribe::{ReadyCallback, StopCallback, SubscribeOptions, SubscriptionHandle};
pub use transport::MethodTransport;
