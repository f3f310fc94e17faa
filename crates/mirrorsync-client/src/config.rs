//! Cache configuration and the runtime control handle.
//!
//! [`CacheConfig`] is the serializable form (TOML or code). [`CacheControl`]
//! is what the caches hold: a cheap, cloneable handle over the live values,
//! so turning a cache off takes effect on the next lookup.
//!
//! ```toml
//! subscription_cache_enabled = true
//! subscription_cache_duration_ms = 300000
//! method_cache_enabled = true
//! method_cache_duration_ms = 300000
//! ```

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::ClientError;

/// Default lifetime of cached subscriptions and method results: five minutes.
pub const DEFAULT_CACHE_DURATION_MS: u64 = 5 * 60 * 1000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub subscription_cache_enabled: bool,
    pub subscription_cache_duration_ms: u64,
    pub method_cache_enabled: bool,
    pub method_cache_duration_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            subscription_cache_enabled: true,
            subscription_cache_duration_ms: DEFAULT_CACHE_DURATION_MS,
            method_cache_enabled: true,
            method_cache_duration_ms: DEFAULT_CACHE_DURATION_MS,
        }
    }
}

impl CacheConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ClientError> {
        toml::from_str(s).map_err(|e| ClientError::Config(e.to_string()))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ClientError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| ClientError::Config(format!("failed to read {}: {}", path.display(), e)))?;
        Self::from_toml_str(&text)
    }
}

/// Shared handle over the live cache settings.
#[derive(Debug, Clone, Default)]
pub struct CacheControl {
    inner: Arc<RwLock<CacheConfig>>,
}

impl CacheControl {
    pub fn new(config: CacheConfig) -> Self {
        Self { inner: Arc::new(RwLock::new(config)) }
    }

    pub fn snapshot(&self) -> CacheConfig {
        self.inner.read().clone()
    }

    pub fn disable_subscription_cache(&self) {
        self.inner.write().subscription_cache_enabled = false;
    }

    pub fn set_default_subscription_cache_duration_ms(&self, ms: u64) {
        self.inner.write().subscription_cache_duration_ms = ms;
    }

    pub fn disable_method_result_cache(&self) {
        self.inner.write().method_cache_enabled = false;
    }

    pub fn set_default_method_result_cache_duration_ms(&self, ms: u64) {
        self.inner.write().method_cache_duration_ms = ms;
    }

    pub fn subscription_cache_enabled(&self) -> bool {
        self.inner.read().subscription_cache_enabled
    }

    pub fn subscription_cache_duration_ms(&self) -> u64 {
        self.inner.read().subscription_cache_duration_ms
    }

    pub fn method_cache_enabled(&self) -> bool {
        self.inner.read().method_cache_enabled
    }

    pub fn method_cache_duration_ms(&self) -> u64 {
        self.inner.read().method_cache_duration_ms
    }
}

/// Call-site override, then the entry's own duration, then the default.
pub(crate) fn effective_duration(
    override_ms: Option<u64>,
    stored_ms: Option<u64>,
    default_ms: u64,
) -> Duration {
    Duration::from_millis(override_ms.or(stored_ms).unwrap_or(default_ms))
}

/// An entry is expired once its full duration has elapsed.
pub(crate) fn has_expired(since: Instant, duration: Duration) -> bool {
    since.elapsed() >= duration
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_and_control() {
        let control = CacheControl::default();
        assert!(control.subscription_cache_enabled());
        assert_eq!(control.method_cache_duration_ms(), 300_000);

        let shared = control.clone();
        shared.disable_method_result_cache();
        shared.set_default_subscription_cache_duration_ms(1_000);
        assert!(!control.method_cache_enabled());
        assert_eq!(control.subscription_cache_duration_ms(), 1_000);
        assert!(control.snapshot().subscription_cache_enabled);
    }

    #[test]
    fn test_effective_duration_precedence() {
        assert_eq!(effective_duration(Some(1), Some(2), 3), Duration::from_millis(1));
        assert_eq!(effective_duration(None, Some(2), 3), Duration::from_millis(2));
        assert_eq!(effective_duration(None, None, 3), Duration::from_millis(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_boundary() {
        let start = Instant::now();
        let d = Duration::from_millis(1_000);
        tokio::time::advance(Duration::from_millis(999)).await;
        assert!(!has_expired(start, d));
        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(has_expired(start, d));
    }

    #[test]
    fn test_load_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "method_cache_enabled = false\nsubscription_cache_duration_ms = 10").unwrap();
        let config = CacheConfig::load(file.path()).unwrap();
        assert!(!config.method_cache_enabled);
        assert_eq!(config.subscription_cache_duration_ms, 10);
        assert_eq!(config.method_cache_duration_ms, DEFAULT_CACHE_DURATION_MS);
        assert!(CacheConfig::from_toml_str("method_cache_enabled = 3").is_err());
    }
}
