//! Server configuration.
//!
//! All values have defaults, so an empty TOML file (or no file at all) yields a
//! working configuration.
//!
//! ```toml
//! change_stream_grace_ms = 5000
//! connection_pool_size = 100
//! sweep_interval_ms = 5000
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ServerError;

/// How long a change stream stays referenced after the operation that used
/// it finished. Change events can lag the write that caused them.
pub const DEFAULT_CHANGE_STREAM_GRACE_MS: u64 = 5_000;

/// Connection pool size requested from the backing store. Each open change
/// stream may hold a connection, and there can be one per collection.
pub const DEFAULT_CONNECTION_POOL_SIZE: usize = 100;

/// Minimum store version with change-stream support.
pub const MIN_STORE_VERSION: (u32, u32) = (3, 6);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Delay between an operation finishing and its stream reference being released.
    pub change_stream_grace_ms: u64,
    /// Expected connection pool size of the backing store.
    pub connection_pool_size: usize,
    /// Tick of the per-collection sweeper closing unreferenced streams.
    pub sweep_interval_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            change_stream_grace_ms: DEFAULT_CHANGE_STREAM_GRACE_MS,
            connection_pool_size: DEFAULT_CONNECTION_POOL_SIZE,
            sweep_interval_ms: DEFAULT_CHANGE_STREAM_GRACE_MS,
        }
    }
}

impl ServerConfig {
    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.change_stream_grace_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn from_toml_str(s: &str) -> Result<Self, ServerError> {
        toml::from_str(s).map_err(|e| ServerError::Config(e.to_string()))
    }

    /// Load from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ServerError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| ServerError::Config(format!("failed to read {}: {}", path.display(), e)))?;
        Self::from_toml_str(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.grace(), Duration::from_secs(5));
        assert_eq!(config.connection_pool_size, 100);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = ServerConfig::from_toml_str("change_stream_grace_ms = 250").unwrap();
        assert_eq!(config.change_stream_grace_ms, 250);
        assert_eq!(config.sweep_interval_ms, DEFAULT_CHANGE_STREAM_GRACE_MS);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "connection_pool_size = 12").unwrap();
        let config = ServerConfig::load(file.path()).unwrap();
        assert_eq!(config.connection_pool_size, 12);
    }

    #[test]
    fn test_bad_toml() {
        assert!(matches!(
            ServerConfig::from_toml_str("change_stream_grace_ms = \"soon\""),
            Err(ServerError::Config(_))
        ));
    }
}
