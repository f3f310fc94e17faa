//! Cache keys.
//!
//! A key is the BLAKE3 hash of `{"name": .., "args": [..]}` encoded as JSON.
//! Object keys encode in sorted order, so argument objects that differ only
//! in key order hash the same.

use std::fmt;

use serde_json::{Value, json};

use crate::error::ClientError;

#[derive(Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(name: &str, args: &[Value]) -> Result<Self, ClientError> {
        if name.trim().is_empty() {
            return Err(ClientError::InvalidArgument("cache key needs a non-empty name".into()));
        }
        let encoded = serde_json::to_vec(&json!({ "name": name, "args": args }))
            .map_err(|e| ClientError::InvalidArgument(format!("unencodable arguments: {e}")))?;
        Ok(Self(blake3::hash(&encoded).to_hex().to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CacheKey({})", &self.0[..12.min(self.0.len())])
    }
}
