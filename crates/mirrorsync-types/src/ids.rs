//! Typed identifiers for operations, subscriptions, and documents.
//!
//! `OperationId` and `SubscriptionId` wrap UUIDv7 (time-ordered, globally
//! unique) and display as standard UUID text for logging. The `short()` form is
//! for log lines only, never a lookup key.
//!
//! `DocId` is the document's `_id`. It is an opaque string chosen by whoever
//! inserted the document, so it is a string newtype rather than a UUID.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ModelError;

/// Correlates one mutating call with the change events it causes.
#[derive(Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(uuid::Uuid);

/// Identifies one client-side subscription handle.
#[derive(Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(uuid::Uuid);

// ── Shared behavior ─────────────────────────────────────────────────────────

macro_rules! impl_typed_id {
    ($T:ident, $name:literal) => {
        impl $T {
            /// Create a new time-ordered ID (UUIDv7).
            pub fn new() -> Self {
                Self(uuid::Uuid::now_v7())
            }

            /// First 8 hex characters, for log display only.
            pub fn short(&self) -> String {
                self.0.as_simple().to_string()[..8].to_string()
            }

            /// Full 32-character hex string (no hyphens).
            pub fn to_hex(&self) -> String {
                self.0.as_simple().to_string()
            }

            /// Parse from a hex string (32 chars, no hyphens) or standard UUID format.
            pub fn parse(s: &str) -> Result<Self, ModelError> {
                uuid::Uuid::parse_str(s)
                    .map(Self)
                    .map_err(|e| ModelError::InvalidOperationId(format!("{s}: {e}")))
            }
        }

        impl Default for $T {
            fn default() -> Self {
                Self::new()
            }
        }

        impl From<uuid::Uuid> for $T {
            fn from(u: uuid::Uuid) -> Self {
                Self(u)
            }
        }

        impl fmt::Display for $T {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl fmt::Debug for $T {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", $name, self.short())
            }
        }
    };
}

impl_typed_id!(OperationId, "OperationId");
impl_typed_id!(SubscriptionId, "SubscriptionId");

/// A document identity, serialized as the bare `_id` string.
#[derive(Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocId(String);

impl DocId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for DocId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for DocId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for DocId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for DocId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DocId({})", self.0)
    }
}
