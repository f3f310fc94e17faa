//! Data messages delivered over the client-server transport.
//!
//! The shapes match the live-query protocol the client already understands,
//! so messages produced by the mutation notifier are indistinguishable from
//! ones a live query would have sent.

use serde::{Deserialize, Serialize};

use crate::document::Fields;
use crate::ids::DocId;

/// A single added / changed / removed data message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "msg", rename_all = "lowercase")]
pub enum WireMessage {
    Added {
        collection: String,
        id: DocId,
        fields: Fields,
    },
    Changed {
        collection: String,
        id: DocId,
        fields: Fields,
        /// Top-level fields removed from the document.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        cleared: Vec<String>,
    },
    Removed {
        collection: String,
        id: DocId,
    },
}

/// Discriminant of a [`WireMessage`], for logging and matching.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, strum::Display, strum::IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum MessageKind {
    Added,
    Changed,
    Removed,
}

impl WireMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Added { .. } => MessageKind::Added,
            Self::Changed { .. } => MessageKind::Changed,
            Self::Removed { .. } => MessageKind::Removed,
        }
    }

    pub fn collection(&self) -> &str {
        match self {
            Self::Added { collection, .. }
            | Self::Changed { collection, .. }
            | Self::Removed { collection, .. } => collection,
        }
    }

    pub fn id(&self) -> &DocId {
        match self {
            Self::Added { id, .. } | Self::Changed { id, .. } | Self::Removed { id, .. } => id,
        }
    }
}
