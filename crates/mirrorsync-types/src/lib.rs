//! Shared types for mirrorsync.
//!
//! This crate is the vocabulary both sides of the wire agree on: documents,
//! mutation modifiers, change-stream events, and the added/changed/removed wire
//! messages. It has **no internal mirrorsync dependencies**, so the server
//! and the client build on it without pulling each other in.
//!
//! # Key Types
//!
//! |---------------------|-----------------------------------------------|
//! | Type                | Purpose                                       |
//! |---------------------|-----------------------------------------------|
//! | [`DocId`]           | Document identity (`_id`)                     |
//! | [`Document`]        | `_id` plus a flat field map                   |
//! | [`Modifier`]        | Update-style, replacement, pipeline, or mixed |
//! | [`TaggedModifier`]  | Modifier + the operation that issued it       |
//! | [`OperationId`]     | Correlates a mutating call to its changes     |
//! | [`ChangeEvent`]     | One change-stream notification                |
//! | [`WireMessage`]     | added / changed / removed                     |
//! |---------------------|-----------------------------------------------|

pub mod change;
pub mod document;
pub mod error;
pub mod ids;
pub mod modifier;
pub mod payload;
pub mod tagger;
pub mod wire;

pub use change::{ChangeEvent, DocumentKey, OperationType, UpdateDescription};
pub use document::{Document, Fields};
pub use error::ModelError;
pub use ids::{DocId, OperationId, SubscriptionId};
pub use modifier::{Modifier, UPDATE_OPERATORS, is_update_operator};
pub use payload::{
    DocumentsByCollection, STORE_MERGE_MARKER, decode_documents_by_collection,
    encode_store_merge, has_store_merge_marker, without_marker,
};
pub use tagger::{OPERATION_ID_FIELD, TaggedModifier, embedded_operation_id, strip_tag};
pub use wire::{MessageKind, WireMessage};
