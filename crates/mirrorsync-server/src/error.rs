//! Error types for the server side.

use mirrorsync_types::ModelError;
use thiserror::Error;

/// Failures reported by a [`Store`](crate::store::Store) implementation.
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error("invalid modifier: {0}")]
    InvalidModifier(String),

    #[error("invalid document: {0}")]
    InvalidDocument(String),

    #[error("unsupported operator: {0}")]
    UnsupportedOperator(String),

    #[error("duplicate document id {id} in {collection}")]
    DuplicateId { collection: String, id: String },

    #[error("change streams unavailable: {0}")]
    ChangeStreamsUnavailable(String),

    #[error("store error: {0}")]
    Internal(String),
}

/// Errors surfaced by the decorated store and the method registry.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Malformed input from the caller; never retried.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Change observation is not possible. Writes still succeed, only
    /// live mutation notifications are lost.
    #[error("backing store unavailable: {0}")]
    BackingStoreUnavailable(String),

    #[error("a method named '{0}' is already defined")]
    MethodAlreadyDefined(String),

    #[error("method '{0}' not found")]
    MethodNotFound(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("model error: {0}")]
    Model(#[from] ModelError),
}
