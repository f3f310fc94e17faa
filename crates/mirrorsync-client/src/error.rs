//! Client error types.

use mirrorsync_types::ModelError;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// Malformed cache key input or merge payload.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Staleness check against a cache entry that does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The call never reached the method, or its reply never came back.
    #[error("transport error: {0}")]
    Transport(String),

    /// The method ran and failed.
    #[error("method '{name}' failed: {message}")]
    Method { name: String, message: String },

    #[error("config error: {0}")]
    Config(String),

    #[error("model error: {0}")]
    Model(#[from] ModelError),
}
