//! Error types for the shared model.

use thiserror::Error;

/// Errors raised while converting raw JSON into model types.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModelError {
    /// Value is not an object with a string `_id`.
    #[error("invalid document: {0}")]
    InvalidDocument(String),

    /// Modifier is neither an object nor a stage array.
    #[error("invalid modifier: {0}")]
    InvalidModifier(String),

    /// Operation id could not be parsed.
    #[error("invalid operation id: {0}")]
    InvalidOperationId(String),
}
