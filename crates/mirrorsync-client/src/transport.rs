//! How the client reaches server methods.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::ClientError;

/// One request/response method call.
///
/// Implementations map a failed call to [`ClientError::Method`] when the
/// method itself failed and to [`ClientError::Transport`] otherwise.
#[async_trait]
pub trait MethodTransport: Send + Sync {
    async fn call(&self, name: &str, args: Vec<Value>) -> Result<Value, ClientError>;
}
