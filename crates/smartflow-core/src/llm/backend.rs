//! Upstream model backend abstraction

use async_trait::async_trait;

use super::error::ModelError;
use super::types::{Message, RawModelOutput};

/// A single-attempt connection to an upstream model service
///
/// Implementations perform exactly one network exchange per call and
/// classify failures; timeouts across attempts, retries, and circuit
/// breaking are layered on top by [`super::ModelClient`].
#[async_trait]
pub trait ModelBackend: Send + Sync {
    /// Identifier of the upstream endpoint, used to key circuit state
    fn endpoint(&self) -> &str;

    /// Send the prompt messages and return the raw model text
    async fn complete(&self, messages: &[Message]) -> Result<RawModelOutput, ModelError>;
}
