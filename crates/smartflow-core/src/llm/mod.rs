//! LLM integration - upstream model access
//!
//! This module provides:
//! - A backend trait for single upstream attempts, with an OpenAI-compatible HTTP client
//! - Request/response types matching the chat completions API
//! - Retry with exponential backoff and full jitter
//! - A per-endpoint circuit breaker

mod backend;
mod circuit;
mod client;
mod error;
mod model_client;
mod retry;
mod types;

pub use backend::ModelBackend;
pub use circuit::{CircuitBreaker, CircuitPermit, CircuitState};
pub use client::{LlmClient, LlmClientBuilder};
pub use error::{ErrorClass, ModelError};
pub use model_client::ModelClient;
pub use retry::{Backoff, RetryPolicy};
pub use types::{
    ChatRequest, ChatResponse, Choice, FinishReason, Message, MessageRole, RawModelOutput, Usage,
};
