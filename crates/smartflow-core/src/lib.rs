//! SmartFlow Core Library
//!
//! This crate provides the core functionality for SmartFlow, including:
//! - Task decomposition (prompting, validation, caching, coalescing)
//! - LLM integration (OpenRouter-compatible API, retry, circuit breaking)
//! - Configuration (TOML file plus environment overrides)

pub mod config;
pub mod decomposition;
pub mod error;
pub mod llm;

pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::decomposition::{
        DecompositionError, DecompositionOrchestrator, DecompositionRequest, DecompositionResult,
        Granularity, PreferenceProfile, ResultSource, SubtaskDraft,
    };
    pub use crate::error::{Error, Result};
    pub use crate::llm::{LlmClient, ModelBackend, ModelClient};
}
