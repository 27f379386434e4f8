//! Task decomposition engine
//!
//! Turns a free-text task description plus user preferences into a
//! validated, ordered list of subtasks by consulting an upstream model.
//!
//! - [`DecompositionOrchestrator`]: entry point sequencing the steps below
//! - [`PromptBuilder`]: deterministic prompt rendering
//! - [`ResultValidator`]: lenient parsing and structural validation of model output
//! - [`DecompositionCache`]: fingerprint-keyed LRU cache with TTL
//! - [`Coalescer`]: one upstream call per in-flight fingerprint

mod cache;
mod coalescer;
mod error;
mod orchestrator;
mod prompt;
mod request;
mod result;
mod validator;

pub use cache::{CacheStats, DecompositionCache};
pub use coalescer::{Coalescer, LeaderHandle, Outcome, Role, WaitHandle};
pub use error::{DecompositionError, ValidationError};
pub use orchestrator::{DecompositionOrchestrator, OrchestratorStats};
pub use prompt::{Prompt, PromptBuilder};
pub use request::{
    DEFAULT_MAX_SUBTASKS, DecompositionRequest, Fingerprint, Granularity, PreferenceProfile,
    normalize_text,
};
pub use result::{DecompositionResult, MAX_TITLE_CHARS, ResultSource, SubtaskDraft};
pub use validator::{ModelPayload, ParsedOutput, PayloadSubtask, ResultValidator};
