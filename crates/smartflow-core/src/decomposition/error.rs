//! Decomposition error taxonomy

use std::time::Duration;

use thiserror::Error;

/// Errors raised while turning model output into a decomposition
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    /// Output could not be parsed into the expected structure
    #[error("Malformed model output: {0}")]
    Malformed(String),

    /// Output parsed but contained no subtasks
    #[error("Model output contained no subtasks")]
    NoSubtasks,
}

/// Umbrella error surfaced to callers of the decomposition engine
///
/// Cloneable so a coalesced leader can hand the same outcome to every
/// follower.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecompositionError {
    #[error("Invalid preferences: {0}")]
    InvalidPreference(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Upstream exhausted after {attempts} attempts: {last_error}")]
    UpstreamExhausted { attempts: u32, last_error: String },

    #[error("Circuit open for '{endpoint}', retry in {retry_in:?}")]
    CircuitOpen { endpoint: String, retry_in: Duration },

    #[error("Upstream rejected the request: {0}")]
    Upstream(String),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Deadline exceeded after {0:?}")]
    DeadlineExceeded(Duration),

    #[error("Coalesced leader abandoned the request")]
    LeaderAbandoned,
}

impl DecompositionError {
    /// Whether the caller may reasonably retry the same request later
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::UpstreamExhausted { .. }
            | Self::CircuitOpen { .. }
            | Self::DeadlineExceeded(_)
            | Self::LeaderAbandoned
            | Self::Validation(_) => true,
            Self::InvalidPreference(_) | Self::InvalidRequest(_) | Self::Upstream(_) => false,
        }
    }

    /// Whether this failure may be answered with the heuristic fallback
    pub fn allows_fallback(&self) -> bool {
        matches!(
            self,
            Self::UpstreamExhausted { .. }
                | Self::CircuitOpen { .. }
                | Self::DeadlineExceeded(_)
                | Self::Validation(_)
        )
    }

    /// Whether this failure counts against upstream health
    pub fn is_terminal_upstream_failure(&self) -> bool {
        matches!(
            self,
            Self::UpstreamExhausted { .. } | Self::DeadlineExceeded(_)
        )
    }

    /// Get error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidPreference(_) => "D001",
            Self::InvalidRequest(_) => "D002",
            Self::UpstreamExhausted { .. } => "D100",
            Self::CircuitOpen { .. } => "D101",
            Self::Upstream(_) => "D102",
            Self::DeadlineExceeded(_) => "D103",
            Self::Validation(ValidationError::Malformed(_)) => "D200",
            Self::Validation(ValidationError::NoSubtasks) => "D201",
            Self::LeaderAbandoned => "D300",
        }
    }

    /// Get suggestion for how to fix this error
    pub fn suggestion(&self) -> Option<String> {
        match self {
            Self::InvalidPreference(_) => Some("max subtasks must be at least 1".to_string()),
            Self::InvalidRequest(_) => Some("provide a non-empty task description".to_string()),
            Self::CircuitOpen { retry_in, .. } => {
                Some(format!("retry after {} seconds", retry_in.as_secs().max(1)))
            }
            Self::Upstream(_) => Some("smartflow config get llm.api_key".to_string()),
            Self::UpstreamExhausted { .. } | Self::DeadlineExceeded(_) => {
                Some("smartflow config set retry.max_attempts 5".to_string())
            }
            _ => None,
        }
    }
}
