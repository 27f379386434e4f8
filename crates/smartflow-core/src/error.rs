//! Error types for SmartFlow

use thiserror::Error;

use crate::decomposition::DecompositionError;

/// Result type alias using SmartFlow's Error
pub type Result<T> = std::result::Result<T, Error>;

/// SmartFlow error types with helpful messages and suggestions
#[derive(Error, Debug)]
pub enum Error {
    // Decomposition errors (E001-E099)
    #[error(transparent)]
    Decomposition(#[from] DecompositionError),

    // Network errors (E100-E199)
    #[error("Network error: {0}. Check your internet connection.")]
    NetworkError(#[from] reqwest::Error),

    #[error("LLM setup error: {0}. Check your API key with `smartflow config get llm.api_key`.")]
    LLMError(String),

    // Config errors (E600-E699)
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl Error {
    /// Get error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            Self::Decomposition(e) => e.code(),
            Self::NetworkError(_) => "E100",
            Self::LLMError(_) => "E101",
            Self::ConfigError(_) => "E600",
        }
    }

    /// Get suggestion for how to fix this error
    pub fn suggestion(&self) -> Option<String> {
        match self {
            Self::Decomposition(e) => e.suggestion(),
            Self::NetworkError(_) => Some("Check internet connection".to_string()),
            Self::LLMError(_) => Some("export SMARTFLOW_API_KEY=<key>".to_string()),
            Self::ConfigError(_) => Some("smartflow config list".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_delegate_to_decomposition_errors() {
        let err: Error = DecompositionError::LeaderAbandoned.into();
        assert_eq!(err.code(), "D300");

        let err = Error::LLMError("API key is required".to_string());
        assert_eq!(err.code(), "E101");
        assert!(err.suggestion().is_some());
    }
}
