//! Upstream model error types
//!
//! Every failure from a single upstream attempt is classified as either
//! transient (worth retrying) or permanent (surface immediately).

use std::time::Duration;

use thiserror::Error;

/// Whether an upstream failure may succeed on retry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Timeouts, 5xx responses, rate limits
    Transient,
    /// Bad requests, authentication failures, content-policy rejections
    Permanent,
}

/// Errors from a single upstream model attempt
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModelError {
    #[error("Upstream attempt timed out after {0:?}")]
    Timeout(Duration),

    #[error("Rate limited by upstream")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Upstream server error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Content policy rejection: {0}")]
    ContentPolicy(String),

    #[error("Invalid upstream response: {0}")]
    InvalidResponse(String),
}

impl ModelError {
    /// Classify this error for the retry policy
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Timeout(_) | Self::RateLimited { .. } | Self::Server { .. } | Self::Network(_) => {
                ErrorClass::Transient
            }
            Self::Unauthorized(_)
            | Self::BadRequest(_)
            | Self::ContentPolicy(_)
            | Self::InvalidResponse(_) => ErrorClass::Permanent,
        }
    }

    /// Check if this error is retryable
    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// Upstream-suggested wait before the next attempt
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }

    /// Classify an HTTP error status
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            401 | 403 => Self::Unauthorized(body),
            408 => Self::Timeout(Duration::ZERO),
            429 => Self::RateLimited {
                retry_after: extract_retry_after(&body).map(Duration::from_secs),
            },
            451 => Self::ContentPolicy(body),
            500..=599 => Self::Server {
                status,
                message: body,
            },
            _ => Self::BadRequest(format!("HTTP {}: {}", status, body)),
        }
    }
}

impl From<reqwest::Error> for ModelError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout(Duration::ZERO)
        } else if err.is_decode() {
            Self::InvalidResponse(err.to_string())
        } else {
            Self::Network(err.to_string())
        }
    }
}

/// Extract retry-after seconds from an error response body
fn extract_retry_after(body: &str) -> Option<u64> {
    let json = serde_json::from_str::<serde_json::Value>(body).ok()?;
    json.get("retry_after")
        .and_then(|v| v.as_u64())
        .or_else(|| {
            json.get("error")
                .and_then(|e| e.get("retry_after"))
                .and_then(|v| v.as_u64())
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(ModelError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(ModelError::RateLimited { retry_after: None }.is_transient());
        assert!(
            ModelError::Server {
                status: 503,
                message: "unavailable".to_string()
            }
            .is_transient()
        );
        assert!(ModelError::Network("reset".to_string()).is_transient());

        assert!(!ModelError::Unauthorized("bad key".to_string()).is_transient());
        assert!(!ModelError::BadRequest("oops".to_string()).is_transient());
        assert!(!ModelError::ContentPolicy("no".to_string()).is_transient());
    }

    #[test]
    fn test_from_status() {
        assert!(matches!(
            ModelError::from_status(401, String::new()),
            ModelError::Unauthorized(_)
        ));
        assert!(matches!(
            ModelError::from_status(502, "gateway".to_string()),
            ModelError::Server { status: 502, .. }
        ));
        assert!(matches!(
            ModelError::from_status(400, "bad".to_string()),
            ModelError::BadRequest(_)
        ));

        let limited = ModelError::from_status(429, r#"{"error": {"retry_after": 7}}"#.to_string());
        assert_eq!(limited.retry_after(), Some(Duration::from_secs(7)));
    }

    #[test]
    fn test_extract_retry_after() {
        assert_eq!(extract_retry_after(r#"{"retry_after": 30}"#), Some(30));
        assert_eq!(extract_retry_after(r#"{"message": "slow down"}"#), None);
        assert_eq!(extract_retry_after("not json"), None);
    }
}
