//! Decomposition results returned to callers

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::request::DecompositionRequest;

/// Maximum subtask title length in characters
pub const MAX_TITLE_CHARS: usize = 200;

/// Where a result came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResultSource {
    /// Fresh, validated model output
    Model,
    /// Served from the decomposition cache
    CacheHit,
    /// Deterministic heuristic result after upstream failure
    Fallback,
}

impl std::fmt::Display for ResultSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Model => write!(f, "model"),
            Self::CacheHit => write!(f, "cache_hit"),
            Self::Fallback => write!(f, "fallback"),
        }
    }
}

/// One step of a decomposition, not yet persisted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubtaskDraft {
    /// 1..=200 characters
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Dense, 0-based position within the result
    pub order: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_minutes: Option<u32>,
}

/// A validated decomposition of one task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecompositionResult {
    pub main_task_summary: String,
    pub estimated_duration_minutes: u32,
    /// Within `[0, 10]`
    pub priority_score: f64,
    pub subtasks: Vec<SubtaskDraft>,
    pub produced_at: DateTime<Utc>,
    pub source: ResultSource,
}

impl DecompositionResult {
    /// Heuristic single-subtask result used when the upstream path fails
    ///
    /// Deterministic apart from `produced_at`: the only subtask is the
    /// original description.
    pub fn fallback(
        request: &DecompositionRequest,
        estimated_minutes: u32,
        priority_score: f64,
    ) -> Self {
        let description = request.description().trim();
        Self {
            main_task_summary: description.to_string(),
            estimated_duration_minutes: estimated_minutes,
            priority_score: priority_score.clamp(0.0, 10.0),
            subtasks: vec![SubtaskDraft {
                title: truncate_chars(description, MAX_TITLE_CHARS),
                description: Some(description.to_string()),
                order: 0,
                estimated_minutes: Some(estimated_minutes),
            }],
            produced_at: Utc::now(),
            source: ResultSource::Fallback,
        }
    }

    /// Copy of this result relabelled with a new source
    pub fn with_source(&self, source: ResultSource) -> Self {
        Self {
            source,
            ..self.clone()
        }
    }
}

pub(crate) fn sum_estimates(subtasks: &[SubtaskDraft]) -> Option<u32> {
    subtasks
        .iter()
        .filter_map(|s| s.estimated_minutes)
        .fold(None, |acc: Option<u32>, m| Some(acc.unwrap_or(0).saturating_add(m)))
}

/// Truncate to at most `max` characters on a character boundary
pub(crate) fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}
