//! Parsing and validation of untrusted model output
//!
//! Model output has no guaranteed schema. It is first parsed into a tagged
//! [`ParsedOutput`] with local repairs (markdown fences, surrounding prose,
//! trailing commas, response envelopes, field aliases), then validated and
//! coerced into a [`DecompositionResult`]:
//!
//! - zero subtasks are rejected
//! - more than `max_subtasks` are truncated, keeping the first ones in the
//!   order the model gave them
//! - `order` is reassigned densely from 0 by final position
//! - the priority is clamped into `[0, 10]`
//! - a missing total duration becomes the sum of subtask estimates, or the
//!   configured default

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::error::ValidationError;
use super::request::PreferenceProfile;
use super::result::{
    DecompositionResult, MAX_TITLE_CHARS, ResultSource, SubtaskDraft, sum_estimates,
    truncate_chars,
};
use crate::config::DecompositionConfig;
use crate::llm::RawModelOutput;

/// Nested envelopes unwrapped before giving up
const MAX_ENVELOPE_DEPTH: usize = 4;

const SUBTASK_LIST_KEYS: &[&str] = &["subtasks", "subTasks", "sub_tasks", "steps", "tasks"];
const SUMMARY_KEYS: &[&str] = &[
    "mainTaskSummary",
    "main_task_summary",
    "main_task",
    "mainTask",
    "summary",
];
const DURATION_KEYS: &[&str] = &[
    "estimatedDurationMinutes",
    "estimated_duration_minutes",
    "estimated_duration",
    "estimatedDuration",
    "total_minutes",
];
const PRIORITY_KEYS: &[&str] = &["priorityScore", "priority_score", "priority"];
const PRODUCED_AT_KEYS: &[&str] = &["producedAt", "produced_at"];
const TITLE_KEYS: &[&str] = &["title", "name", "step", "task"];
const DESCRIPTION_KEYS: &[&str] = &["description", "details", "desc"];
const SUBTASK_MINUTES_KEYS: &[&str] = &[
    "estimatedMinutes",
    "estimated_minutes",
    "estimated_duration",
    "estimatedDuration",
    "duration_minutes",
    "minutes",
];

/// Model output after lenient parsing
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedOutput {
    Parsed(ModelPayload),
    Malformed(String),
}

impl ParsedOutput {
    pub fn is_parsed(&self) -> bool {
        matches!(self, Self::Parsed(_))
    }
}

/// Loosely typed fields recovered from model output
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelPayload {
    pub main_task: Option<String>,
    pub estimated_duration: Option<u32>,
    pub priority: Option<f64>,
    pub produced_at: Option<DateTime<Utc>>,
    /// Present when the text is an already serialized result
    pub source: Option<ResultSource>,
    pub subtasks: Vec<PayloadSubtask>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PayloadSubtask {
    pub title: Option<String>,
    pub description: Option<String>,
    pub estimated_minutes: Option<u32>,
}

/// Validates raw model output against a preference profile
#[derive(Debug, Clone)]
pub struct ResultValidator {
    default_estimated_minutes: u32,
    default_priority: f64,
}

impl Default for ResultValidator {
    fn default() -> Self {
        Self::from_config(&DecompositionConfig::default())
    }
}

impl ResultValidator {
    pub fn new(default_estimated_minutes: u32, default_priority: f64) -> Self {
        Self {
            default_estimated_minutes,
            default_priority: default_priority.clamp(0.0, 10.0),
        }
    }

    pub fn from_config(config: &DecompositionConfig) -> Self {
        Self::new(config.default_estimated_minutes, config.default_priority)
    }

    /// Validate upstream output into a result
    ///
    /// `source` is `model` unless the text is a serialized result that
    /// names its own source.
    pub fn validate(
        &self,
        raw: &RawModelOutput,
        preferences: &PreferenceProfile,
    ) -> Result<DecompositionResult, ValidationError> {
        self.validate_text(&raw.content, preferences)
    }

    pub fn validate_text(
        &self,
        text: &str,
        preferences: &PreferenceProfile,
    ) -> Result<DecompositionResult, ValidationError> {
        match self.parse(text) {
            ParsedOutput::Parsed(payload) => self.coerce(payload, preferences),
            ParsedOutput::Malformed(reason) => Err(ValidationError::Malformed(reason)),
        }
    }

    /// Parse raw text into a payload, repairing common malformations
    pub fn parse(&self, text: &str) -> ParsedOutput {
        let Some(mut value) = parse_json_lenient(text) else {
            return ParsedOutput::Malformed("no JSON object or array found".to_string());
        };

        for _ in 0..MAX_ENVELOPE_DEPTH {
            match unwrap_envelope(&value) {
                Envelope::Inner(inner) => value = inner,
                Envelope::UpstreamError(msg) => {
                    return ParsedOutput::Malformed(format!("upstream reported an error: {}", msg));
                }
                Envelope::None => break,
            }
        }

        match payload_from_value(&value) {
            Ok(payload) => ParsedOutput::Parsed(payload),
            Err(reason) => ParsedOutput::Malformed(reason),
        }
    }

    fn coerce(
        &self,
        payload: ModelPayload,
        preferences: &PreferenceProfile,
    ) -> Result<DecompositionResult, ValidationError> {
        let max = preferences.max_subtasks as usize;
        let total = payload.subtasks.len();

        let mut subtasks = Vec::with_capacity(total.min(max));
        for (position, raw) in payload.subtasks.into_iter().take(max).enumerate() {
            let description = raw.description.map(|d| d.trim().to_string()).filter(|d| !d.is_empty());
            let title = raw
                .title
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .or_else(|| description.clone())
                .ok_or_else(|| {
                    ValidationError::Malformed(format!(
                        "subtask {} has neither a title nor a description",
                        position + 1
                    ))
                })?;

            subtasks.push(SubtaskDraft {
                title: truncate_chars(&title, MAX_TITLE_CHARS),
                description,
                order: position as u32,
                estimated_minutes: raw.estimated_minutes,
            });
        }

        if subtasks.is_empty() {
            return Err(ValidationError::NoSubtasks);
        }
        if total > max {
            debug!(total, kept = max, "Truncated subtasks to max_subtasks");
        }

        let main_task_summary = payload
            .main_task
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| subtasks[0].title.clone());

        let priority_score = payload
            .priority
            .filter(|p| p.is_finite())
            .unwrap_or(self.default_priority)
            .clamp(0.0, 10.0);

        let estimated_duration_minutes = payload
            .estimated_duration
            .or_else(|| sum_estimates(&subtasks))
            .unwrap_or(self.default_estimated_minutes);

        Ok(DecompositionResult {
            main_task_summary,
            estimated_duration_minutes,
            priority_score,
            subtasks,
            produced_at: payload.produced_at.unwrap_or_else(Utc::now),
            source: payload.source.unwrap_or(ResultSource::Model),
        })
    }
}

enum Envelope {
    Inner(Value),
    UpstreamError(String),
    None,
}

/// Peel one layer of transport envelope off a parsed response
fn unwrap_envelope(value: &Value) -> Envelope {
    let inner = match value {
        // Double-encoded JSON
        Value::String(s) => return parse_json_lenient(s).map_or(Envelope::None, Envelope::Inner),
        Value::Object(obj) if has_subtask_list(obj) => return Envelope::None,
        Value::Object(obj) => obj,
        _ => return Envelope::None,
    };

    // OpenAI-compatible: {"choices": [{"message": {"content": "..."}}]}
    if let Some(content) = inner
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
    {
        return content_to_envelope(content);
    }

    // Gateway style: {"code": 0, "msg": "...", "data": {"content": "..."}}
    if let (Some(code), Some(data)) = (inner.get("code"), inner.get("data")) {
        if code.as_i64() != Some(0) {
            let msg = inner
                .get("msg")
                .or_else(|| inner.get("message"))
                .and_then(Value::as_str)
                .unwrap_or("unknown error");
            return Envelope::UpstreamError(msg.to_string());
        }
        return match data.get("content") {
            Some(content) => content_to_envelope(content),
            None => Envelope::Inner(data.clone()),
        };
    }

    if let Some(output) = inner.get("output") {
        return content_to_envelope(output);
    }

    Envelope::None
}

fn content_to_envelope(content: &Value) -> Envelope {
    match content {
        Value::String(s) => parse_json_lenient(s).map_or(Envelope::None, Envelope::Inner),
        Value::Object(_) | Value::Array(_) => Envelope::Inner(content.clone()),
        _ => Envelope::None,
    }
}

fn has_subtask_list(obj: &Map<String, Value>) -> bool {
    SUBTASK_LIST_KEYS.iter().any(|k| obj.contains_key(*k))
}

fn payload_from_value(value: &Value) -> Result<ModelPayload, String> {
    match value {
        Value::Array(items) => Ok(ModelPayload {
            subtasks: subtasks_from_items(items)?,
            ..ModelPayload::default()
        }),
        Value::Object(obj) => {
            let list = SUBTASK_LIST_KEYS.iter().find_map(|k| obj.get(*k));
            let subtasks = match list {
                Some(Value::Array(items)) => subtasks_from_items(items)?,
                Some(_) => return Err("subtask list is not an array".to_string()),
                None if TITLE_KEYS.iter().any(|k| obj.contains_key(*k)) => {
                    vec![subtask_from_object(obj)]
                }
                None => return Err("no subtask list found".to_string()),
            };

            Ok(ModelPayload {
                main_task: if list.is_some() {
                    text_field(obj, SUMMARY_KEYS)
                } else {
                    None
                },
                estimated_duration: if list.is_some() {
                    field(obj, DURATION_KEYS).and_then(lenient_minutes)
                } else {
                    None
                },
                priority: field(obj, PRIORITY_KEYS).and_then(lenient_number),
                produced_at: field(obj, PRODUCED_AT_KEYS)
                    .and_then(Value::as_str)
                    .and_then(|s| s.parse::<DateTime<Utc>>().ok()),
                source: obj
                    .get("source")
                    .and_then(|v| serde_json::from_value(v.clone()).ok()),
                subtasks,
            })
        }
        _ => Err("expected a JSON object or array".to_string()),
    }
}

fn subtasks_from_items(items: &[Value]) -> Result<Vec<PayloadSubtask>, String> {
    let mut subtasks = Vec::with_capacity(items.len());
    for (i, item) in items.iter().enumerate() {
        match item {
            Value::Object(obj) => subtasks.push(subtask_from_object(obj)),
            Value::String(title) => subtasks.push(PayloadSubtask {
                title: Some(title.clone()),
                ..PayloadSubtask::default()
            }),
            Value::Null => warn!(index = i, "Skipping null subtask entry"),
            other => return Err(format!("subtask {} is not an object: {}", i + 1, other)),
        }
    }
    Ok(subtasks)
}

fn subtask_from_object(obj: &Map<String, Value>) -> PayloadSubtask {
    PayloadSubtask {
        title: text_field(obj, TITLE_KEYS),
        description: text_field(obj, DESCRIPTION_KEYS),
        estimated_minutes: field(obj, SUBTASK_MINUTES_KEYS).and_then(lenient_minutes),
    }
}

fn field<'a>(obj: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .find_map(|k| obj.get(*k))
        .filter(|v| !v.is_null())
}

fn text_field(obj: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    match field(obj, keys)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Accept numbers and numeric strings such as `"30"` or `"45 min"`
fn lenient_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            let s = s.trim();
            let end = s
                .char_indices()
                .find(|(i, c)| !(c.is_ascii_digit() || *c == '.' || (*i == 0 && *c == '-')))
                .map(|(i, _)| i)
                .unwrap_or(s.len());
            s[..end].parse().ok()
        }
        _ => None,
    }
}

/// Non-negative whole minutes; negative or non-finite values are absent
fn lenient_minutes(value: &Value) -> Option<u32> {
    let n = lenient_number(value)?;
    if !n.is_finite() || n < 0.0 {
        return None;
    }
    Some(n.round().min(u32::MAX as f64) as u32)
}

/// Find and parse the JSON value in free-form model text
fn parse_json_lenient(text: &str) -> Option<Value> {
    let mut candidates = vec![text.trim()];
    if let Some(body) = strip_code_fences(text) {
        candidates.push(body.trim());
    }
    let sliced: Vec<&str> = candidates.iter().filter_map(|&c| outermost_json(c)).collect();
    candidates.extend(sliced);

    for candidate in candidates {
        if candidate.is_empty() {
            continue;
        }
        if let Ok(value) = serde_json::from_str::<Value>(candidate) {
            if value.is_object() || value.is_array() || value.is_string() {
                return Some(value);
            }
        }
        if let Ok(value) = serde_json::from_str::<Value>(&remove_trailing_commas(candidate)) {
            if value.is_object() || value.is_array() {
                return Some(value);
            }
        }
    }
    None
}

/// Body of the first markdown code fence, if any
fn strip_code_fences(text: &str) -> Option<&str> {
    let start = text.find("```")?;
    let after = &text[start + 3..];
    let body_start = after.find('\n').map(|i| i + 1).unwrap_or(after.len());
    let body = &after[body_start..];
    let end = body.find("```").unwrap_or(body.len());
    Some(&body[..end])
}

/// Slice from the first `{`/`[` to the last matching closer
fn outermost_json(text: &str) -> Option<&str> {
    let start = text.find(['{', '['])?;
    let close = if text[start..].starts_with('{') { '}' } else { ']' };
    let end = text.rfind(close)?;
    (end > start).then(|| &text[start..=end])
}

/// Drop commas that directly precede a closing brace or bracket
fn remove_trailing_commas(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());
    let mut in_string = false;
    let mut escaped = false;

    for (i, &c) in chars.iter().enumerate() {
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }

        match c {
            '"' => {
                in_string = true;
                out.push(c);
            }
            ',' => {
                let next = chars[i + 1..].iter().find(|ch| !ch.is_whitespace());
                if !matches!(next, Some('}') | Some(']')) {
                    out.push(c);
                }
            }
            _ => out.push(c),
        }
    }
    out
}
