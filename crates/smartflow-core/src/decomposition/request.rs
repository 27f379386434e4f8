//! Decomposition requests, preference profiles, and fingerprints

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::error::DecompositionError;
use crate::config::DecompositionConfig;

/// Default upper bound on the number of subtasks
pub const DEFAULT_MAX_SUBTASKS: u32 = 8;

/// How finely the task should be broken down
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    /// Merge similar steps into fewer, larger ones
    Coarse,
    #[default]
    Balanced,
    /// Expand into small, concrete actions
    Fine,
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Coarse => write!(f, "coarse"),
            Self::Balanced => write!(f, "balanced"),
            Self::Fine => write!(f, "fine"),
        }
    }
}

impl std::str::FromStr for Granularity {
    type Err = DecompositionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "coarse" => Ok(Self::Coarse),
            "balanced" => Ok(Self::Balanced),
            "fine" => Ok(Self::Fine),
            other => Err(DecompositionError::InvalidPreference(format!(
                "unknown granularity '{}', expected coarse, balanced or fine",
                other
            ))),
        }
    }
}

/// User preferences that shape the prompt and validation bounds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreferenceProfile {
    pub granularity: Granularity,
    pub max_subtasks: u32,
    /// Soft hints, kept sorted for deterministic prompts and fingerprints
    #[serde(default)]
    pub focus_areas: BTreeSet<String>,
}

impl Default for PreferenceProfile {
    fn default() -> Self {
        Self::from_config(&DecompositionConfig::default())
    }
}

impl PreferenceProfile {
    pub fn new(granularity: Granularity, max_subtasks: u32) -> Self {
        Self {
            granularity,
            max_subtasks,
            focus_areas: BTreeSet::new(),
        }
    }

    /// Balanced profile bounded by the configured subtask limit
    pub fn from_config(config: &DecompositionConfig) -> Self {
        Self::new(Granularity::default(), config.default_max_subtasks)
    }

    /// Add a focus area; blank areas are ignored
    pub fn with_focus_area(mut self, area: impl AsRef<str>) -> Self {
        let area = area.as_ref().trim();
        if !area.is_empty() {
            self.focus_areas.insert(area.to_string());
        }
        self
    }

    pub fn with_focus_areas<I, S>(self, areas: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        areas
            .into_iter()
            .fold(self, |profile, area| profile.with_focus_area(area))
    }

    pub fn validate(&self) -> Result<(), DecompositionError> {
        if self.max_subtasks == 0 {
            return Err(DecompositionError::InvalidPreference(
                "max_subtasks must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Focus areas normalized the same way as descriptions
    fn normalized_focus_areas(&self) -> BTreeSet<String> {
        self.focus_areas
            .iter()
            .map(|a| normalize_text(a))
            .filter(|a| !a.is_empty())
            .collect()
    }
}

/// A caller's request to decompose one task
///
/// Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecompositionRequest {
    description: String,
    preferences: PreferenceProfile,
    requested_at: DateTime<Utc>,
}

impl DecompositionRequest {
    pub fn new(description: impl Into<String>, preferences: PreferenceProfile) -> Self {
        Self {
            description: description.into(),
            preferences,
            requested_at: Utc::now(),
        }
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn preferences(&self) -> &PreferenceProfile {
        &self.preferences
    }

    pub fn requested_at(&self) -> DateTime<Utc> {
        self.requested_at
    }

    /// Description trimmed, case-folded, and whitespace-collapsed
    pub fn normalized_description(&self) -> String {
        normalize_text(&self.description)
    }

    /// Reject requests the engine must never send upstream
    pub fn validate(&self) -> Result<(), DecompositionError> {
        if self.description.trim().is_empty() {
            return Err(DecompositionError::InvalidRequest(
                "task description must not be empty".to_string(),
            ));
        }
        self.preferences.validate()
    }

    /// Content-addressed key for caching and coalescing
    pub fn fingerprint(&self) -> Fingerprint {
        let mut hasher = Sha256::new();
        hasher.update(b"description\0");
        hasher.update(self.normalized_description().as_bytes());
        hasher.update(b"\0granularity\0");
        hasher.update(self.preferences.granularity.to_string().as_bytes());
        hasher.update(b"\0max_subtasks\0");
        hasher.update(self.preferences.max_subtasks.to_be_bytes());
        for area in self.preferences.normalized_focus_areas() {
            hasher.update(b"\0focus\0");
            hasher.update(area.as_bytes());
        }
        Fingerprint(hex::encode(hasher.finalize()))
    }
}

/// Deterministic SHA-256 digest of a normalized request
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Wrap a previously computed hex digest
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex characters, for log lines
    pub fn short(&self) -> &str {
        self.0.get(..12).unwrap_or(&self.0)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Trim, case-fold, and collapse internal whitespace
pub fn normalize_text(text: &str) -> String {
    text.split_whitespace()
        .map(|word| word.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(description: &str) -> DecompositionRequest {
        DecompositionRequest::new(description, PreferenceProfile::default())
    }

    #[test]
    fn test_profile_from_config() {
        let config = DecompositionConfig {
            default_max_subtasks: 5,
            ..DecompositionConfig::default()
        };
        let profile = PreferenceProfile::from_config(&config);
        assert_eq!(profile.max_subtasks, 5);
        assert_eq!(profile.granularity, Granularity::Balanced);
        assert!(profile.focus_areas.is_empty());

        assert_eq!(PreferenceProfile::default().max_subtasks, DEFAULT_MAX_SUBTASKS);
    }

    #[test]
    fn test_normalize_text() {
        assert_eq!(normalize_text("  Plan a   Small\tCRM\nSystem "), "plan a small crm system");
        assert_eq!(normalize_text("   "), "");
    }

    #[test]
    fn test_fingerprint_ignores_cosmetic_differences() {
        let a = request("Plan a small CRM system");
        let b = request("  plan A small   crm\nsystem  ");
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint().as_str().len(), 64);
    }

    #[test]
    fn test_fingerprint_ignores_focus_area_order() {
        let prefs_a = PreferenceProfile::default().with_focus_areas(["Testing", "security"]);
        let prefs_b = PreferenceProfile::default().with_focus_areas(["Security ", "testing"]);
        let a = DecompositionRequest::new("build api", prefs_a);
        let b = DecompositionRequest::new("build api", prefs_b);
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_fingerprint_distinguishes_inputs() {
        let base = request("plan a small crm system");
        let other_text = request("plan a large crm system");
        let other_granularity = DecompositionRequest::new(
            "plan a small crm system",
            PreferenceProfile::new(Granularity::Fine, DEFAULT_MAX_SUBTASKS),
        );
        let other_max = DecompositionRequest::new(
            "plan a small crm system",
            PreferenceProfile::new(Granularity::Balanced, 6),
        );
        let other_focus = DecompositionRequest::new(
            "plan a small crm system",
            PreferenceProfile::default().with_focus_area("design"),
        );

        let fingerprints = [
            base.fingerprint(),
            other_text.fingerprint(),
            other_granularity.fingerprint(),
            other_max.fingerprint(),
            other_focus.fingerprint(),
        ];
        for (i, a) in fingerprints.iter().enumerate() {
            for b in fingerprints.iter().skip(i + 1) {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn test_validate() {
        assert!(request("write the report").validate().is_ok());
        assert!(matches!(
            request("   ").validate(),
            Err(DecompositionError::InvalidRequest(_))
        ));

        let zero = DecompositionRequest::new("x", PreferenceProfile::new(Granularity::Coarse, 0));
        assert!(matches!(
            zero.validate(),
            Err(DecompositionError::InvalidPreference(_))
        ));
    }

    #[test]
    fn test_granularity_parse() {
        assert_eq!("Fine".parse::<Granularity>().unwrap(), Granularity::Fine);
        assert_eq!(" coarse ".parse::<Granularity>().unwrap(), Granularity::Coarse);
        assert!("extreme".parse::<Granularity>().is_err());
    }

    #[test]
    fn test_short_fingerprint() {
        let fp = request("x").fingerprint();
        assert_eq!(fp.short().len(), 12);
        assert!(fp.as_str().starts_with(fp.short()));
        assert_eq!(Fingerprint::from_hex("abc").short(), "abc");
    }
}
