//! Configuration management with file persistence

use anyhow::{Context, anyhow};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::decomposition::DEFAULT_MAX_SUBTASKS;

/// SmartFlow configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub llm: LlmConfig,
    pub cache: CacheConfig,
    pub retry: RetryConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub decomposition: DecompositionConfig,
}

/// Upstream model parameters, fixed per engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    #[serde(skip)]
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub capacity: usize,
    pub ttl_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub attempt_timeout_secs: u64,
    /// Full jitter on backoff delays
    pub jitter: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive terminal failures before the circuit opens
    pub failure_threshold: u32,
    pub cooldown_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecompositionConfig {
    pub default_max_subtasks: u32,
    pub request_deadline_secs: u64,
    /// Serve the single-subtask heuristic result when the upstream path fails
    pub fallback_enabled: bool,
    /// Re-request strict JSON once when the first output is malformed
    pub strict_reprompt: bool,
    pub default_estimated_minutes: u32,
    pub default_priority: f64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: "https://openrouter.ai/api/v1".to_string(),
            model: "anthropic/claude-3-5-haiku-latest".to_string(),
            temperature: 0.3,
            max_tokens: 1024,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            ttl_secs: 24 * 60 * 60,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 8_000,
            attempt_timeout_secs: 30,
            jitter: true,
        }
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_secs: 30,
        }
    }
}

impl Default for DecompositionConfig {
    fn default() -> Self {
        Self {
            default_max_subtasks: DEFAULT_MAX_SUBTASKS,
            request_deadline_secs: 90,
            fallback_enabled: true,
            strict_reprompt: true,
            default_estimated_minutes: 120,
            default_priority: 7.0,
        }
    }
}

/// Mask a secret, keeping its last four characters when it is long enough
fn redact(key: &str) -> String {
    match key.char_indices().rev().nth(3) {
        Some((idx, _)) if idx > 0 => format!("***{}", &key[idx..]),
        _ => "***".to_string(),
    }
}

impl LlmConfig {
    pub fn resolved_api_key(&self) -> anyhow::Result<Option<String>> {
        self.enforce_env_only()?;

        Ok(env::var("SMARTFLOW_API_KEY")
            .or_else(|_| env::var("OPENROUTER_API_KEY"))
            .ok())
    }

    pub fn redacted_api_key(&self) -> anyhow::Result<Option<String>> {
        self.resolved_api_key().map(|opt| opt.as_deref().map(redact))
    }

    pub fn enforce_env_only(&self) -> anyhow::Result<()> {
        if self.api_key.is_some() {
            return Err(anyhow!(
                "LLM API keys must be provided via environment variables, not stored in configuration"
            ));
        }
        Ok(())
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

impl RetryConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }
}

impl CircuitBreakerConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

impl DecompositionConfig {
    pub fn request_deadline(&self) -> Duration {
        Duration::from_secs(self.request_deadline_secs)
    }
}

impl Config {
    /// Get the config directory path
    pub fn config_dir() -> anyhow::Result<PathBuf> {
        let dir = if let Ok(custom_dir) = env::var("SMARTFLOW_CONFIG_DIR") {
            PathBuf::from(custom_dir)
        } else {
            dirs::config_dir()
                .ok_or_else(|| anyhow!("Could not determine config directory"))?
                .join("smartflow")
        };
        Ok(dir)
    }

    /// Get the config file path
    pub fn config_path() -> anyhow::Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load configuration from file, or fall back to defaults if it doesn't exist
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load configuration from a specific file
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Config::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self) -> anyhow::Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        self.validate()?;

        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create config directory: {}", dir.display()))?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        self.llm.enforce_env_only()?;

        if self.cache.capacity == 0 {
            return Err(anyhow!("cache.capacity must be at least 1"));
        }
        if self.cache.ttl_secs == 0 {
            return Err(anyhow!("cache.ttl_secs must be at least 1"));
        }
        if self.retry.max_attempts == 0 {
            return Err(anyhow!("retry.max_attempts must be at least 1"));
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            return Err(anyhow!("retry.max_delay_ms must not be below retry.base_delay_ms"));
        }
        if self.retry.attempt_timeout_secs == 0 {
            return Err(anyhow!("retry.attempt_timeout_secs must be at least 1"));
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(anyhow!("circuit_breaker.failure_threshold must be at least 1"));
        }
        if self.decomposition.default_max_subtasks == 0 {
            return Err(anyhow!("decomposition.default_max_subtasks must be at least 1"));
        }
        if self.decomposition.request_deadline_secs == 0 {
            return Err(anyhow!("decomposition.request_deadline_secs must be at least 1"));
        }
        if !(0.0..=10.0).contains(&self.decomposition.default_priority) {
            return Err(anyhow!("decomposition.default_priority must be between 0 and 10"));
        }
        Ok(())
    }

    /// Get a configuration value by key
    pub fn get(&self, key: &str) -> anyhow::Result<String> {
        match key {
            "llm.base_url" => Ok(self.llm.base_url.clone()),
            "llm.model" => Ok(self.llm.model.clone()),
            "llm.temperature" => Ok(self.llm.temperature.to_string()),
            "llm.max_tokens" => Ok(self.llm.max_tokens.to_string()),

            "cache.capacity" => Ok(self.cache.capacity.to_string()),
            "cache.ttl_secs" => Ok(self.cache.ttl_secs.to_string()),

            "retry.max_attempts" => Ok(self.retry.max_attempts.to_string()),
            "retry.base_delay_ms" => Ok(self.retry.base_delay_ms.to_string()),
            "retry.max_delay_ms" => Ok(self.retry.max_delay_ms.to_string()),
            "retry.attempt_timeout_secs" => Ok(self.retry.attempt_timeout_secs.to_string()),
            "retry.jitter" => Ok(self.retry.jitter.to_string()),

            "circuit_breaker.failure_threshold" => {
                Ok(self.circuit_breaker.failure_threshold.to_string())
            }
            "circuit_breaker.cooldown_secs" => Ok(self.circuit_breaker.cooldown_secs.to_string()),

            "decomposition.default_max_subtasks" => {
                Ok(self.decomposition.default_max_subtasks.to_string())
            }
            "decomposition.request_deadline_secs" => {
                Ok(self.decomposition.request_deadline_secs.to_string())
            }
            "decomposition.fallback_enabled" => Ok(self.decomposition.fallback_enabled.to_string()),
            "decomposition.strict_reprompt" => Ok(self.decomposition.strict_reprompt.to_string()),
            "decomposition.default_estimated_minutes" => {
                Ok(self.decomposition.default_estimated_minutes.to_string())
            }
            "decomposition.default_priority" => Ok(self.decomposition.default_priority.to_string()),

            // API key (special handling - show redacted)
            "llm.api_key" | "api_key" => match self.llm.redacted_api_key()? {
                Some(redacted) => Ok(redacted),
                None => Ok("(not set - use SMARTFLOW_API_KEY or OPENROUTER_API_KEY env var)".to_string()),
            },

            _ => Err(anyhow!(
                "Unknown configuration key: {}. Use `smartflow config list` to see available keys.",
                key
            )),
        }
    }

    /// Set a configuration value by key
    ///
    /// The updated configuration is validated as a whole; on failure the
    /// previous value is restored.
    pub fn set(&mut self, key: &str, value: &str) -> anyhow::Result<()> {
        let previous = self.clone();
        if let Err(e) = self.set_unchecked(key, value).and_then(|_| self.validate()) {
            *self = previous;
            return Err(e);
        }
        Ok(())
    }

    fn set_unchecked(&mut self, key: &str, value: &str) -> anyhow::Result<()> {
        match key {
            "llm.base_url" => {
                self.llm.base_url = value.trim_end_matches('/').to_string();
            }
            "llm.model" => {
                self.llm.model = value.to_string();
            }
            "llm.temperature" => {
                let temp: f32 = parse_value(key, value)?;
                if !(0.0..=2.0).contains(&temp) {
                    return Err(anyhow!("Temperature must be between 0.0 and 2.0"));
                }
                self.llm.temperature = temp;
            }
            "llm.max_tokens" => self.llm.max_tokens = parse_value(key, value)?,

            "cache.capacity" => self.cache.capacity = parse_value(key, value)?,
            "cache.ttl_secs" => self.cache.ttl_secs = parse_value(key, value)?,

            "retry.max_attempts" => self.retry.max_attempts = parse_value(key, value)?,
            "retry.base_delay_ms" => self.retry.base_delay_ms = parse_value(key, value)?,
            "retry.max_delay_ms" => self.retry.max_delay_ms = parse_value(key, value)?,
            "retry.attempt_timeout_secs" => {
                self.retry.attempt_timeout_secs = parse_value(key, value)?
            }
            "retry.jitter" => self.retry.jitter = parse_value(key, value)?,

            "circuit_breaker.failure_threshold" => {
                self.circuit_breaker.failure_threshold = parse_value(key, value)?
            }
            "circuit_breaker.cooldown_secs" => {
                self.circuit_breaker.cooldown_secs = parse_value(key, value)?
            }

            "decomposition.default_max_subtasks" => {
                self.decomposition.default_max_subtasks = parse_value(key, value)?
            }
            "decomposition.request_deadline_secs" => {
                self.decomposition.request_deadline_secs = parse_value(key, value)?
            }
            "decomposition.fallback_enabled" => {
                self.decomposition.fallback_enabled = parse_value(key, value)?
            }
            "decomposition.strict_reprompt" => {
                self.decomposition.strict_reprompt = parse_value(key, value)?
            }
            "decomposition.default_estimated_minutes" => {
                self.decomposition.default_estimated_minutes = parse_value(key, value)?
            }
            "decomposition.default_priority" => {
                self.decomposition.default_priority = parse_value(key, value)?
            }

            // API key cannot be set via config
            "llm.api_key" | "api_key" => {
                return Err(anyhow!(
                    "API keys cannot be stored in configuration for security. \
                     Set the SMARTFLOW_API_KEY or OPENROUTER_API_KEY environment variable instead."
                ));
            }

            _ => {
                return Err(anyhow!(
                    "Unknown configuration key: {}. Use `smartflow config list` to see available keys.",
                    key
                ));
            }
        }
        Ok(())
    }

    /// List all configuration keys and their values
    pub fn list(&self) -> anyhow::Result<Vec<(String, String)>> {
        CONFIG_KEYS
            .iter()
            .map(|key| {
                let value = self.get(key)?;
                Ok((key.to_string(), value))
            })
            .collect()
    }

    /// Reset configuration to defaults
    pub fn reset() -> anyhow::Result<()> {
        let path = Self::config_path()?;
        if path.exists() {
            fs::remove_file(&path)
                .with_context(|| format!("Failed to remove config file: {}", path.display()))?;
        }
        Ok(())
    }
}

const CONFIG_KEYS: &[&str] = &[
    "llm.base_url",
    "llm.model",
    "llm.temperature",
    "llm.max_tokens",
    "llm.api_key",
    "cache.capacity",
    "cache.ttl_secs",
    "retry.max_attempts",
    "retry.base_delay_ms",
    "retry.max_delay_ms",
    "retry.attempt_timeout_secs",
    "retry.jitter",
    "circuit_breaker.failure_threshold",
    "circuit_breaker.cooldown_secs",
    "decomposition.default_max_subtasks",
    "decomposition.request_deadline_secs",
    "decomposition.fallback_enabled",
    "decomposition.strict_reprompt",
    "decomposition.default_estimated_minutes",
    "decomposition.default_priority",
];

fn parse_value<T>(key: &str, value: &str) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .trim()
        .parse()
        .with_context(|| format!("Invalid {} value: {}", key, value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.cache.ttl(), Duration::from_secs(86_400));
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.base_delay(), Duration::from_millis(500));
        assert_eq!(config.circuit_breaker.failure_threshold, 5);
        assert_eq!(config.decomposition.default_max_subtasks, 8);
        assert!(config.decomposition.fallback_enabled);
    }

    #[test]
    fn test_get_set_round_trip() {
        let mut config = Config::default();
        config.set("retry.max_attempts", "5").unwrap();
        assert_eq!(config.get("retry.max_attempts").unwrap(), "5");

        config.set("decomposition.fallback_enabled", "false").unwrap();
        assert!(!config.decomposition.fallback_enabled);

        config.set("llm.base_url", "https://example.com/v1/").unwrap();
        assert_eq!(config.llm.base_url, "https://example.com/v1");
    }

    #[test]
    fn test_set_rejects_invalid_values() {
        let mut config = Config::default();
        assert!(config.set("cache.capacity", "0").is_err());
        assert_eq!(config.cache.capacity, 1024);

        assert!(config.set("retry.max_delay_ms", "10").is_err());
        assert_eq!(config.retry.max_delay_ms, 8_000);

        assert!(config.set("llm.temperature", "3.5").is_err());
        assert!(config.set("retry.max_attempts", "many").is_err());
        assert!(config.set("decomposition.default_priority", "11").is_err());
        assert!(config.set("unknown.key", "1").is_err());
    }

    #[test]
    fn test_api_key_cannot_be_stored() {
        let mut config = Config::default();
        assert!(config.set("llm.api_key", "sk-secret").is_err());

        config.llm.api_key = Some("sk-secret".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_redact_keeps_last_four_chars() {
        assert_eq!(redact("sk-or-v1-abcdef"), "***cdef");
        assert_eq!(redact("abcd"), "***");
        assert_eq!(redact(""), "***");
        assert_eq!(redact("clé-secrète"), "***rète");
        assert_eq!(redact("ключ"), "***");
    }

    #[test]
    fn test_list_covers_every_key() {
        let config = Config::default();
        let listed = config.list().unwrap();
        assert_eq!(listed.len(), CONFIG_KEYS.len());
        assert!(listed.iter().any(|(k, v)| k == "cache.ttl_secs" && v == "86400"));
    }

    #[test]
    fn test_toml_round_trip_and_partial_file() {
        let config = Config::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed, config);

        let partial: Config = toml::from_str("[retry]\nmax_attempts = 4\n").unwrap();
        assert_eq!(partial.retry.max_attempts, 4);
        assert_eq!(partial.retry.base_delay_ms, 500);
        assert_eq!(partial.cache.capacity, 1024);
    }

    #[test]
    fn test_save_and_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        assert_eq!(Config::load_from(&path).unwrap(), Config::default());

        let mut config = Config::default();
        config.set("cache.ttl_secs", "600").unwrap();
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.cache.ttl(), Duration::from_secs(600));
        assert_eq!(loaded, config);

        fs::write(&path, "[cache]\ncapacity = 0\n").unwrap();
        assert!(Config::load_from(&path).is_err());
    }
}
