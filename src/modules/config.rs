use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::modules::llm::LlmProvider;

pub const DEFAULT_CONFIG_FILE: &str = "iskra.toml";

pub const ENV_LLM_PROVIDER: &str = "ISKRA_LLM_PROVIDER";
pub const ENV_LLM_HOST: &str = "ISKRA_LLM_HOST";
pub const ENV_LLM_MODEL: &str = "ISKRA_LLM_MODEL";
pub const ENV_LLM_API_KEY: &str = "ISKRA_LLM_API_KEY";
pub const ENV_LLM_TIMEOUT_MS: &str = "ISKRA_LLM_TIMEOUT_MS";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },
    #[error("environment variable {key} has invalid value `{value}`")]
    InvalidEnv { key: String, value: String },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmSettings {
    pub provider: LlmProvider,
    pub host: String,
    pub model: String,
    pub api_key: Option<String>,
    pub timeout_ms: u64,
    pub max_attempts: u32,
    /// Request/response log file. Nothing is logged when unset.
    pub log_path: Option<PathBuf>,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            provider: LlmProvider::Openai,
            host: "https://api.openai.com".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key: None,
            timeout_ms: 30_000,
            max_attempts: 3,
            log_path: Some(PathBuf::from("logs").join("llm.log")),
        }
    }
}

impl LlmSettings {
    /// Applies `ISKRA_LLM_*` overrides through `getter` so callers and tests
    /// decide where variables come from.
    pub fn apply_env<F>(&mut self, getter: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |key: &str| {
            getter(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        if let Some(value) = read(ENV_LLM_PROVIDER) {
            self.provider = match value.to_lowercase().as_str() {
                "openai" => LlmProvider::Openai,
                "ollama" => LlmProvider::Ollama,
                _ => {
                    return Err(ConfigError::InvalidEnv {
                        key: ENV_LLM_PROVIDER.to_string(),
                        value,
                    });
                }
            };
        }
        if let Some(value) = read(ENV_LLM_HOST) {
            self.host = value;
        }
        if let Some(value) = read(ENV_LLM_MODEL) {
            self.model = value;
        }
        if let Some(value) = read(ENV_LLM_API_KEY) {
            self.api_key = Some(value);
        }
        if let Some(value) = read(ENV_LLM_TIMEOUT_MS) {
            self.timeout_ms = value.parse().map_err(|_| ConfigError::InvalidEnv {
                key: ENV_LLM_TIMEOUT_MS.to_string(),
                value,
            })?;
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// True when the provider can be called at all. OpenAI-style endpoints need a key.
    pub fn has_credentials(&self) -> bool {
        match self.provider {
            LlmProvider::Ollama => true,
            LlmProvider::Openai => self.api_key.as_deref().is_some_and(|k| !k.is_empty()),
        }
    }
}

/// Tunables for the whole engine. Every field has a default, so a config
/// file only needs to name what it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    pub tick_interval_ms: u64,
    pub error_backoff_ms: u64,
    pub status_log_every: u64,

    pub initial_agents: usize,
    pub world_bound: f64,
    pub spawn_bound: f64,
    pub energy_jitter: f64,
    pub move_step: f64,
    pub complexity_step: f64,
    pub complexity_cap: f64,
    pub memory_probability: f64,
    pub world_event_probability: f64,
    pub relationship_delta_min: f64,
    pub relationship_delta_max: f64,
    pub retained_events: usize,

    pub answer_context_limit: usize,
    pub continue_idle_secs: u64,
    pub continue_window_secs: u64,
    pub continue_probability: f64,
    pub initiate_every: u64,
    pub initiate_probability: f64,
    pub contact_cooldown_secs: u64,
    pub reflect_every: u64,
    pub reflect_probability: f64,
    pub reflection_event_limit: usize,
    pub scripted_fallback_on_refusal: bool,

    pub request_cooldown_ms: u64,
    pub cache_ttl_secs: u64,
    pub queue_capacity: usize,
    pub worker_poll_ms: u64,
    pub worker_throttle_ms: u64,
    pub harvest_poll_timeout_ms: u64,
    pub harvest_attempt_threshold: u32,
    pub stale_result_secs: u64,
    pub history_limit: usize,

    pub human_message_max_chars: usize,
    pub human_pending_window_secs: u64,
    pub human_busy_retry_secs: u64,
    pub human_rest_secs: u64,

    pub redacted_terms: Vec<String>,
    pub llm: LlmSettings,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 5_000,
            error_backoff_ms: 5_000,
            status_log_every: 10,

            initial_agents: 5,
            world_bound: 10.0,
            spawn_bound: 9.0,
            energy_jitter: 0.05,
            move_step: 0.5,
            complexity_step: 0.001,
            complexity_cap: 2.0,
            memory_probability: 0.3,
            world_event_probability: 0.05,
            relationship_delta_min: -0.05,
            relationship_delta_max: 0.1,
            retained_events: 5_000,

            answer_context_limit: 10,
            continue_idle_secs: 300,
            continue_window_secs: 3_600,
            continue_probability: 0.1,
            initiate_every: 5,
            initiate_probability: 0.08,
            contact_cooldown_secs: 600,
            reflect_every: 15,
            reflect_probability: 0.3,
            reflection_event_limit: 3,
            scripted_fallback_on_refusal: true,

            request_cooldown_ms: 60_000,
            cache_ttl_secs: 120,
            queue_capacity: 64,
            worker_poll_ms: 500,
            worker_throttle_ms: 2_000,
            harvest_poll_timeout_ms: 200,
            harvest_attempt_threshold: 5,
            stale_result_secs: 600,
            history_limit: 20,

            human_message_max_chars: 500,
            human_pending_window_secs: 30,
            human_busy_retry_secs: 5,
            human_rest_secs: 3,

            redacted_terms: ["violence", "drugs", "weapons", "extremism", "gambling"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            llm: LlmSettings::default(),
        }
    }
}

impl SimConfig {
    /// Loads `path` (or `iskra.toml` in the working directory when it exists),
    /// applies environment overrides and validates the result.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                let default_path = PathBuf::from(DEFAULT_CONFIG_FILE);
                if default_path.exists() {
                    Self::from_file(&default_path)?
                } else {
                    Self::default()
                }
            }
        };
        config.llm.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content).map_err(|err| match err {
            ConfigError::Parse { message, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                message,
            },
            other => other,
        })
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            message: e.to_string(),
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let probabilities = [
            ("memory_probability", self.memory_probability),
            ("world_event_probability", self.world_event_probability),
            ("continue_probability", self.continue_probability),
            ("initiate_probability", self.initiate_probability),
            ("reflect_probability", self.reflect_probability),
        ];
        for (name, value) in probabilities {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::Invalid(format!(
                    "{name} must be within [0, 1], got {value}"
                )));
            }
        }
        if self.tick_interval_ms == 0 {
            return Err(ConfigError::Invalid("tick_interval_ms must be positive".into()));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::Invalid("queue_capacity must be positive".into()));
        }
        if self.history_limit == 0 {
            return Err(ConfigError::Invalid("history_limit must be positive".into()));
        }
        if self.world_bound <= 0.0 || self.spawn_bound <= 0.0 || self.spawn_bound > self.world_bound
        {
            return Err(ConfigError::Invalid(
                "spawn_bound must be positive and no larger than world_bound".into(),
            ));
        }
        if self.energy_jitter < 0.0 || self.move_step < 0.0 || self.complexity_step < 0.0 {
            return Err(ConfigError::Invalid(
                "energy_jitter, move_step and complexity_step must not be negative".into(),
            ));
        }
        if self.relationship_delta_min > self.relationship_delta_max {
            return Err(ConfigError::Invalid(
                "relationship_delta_min must not exceed relationship_delta_max".into(),
            ));
        }
        if self.llm.max_attempts == 0 {
            return Err(ConfigError::Invalid("llm.max_attempts must be positive".into()));
        }
        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_millis(self.error_backoff_ms)
    }

    pub fn request_cooldown(&self) -> Duration {
        Duration::from_millis(self.request_cooldown_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn worker_poll(&self) -> Duration {
        Duration::from_millis(self.worker_poll_ms)
    }

    pub fn worker_throttle(&self) -> Duration {
        Duration::from_millis(self.worker_throttle_ms)
    }

    pub fn harvest_poll_timeout(&self) -> Duration {
        Duration::from_millis(self.harvest_poll_timeout_ms)
    }

    pub fn stale_result_age(&self) -> Duration {
        Duration::from_secs(self.stale_result_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn partial_file_keeps_defaults() {
        let config = SimConfig::from_toml_str(
            r#"
            tick_interval_ms = 250
            initiate_probability = 1.0

            [llm]
            provider = "ollama"
            model = "llama3"
            "#,
        )
        .unwrap();

        assert_eq!(config.tick_interval(), Duration::from_millis(250));
        assert_eq!(config.initiate_probability, 1.0);
        assert_eq!(config.request_cooldown(), Duration::from_secs(60));
        assert_eq!(config.llm.provider, LlmProvider::Ollama);
        assert_eq!(config.llm.model, "llama3");
        assert_eq!(config.llm.max_attempts, 3);
        config.validate().unwrap();
    }

    #[test]
    fn env_overrides_llm_settings() {
        let vars: HashMap<&str, &str> = HashMap::from([
            (ENV_LLM_PROVIDER, "Ollama"),
            (ENV_LLM_HOST, "http://localhost:11434"),
            (ENV_LLM_TIMEOUT_MS, "1500"),
            (ENV_LLM_API_KEY, "  "),
        ]);
        let mut settings = LlmSettings::default();
        settings
            .apply_env(|key| vars.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(settings.provider, LlmProvider::Ollama);
        assert_eq!(settings.host, "http://localhost:11434");
        assert_eq!(settings.timeout(), Duration::from_millis(1500));
        assert_eq!(settings.api_key, None);
        assert!(settings.has_credentials());
    }

    #[test]
    fn bad_env_value_is_reported() {
        let mut settings = LlmSettings::default();
        let err = settings
            .apply_env(|key| (key == ENV_LLM_PROVIDER).then(|| "gigachat".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { ref key, .. } if key == ENV_LLM_PROVIDER));
    }

    #[test]
    fn openai_without_key_has_no_credentials() {
        let settings = LlmSettings::default();
        assert!(!settings.has_credentials());
    }

    #[test]
    fn out_of_range_probability_is_rejected() {
        let config = SimConfig {
            reflect_probability: 1.5,
            ..SimConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }
}
