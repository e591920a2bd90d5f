//! Tunables for a story session.

use crate::memory::WindowConfig;
use std::path::PathBuf;
use thiserror::Error;

/// Errors reading configuration from the environment.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value '{value}' for {key}")]
    Invalid { key: &'static str, value: String },
}

/// Configuration for a [`StorySession`](crate::StorySession).
#[derive(Debug, Clone, PartialEq)]
pub struct StoryConfig {
    /// Model override; the client's default is used when unset.
    pub model: Option<String>,

    /// Maximum tokens per model response.
    pub max_tokens: usize,

    pub temperature: Option<f32>,

    /// Window used for the character's view of the conversation.
    pub conversation_window: WindowConfig,

    /// Window used by the progression classifiers.
    pub progression_window: WindowConfig,

    /// How many summarization rounds to try before giving up.
    pub max_summary_attempts: usize,

    /// Goal creation is skipped when more goals than this are incomplete.
    pub goal_creation_ceiling: usize,

    /// Character name used when a storyline has no record.
    pub character_name: String,

    /// Database file; `None` keeps everything in memory.
    pub database: Option<PathBuf>,
}

impl Default for StoryConfig {
    fn default() -> Self {
        Self {
            model: None,
            max_tokens: 4096,
            temperature: Some(0.8),
            conversation_window: WindowConfig::conversation(),
            progression_window: WindowConfig::progression(),
            max_summary_attempts: 3,
            goal_creation_ceiling: 5,
            character_name: "Character".to_string(),
            database: None,
        }
    }
}

impl StoryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load `.env` if present, then read `STORYLINE_MODEL`, `STORYLINE_DB`
    /// and `STORYLINE_MAX_TOKENS` over the defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::from_vars(|key| std::env::var(key).ok())
    }

    fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(model) = var("STORYLINE_MODEL").filter(|m| !m.is_empty()) {
            config.model = Some(model);
        }
        if let Some(path) = var("STORYLINE_DB").filter(|p| !p.is_empty()) {
            config.database = Some(PathBuf::from(path));
        }
        if let Some(value) = var("STORYLINE_MAX_TOKENS") {
            config.max_tokens = value.trim().parse().map_err(|_| ConfigError::Invalid {
                key: "STORYLINE_MAX_TOKENS",
                value,
            })?;
        }

        Ok(config)
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_max_tokens(mut self, tokens: usize) -> Self {
        self.max_tokens = tokens;
        self
    }

    pub fn with_temperature(mut self, temp: f32) -> Self {
        self.temperature = Some(temp);
        self
    }

    pub fn with_conversation_window(mut self, window: WindowConfig) -> Self {
        self.conversation_window = window;
        self
    }

    pub fn with_progression_window(mut self, window: WindowConfig) -> Self {
        self.progression_window = window;
        self
    }

    pub fn with_max_summary_attempts(mut self, attempts: usize) -> Self {
        self.max_summary_attempts = attempts;
        self
    }

    pub fn with_goal_creation_ceiling(mut self, ceiling: usize) -> Self {
        self.goal_creation_ceiling = ceiling;
        self
    }

    pub fn with_character_name(mut self, name: impl Into<String>) -> Self {
        self.character_name = name.into();
        self
    }

    pub fn with_database(mut self, path: impl Into<PathBuf>) -> Self {
        self.database = Some(path.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = StoryConfig::default();
        assert_eq!(config.conversation_window, WindowConfig::new(8, 2));
        assert_eq!(config.progression_window, WindowConfig::new(2, 2));
        assert_eq!(config.goal_creation_ceiling, 5);
        assert_eq!(config.max_summary_attempts, 3);
    }

    #[test]
    fn test_from_vars_overrides() {
        let config = StoryConfig::from_vars(vars(&[
            ("STORYLINE_MODEL", "claude-test"),
            ("STORYLINE_DB", "/tmp/story.db"),
            ("STORYLINE_MAX_TOKENS", " 1024 "),
        ]))
        .unwrap();

        assert_eq!(config.model.as_deref(), Some("claude-test"));
        assert_eq!(config.database, Some(PathBuf::from("/tmp/story.db")));
        assert_eq!(config.max_tokens, 1024);
    }

    #[test]
    fn test_from_vars_rejects_bad_token_count() {
        let err = StoryConfig::from_vars(vars(&[("STORYLINE_MAX_TOKENS", "lots")])).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                key: "STORYLINE_MAX_TOKENS",
                ..
            }
        ));
    }

    #[test]
    fn test_builder() {
        let config = StoryConfig::new()
            .with_model("m")
            .with_max_tokens(10)
            .with_character_name("Mara")
            .with_goal_creation_ceiling(2);
        assert_eq!(config.model.as_deref(), Some("m"));
        assert_eq!(config.max_tokens, 10);
        assert_eq!(config.character_name, "Mara");
        assert_eq!(config.goal_creation_ceiling, 2);
    }
}
