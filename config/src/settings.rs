//! Engine settings stored in settings.toml

use crate::PathManager;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// Environment variable overriding `ai.default_model`
pub const DEFAULT_MODEL_ENV: &str = "ENTITY_ENGINE_DEFAULT_MODEL";

/// Root settings document
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct EngineSettings {
    pub server: ServerSettings,
    pub ai: AiSettings,
    /// Provider name -> provider settings
    pub providers: BTreeMap<String, ProviderSettings>,
}

/// HTTP surface settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// Prefix every endpoint is mounted under (e.g. "/api/ee"), empty for root
    pub base_path: String,
    /// Upper bound on request body size
    pub max_body_bytes: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3300,
            base_path: String::new(),
            max_body_bytes: 10 * 1024 * 1024,
        }
    }
}

/// Model resolution and tool-loop settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AiSettings {
    /// Default model id, e.g. "openai:gpt-4o-mini"
    pub default_model: Option<String>,
    /// Tried in order when the primary model fails
    pub fallback_models: Vec<String>,
    /// Upper bound on tool-calling steps per chat request
    pub max_steps: usize,
    /// How long a frontend-proxied tool call may stay unanswered
    pub tool_timeout_secs: u64,
    /// Period of background provider health checks, 0 disables them
    pub health_check_interval_secs: u64,
}

impl Default for AiSettings {
    fn default() -> Self {
        Self {
            default_model: None,
            fallback_models: Vec::new(),
            max_steps: 5,
            tool_timeout_secs: 30,
            health_check_interval_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    #[default]
    OpenAI,
    Ollama,
}

/// Connection settings for one model provider
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct ProviderSettings {
    pub kind: ProviderKind,
    pub base_url: Option<String>,
    /// Name of the environment variable holding the API key
    pub api_key_env: Option<String>,
    /// Model used when the provider name alone is requested
    pub default_model: Option<String>,
    /// Alias -> provider-specific model name
    pub models: BTreeMap<String, String>,
}

impl ProviderSettings {
    /// Read the API key from the configured environment variable
    pub fn api_key(&self) -> Option<String> {
        self.api_key_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|key| !key.is_empty())
    }
}

impl EngineSettings {
    /// Load settings from the default location, falling back to defaults
    /// when no settings file exists yet.
    pub fn load() -> anyhow::Result<Self> {
        let settings = match PathManager::settings_path() {
            Some(path) if path.exists() => Self::load_from(&path)?,
            _ => Self::default(),
        };
        Ok(settings.with_env_overrides())
    }

    /// Load settings from a specific file
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let settings: EngineSettings = toml::from_str(&content)?;
        Ok(settings)
    }

    /// Save settings to the default location
    pub fn save(&self) -> anyhow::Result<()> {
        match PathManager::settings_path() {
            Some(path) => self.save_to(&path),
            None => Err(anyhow::anyhow!("Could not determine settings path")),
        }
    }

    /// Save settings to a specific file
    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Apply environment overrides on top of file values
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(model) = std::env::var(DEFAULT_MODEL_ENV) {
            if !model.trim().is_empty() {
                self.ai.default_model = Some(model.trim().to_string());
            }
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = EngineSettings::default();
        assert_eq!(settings.server.port, 3300);
        assert_eq!(settings.ai.max_steps, 5);
        assert_eq!(settings.ai.tool_timeout_secs, 30);
        assert!(settings.providers.is_empty());
    }

    #[test]
    fn test_parse_partial_toml() {
        let toml = r#"
            [ai]
            default_model = "local:llama3"
            fallback_models = ["openai:gpt-4o-mini"]

            [providers.local]
            kind = "ollama"
            base_url = "http://localhost:11434"

            [providers.local.models]
            fast = "llama3.2:1b"
        "#;
        let settings: EngineSettings = toml::from_str(toml).unwrap();

        assert_eq!(settings.ai.default_model.as_deref(), Some("local:llama3"));
        assert_eq!(settings.ai.fallback_models, vec!["openai:gpt-4o-mini"]);
        // Unspecified fields keep their defaults
        assert_eq!(settings.ai.max_steps, 5);
        assert_eq!(settings.server.host, "127.0.0.1");

        let local = &settings.providers["local"];
        assert_eq!(local.kind, ProviderKind::Ollama);
        assert_eq!(local.models["fast"], "llama3.2:1b");
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.toml");

        let mut settings = EngineSettings::default();
        settings.server.base_path = "/api/ee".to_string();
        settings.ai.tool_timeout_secs = 5;
        settings.save_to(&path).unwrap();

        let loaded = EngineSettings::load_from(&path).unwrap();
        assert_eq!(loaded, settings);
    }

    #[test]
    fn test_api_key_from_missing_env() {
        let provider = ProviderSettings {
            api_key_env: Some("ENTITY_ENGINE_TEST_KEY_THAT_IS_NOT_SET".to_string()),
            ..Default::default()
        };
        assert!(provider.api_key().is_none());
    }
}
