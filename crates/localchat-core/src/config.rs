use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use anyhow::{Result, anyhow};
use tracing::{debug, warn};

use crate::engine::ChatParams;
use crate::models::Model;

pub const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Config {
    pub default_model: Option<String>,
    pub ollama_url: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for Config {
    fn default() -> Self {
        let params = ChatParams::default();
        Self {
            default_model: None,
            ollama_url: DEFAULT_OLLAMA_URL.to_string(),
            temperature: params.temperature,
            max_tokens: params.max_tokens,
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load() -> Result<Self> {
        Self::load_from(&Self::get_config_path()?)
    }

    /// Missing file means defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::new());
        }

        let config_content = fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&config_content)
            .map_err(|e| anyhow!("invalid config {}: {}", path.display(), e))?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::get_config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let config_content = serde_json::to_string_pretty(self)?;
        fs::write(path, config_content)?;
        Ok(())
    }

    /// Remember `model` as the default, keeping the rest of the file.
    pub fn save_default_model(path: &Path, model: Model) -> Result<()> {
        let mut config = Self::load_from(path).unwrap_or_else(|e| {
            warn!(error = %e, "config unreadable, rewriting with defaults");
            Self::new()
        });
        config.default_model = Some(model.as_str().to_string());
        config.save_to(path)
    }

    /// The configured default, if it names a catalog model.
    pub fn model(&self) -> Option<Model> {
        let id = self.default_model.as_deref()?;
        let model = Model::from_str(id);
        if model.is_none() {
            warn!(model = id, "configured default model is not in the catalog");
        }
        model
    }

    pub fn chat_params(&self) -> ChatParams {
        ChatParams {
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        }
    }

    pub fn get_config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow!("Could not determine config directory"))?;

        Ok(config_dir.join("localchat").join("config.json"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let config = Config::load_from(&dir.path().join("config.json")).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.ollama_url, "http://localhost:11434");
        assert_eq!(config.chat_params(), ChatParams::default());
        assert_eq!(config.model(), None);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"default_model": "qwen2.5:0.5b", "temperature": 0.2}"#).unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.model(), Some(Model::Qwen25_05B));
        assert_eq!(config.temperature, 0.2);
        assert_eq!(config.max_tokens, 1024);
    }

    #[test]
    fn test_save_default_model_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.json");
        Config {
            ollama_url: "http://gpu-box:11434".to_string(),
            ..Config::default()
        }
        .save_to(&path)
        .unwrap();

        Config::save_default_model(&path, Model::Phi35Mini).unwrap();
        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.model(), Some(Model::Phi35Mini));
        assert_eq!(config.ollama_url, "http://gpu-box:11434");
    }

    #[test]
    fn test_unknown_model_and_bad_json() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"default_model": "mistral:7b"}"#).unwrap();
        assert_eq!(Config::load_from(&path).unwrap().model(), None);

        fs::write(&path, "{not json").unwrap();
        assert!(Config::load_from(&path).is_err());
    }
}
