//! Application configuration, read from a JSON file.
//!
//! Every section has defaults, so a missing file or a partial file is fine.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::catalog::ModelInfo;
use crate::pipeline::GenerateOptions;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid config {path}: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("{0}")]
    Invalid(String),
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub logging: LoggingConfig,
    pub generation: GenerationDefaults,
    pub runtime: RuntimeConfig,
    /// Replaces the built-in model catalog when set.
    pub models: Option<Vec<ModelInfo>>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// One of error, warn, info, debug, trace.
    pub level: String,
    /// Directory for timestamped log files. Console only when unset.
    pub dir: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            dir: None,
        }
    }
}

/// Options the controller attaches to every generate request.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationDefaults {
    pub max_new_tokens: u32,
    pub temperature: f32,
}

impl Default for GenerationDefaults {
    fn default() -> Self {
        Self {
            max_new_tokens: 150,
            temperature: 0.7,
        }
    }
}

impl GenerationDefaults {
    pub fn to_options(&self) -> GenerateOptions {
        GenerateOptions::new(self.max_new_tokens, self.temperature)
    }
}

/// Timing of the built-in runtime.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Number of simulated download steps per model load.
    pub load_steps: u32,
    pub load_step_ms: u64,
    /// Delay between streamed words.
    pub token_delay_ms: u64,
    /// Report streaming capability for text generation pipelines.
    pub streaming: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            load_steps: 8,
            load_step_ms: 120,
            token_delay_ms: 60,
            streaming: true,
        }
    }
}

impl AppConfig {
    /// Load from `path`, falling back to defaults when the file does not exist.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config = Self::from_json(&raw).map_err(|e| match e {
            ConfigError::Json { source, .. } => ConfigError::Json {
                path: path.display().to_string(),
                source,
            },
            other => other,
        })?;
        Ok(config)
    }

    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = serde_json::from_str(raw).map_err(|source| ConfigError::Json {
            path: "<inline>".to_string(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=2.0).contains(&self.generation.temperature) {
            return Err(ConfigError::Invalid(
                "generation.temperature must be between 0.0 and 2.0".to_string(),
            ));
        }
        if self.generation.max_new_tokens == 0 {
            return Err(ConfigError::Invalid(
                "generation.max_new_tokens must be greater than 0".to_string(),
            ));
        }
        if let Some(models) = &self.models {
            if models.iter().any(|m| m.key.trim().is_empty()) {
                return Err(ConfigError::Invalid("models: every entry needs a key".to_string()));
            }
        }
        Ok(())
    }
}
