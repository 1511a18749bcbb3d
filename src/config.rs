//! Configuration types.
//!
//! Everything comes from the environment (after an optional `.env` file);
//! the label catalog is a JSON file.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::ConfigError;
use crate::pipeline::types::LabelCatalog;

/// Run configuration outside the collaborators.
#[derive(Debug, Clone)]
pub struct TriageConfig {
    pub label_config_file: PathBuf,
    pub rules_config_file: PathBuf,
    pub logging: LogConfig,
}

/// Logging destination and level.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Level for the log file (`error`, `warn`, `info`, `debug`, `trace`).
    pub level: String,
    pub file: PathBuf,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: PathBuf::from("data/logs/email_triage.log"),
        }
    }
}

impl TriageConfig {
    /// Read `LABEL_CONFIG_FILE`, `RULES_CONFIG_FILE`, `LOG_LEVEL` and `LOG_FILE`.
    pub fn from_env() -> Self {
        let path_var = |key: &str, default: &str| {
            std::env::var(key)
                .ok()
                .filter(|s| !s.trim().is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(default))
        };

        let defaults = LogConfig::default();
        Self {
            label_config_file: path_var("LABEL_CONFIG_FILE", "config/labels.json"),
            rules_config_file: path_var("RULES_CONFIG_FILE", "config/rules.yaml"),
            logging: LogConfig {
                level: std::env::var("LOG_LEVEL")
                    .map(|s| s.trim().to_lowercase())
                    .ok()
                    .filter(|s| !s.is_empty())
                    .unwrap_or(defaults.level),
                file: std::env::var("LOG_FILE")
                    .ok()
                    .filter(|s| !s.trim().is_empty())
                    .map(PathBuf::from)
                    .unwrap_or(defaults.file),
            },
        }
    }
}

impl LabelCatalog {
    /// Load and validate the label catalog JSON. A missing file is an error.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        debug!(path = %path.display(), "Loading label configuration");
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let raw = fs::read_to_string(path)?;
        let catalog = Self::parse(&raw, &path.display().to_string())?;
        info!(labels = catalog.labels.len(), "Loaded label definitions");
        Ok(catalog)
    }

    /// Parse catalog JSON. `origin` names the source in errors.
    pub fn parse(raw: &str, origin: &str) -> Result<Self, ConfigError> {
        let catalog: LabelCatalog =
            serde_json::from_str(raw).map_err(|e| ConfigError::ParseError {
                path: origin.to_string(),
                message: e.to_string(),
            })?;
        catalog.validate()?;
        Ok(catalog)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |message: String| ConfigError::InvalidValue {
            key: "labels".into(),
            message,
        };

        if self.labels.is_empty() {
            return Err(invalid("at least one label is required".into()));
        }
        let mut seen = HashSet::new();
        for label in &self.labels {
            if label.name.trim().is_empty() {
                return Err(invalid("label names must not be empty".into()));
            }
            if !seen.insert(label.name.as_str()) {
                return Err(invalid(format!("duplicate label '{}'", label.name)));
            }
        }
        if let Some(default) = &self.default_label
            && !seen.contains(default.as_str())
        {
            return Err(ConfigError::InvalidValue {
                key: "default_label".into(),
                message: format!("'{default}' is not a defined label"),
            });
        }
        Ok(())
    }
}
