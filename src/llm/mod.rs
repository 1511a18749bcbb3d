//! LLM integration for inbox triage.
//!
//! Talks to any OpenAI-compatible chat completions API (a local MLX server,
//! OpenAI, or a compatible proxy) through rig-core's OpenAI client.

mod classifier;

pub use classifier::{LlmClassifier, build_classification_prompt, normalize_label};

use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Default model, matching what the local MLX server usually serves.
pub const DEFAULT_MODEL: &str = "mlx-community/Llama-3.2-3B-Instruct-4bit";

/// Configuration for the classifier endpoint.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    /// API base, e.g. `http://localhost:8080/v1`.
    pub base_url: String,
    pub model: String,
    /// Local servers ignore it; defaults to `not-needed`.
    pub api_key: SecretString,
    pub timeout: Duration,
}

impl LlmConfig {
    /// Read `LLM_BASE_URL` (required), `LLM_MODEL`, `LLM_API_KEY` or
    /// `OPENAI_API_KEY`, and `LLM_TIMEOUT_SECS`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let base_url = std::env::var("LLM_BASE_URL")
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ConfigError::MissingEnvVar("LLM_BASE_URL".into()))?;

        let model = std::env::var("LLM_MODEL")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_MODEL.to_string());

        let api_key = std::env::var("LLM_API_KEY")
            .or_else(|_| std::env::var("OPENAI_API_KEY"))
            .ok()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "not-needed".to_string());

        let timeout_secs: u64 = std::env::var("LLM_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(60);

        Ok(Self {
            base_url,
            model,
            api_key: SecretString::from(api_key),
            timeout: Duration::from_secs(timeout_secs),
        })
    }

    /// Human-readable guess at what serves `base_url`, for logging.
    pub fn provider_kind(&self) -> &'static str {
        let url = self.base_url.to_lowercase();
        if url.contains("openai") {
            "openai"
        } else if url.contains("localhost") || url.contains("127.0.0.1") {
            "mlx-local"
        } else if url.contains(".ts.net") {
            "mlx-tailscale"
        } else {
            "openai-compatible"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(base_url: &str) -> LlmConfig {
        LlmConfig {
            base_url: base_url.into(),
            model: DEFAULT_MODEL.into(),
            api_key: SecretString::from("not-needed"),
            timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn provider_kind_from_base_url() {
        assert_eq!(config("https://api.openai.com/v1").provider_kind(), "openai");
        assert_eq!(config("http://localhost:8080/v1").provider_kind(), "mlx-local");
        assert_eq!(config("http://mac.tail1.ts.net:8080/v1").provider_kind(), "mlx-tailscale");
        assert_eq!(config("http://llm.internal/v1").provider_kind(), "openai-compatible");
    }
}
