//! Chat-completions classifier.
//!
//! Completions go through rig's OpenAI client pointed at `LLM_BASE_URL`,
//! using the chat-completions API that local MLX servers and proxies speak.
//! The `/models` reachability check is a plain GET.

use async_trait::async_trait;
use rig::client::CompletionClient;
use rig::completion::Prompt;
use rig::providers::openai;
use secrecy::ExposeSecret;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::error::LlmError;
use crate::llm::LlmConfig;
use crate::pipeline::types::{Classification, Classifier, LabelCatalog};

const SYSTEM_PROMPT: &str = "You are an email classification system.";

/// Short answers only: a single label name.
const MAX_TOKENS: u64 = 50;

/// Characters of body sent to the model.
const CONTENT_PREVIEW_CHARS: usize = 1000;

#[derive(Debug, Deserialize)]
struct ModelList {
    #[serde(default)]
    data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: String,
}

/// Classifier backed by an OpenAI-compatible chat completions endpoint.
pub struct LlmClassifier {
    config: LlmConfig,
    completions: openai::CompletionsClient,
    http: reqwest::Client,
}

impl LlmClassifier {
    pub fn new(config: LlmConfig) -> Result<Self, LlmError> {
        let provider = config.provider_kind();

        let completions = openai::Client::builder()
            .api_key(config.api_key.expose_secret())
            .base_url(config.base_url.trim_end_matches('/'))
            .build()
            .map_err(|e| LlmError::RequestFailed {
                provider: provider.to_string(),
                reason: format!("Failed to create OpenAI client: {e}"),
            })?
            .completions_api();

        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| LlmError::RequestFailed {
                provider: provider.to_string(),
                reason: format!("Failed to build HTTP client: {e}"),
            })?;

        info!(
            provider,
            model = %config.model,
            base_url = %config.base_url,
            "Initialized LLM classifier"
        );
        Ok(Self {
            config,
            completions,
            http,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{path}", self.config.base_url.trim_end_matches('/'))
    }

    /// Check the API is reachable by listing its models.
    ///
    /// A model missing from a non-empty list only warns; some providers do
    /// not list everything they serve.
    pub async fn verify(&self) -> Result<Vec<String>, LlmError> {
        let unreachable_err = |reason: String| LlmError::Unreachable {
            provider: self.config.provider_kind().into(),
            base_url: self.config.base_url.clone(),
            reason,
        };

        let resp = self
            .http
            .get(self.endpoint("models"))
            .bearer_auth(self.config.api_key.expose_secret())
            .send()
            .await
            .map_err(|e| unreachable_err(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(unreachable_err(format!("models endpoint returned {status}: {body}")));
        }

        let list: ModelList = resp
            .json()
            .await
            .map_err(|e| unreachable_err(format!("invalid models response: {e}")))?;
        let models: Vec<String> = list.data.into_iter().map(|m| m.id).collect();

        debug!(models = ?models, "LLM API reachable");
        if !models.is_empty() && !models.contains(&self.config.model) {
            warn!(
                model = %self.config.model,
                available = ?models.iter().take(5).collect::<Vec<_>>(),
                "Requested model not listed by provider"
            );
        }
        Ok(models)
    }
}

#[async_trait]
impl Classifier for LlmClassifier {
    async fn classify(
        &self,
        sender: &str,
        subject: &str,
        content: &str,
        catalog: &LabelCatalog,
    ) -> Result<Classification, LlmError> {
        if catalog.labels.is_empty() {
            return Err(LlmError::EmptyCatalog);
        }

        let prompt = build_classification_prompt(sender, subject, content, catalog);
        let agent = self
            .completions
            .agent(self.config.model.as_str())
            .preamble(SYSTEM_PROMPT)
            .temperature(0.0)
            .max_tokens(MAX_TOKENS)
            .build();

        let raw = tokio::time::timeout(self.config.timeout, agent.prompt(prompt.as_str()))
            .await
            .map_err(|_| LlmError::Timeout {
                provider: self.config.provider_kind().into(),
                timeout: self.config.timeout,
            })?
            .map_err(|e| LlmError::RequestFailed {
                provider: self.config.provider_kind().into(),
                reason: e.to_string(),
            })?;
        debug!(raw = %raw, "Raw LLM output");

        let label = normalize_label(&raw, catalog)?;
        Ok(Classification { label, raw })
    }
}

/// Build the user prompt listing every label and the email.
pub fn build_classification_prompt(
    sender: &str,
    subject: &str,
    content: &str,
    catalog: &LabelCatalog,
) -> String {
    let labels = catalog
        .labels
        .iter()
        .map(|l| format!("- {}: {}", l.name, l.description))
        .collect::<Vec<_>>()
        .join("\n");

    let mut preview: String = content.chars().take(CONTENT_PREVIEW_CHARS).collect();
    if content.chars().nth(CONTENT_PREVIEW_CHARS).is_some() {
        preview.push_str("...");
    }

    format!(
        "Classify the following email into exactly one of these categories:\n\n\
         {labels}\n\n\
         Email Details:\n\
         From: {sender}\n\
         Subject: {subject}\n\
         Content: {preview}\n\n\
         Respond with ONLY the category name, nothing else. \
         Choose the single most appropriate category."
    )
}

/// Map a model answer onto a catalog label.
///
/// Matching ignores case and stray quotes or trailing periods; the catalog's
/// spelling is returned. Anything else falls back to the catalog default.
pub fn normalize_label(raw: &str, catalog: &LabelCatalog) -> Result<String, LlmError> {
    let answer = raw
        .trim()
        .trim_matches(|c: char| c == '"' || c == '\'' || c == '`' || c == '.')
        .trim()
        .to_lowercase();

    if let Some(name) = catalog.names().find(|n| n.to_lowercase() == answer) {
        return Ok(name.to_string());
    }

    let fallback = catalog.fallback_label().ok_or(LlmError::EmptyCatalog)?;
    warn!(
        answer = %answer,
        valid = ?catalog.names().collect::<Vec<_>>(),
        fallback,
        "LLM returned invalid label, using default"
    );
    Ok(fallback.to_string())
}
