//! Error types for inbox triage.

use std::time::Duration;

/// Top-level error type for a triage run.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Mail provider error: {0}")]
    Mail(#[from] MailError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),
}

/// Configuration-related errors.
///
/// Raised at startup (fatal to the run) or by the label ledger while a
/// single message is being processed (fatal to that message only).
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error(
        "Rule referenced unknown label '{label}' (source={source_name}). \
         Ensure this label exists in the mailbox before referencing it."
    )]
    UnknownLabel { label: String, source_name: String },

    #[error("Rule '{rule}' is invalid: {reason}")]
    InvalidRule { rule: String, reason: String },

    #[error("Duplicate rule name: {0}")]
    DuplicateRule(String),

    #[error("Rule '{rule}' references unknown email group '{group}'")]
    UnknownGroup { rule: String, group: String },

    #[error("Configuration file not found: {0}")]
    FileNotFound(String),

    #[error("Failed to parse {path}: {message}")]
    ParseError { path: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Mail provider errors.
#[derive(Debug, thiserror::Error)]
pub enum MailError {
    #[error("Mail request {operation} failed: {reason}")]
    RequestFailed { operation: String, reason: String },

    #[error("Mail API returned {status} for {operation}: {body}")]
    Api {
        operation: String,
        status: u16,
        body: String,
    },

    #[error("Authentication failed for mail provider: {0}")]
    AuthFailed(String),

    #[error("Message {id} could not be decoded: {reason}")]
    InvalidMessage { id: String, reason: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} unreachable at {base_url}: {reason}")]
    Unreachable {
        provider: String,
        base_url: String,
        reason: String,
    },

    #[error("Provider {provider} timed out after {timeout:?}")]
    Timeout { provider: String, timeout: Duration },

    #[error("Label catalog is empty; nothing to classify into")]
    EmptyCatalog,
}

/// Failure while triaging one message.
///
/// The batch loop converts these into a failure count; they never abort
/// the rest of the batch.
#[derive(Debug, thiserror::Error)]
pub enum TriageError {
    #[error("{0}")]
    Config(#[from] ConfigError),

    #[error("{0}")]
    Mail(#[from] MailError),

    #[error("{0}")]
    Llm(#[from] LlmError),
}

/// Result type alias for triage runs.
pub type Result<T> = std::result::Result<T, Error>;
