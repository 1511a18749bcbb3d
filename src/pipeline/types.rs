//! Shared types for the triage pipeline.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{LlmError, MailError};
use crate::pipeline::ledger::DecisionSource;

// ── Inbound message ─────────────────────────────────────────────────

/// A candidate message fetched from the mail provider.
///
/// Addresses are bare, lower-cased email addresses. `existing_labels` are
/// label *names* already applied provider-side.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Provider-stable message ID.
    pub id: String,
    /// Sender address.
    pub sender: String,
    /// Raw `From` header (display name and address).
    pub sender_display: String,
    pub subject: String,
    /// Plain-text body.
    pub content: String,
    /// Short preview text.
    pub snippet: String,
    #[serde(default)]
    pub to: Vec<String>,
    #[serde(default)]
    pub cc: Vec<String>,
    #[serde(default)]
    pub bcc: Vec<String>,
    #[serde(default)]
    pub existing_labels: Vec<String>,
    /// When the message was sent, if the provider knows.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub received_at: Option<DateTime<Utc>>,
}

// ── Mailbox identity ────────────────────────────────────────────────

/// Addresses that count as "me" for recipient conditions.
#[derive(Debug, Clone, Default)]
pub struct MailboxIdentity {
    primary: String,
    addresses: HashSet<String>,
}

impl MailboxIdentity {
    /// Build an identity; the primary address is always part of the set.
    pub fn new(primary: &str, extra: impl IntoIterator<Item = String>) -> Self {
        let primary = primary.trim().to_lowercase();
        let mut addresses: HashSet<String> = extra
            .into_iter()
            .map(|a| a.trim().to_lowercase())
            .filter(|a| !a.is_empty())
            .collect();
        if !primary.is_empty() {
            addresses.insert(primary.clone());
        }
        Self { primary, addresses }
    }

    pub fn primary_address(&self) -> &str {
        &self.primary
    }

    pub fn addresses(&self) -> &HashSet<String> {
        &self.addresses
    }

    /// Domain of the primary address, empty when unknown.
    pub fn primary_domain(&self) -> &str {
        domain_of(&self.primary)
    }
}

/// Substring after the first `@`, or empty.
pub fn domain_of(address: &str) -> &str {
    address.split_once('@').map(|(_, d)| d).unwrap_or("")
}

// ── Label catalog ───────────────────────────────────────────────────

/// One label the classifier may choose.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

/// Ordered label catalog plus an optional fallback label.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LabelCatalog {
    pub labels: Vec<LabelDefinition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_label: Option<String>,
}

impl LabelCatalog {
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.labels.iter().map(|l| l.name.as_str())
    }

    pub fn name_set(&self) -> HashSet<String> {
        self.names().map(String::from).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names().any(|n| n == name)
    }

    /// Label used when the classifier answers outside the catalog.
    pub fn fallback_label(&self) -> Option<&str> {
        self.default_label
            .as_deref()
            .or_else(|| self.labels.first().map(|l| l.name.as_str()))
    }
}

// ── Collaborator traits ─────────────────────────────────────────────

/// Mail provider: pure I/O, no triage logic.
#[async_trait]
pub trait MailProvider: Send + Sync {
    /// Provider name for logging (e.g. "gmail").
    fn name(&self) -> &str;

    /// IDs of up to `limit` candidate messages, newest first.
    async fn list_candidates(&self, limit: usize) -> Result<Vec<String>, MailError>;

    /// Fetch one candidate message.
    async fn fetch_message(&self, message_id: &str) -> Result<InboundMessage, MailError>;

    /// Apply a label to a message, creating the label if needed.
    async fn apply_label(&self, message_id: &str, label: &str) -> Result<(), MailError>;

    /// Whether the provider already knows this label name.
    fn label_exists(&self, label: &str) -> bool;

    /// The mailbox owner's primary address.
    fn primary_address(&self) -> String;

    /// Every address that counts as the mailbox owner, primary included.
    fn identity_addresses(&self) -> HashSet<String>;

    fn identity(&self) -> MailboxIdentity {
        MailboxIdentity::new(&self.primary_address(), self.identity_addresses())
    }
}

/// A classifier answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    /// Label chosen, normalized against the catalog.
    pub label: String,
    /// Raw model output before normalization.
    pub raw: String,
}

/// Language-model classifier: picks exactly one catalog label.
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(
        &self,
        sender: &str,
        subject: &str,
        content: &str,
        catalog: &LabelCatalog,
    ) -> Result<Classification, LlmError>;
}

// ── Outcome ─────────────────────────────────────────────────────────

/// A rule that matched, with the actions it requested.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuleHit {
    pub rule: String,
    pub add: Vec<String>,
    pub exclude: Vec<String>,
    pub terminated: bool,
}

/// What the classifier suggested and what became of it.
#[derive(Debug, Clone, Serialize)]
pub struct ModelSuggestion {
    pub label: String,
    pub raw: String,
    /// True when an earlier exclude blocked the suggestion.
    pub discarded: bool,
}

/// Final label with the source that decided it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LabelProvenance {
    pub label: String,
    pub source: DecisionSource,
}

/// Result of triaging one message.
#[derive(Debug, Clone, Serialize)]
pub struct TriageOutcome {
    pub message_id: String,
    pub subject: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub received_at: Option<DateTime<Utc>>,
    /// Labels in `Add` state after all sources ran.
    pub final_labels: Vec<LabelProvenance>,
    /// Labels left excluded.
    pub excluded_labels: Vec<LabelProvenance>,
    /// True when a rule terminated and the classifier was never called.
    pub model_skipped: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<ModelSuggestion>,
    pub rule_hits: Vec<RuleHit>,
    /// Labels sent to the provider.
    pub applied: Vec<String>,
    /// Final labels not sent because the message already had them.
    pub already_present: Vec<String>,
    pub dry_run: bool,
    pub processed_at: DateTime<Utc>,
}

impl TriageOutcome {
    pub fn label_names(&self) -> Vec<&str> {
        self.final_labels.iter().map(|p| p.label.as_str()).collect()
    }

    pub fn source_of(&self, label: &str) -> Option<&DecisionSource> {
        self.final_labels
            .iter()
            .find(|p| p.label == label)
            .map(|p| &p.source)
    }
}
