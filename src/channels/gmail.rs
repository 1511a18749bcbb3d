//! Gmail mail provider over the Gmail REST API.
//!
//! Uses a bearer access token; obtaining and refreshing it is left to the
//! environment. Messages are fetched in `raw` format and decoded locally.

use std::collections::{HashMap, HashSet};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::channels::rfc822;
use crate::error::{ConfigError, MailError};
use crate::pipeline::types::{InboundMessage, MailProvider};

pub const DEFAULT_API_BASE: &str = "https://gmail.googleapis.com/gmail/v1";
pub const DEFAULT_CANDIDATE_QUERY: &str = "in:inbox has:nouserlabels";

/// Snippet length when Gmail does not send one.
const SNIPPET_CHARS: usize = 200;

/// Gmail connection settings.
#[derive(Debug, Clone)]
pub struct GmailConfig {
    pub api_base: String,
    pub access_token: SecretString,
    /// Base search query for candidates.
    pub candidate_query: String,
    /// Label names whose messages are never candidates.
    pub exclude_labels: Vec<String>,
    /// Extra addresses treated as the mailbox owner.
    pub extra_addresses: Vec<String>,
    pub timeout: Duration,
}

impl GmailConfig {
    /// Read `GMAIL_ACCESS_TOKEN` (required), `GMAIL_API_BASE`,
    /// `GMAIL_CANDIDATE_QUERY`, `GMAIL_EXCLUDE_LABELS` and `TRIAGE_ADDRESSES`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let access_token = std::env::var("GMAIL_ACCESS_TOKEN")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| ConfigError::MissingEnvVar("GMAIL_ACCESS_TOKEN".into()))?;

        let api_base =
            std::env::var("GMAIL_API_BASE").unwrap_or_else(|_| DEFAULT_API_BASE.to_string());
        let candidate_query = std::env::var("GMAIL_CANDIDATE_QUERY")
            .unwrap_or_else(|_| DEFAULT_CANDIDATE_QUERY.to_string());

        let timeout_secs: u64 = std::env::var("GMAIL_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(30);

        Ok(Self {
            api_base,
            access_token: SecretString::from(access_token),
            candidate_query,
            exclude_labels: split_list(&std::env::var("GMAIL_EXCLUDE_LABELS").unwrap_or_default()),
            extra_addresses: split_list(&std::env::var("TRIAGE_ADDRESSES").unwrap_or_default()),
            timeout: Duration::from_secs(timeout_secs),
        })
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Build the candidate search query, excluding already-triaged labels.
///
/// Labels are de-duplicated, sorted case-insensitively and quoted.
pub fn build_candidate_query(base: &str, exclude_labels: &[String]) -> String {
    let mut labels: Vec<&str> = exclude_labels
        .iter()
        .map(|l| l.trim())
        .filter(|l| !l.is_empty())
        .collect::<HashSet<_>>()
        .into_iter()
        .collect();
    labels.sort_by_key(|l| l.to_lowercase());

    let mut parts = vec![base.trim().to_string()];
    parts.extend(
        labels
            .into_iter()
            .map(|l| format!("-label:\"{}\"", l.replace('"', "\\\""))),
    );
    parts.retain(|p| !p.is_empty());
    parts.join(" ")
}

// ── Wire types ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Profile {
    #[serde(default)]
    email_address: String,
}

#[derive(Debug, Deserialize)]
struct LabelList {
    #[serde(default)]
    labels: Vec<GmailLabel>,
}

#[derive(Debug, Deserialize)]
struct GmailLabel {
    id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct MessageList {
    #[serde(default)]
    messages: Vec<MessageRef>,
}

#[derive(Debug, Deserialize)]
struct MessageRef {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMessage {
    id: String,
    #[serde(default)]
    label_ids: Vec<String>,
    #[serde(default)]
    snippet: String,
    raw: String,
}

#[derive(Debug, Default)]
struct LabelCache {
    by_id: HashMap<String, String>,
    by_name: HashMap<String, String>,
}

impl LabelCache {
    fn insert(&mut self, id: String, name: String) {
        self.by_name.insert(name.clone(), id.clone());
        self.by_id.insert(id, name);
    }
}

// ── Client ──────────────────────────────────────────────────────────

/// Gmail REST client implementing [`MailProvider`].
pub struct GmailClient {
    config: GmailConfig,
    client: reqwest::Client,
    query: String,
    primary: String,
    addresses: HashSet<String>,
    labels: RwLock<LabelCache>,
}

impl GmailClient {
    /// Connect: load the profile and the label cache.
    pub async fn connect(config: GmailConfig) -> Result<Self, MailError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| MailError::RequestFailed {
                operation: "client".into(),
                reason: e.to_string(),
            })?;

        let query = build_candidate_query(&config.candidate_query, &config.exclude_labels);
        let mut gmail = Self {
            config,
            client,
            query,
            primary: String::new(),
            addresses: HashSet::new(),
            labels: RwLock::new(LabelCache::default()),
        };

        let profile: Profile = gmail.get_json("profile", "users/me/profile", &[]).await?;
        gmail.primary = profile.email_address.trim().to_lowercase();
        gmail.addresses = gmail
            .config
            .extra_addresses
            .iter()
            .map(|a| a.to_lowercase())
            .chain(std::iter::once(gmail.primary.clone()))
            .filter(|a| !a.is_empty())
            .collect();

        gmail.refresh_labels().await?;
        info!(
            primary = %gmail.primary,
            addresses = gmail.addresses.len(),
            query = %gmail.query,
            "Connected to Gmail"
        );
        Ok(gmail)
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{path}", self.config.api_base.trim_end_matches('/'))
    }

    async fn send<T: DeserializeOwned>(
        &self,
        operation: &str,
        request: reqwest::RequestBuilder,
    ) -> Result<T, MailError> {
        let resp = request
            .bearer_auth(self.config.access_token.expose_secret())
            .send()
            .await
            .map_err(|e| MailError::RequestFailed {
                operation: operation.into(),
                reason: e.to_string(),
            })?;

        let status = resp.status();
        if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
            let body = resp.text().await.unwrap_or_default();
            return Err(MailError::AuthFailed(format!("{operation}: {status} {body}")));
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(MailError::Api {
                operation: operation.into(),
                status: status.as_u16(),
                body,
            });
        }

        let bytes = resp.bytes().await.map_err(|e| MailError::RequestFailed {
            operation: operation.into(),
            reason: e.to_string(),
        })?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        operation: &str,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, MailError> {
        let request = self.client.get(self.url(path)).query(query);
        self.send(operation, request).await
    }

    async fn post_json<T: DeserializeOwned>(
        &self,
        operation: &str,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<T, MailError> {
        let request = self.client.post(self.url(path)).json(body);
        self.send(operation, request).await
    }

    /// Reload the label id/name cache.
    pub async fn refresh_labels(&self) -> Result<(), MailError> {
        let list: LabelList = self
            .get_json("labels.list", "users/me/labels", &[])
            .await?;
        let mut cache = LabelCache::default();
        for label in list.labels {
            cache.insert(label.id, label.name);
        }
        debug!(count = cache.by_id.len(), "Cached Gmail labels");
        *self.labels.write().unwrap_or_else(PoisonError::into_inner) = cache;
        Ok(())
    }

    fn cached_label_id(&self, name: &str) -> Option<String> {
        self.labels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .by_name
            .get(name)
            .cloned()
    }

    fn label_names(&self, ids: &[String]) -> Vec<String> {
        let cache = self.labels.read().unwrap_or_else(PoisonError::into_inner);
        ids.iter()
            .filter_map(|id| cache.by_id.get(id).cloned())
            .collect()
    }

    async fn get_or_create_label(&self, name: &str) -> Result<String, MailError> {
        if let Some(id) = self.cached_label_id(name) {
            return Ok(id);
        }

        info!(label = name, "Creating Gmail label");
        let created: GmailLabel = self
            .post_json(
                "labels.create",
                "users/me/labels",
                &serde_json::json!({
                    "name": name,
                    "labelListVisibility": "labelShow",
                    "messageListVisibility": "show"
                }),
            )
            .await?;

        let id = created.id.clone();
        self.labels
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(created.id, created.name);
        Ok(id)
    }
}

#[async_trait]
impl MailProvider for GmailClient {
    fn name(&self) -> &str {
        "gmail"
    }

    async fn list_candidates(&self, limit: usize) -> Result<Vec<String>, MailError> {
        let list: MessageList = self
            .get_json(
                "messages.list",
                "users/me/messages",
                &[("q", self.query.clone()), ("maxResults", limit.to_string())],
            )
            .await?;
        info!(count = list.messages.len(), query = %self.query, "Found candidate messages");
        Ok(list.messages.into_iter().map(|m| m.id).take(limit).collect())
    }

    async fn fetch_message(&self, message_id: &str) -> Result<InboundMessage, MailError> {
        let msg: RawMessage = self
            .get_json(
                "messages.get",
                &format!("users/me/messages/{message_id}"),
                &[("format", "raw".to_string())],
            )
            .await?;

        let bytes = URL_SAFE_NO_PAD
            .decode(msg.raw.trim_end_matches('='))
            .map_err(|e| MailError::InvalidMessage {
                id: msg.id.clone(),
                reason: format!("invalid base64url payload: {e}"),
            })?;
        let email = rfc822::parse_message(&msg.id, &bytes)?;

        let snippet = if msg.snippet.is_empty() {
            rfc822::preview(&email.content, SNIPPET_CHARS)
        } else {
            msg.snippet
        };

        debug!(message_id = %msg.id, subject = %email.subject, "Fetched message");
        Ok(InboundMessage {
            existing_labels: self.label_names(&msg.label_ids),
            id: msg.id,
            sender: email.sender,
            sender_display: email.sender_display,
            subject: email.subject,
            content: email.content,
            snippet,
            to: email.to,
            cc: email.cc,
            bcc: email.bcc,
            received_at: email.date,
        })
    }

    async fn apply_label(&self, message_id: &str, label: &str) -> Result<(), MailError> {
        let label_id = self.get_or_create_label(label).await?;
        let _: serde_json::Value = self
            .post_json(
                "messages.modify",
                &format!("users/me/messages/{message_id}/modify"),
                &serde_json::json!({ "addLabelIds": [label_id] }),
            )
            .await?;
        info!(message_id, label, "Applied label");
        Ok(())
    }

    fn label_exists(&self, label: &str) -> bool {
        self.labels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .by_name
            .contains_key(label)
    }

    fn primary_address(&self) -> String {
        self.primary.clone()
    }

    fn identity_addresses(&self) -> HashSet<String> {
        self.addresses.clone()
    }
}
