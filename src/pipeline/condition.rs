//! Condition DSL for deterministic rules.
//!
//! Conditions arrive as loosely-shaped YAML/JSON and are parsed once, at
//! load time, into a typed tree. A known key with the wrong value type or an
//! unknown operator (e.g. `all` given a string, `sender: {domain: ..}`) is
//! rejected with a [`ConfigError`]. A node whose key is not a condition at
//! all becomes [`Condition::Unsupported`], which never matches.
//!
//! A node interprets exactly one key, checked in this order:
//! `all`, `any`, `not`, `sender`, `subject`, `body`/`content`, `snippet`,
//! `recipients`, `existing_labels`, `decided_labels`, `excluded_labels`.

use std::collections::{HashMap, HashSet};

use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::error::ConfigError;
use crate::pipeline::context::RuleContext;
use crate::pipeline::ledger::LabelDecision;
use crate::pipeline::types::domain_of;

/// Recipient patterns that suggest a mailing list.
pub const DEFAULT_MAILING_LIST_PATTERNS: &[&str] = &[
    "-list@",
    "@googlegroups.com",
    "@lists.",
    "+list@",
    "newsletter@",
];

/// Named sender groups, lower-cased.
pub type EmailGroups = HashMap<String, HashSet<String>>;

// ── Tree ────────────────────────────────────────────────────────────

/// A parsed condition node.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// Empty condition; always matches.
    Always,
    All(Vec<Condition>),
    Any(Vec<Condition>),
    Not(Box<Condition>),
    Sender(SenderSpec),
    Subject(TextMatch),
    Body(TextMatch),
    Snippet(TextMatch),
    Recipients(RecipientSpec),
    ExistingLabels(LabelSetSpec),
    DecidedLabels(LabelSetSpec),
    ExcludedLabels(LabelSetSpec),
    /// Shape not understood; never matches.
    Unsupported(String),
}

/// Text-match spec shared by subject, body, snippet and sender `contains`.
#[derive(Debug, Clone, PartialEq)]
pub enum TextMatch {
    /// Empty spec; always matches.
    Any,
    /// Bare string: case-insensitive substring.
    Contains(String),
    Structured(TextSpec),
}

/// Structured text operators. `None` means the operator is absent; an
/// empty list is still a present operator.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TextSpec {
    pub contains_all: Option<Vec<String>>,
    pub contains_any: Option<Vec<String>>,
    pub not_contains: Option<Vec<String>>,
    pub starts_with: Option<Vec<String>>,
    pub ends_with: Option<Vec<String>>,
    pub equals_any: Option<Vec<String>>,
}

/// Sender operators. Empty lists impose no constraint.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SenderSpec {
    pub in_list: Vec<String>,
    pub not_in: Vec<String>,
    pub domains: Vec<String>,
    pub domains_not: Vec<String>,
    pub contains: Option<TextMatch>,
    /// Union of the addresses of every group named in `groups_any`.
    pub groups_any: Option<HashSet<String>>,
    /// Union of the addresses of every group named in `groups_not_any`.
    pub groups_not_any: Option<HashSet<String>>,
}

/// Recipient operators.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecipientSpec {
    pub only_me: bool,
    pub not_on_to: bool,
    pub cc_me: bool,
    pub to_me: bool,
    pub total_more_than: Option<i64>,
    pub total_less_than: Option<i64>,
    pub includes_any: Vec<String>,
    pub includes_domains: Vec<String>,
    pub contains_mailing_list: bool,
    pub mailing_list_patterns: Vec<String>,
    pub all_internal: bool,
    pub any_external: bool,
    pub sender_in_recipients: bool,
}

/// Set-membership operators over a label set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LabelSetSpec {
    pub has_any: Option<Vec<String>>,
    pub has_all: Option<Vec<String>>,
    pub missing_all: Option<Vec<String>>,
}

// ── Parsing ─────────────────────────────────────────────────────────

/// What the parser needs beyond the raw value.
pub struct ParseScope<'a> {
    /// Rule being parsed, for error messages.
    pub rule: &'a str,
    pub groups: &'a EmailGroups,
}

impl Condition {
    /// Parse a condition node.
    pub fn parse(value: &Value, scope: &ParseScope<'_>) -> Result<Self, ConfigError> {
        if !truthy(value) {
            return Ok(Condition::Always);
        }
        let Value::Object(map) = value else {
            warn!(rule = scope.rule, condition = %value, "Unsupported condition shape");
            return Ok(Condition::Unsupported(value.to_string()));
        };

        if let Some(children) = map.get("all") {
            return Ok(Condition::All(parse_children(children, "all", scope)?));
        }
        if let Some(children) = map.get("any") {
            return Ok(Condition::Any(parse_children(children, "any", scope)?));
        }
        if let Some(child) = map.get("not") {
            return Ok(Condition::Not(Box::new(Condition::parse(child, scope)?)));
        }
        if let Some(spec) = map.get("sender") {
            return Ok(Condition::Sender(SenderSpec::parse(spec, scope)?));
        }
        if let Some(spec) = map.get("subject") {
            return Ok(Condition::Subject(TextMatch::parse(spec, "subject", scope)?));
        }
        if map.contains_key("body") || map.contains_key("content") {
            // `body` wins unless it is empty.
            let spec = map
                .get("body")
                .filter(|v| truthy(v))
                .or_else(|| map.get("content"))
                .unwrap_or(&Value::Null);
            return Ok(Condition::Body(TextMatch::parse(spec, "body", scope)?));
        }
        if let Some(spec) = map.get("snippet") {
            return Ok(Condition::Snippet(TextMatch::parse(spec, "snippet", scope)?));
        }
        if let Some(spec) = map.get("recipients") {
            return Ok(Condition::Recipients(RecipientSpec::parse(spec, scope)?));
        }
        if let Some(spec) = map.get("existing_labels") {
            return Ok(Condition::ExistingLabels(LabelSetSpec::parse(
                spec,
                "existing_labels",
                scope,
            )?));
        }
        if let Some(spec) = map.get("decided_labels") {
            return Ok(Condition::DecidedLabels(LabelSetSpec::parse(
                spec,
                "decided_labels",
                scope,
            )?));
        }
        if let Some(spec) = map.get("excluded_labels") {
            return Ok(Condition::ExcludedLabels(LabelSetSpec::parse(
                spec,
                "excluded_labels",
                scope,
            )?));
        }

        warn!(rule = scope.rule, condition = %value, "Unsupported condition key");
        Ok(Condition::Unsupported(value.to_string()))
    }
}

fn parse_children(
    value: &Value,
    key: &str,
    scope: &ParseScope<'_>,
) -> Result<Vec<Condition>, ConfigError> {
    match value {
        Value::Null => Ok(Vec::new()),
        Value::Array(items) => items.iter().map(|v| Condition::parse(v, scope)).collect(),
        other => Err(invalid(scope, format!("'{key}' expects a list, got {other}"))),
    }
}

impl TextMatch {
    fn parse(value: &Value, field: &str, scope: &ParseScope<'_>) -> Result<Self, ConfigError> {
        if !truthy(value) {
            return Ok(TextMatch::Any);
        }
        match value {
            Value::String(s) => Ok(TextMatch::Contains(s.to_lowercase())),
            Value::Object(map) => {
                reject_unknown_keys(
                    map,
                    &[
                        "contains_all",
                        "contains_any",
                        "not_contains",
                        "starts_with",
                        "ends_with",
                        "equals_any",
                    ],
                    field,
                    scope,
                )?;
                let op = |key: &str| -> Result<Option<Vec<String>>, ConfigError> {
                    map.get(key)
                        .map(|v| string_list(v, key, scope).map(lowered))
                        .transpose()
                };
                Ok(TextMatch::Structured(TextSpec {
                    contains_all: op("contains_all")?,
                    contains_any: op("contains_any")?,
                    not_contains: op("not_contains")?,
                    starts_with: op("starts_with")?,
                    ends_with: op("ends_with")?,
                    equals_any: op("equals_any")?,
                }))
            }
            other => Err(invalid(
                scope,
                format!("'{field}' expects a string or mapping, got {other}"),
            )),
        }
    }
}

impl SenderSpec {
    fn parse(value: &Value, scope: &ParseScope<'_>) -> Result<Self, ConfigError> {
        let Some(map) = mapping(value, "sender", scope)? else {
            return Ok(SenderSpec::default());
        };
        reject_unknown_keys(
            map,
            &[
                "in",
                "not_in",
                "domains",
                "domains_not",
                "contains",
                "groups_any",
                "groups_not_any",
            ],
            "sender",
            scope,
        )?;

        let contains = match map.get("contains") {
            Some(v) if truthy(v) => Some(TextMatch::parse(v, "sender.contains", scope)?),
            _ => None,
        };

        Ok(SenderSpec {
            in_list: lowered(optional_list(map, "in", scope)?),
            not_in: lowered(optional_list(map, "not_in", scope)?),
            domains: lowered(optional_list(map, "domains", scope)?),
            domains_not: lowered(optional_list(map, "domains_not", scope)?),
            contains,
            groups_any: resolve_groups(map, "groups_any", scope)?,
            groups_not_any: resolve_groups(map, "groups_not_any", scope)?,
        })
    }
}

fn resolve_groups(
    map: &Map<String, Value>,
    key: &str,
    scope: &ParseScope<'_>,
) -> Result<Option<HashSet<String>>, ConfigError> {
    let names = optional_list(map, key, scope)?;
    if names.is_empty() {
        return Ok(None);
    }
    let mut members = HashSet::new();
    for name in names {
        let group = scope
            .groups
            .get(&name)
            .ok_or_else(|| ConfigError::UnknownGroup {
                rule: scope.rule.to_string(),
                group: name.clone(),
            })?;
        members.extend(group.iter().cloned());
    }
    Ok(Some(members))
}

impl RecipientSpec {
    fn parse(value: &Value, scope: &ParseScope<'_>) -> Result<Self, ConfigError> {
        let Some(map) = mapping(value, "recipients", scope)? else {
            return Ok(RecipientSpec::default());
        };
        reject_unknown_keys(
            map,
            &[
                "only_me",
                "not_on_to",
                "cc_me",
                "to_me",
                "total_more_than",
                "total_less_than",
                "includes_any",
                "includes_domains",
                "contains_mailing_list",
                "mailing_list_patterns",
                "all_internal",
                "any_external",
                "sender_in_recipients",
            ],
            "recipients",
            scope,
        )?;
        let flag = |key: &str| map.get(key).is_some_and(truthy);

        Ok(RecipientSpec {
            only_me: flag("only_me"),
            not_on_to: flag("not_on_to"),
            cc_me: flag("cc_me"),
            to_me: flag("to_me"),
            total_more_than: integer(map, "total_more_than", scope)?,
            total_less_than: integer(map, "total_less_than", scope)?,
            includes_any: lowered(optional_list(map, "includes_any", scope)?),
            includes_domains: lowered(optional_list(map, "includes_domains", scope)?),
            contains_mailing_list: flag("contains_mailing_list"),
            mailing_list_patterns: lowered(optional_list(map, "mailing_list_patterns", scope)?),
            all_internal: flag("all_internal"),
            any_external: flag("any_external"),
            sender_in_recipients: flag("sender_in_recipients"),
        })
    }
}

impl LabelSetSpec {
    fn parse(value: &Value, field: &str, scope: &ParseScope<'_>) -> Result<Self, ConfigError> {
        let Some(map) = mapping(value, field, scope)? else {
            return Ok(LabelSetSpec::default());
        };
        reject_unknown_keys(map, &["has_any", "has_all", "missing_all"], field, scope)?;
        let op = |key: &str| -> Result<Option<Vec<String>>, ConfigError> {
            map.get(key).map(|v| string_list(v, key, scope)).transpose()
        };
        Ok(LabelSetSpec {
            has_any: op("has_any")?,
            has_all: op("has_all")?,
            missing_all: op("missing_all")?,
        })
    }
}

// ── Parse helpers ───────────────────────────────────────────────────

/// Truthiness as the rule files use it: null, false, 0, "" and empty
/// collections are all "not set".
fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn invalid(scope: &ParseScope<'_>, reason: String) -> ConfigError {
    ConfigError::InvalidRule {
        rule: scope.rule.to_string(),
        reason,
    }
}

/// A leaf spec must be a mapping; an empty value means "no constraint".
fn mapping<'v>(
    value: &'v Value,
    field: &str,
    scope: &ParseScope<'_>,
) -> Result<Option<&'v Map<String, Value>>, ConfigError> {
    if !truthy(value) {
        return Ok(None);
    }
    match value {
        Value::Object(map) => Ok(Some(map)),
        other => Err(invalid(scope, format!("'{field}' expects a mapping, got {other}"))),
    }
}

/// A single string or a list of strings.
fn string_list(value: &Value, key: &str, scope: &ParseScope<'_>) -> Result<Vec<String>, ConfigError> {
    match value {
        Value::Null => Ok(Vec::new()),
        Value::String(s) => Ok(vec![s.clone()]),
        Value::Array(items) => items
            .iter()
            .map(|item| match item {
                Value::String(s) => Ok(s.clone()),
                other => Err(invalid(scope, format!("'{key}' entries must be strings, got {other}"))),
            })
            .collect(),
        other => Err(invalid(scope, format!("'{key}' expects a string or list, got {other}"))),
    }
}

fn optional_list(
    map: &Map<String, Value>,
    key: &str,
    scope: &ParseScope<'_>,
) -> Result<Vec<String>, ConfigError> {
    map.get(key)
        .map(|v| string_list(v, key, scope))
        .transpose()
        .map(Option::unwrap_or_default)
}

fn integer(
    map: &Map<String, Value>,
    key: &str,
    scope: &ParseScope<'_>,
) -> Result<Option<i64>, ConfigError> {
    let Some(value) = map.get(key) else {
        return Ok(None);
    };
    let parsed = match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    };
    parsed
        .map(Some)
        .ok_or_else(|| invalid(scope, format!("'{key}' expects an integer, got {value}")))
}

fn lowered(values: Vec<String>) -> Vec<String> {
    values.into_iter().map(|v| v.to_lowercase()).collect()
}

/// An operator the leaf does not know would otherwise leave the spec empty,
/// and an empty spec matches everything.
fn reject_unknown_keys(
    map: &Map<String, Value>,
    known: &[&str],
    field: &str,
    scope: &ParseScope<'_>,
) -> Result<(), ConfigError> {
    match map.keys().find(|k| !known.contains(&k.as_str())) {
        Some(key) => Err(invalid(
            scope,
            format!("unknown operator '{key}' in '{field}' (expected one of {known:?})"),
        )),
        None => Ok(()),
    }
}

// ── Evaluation ──────────────────────────────────────────────────────

/// Evaluate an optional condition; no condition matches everything.
pub fn evaluate(condition: Option<&Condition>, ctx: &RuleContext<'_>) -> bool {
    condition.is_none_or(|c| c.evaluate(ctx))
}

impl Condition {
    pub fn evaluate(&self, ctx: &RuleContext<'_>) -> bool {
        match self {
            Condition::Always => true,
            Condition::All(children) => children.iter().all(|c| c.evaluate(ctx)),
            Condition::Any(children) => children.iter().any(|c| c.evaluate(ctx)),
            Condition::Not(child) => !child.evaluate(ctx),
            Condition::Sender(spec) => spec.matches(ctx),
            Condition::Subject(spec) => spec.matches(&ctx.subject),
            Condition::Body(spec) => spec.matches(&ctx.content),
            Condition::Snippet(spec) => spec.matches(&ctx.snippet),
            Condition::Recipients(spec) => spec.matches(ctx),
            Condition::ExistingLabels(spec) => {
                spec.matches(|label| ctx.existing_labels.contains(label))
            }
            Condition::DecidedLabels(spec) => {
                spec.matches(|label| ctx.decisions.state(label) == LabelDecision::Add)
            }
            Condition::ExcludedLabels(spec) => {
                spec.matches(|label| ctx.decisions.is_excluded(label))
            }
            Condition::Unsupported(raw) => {
                debug!(condition = %raw, "Unsupported condition evaluated as false");
                false
            }
        }
    }
}

impl TextMatch {
    /// Match against already lower-cased text.
    pub fn matches(&self, text: &str) -> bool {
        match self {
            TextMatch::Any => true,
            TextMatch::Contains(needle) => text.contains(needle.as_str()),
            TextMatch::Structured(spec) => spec.matches(text),
        }
    }
}

impl TextSpec {
    fn matches(&self, text: &str) -> bool {
        let contains = |v: &String| text.contains(v.as_str());

        if let Some(values) = &self.contains_all
            && !values.iter().all(contains)
        {
            return false;
        }
        if let Some(values) = &self.contains_any
            && !values.iter().any(contains)
        {
            return false;
        }
        if let Some(values) = &self.not_contains
            && values.iter().any(contains)
        {
            return false;
        }
        if let Some(values) = &self.starts_with
            && !values.iter().any(|v| text.starts_with(v.as_str()))
        {
            return false;
        }
        if let Some(values) = &self.ends_with
            && !values.iter().any(|v| text.ends_with(v.as_str()))
        {
            return false;
        }
        if let Some(values) = &self.equals_any
            && !values.iter().any(|v| v == text)
        {
            return false;
        }
        true
    }
}

impl SenderSpec {
    fn matches(&self, ctx: &RuleContext<'_>) -> bool {
        let sender = ctx.sender.as_str();
        let domain = ctx.sender_domain();

        if !self.in_list.is_empty() && !self.in_list.iter().any(|a| a == sender) {
            return false;
        }
        if self.not_in.iter().any(|a| a == sender) {
            return false;
        }
        if !self.domains.is_empty() && !self.domains.iter().any(|d| d == domain) {
            return false;
        }
        if self.domains_not.iter().any(|d| d == domain) {
            return false;
        }
        if let Some(spec) = &self.contains
            && !spec.matches(sender)
        {
            return false;
        }
        if let Some(members) = &self.groups_any
            && !members.contains(sender)
        {
            return false;
        }
        if let Some(members) = &self.groups_not_any
            && members.contains(sender)
        {
            return false;
        }
        true
    }
}

impl RecipientSpec {
    fn matches(&self, ctx: &RuleContext<'_>) -> bool {
        let recipients = &ctx.all_recipients;
        let total = recipients.len() as i64;

        if self.only_me && (recipients.is_empty() || !recipients.iter().all(|a| ctx.is_me(a))) {
            return false;
        }
        if self.not_on_to && ctx.to.iter().any(|a| ctx.is_me(a)) {
            return false;
        }
        if self.cc_me && !ctx.cc.iter().any(|a| ctx.is_me(a)) {
            return false;
        }
        if self.to_me && !ctx.to.iter().any(|a| ctx.is_me(a)) {
            return false;
        }
        if let Some(limit) = self.total_more_than
            && total <= limit
        {
            return false;
        }
        if let Some(limit) = self.total_less_than
            && total >= limit
        {
            return false;
        }
        if !self.includes_any.is_empty()
            && !recipients.iter().any(|a| self.includes_any.contains(a))
        {
            return false;
        }
        if !self.includes_domains.is_empty()
            && !recipients
                .iter()
                .any(|a| self.includes_domains.iter().any(|d| d == domain_of(a)))
        {
            return false;
        }
        if self.contains_mailing_list
            && !recipients
                .iter()
                .any(|a| looks_like_mailing_list(a, &self.mailing_list_patterns))
        {
            return false;
        }

        let primary_domain = ctx.primary_domain.as_str();
        if self.all_internal {
            if primary_domain.is_empty() || recipients.is_empty() {
                return false;
            }
            let foreign = recipients
                .iter()
                .map(|a| domain_of(a))
                .any(|d| !d.is_empty() && d != primary_domain);
            if foreign {
                return false;
            }
        }
        if self.any_external {
            if primary_domain.is_empty() {
                return false;
            }
            let external = recipients
                .iter()
                .map(|a| domain_of(a))
                .any(|d| !d.is_empty() && d != primary_domain);
            if !external {
                return false;
            }
        }
        if self.sender_in_recipients && !recipients.iter().any(|a| *a == ctx.sender) {
            return false;
        }
        true
    }
}

/// Heuristic: does this address look like a list or newsletter?
pub fn looks_like_mailing_list(address: &str, extra_patterns: &[String]) -> bool {
    let address = address.to_lowercase();
    extra_patterns
        .iter()
        .map(String::as_str)
        .chain(DEFAULT_MAILING_LIST_PATTERNS.iter().copied())
        .filter(|p| !p.is_empty())
        .any(|p| address.contains(&p.to_lowercase()))
}

impl LabelSetSpec {
    fn matches(&self, has: impl Fn(&str) -> bool) -> bool {
        if let Some(labels) = &self.has_any
            && !labels.iter().any(|l| has(l.as_str()))
        {
            return false;
        }
        if let Some(labels) = &self.has_all
            && !labels.iter().all(|l| has(l.as_str()))
        {
            return false;
        }
        if let Some(labels) = &self.missing_all
            && labels.iter().any(|l| has(l.as_str()))
        {
            return false;
        }
        true
    }
}
