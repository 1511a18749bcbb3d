//! Pre-LLM deterministic rules engine.
//!
//! Runs before the LLM classifier. Each rule is a condition plus label
//! actions:
//! - matching rules add and/or exclude labels in the message's ledger
//! - a matching rule with `terminate: true` stops evaluation and the
//!   classifier is skipped for that message
//!
//! Rules run strictly in declared order; there is no priority reordering.

use std::collections::HashSet;

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::error::ConfigError;
use crate::pipeline::condition::{self, Condition, EmailGroups, ParseScope};
use crate::pipeline::context::RuleContext;
use crate::pipeline::ledger::DecisionSource;
use crate::pipeline::types::RuleHit;

/// Rule as written in configuration, before validation.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawRule {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub when: Option<Value>,
    #[serde(default)]
    pub actions: Option<RawActions>,
    #[serde(default)]
    pub terminate: bool,
}

/// Label actions as written in configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawActions {
    #[serde(default)]
    pub add: Option<Vec<String>>,
    #[serde(default)]
    pub exclude: Option<Vec<String>>,
}

/// A validated, immutable rule.
#[derive(Debug, Clone, PartialEq)]
pub struct Rule {
    pub name: String,
    pub description: Option<String>,
    /// `None` matches every message.
    pub condition: Option<Condition>,
    pub add_labels: Vec<String>,
    pub exclude_labels: Vec<String>,
    pub terminate: bool,
}

impl Rule {
    /// Validate a raw rule and parse its condition tree.
    pub fn parse(raw: RawRule, groups: &EmailGroups) -> Result<Self, ConfigError> {
        let name = raw
            .name
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty())
            .ok_or_else(|| ConfigError::InvalidRule {
                rule: "<unnamed>".into(),
                reason: "missing required field 'name'".into(),
            })?;

        let scope = ParseScope {
            rule: &name,
            groups,
        };
        let condition = match raw.when {
            Some(value) => match Condition::parse(&value, &scope)? {
                Condition::Always => None,
                parsed => Some(parsed),
            },
            None => None,
        };

        let actions = raw.actions.unwrap_or_default();
        Ok(Self {
            description: raw.description,
            condition,
            add_labels: actions.add.unwrap_or_default(),
            exclude_labels: actions.exclude.unwrap_or_default(),
            terminate: raw.terminate,
            name,
        })
    }

    /// Provenance recorded for this rule's decisions.
    pub fn source(&self) -> DecisionSource {
        DecisionSource::rule(&self.name)
    }
}

/// Result of running the rules against one message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleRun {
    /// A matching rule asked to stop; the classifier must not run.
    pub terminated: bool,
    /// Matching rules in evaluation order.
    pub hits: Vec<RuleHit>,
}

/// Deterministic rules engine.
#[derive(Debug, Clone, Default)]
pub struct RulesEngine {
    rules: Vec<Rule>,
}

impl RulesEngine {
    /// Create an engine over already-parsed rules. Names must be unique.
    pub fn new(rules: Vec<Rule>) -> Result<Self, ConfigError> {
        let mut seen = HashSet::new();
        for rule in &rules {
            if !seen.insert(rule.name.as_str()) {
                return Err(ConfigError::DuplicateRule(rule.name.clone()));
            }
        }
        Ok(Self { rules })
    }

    /// Create an engine with no rules.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Parse raw rules in order.
    pub fn from_raw(raw: Vec<RawRule>, groups: &EmailGroups) -> Result<Self, ConfigError> {
        let rules = raw
            .into_iter()
            .map(|r| Rule::parse(r, groups))
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(rules)
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Evaluate every rule in order against `ctx`.
    ///
    /// A matching rule applies its `add` labels, then its `exclude` labels,
    /// so an exclude in the same rule wins over an add of the same label.
    /// An unknown label aborts the run with a configuration error; the
    /// caller fails the message.
    pub fn run(&self, ctx: &mut RuleContext<'_>) -> Result<RuleRun, ConfigError> {
        let mut run = RuleRun::default();

        for rule in &self.rules {
            let matched = condition::evaluate(rule.condition.as_ref(), ctx);
            debug!(rule = %rule.name, matched, "Rule evaluated");
            if !matched {
                continue;
            }

            let source = rule.source();
            for label in &rule.add_labels {
                ctx.decisions.add(label, &source)?;
            }
            for label in &rule.exclude_labels {
                ctx.decisions.exclude(label, &source)?;
            }

            run.hits.push(RuleHit {
                rule: rule.name.clone(),
                add: rule.add_labels.clone(),
                exclude: rule.exclude_labels.clone(),
                terminated: rule.terminate,
            });

            if rule.terminate {
                info!(
                    rule = %rule.name,
                    subject = %ctx.subject,
                    "Rule requested termination"
                );
                run.terminated = true;
                return Ok(run);
            }
        }

        Ok(run)
    }
}
