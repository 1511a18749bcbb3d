//! Rule configuration loading.
//!
//! Accepts three shapes, tried in order: a full document
//! (`{email_groups?, rules: [...]}`), a bare list of rules, or a single rule.
//! YAML is a superset of JSON, so both parse through `serde_yaml`.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;

use serde::Deserialize;
use tracing::{info, warn};

use crate::error::ConfigError;
use crate::pipeline::condition::EmailGroups;
use crate::pipeline::rules::{RawRule, RulesEngine};

#[derive(Debug, Deserialize)]
struct RuleDocument {
    #[serde(default)]
    email_groups: HashMap<String, GroupMembers>,
    rules: Vec<RawRule>,
}

/// Group members may be written as a list or a single address.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum GroupMembers {
    One(String),
    Many(Vec<String>),
}

impl GroupMembers {
    fn normalized(self) -> HashSet<String> {
        let members = match self {
            Self::One(address) => vec![address],
            Self::Many(addresses) => addresses,
        };
        members
            .into_iter()
            .map(|a| a.trim().to_lowercase())
            .filter(|a| !a.is_empty())
            .collect()
    }
}

/// Load the rule set at `path`.
///
/// A missing file yields an engine with no rules; every message then goes
/// straight to the classifier.
pub fn load_rule_set(path: impl AsRef<Path>) -> Result<RulesEngine, ConfigError> {
    let path = path.as_ref();
    if !path.exists() {
        warn!(path = %path.display(), "Rules file not found, running without rules");
        return Ok(RulesEngine::empty());
    }

    let raw = fs::read_to_string(path)?;
    let engine = parse_rule_set(&raw, &path.display().to_string())?;
    info!(path = %path.display(), rules = engine.len(), "Loaded triage rules");
    Ok(engine)
}

/// Parse rule configuration text. `origin` names the source in errors.
pub fn parse_rule_set(raw: &str, origin: &str) -> Result<RulesEngine, ConfigError> {
    if raw.trim().is_empty() {
        return Ok(RulesEngine::empty());
    }

    let (groups, rules) = parse_shapes(raw, origin)?;
    RulesEngine::from_raw(rules, &groups)
}

fn parse_shapes(raw: &str, origin: &str) -> Result<(EmailGroups, Vec<RawRule>), ConfigError> {
    let mut attempts = Vec::new();

    match serde_yaml::from_str::<RuleDocument>(raw) {
        Ok(doc) => {
            let groups = doc
                .email_groups
                .into_iter()
                .map(|(name, members)| (name, members.normalized()))
                .collect();
            return Ok((groups, doc.rules));
        }
        Err(e) => attempts.push(format!("rules document ({e})")),
    }

    match serde_yaml::from_str::<Vec<RawRule>>(raw) {
        Ok(list) => return Ok((EmailGroups::new(), list)),
        Err(e) => attempts.push(format!("list ({e})")),
    }

    match serde_yaml::from_str::<RawRule>(raw) {
        Ok(rule) if rule.name.is_some() => return Ok((EmailGroups::new(), vec![rule])),
        Ok(_) => attempts.push("single (no 'name')".to_string()),
        Err(e) => attempts.push(format!("single ({e})")),
    }

    Err(ConfigError::ParseError {
        path: origin.to_string(),
        message: format!("unable to parse rules using {}", attempts.join(", ")),
    })
}
