//! Per-message label decision ledger.
//!
//! Every label a message touches moves through a tiny state machine:
//! `None → Add | Exclude`, and any later decision may flip it. The ledger
//! records which source (a rule or the LLM) made the current decision.
//! Decisions are last-write-wins: rules run in declared order, the LLM
//! always runs last.

use std::collections::HashSet;
use std::fmt;

use serde::{Serialize, Serializer};
use tracing::{debug, info};

use crate::error::ConfigError;

// ── Decision state ──────────────────────────────────────────────────

/// Current decision for a label.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LabelDecision {
    #[default]
    None,
    Add,
    Exclude,
}

impl LabelDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Add => "add",
            Self::Exclude => "exclude",
        }
    }

    /// Compute the transition caused by applying `action` to this state.
    pub fn transition(self, action: LabelAction) -> Transition {
        let next = LabelDecision::from(action);
        if self == next {
            Transition::Unchanged
        } else if self == LabelDecision::None {
            Transition::Set(next)
        } else {
            Transition::Overridden {
                from: self,
                to: next,
            }
        }
    }
}

/// A decision a source can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelAction {
    Add,
    Exclude,
}

impl From<LabelAction> for LabelDecision {
    fn from(action: LabelAction) -> Self {
        match action {
            LabelAction::Add => LabelDecision::Add,
            LabelAction::Exclude => LabelDecision::Exclude,
        }
    }
}

/// Outcome of a single `decide` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Requested state equals the current one; nothing changed.
    Unchanged,
    /// First decision for the label.
    Set(LabelDecision),
    /// A previous decision was replaced.
    Overridden {
        from: LabelDecision,
        to: LabelDecision,
    },
}

// ── Provenance ──────────────────────────────────────────────────────

/// Which component produced a decision.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DecisionSource {
    /// A deterministic rule, by name.
    Rule(String),
    /// The language-model classifier.
    Llm,
}

impl DecisionSource {
    pub fn rule(name: impl Into<String>) -> Self {
        Self::Rule(name.into())
    }
}

impl fmt::Display for DecisionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rule(name) => write!(f, "rule:{name}"),
            Self::Llm => f.write_str("llm"),
        }
    }
}

impl Serialize for DecisionSource {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

// ── Validation ──────────────────────────────────────────────────────

/// Decides whether a label name outside the catalog is still acceptable.
///
/// The mail provider implements this through its label cache.
pub trait LabelValidator {
    fn is_valid_label(&self, label: &str) -> bool;
}

impl<F> LabelValidator for F
where
    F: Fn(&str) -> bool,
{
    fn is_valid_label(&self, label: &str) -> bool {
        self(label)
    }
}

// ── Ledger ──────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct LabelEntry {
    label: String,
    state: LabelDecision,
    source: DecisionSource,
}

/// Per-message record of label decisions and their provenance.
///
/// Created fresh for each message and dropped once the final label set has
/// been read. Labels keep their first-decided order so output is stable.
pub struct LabelLedger<'a> {
    valid_labels: &'a HashSet<String>,
    validator: Option<&'a (dyn LabelValidator + Sync)>,
    entries: Vec<LabelEntry>,
}

impl<'a> LabelLedger<'a> {
    /// Ledger validated only against a known label set.
    pub fn new(valid_labels: &'a HashSet<String>) -> Self {
        Self {
            valid_labels,
            validator: None,
            entries: Vec::new(),
        }
    }

    /// Also accept labels the injected validator knows about.
    pub fn with_validator(mut self, validator: &'a (dyn LabelValidator + Sync)) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Mark a label to be applied.
    pub fn add(&mut self, label: &str, source: &DecisionSource) -> Result<Transition, ConfigError> {
        self.decide(label, LabelAction::Add, source)
    }

    /// Mark a label to be excluded.
    pub fn exclude(
        &mut self,
        label: &str,
        source: &DecisionSource,
    ) -> Result<Transition, ConfigError> {
        self.decide(label, LabelAction::Exclude, source)
    }

    /// Record a decision for `label`.
    ///
    /// Fails without touching any state when the label is unknown. A repeat
    /// of the current state is a no-op and keeps the original provenance.
    pub fn decide(
        &mut self,
        label: &str,
        action: LabelAction,
        source: &DecisionSource,
    ) -> Result<Transition, ConfigError> {
        self.validate(label, source)?;

        let previous = self.state(label);
        let transition = previous.transition(action);

        match transition {
            Transition::Unchanged => {
                debug!(
                    label,
                    state = previous.as_str(),
                    source = %source,
                    "Label already decided"
                );
                return Ok(transition);
            }
            Transition::Set(to) => {
                debug!(label, state = to.as_str(), source = %source, "Label decided");
            }
            Transition::Overridden { from, to } => {
                info!(
                    label,
                    from = from.as_str(),
                    to = to.as_str(),
                    source = %source,
                    "Label decision overridden"
                );
            }
        }

        let state = LabelDecision::from(action);
        match self.entries.iter_mut().find(|e| e.label == label) {
            Some(entry) => {
                entry.state = state;
                entry.source = source.clone();
            }
            None => self.entries.push(LabelEntry {
                label: label.to_string(),
                state,
                source: source.clone(),
            }),
        }

        Ok(transition)
    }

    fn validate(&self, label: &str, source: &DecisionSource) -> Result<(), ConfigError> {
        if self.valid_labels.contains(label) {
            return Ok(());
        }
        if self.validator.is_some_and(|v| v.is_valid_label(label)) {
            return Ok(());
        }
        Err(ConfigError::UnknownLabel {
            label: label.to_string(),
            source_name: source.to_string(),
        })
    }

    /// Current state of a label (`None` when never decided).
    pub fn state(&self, label: &str) -> LabelDecision {
        self.entry(label).map(|e| e.state).unwrap_or_default()
    }

    /// Source of the current decision, if any.
    pub fn source(&self, label: &str) -> Option<&DecisionSource> {
        self.entry(label).map(|e| &e.source)
    }

    fn entry(&self, label: &str) -> Option<&LabelEntry> {
        self.entries.iter().find(|e| e.label == label)
    }

    /// Labels currently marked `Add`, in decision order.
    pub fn pending_additions(&self) -> Vec<&str> {
        self.labels_in(LabelDecision::Add)
    }

    /// Labels currently marked `Exclude`.
    pub fn excluded_labels(&self) -> Vec<&str> {
        self.labels_in(LabelDecision::Exclude)
    }

    pub fn is_excluded(&self, label: &str) -> bool {
        self.state(label) == LabelDecision::Exclude
    }

    /// The authoritative output once rules and the classifier have run.
    pub fn final_labels(&self) -> Vec<String> {
        self.pending_additions()
            .into_iter()
            .map(String::from)
            .collect()
    }

    /// Every decided label with its state and source.
    pub fn provenance(&self) -> Vec<(&str, LabelDecision, &DecisionSource)> {
        self.entries
            .iter()
            .map(|e| (e.label.as_str(), e.state, &e.source))
            .collect()
    }

    fn labels_in(&self, state: LabelDecision) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|e| e.state == state)
            .map(|e| e.label.as_str())
            .collect()
    }
}

impl fmt::Debug for LabelLedger<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LabelLedger")
            .field("entries", &self.entries)
            .field("has_validator", &self.validator.is_some())
            .finish()
    }
}
