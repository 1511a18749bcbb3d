//! Triage processor: rules, then the classifier, then label application.
//!
//! Per message:
//! 1. Rules engine (fast, no LLM), which may terminate
//! 2. LLM classification, unless a rule terminated
//! 3. Resolve the ledger and apply final labels the message lacks
//!
//! A failure inside one message is logged and counted; the batch continues.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, error, info};

use crate::error::{MailError, TriageError};
use crate::pipeline::context::RuleContext;
use crate::pipeline::ledger::{DecisionSource, LabelDecision, LabelLedger};
use crate::pipeline::rules::RulesEngine;
use crate::pipeline::types::{
    Classifier, InboundMessage, LabelCatalog, LabelProvenance, MailProvider, MailboxIdentity,
    ModelSuggestion, TriageOutcome,
};

/// Run-wide switches.
#[derive(Debug, Clone, Copy, Default)]
pub struct TriageOptions {
    /// Decide labels but never touch the provider.
    pub dry_run: bool,
    /// 0 silent, 1 per-message status, 2 also raw model output and rule hits.
    pub verbosity: u8,
}

impl TriageOptions {
    /// Verbosity actually used; dry-run always reports.
    pub fn effective_verbosity(&self) -> u8 {
        if self.dry_run {
            self.verbosity.max(1)
        } else {
            self.verbosity
        }
    }
}

/// Summary of one batch.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchReport {
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Final-label counts over succeeded messages, seeded with every catalog label.
    pub classifications: BTreeMap<String, usize>,
    pub outcomes: Vec<TriageOutcome>,
}

impl BatchReport {
    fn new(catalog: &LabelCatalog) -> Self {
        Self {
            classifications: catalog.names().map(|n| (n.to_string(), 0)).collect(),
            ..Default::default()
        }
    }

    fn record_success(&mut self, outcome: TriageOutcome) {
        self.succeeded += 1;
        for label in outcome.label_names() {
            *self.classifications.entry(label.to_string()).or_insert(0) += 1;
        }
        self.outcomes.push(outcome);
    }
}

/// Inbox triage processor.
pub struct TriageProcessor {
    mail: Arc<dyn MailProvider>,
    classifier: Arc<dyn Classifier>,
    rules: RulesEngine,
    catalog: LabelCatalog,
    known_labels: HashSet<String>,
    identity: MailboxIdentity,
    options: TriageOptions,
}

impl TriageProcessor {
    /// Create a processor. The mailbox identity is read from the provider once.
    pub fn new(
        mail: Arc<dyn MailProvider>,
        classifier: Arc<dyn Classifier>,
        rules: RulesEngine,
        catalog: LabelCatalog,
        options: TriageOptions,
    ) -> Self {
        let identity = mail.identity();
        let known_labels = catalog.name_set();
        Self {
            mail,
            classifier,
            rules,
            catalog,
            known_labels,
            identity,
            options,
        }
    }

    /// Triage up to `max_messages` candidates.
    ///
    /// Only listing the candidates can fail the whole batch; everything after
    /// that is counted per message.
    pub async fn run(&self, max_messages: i64) -> Result<BatchReport, MailError> {
        let mut report = BatchReport::new(&self.catalog);

        info!(
            max_messages,
            dry_run = self.options.dry_run,
            verbosity = self.options.effective_verbosity(),
            rules = self.rules.len(),
            "Starting inbox triage"
        );

        if max_messages <= 0 {
            info!(max_messages, "Nothing to do");
            return Ok(report);
        }

        let limit = usize::try_from(max_messages).unwrap_or(usize::MAX);
        let ids = self.mail.list_candidates(limit).await?;
        if ids.is_empty() {
            info!(provider = self.mail.name(), "No candidate messages found");
            return Ok(report);
        }

        info!(count = ids.len(), "Processing candidate messages");

        for id in ids {
            report.processed += 1;
            match self.fetch_and_process(&id).await {
                Ok(outcome) => {
                    self.print_outcome(&outcome);
                    report.record_success(outcome);
                }
                Err(e) => {
                    error!(message_id = %id, error = %e, "Failed to triage message");
                    report.failed += 1;
                    if self.options.effective_verbosity() >= 1 {
                        println!("[ERROR] Email {id} failed: {e}");
                    }
                }
            }
        }

        info!(
            succeeded = report.succeeded,
            processed = report.processed,
            failed = report.failed,
            "Inbox triage complete"
        );
        for (label, count) in &report.classifications {
            if *count > 0 {
                info!(label = %label, count, "Label totals");
            }
        }

        Ok(report)
    }

    async fn fetch_and_process(&self, message_id: &str) -> Result<TriageOutcome, TriageError> {
        let message = self.mail.fetch_message(message_id).await?;
        self.process(&message).await
    }

    /// Triage one message: decide its labels and apply the new ones.
    pub async fn process(&self, message: &InboundMessage) -> Result<TriageOutcome, TriageError> {
        debug!(
            message_id = %message.id,
            sender = %message.sender,
            subject = %truncate(&message.subject, 50),
            "Processing message"
        );

        let validator = |label: &str| self.mail.label_exists(label);
        let ledger = LabelLedger::new(&self.known_labels).with_validator(&validator);
        let mut ctx = RuleContext::new(message, &self.identity, ledger);

        let rule_run = self.rules.run(&mut ctx)?;

        let suggestion = if rule_run.terminated {
            debug!(message_id = %message.id, "Rules terminated, skipping classifier");
            None
        } else {
            let classification = self
                .classifier
                .classify(
                    &message.sender,
                    &message.subject,
                    &message.content,
                    &self.catalog,
                )
                .await?;

            let discarded = ctx.decisions.is_excluded(&classification.label);
            if discarded {
                let excluded_by = ctx
                    .decisions
                    .source(&classification.label)
                    .map(ToString::to_string)
                    .unwrap_or_default();
                info!(
                    message_id = %message.id,
                    label = %classification.label,
                    excluded_by = %excluded_by,
                    "Classifier suggestion discarded, label excluded by rules"
                );
            } else {
                ctx.decisions.add(&classification.label, &DecisionSource::Llm)?;
                info!(
                    message_id = %message.id,
                    label = %classification.label,
                    "Message classified"
                );
            }

            Some(ModelSuggestion {
                label: classification.label,
                raw: classification.raw,
                discarded,
            })
        };

        let mut final_labels = Vec::new();
        let mut excluded_labels = Vec::new();
        for (label, state, source) in ctx.decisions.provenance() {
            let entry = LabelProvenance {
                label: label.to_string(),
                source: source.clone(),
            };
            match state {
                LabelDecision::Add => final_labels.push(entry),
                LabelDecision::Exclude => excluded_labels.push(entry),
                LabelDecision::None => {}
            }
        }

        let mut applied = Vec::new();
        let mut already_present = Vec::new();
        for entry in &final_labels {
            if message.existing_labels.contains(&entry.label) {
                debug!(message_id = %message.id, label = %entry.label, "Label already present");
                already_present.push(entry.label.clone());
                continue;
            }
            if self.options.dry_run {
                debug!(message_id = %message.id, label = %entry.label, "Dry run, not applying");
            } else {
                self.mail.apply_label(&message.id, &entry.label).await?;
                debug!(message_id = %message.id, label = %entry.label, "Applied label");
            }
            applied.push(entry.label.clone());
        }

        Ok(TriageOutcome {
            message_id: message.id.clone(),
            subject: message.subject.clone(),
            received_at: message.received_at,
            final_labels,
            excluded_labels,
            model_skipped: rule_run.terminated,
            suggestion,
            rule_hits: rule_run.hits,
            applied,
            already_present,
            dry_run: self.options.dry_run,
            processed_at: Utc::now(),
        })
    }

    fn print_outcome(&self, outcome: &TriageOutcome) {
        for line in outcome_lines(outcome, self.options.effective_verbosity()) {
            println!("{line}");
        }
    }
}

/// Console report for one message.
///
/// Verbosity 1 lists every final label with its source; a dry run also lists
/// excludes, so each decision is visible. Verbosity 2 adds rule hits and the
/// model answer.
pub fn outcome_lines(outcome: &TriageOutcome, verbosity: u8) -> Vec<String> {
    let mut lines = Vec::new();
    if verbosity == 0 {
        return lines;
    }

    let head = format!("Email '{}' (id={})", outcome.subject, outcome.message_id);
    if outcome.final_labels.is_empty() {
        let tag = if outcome.dry_run { "[DRY RUN]" } else { "[APPLIED]" };
        lines.push(format!("{tag} {head} no labels decided"));
    }
    for entry in &outcome.final_labels {
        let present = outcome.already_present.contains(&entry.label);
        lines.push(match (outcome.dry_run, present) {
            (true, false) => format!(
                "[DRY RUN] {head} would be labeled '{}' (source={})",
                entry.label, entry.source
            ),
            (false, false) => format!(
                "[APPLIED] {head} labeled '{}' (source={})",
                entry.label, entry.source
            ),
            (_, true) => format!(
                "[SKIPPED] {head} already labeled '{}' (source={})",
                entry.label, entry.source
            ),
        });
    }

    if outcome.dry_run || verbosity >= 2 {
        for entry in &outcome.excluded_labels {
            lines.push(format!("  excluded '{}' (source={})", entry.label, entry.source));
        }
    }

    if verbosity < 2 {
        return lines;
    }
    if let Some(received) = outcome.received_at {
        lines.push(format!("  received {}", received.to_rfc3339()));
    }
    for hit in &outcome.rule_hits {
        lines.push(format!(
            "  rule '{}' matched: add={:?} exclude={:?}{}",
            hit.rule,
            hit.add,
            hit.exclude,
            if hit.terminated { " (terminated)" } else { "" }
        ));
    }
    lines.push(match &outcome.suggestion {
        Some(s) => format!(
            "  model answered {:?} -> '{}'{}",
            s.raw,
            s.label,
            if s.discarded { " (discarded: excluded)" } else { "" }
        ),
        None => "  model skipped".to_string(),
    });
    lines
}

fn truncate(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use serde_json::json;

    use crate::error::LlmError;
    use crate::pipeline::condition::EmailGroups;
    use crate::pipeline::rules::RawRule;
    use crate::pipeline::types::{Classification, LabelDefinition};

    struct StubMail {
        messages: Vec<InboundMessage>,
        applied: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl MailProvider for StubMail {
        fn name(&self) -> &str {
            "stub"
        }

        async fn list_candidates(&self, limit: usize) -> Result<Vec<String>, MailError> {
            Ok(self.messages.iter().take(limit).map(|m| m.id.clone()).collect())
        }

        async fn fetch_message(&self, message_id: &str) -> Result<InboundMessage, MailError> {
            self.messages
                .iter()
                .find(|m| m.id == message_id)
                .cloned()
                .ok_or_else(|| MailError::InvalidMessage {
                    id: message_id.into(),
                    reason: "not found".into(),
                })
        }

        async fn apply_label(&self, message_id: &str, label: &str) -> Result<(), MailError> {
            self.applied
                .lock()
                .unwrap()
                .push((message_id.into(), label.into()));
            Ok(())
        }

        fn label_exists(&self, _label: &str) -> bool {
            false
        }

        fn primary_address(&self) -> String {
            "me@corp.com".into()
        }

        fn identity_addresses(&self) -> HashSet<String> {
            HashSet::from(["me@corp.com".to_string()])
        }
    }

    struct FixedClassifier {
        label: String,
        calls: Mutex<usize>,
    }

    #[async_trait]
    impl Classifier for FixedClassifier {
        async fn classify(
            &self,
            _sender: &str,
            _subject: &str,
            _content: &str,
            _catalog: &LabelCatalog,
        ) -> Result<Classification, LlmError> {
            *self.calls.lock().unwrap() += 1;
            Ok(Classification {
                label: self.label.clone(),
                raw: format!(" {} ", self.label.to_uppercase()),
            })
        }
    }

    fn catalog() -> LabelCatalog {
        LabelCatalog {
            labels: ["fyi", "response-required", "VIP"]
                .iter()
                .map(|n| LabelDefinition {
                    name: n.to_string(),
                    description: String::new(),
                })
                .collect(),
            default_label: Some("fyi".into()),
        }
    }

    fn message(id: &str, sender: &str) -> InboundMessage {
        InboundMessage {
            id: id.into(),
            sender: sender.into(),
            sender_display: sender.into(),
            subject: format!("Subject {id}"),
            content: "Body".into(),
            snippet: "Body".into(),
            to: vec!["me@corp.com".into()],
            ..Default::default()
        }
    }

    fn rules(values: Vec<serde_json::Value>) -> RulesEngine {
        let raw: Vec<RawRule> = values
            .into_iter()
            .map(|v| serde_json::from_value(v).unwrap())
            .collect();
        RulesEngine::from_raw(raw, &EmailGroups::new()).unwrap()
    }

    fn processor(
        messages: Vec<InboundMessage>,
        rules: RulesEngine,
        answer: &str,
        dry_run: bool,
    ) -> (TriageProcessor, Arc<StubMail>, Arc<FixedClassifier>) {
        let mail = Arc::new(StubMail {
            messages,
            applied: Mutex::new(Vec::new()),
        });
        let classifier = Arc::new(FixedClassifier {
            label: answer.into(),
            calls: Mutex::new(0),
        });
        let processor = TriageProcessor::new(
            mail.clone(),
            classifier.clone(),
            rules,
            catalog(),
            TriageOptions {
                dry_run,
                verbosity: 0,
            },
        );
        (processor, mail, classifier)
    }

    #[test]
    fn dry_run_implies_verbosity() {
        let opts = TriageOptions {
            dry_run: true,
            verbosity: 0,
        };
        assert_eq!(opts.effective_verbosity(), 1);
        let opts = TriageOptions {
            dry_run: false,
            verbosity: 2,
        };
        assert_eq!(opts.effective_verbosity(), 2);
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "hé");
        assert_eq!(truncate("hi", 10), "hi");
    }

    #[tokio::test]
    async fn rule_and_model_labels_combine() {
        let engine = rules(vec![json!({
            "name": "vip",
            "when": {"sender": {"in": ["vip@x.com"]}},
            "actions": {"add": ["VIP"]}
        })]);
        let msg = message("m1", "vip@x.com");
        let (processor, mail, classifier) = processor(vec![], engine, "response-required", false);

        let outcome = processor.process(&msg).await.unwrap();
        assert_eq!(outcome.label_names(), vec!["VIP", "response-required"]);
        assert_eq!(outcome.source_of("VIP").unwrap().to_string(), "rule:vip");
        assert_eq!(outcome.source_of("response-required"), Some(&DecisionSource::Llm));
        assert_eq!(*classifier.calls.lock().unwrap(), 1);
        assert_eq!(mail.applied.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn exclude_beats_model_suggestion() {
        let engine = rules(vec![json!({"name": "no-fyi", "actions": {"exclude": ["fyi"]}})]);
        let msg = message("m1", "a@b.com");
        let (processor, mail, _) = processor(vec![], engine, "fyi", false);

        let outcome = processor.process(&msg).await.unwrap();
        assert!(outcome.final_labels.is_empty());
        assert!(outcome.suggestion.as_ref().unwrap().discarded);
        assert_eq!(outcome.excluded_labels[0].label, "fyi");
        assert!(mail.applied.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn termination_skips_classifier() {
        let engine = rules(vec![json!({
            "name": "stop",
            "actions": {"add": ["fyi"]},
            "terminate": true
        })]);
        let msg = message("m1", "a@b.com");
        let (processor, _, classifier) = processor(vec![], engine, "VIP", false);

        let outcome = processor.process(&msg).await.unwrap();
        assert!(outcome.model_skipped);
        assert!(outcome.suggestion.is_none());
        assert_eq!(outcome.label_names(), vec!["fyi"]);
        assert_eq!(*classifier.calls.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn existing_labels_are_not_reapplied() {
        let mut msg = message("m1", "a@b.com");
        msg.existing_labels = vec!["fyi".into()];
        let (processor, mail, _) = processor(vec![], RulesEngine::empty(), "fyi", false);

        let outcome = processor.process(&msg).await.unwrap();
        assert_eq!(outcome.already_present, vec!["fyi"]);
        assert!(outcome.applied.is_empty());
        assert!(mail.applied.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn dry_run_never_touches_provider() {
        let msg = message("m1", "a@b.com");
        let (processor, mail, _) = processor(vec![msg], RulesEngine::empty(), "fyi", true);

        let report = processor.run(5).await.unwrap();
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.outcomes[0].applied, vec!["fyi"]);
        assert!(report.outcomes[0].dry_run);
        assert!(mail.applied.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn non_positive_limit_returns_empty_report() {
        let msg = message("m1", "a@b.com");
        let (processor, _, classifier) = processor(vec![msg], RulesEngine::empty(), "fyi", false);

        let report = processor.run(0).await.unwrap();
        assert_eq!(report.processed, 0);
        assert_eq!(report.classifications.get("fyi"), Some(&0));
        assert_eq!(report.classifications.len(), 3);
        assert_eq!(*classifier.calls.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn dry_run_report_shows_excludes_with_their_rule() {
        let engine = rules(vec![json!({
            "name": "vip",
            "actions": {"add": ["VIP"], "exclude": ["fyi"]}
        })]);
        let msg = message("m1", "vip@x.com");

        let (dry, _, _) = processor(vec![], engine.clone(), "response-required", true);
        let outcome = dry.process(&msg).await.unwrap();
        let lines = outcome_lines(&outcome, dry.options.effective_verbosity());
        assert!(lines.contains(
            &"[DRY RUN] Email 'Subject m1' (id=m1) would be labeled 'VIP' (source=rule:vip)"
                .to_string()
        ));
        assert!(lines.contains(&"  excluded 'fyi' (source=rule:vip)".to_string()));
        assert!(!lines.iter().any(|l| l.starts_with("  model")));

        let (live, _, _) = processor(vec![], engine, "response-required", false);
        let outcome = live.process(&msg).await.unwrap();
        assert!(!outcome_lines(&outcome, 1).iter().any(|l| l.contains("excluded")));
        assert!(outcome_lines(&outcome, 2).contains(&"  excluded 'fyi' (source=rule:vip)".to_string()));
        assert!(outcome_lines(&outcome, 0).is_empty());
    }

    #[tokio::test]
    async fn batch_report_serializes_for_json_output() {
        use chrono::TimeZone;

        let mut msg = message("m1", "a@b.com");
        msg.received_at = Some(Utc.with_ymd_and_hms(2024, 3, 1, 9, 30, 0).unwrap());
        let (processor, _, _) = processor(vec![msg], RulesEngine::empty(), "fyi", true);

        let report = processor.run(5).await.unwrap();
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["succeeded"], 1);
        assert_eq!(json["classifications"]["fyi"], 1);
        let outcome = &json["outcomes"][0];
        assert_eq!(outcome["received_at"], "2024-03-01T09:30:00Z");
        assert_eq!(outcome["final_labels"][0]["label"], "fyi");
        assert_eq!(outcome["final_labels"][0]["source"], "llm");
        assert_eq!(outcome["suggestion"]["raw"], " FYI ");

        let lines = outcome_lines(&report.outcomes[0], 2);
        assert!(lines.contains(&"  received 2024-03-01T09:30:00+00:00".to_string()));
    }

    #[tokio::test]
    async fn unknown_rule_label_fails_only_that_message() {
        let engine = rules(vec![json!({
            "name": "bad",
            "when": {"sender": {"in": ["bad@x.com"]}},
            "actions": {"add": ["ghost"]}
        })]);
        let msgs = vec![message("m1", "bad@x.com"), message("m2", "ok@x.com")];
        let (processor, mail, _) = processor(msgs, engine, "fyi", false);

        let report = processor.run(10).await.unwrap();
        assert_eq!(report.processed, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.classifications["fyi"], 1);
        assert_eq!(
            *mail.applied.lock().unwrap(),
            vec![("m2".to_string(), "fyi".to_string())]
        );
    }
}
