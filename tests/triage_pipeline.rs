//! End-to-end triage tests with in-memory collaborators.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use inbox_triage::error::{LlmError, MailError};
use inbox_triage::pipeline::ledger::DecisionSource;
use inbox_triage::pipeline::loader::parse_rule_set;
use inbox_triage::pipeline::processor::{TriageOptions, TriageProcessor};
use inbox_triage::pipeline::rules::RulesEngine;
use inbox_triage::pipeline::types::{
    Classification, Classifier, InboundMessage, LabelCatalog, MailProvider,
};

// ── Stub collaborators ──────────────────────────────────────────────

/// Events in the order they happened, shared by both stubs.
type Journal = Arc<Mutex<Vec<String>>>;

struct MemoryMailbox {
    messages: Vec<InboundMessage>,
    provider_labels: HashSet<String>,
    journal: Journal,
}

#[async_trait]
impl MailProvider for MemoryMailbox {
    fn name(&self) -> &str {
        "memory"
    }

    async fn list_candidates(&self, limit: usize) -> Result<Vec<String>, MailError> {
        Ok(self.messages.iter().take(limit).map(|m| m.id.clone()).collect())
    }

    async fn fetch_message(&self, message_id: &str) -> Result<InboundMessage, MailError> {
        self.messages
            .iter()
            .find(|m| m.id == message_id)
            .cloned()
            .ok_or_else(|| MailError::Api {
                operation: "messages.get".into(),
                status: 404,
                body: message_id.into(),
            })
    }

    async fn apply_label(&self, message_id: &str, label: &str) -> Result<(), MailError> {
        self.journal
            .lock()
            .unwrap()
            .push(format!("apply {message_id} {label}"));
        Ok(())
    }

    fn label_exists(&self, label: &str) -> bool {
        self.provider_labels.contains(label)
    }

    fn primary_address(&self) -> String {
        "me@corp.com".into()
    }

    fn identity_addresses(&self) -> HashSet<String> {
        HashSet::from(["me@corp.com".to_string(), "alias@corp.com".to_string()])
    }
}

/// Answers by sender; a sender mapped to `None` makes the call fail.
struct ScriptedClassifier {
    answers: HashMap<String, Option<String>>,
    journal: Journal,
}

#[async_trait]
impl Classifier for ScriptedClassifier {
    async fn classify(
        &self,
        sender: &str,
        _subject: &str,
        _content: &str,
        _catalog: &LabelCatalog,
    ) -> Result<Classification, LlmError> {
        self.journal.lock().unwrap().push(format!("classify {sender}"));
        match self.answers.get(sender) {
            Some(Some(label)) => Ok(Classification {
                label: label.clone(),
                raw: label.clone(),
            }),
            _ => Err(LlmError::RequestFailed {
                provider: "scripted".into(),
                reason: "model offline".into(),
            }),
        }
    }
}

// ── Fixtures ────────────────────────────────────────────────────────

fn catalog() -> LabelCatalog {
    LabelCatalog::parse(
        r#"{
            "labels": [
                {"name": "response-required", "description": "Needs a reply"},
                {"name": "fyi", "description": "Informational"},
                {"name": "VIP", "description": "Important people"}
            ],
            "default_label": "fyi"
        }"#,
        "test",
    )
    .unwrap()
}

fn message(id: &str, sender: &str, subject: &str) -> InboundMessage {
    InboundMessage {
        id: id.into(),
        sender: sender.into(),
        sender_display: sender.into(),
        subject: subject.into(),
        content: format!("Body of {id}"),
        snippet: format!("Body of {id}"),
        to: vec!["me@corp.com".into()],
        ..Default::default()
    }
}

struct Harness {
    processor: TriageProcessor,
    journal: Journal,
}

impl Harness {
    fn new(
        messages: Vec<InboundMessage>,
        rules: RulesEngine,
        answers: &[(&str, Option<&str>)],
        dry_run: bool,
    ) -> Self {
        let journal: Journal = Arc::default();
        let mailbox = MemoryMailbox {
            messages,
            provider_labels: HashSet::from(["Receipts".to_string()]),
            journal: journal.clone(),
        };
        let classifier = ScriptedClassifier {
            answers: answers
                .iter()
                .map(|(s, a)| (s.to_string(), a.map(String::from)))
                .collect(),
            journal: journal.clone(),
        };
        let processor = TriageProcessor::new(
            Arc::new(mailbox),
            Arc::new(classifier),
            rules,
            catalog(),
            TriageOptions {
                dry_run,
                verbosity: 0,
            },
        );
        Self { processor, journal }
    }

    fn events(&self) -> Vec<String> {
        self.journal.lock().unwrap().clone()
    }
}

fn rules(yaml: &str) -> RulesEngine {
    parse_rule_set(yaml, "test").unwrap()
}

// ── Scenarios ───────────────────────────────────────────────────────

#[tokio::test]
async fn vip_rule_adds_label_and_model_still_runs() {
    let engine = rules(
        r#"
rules:
  - name: vip
    when: {sender: {in: ["vip@x.com"]}}
    actions: {add: [VIP]}
"#,
    );
    let msg = message("m1", "vip@x.com", "Lunch?");
    let h = Harness::new(vec![], engine, &[("vip@x.com", Some("response-required"))], false);

    let outcome = h.processor.process(&msg).await.unwrap();
    assert_eq!(outcome.label_names(), vec!["VIP", "response-required"]);
    assert_eq!(outcome.source_of("VIP"), Some(&DecisionSource::rule("vip")));
    assert!(!outcome.model_skipped);
    assert_eq!(
        h.events(),
        vec![
            "classify vip@x.com",
            "apply m1 VIP",
            "apply m1 response-required"
        ]
    );
}

#[tokio::test]
async fn invoice_rule_excludes_model_suggestion() {
    let engine = rules(
        r#"
rules:
  - name: invoices-need-action
    when: {subject: {contains_any: ["invoice"]}}
    actions: {exclude: [fyi]}
"#,
    );
    let msg = message("m1", "billing@vendor.com", "Your Invoice #42");
    let h = Harness::new(vec![], engine, &[("billing@vendor.com", Some("fyi"))], false);

    let outcome = h.processor.process(&msg).await.unwrap();
    assert!(outcome.final_labels.is_empty());
    let suggestion = outcome.suggestion.unwrap();
    assert_eq!(suggestion.label, "fyi");
    assert!(suggestion.discarded);
    assert_eq!(h.events(), vec!["classify billing@vendor.com"]);
}

#[tokio::test]
async fn classifier_failure_fails_only_its_message() {
    let msgs = vec![
        message("m1", "ok@x.com", "First"),
        message("m2", "broken@x.com", "Second"),
    ];
    let h = Harness::new(
        msgs,
        RulesEngine::empty(),
        &[("ok@x.com", Some("fyi")), ("broken@x.com", None)],
        false,
    );

    let report = h.processor.run(10).await.unwrap();
    assert_eq!(report.processed, 2);
    assert_eq!(report.succeeded, 1);
    assert_eq!(report.failed, 1);
    assert_eq!(report.classifications["fyi"], 1);
    assert_eq!(
        h.events(),
        vec!["classify ok@x.com", "apply m1 fyi", "classify broken@x.com"]
    );
}

#[tokio::test]
async fn composite_condition_matches_unlabeled_domain_mail() {
    let engine = rules(
        r#"
rules:
  - name: example-open
    when:
      all:
        - sender: {domains: ["example.com"]}
        - not: {existing_labels: {has_any: ["done"]}}
    actions: {add: [response-required]}
    terminate: true
"#,
    );
    let msg = message("m1", "a@example.com", "Question");
    let h = Harness::new(vec![], engine, &[], false);

    let outcome = h.processor.process(&msg).await.unwrap();
    assert_eq!(outcome.label_names(), vec!["response-required"]);
    assert!(outcome.model_skipped);
    assert_eq!(h.events(), vec!["apply m1 response-required"]);
}

// ── Laws ────────────────────────────────────────────────────────────

#[tokio::test]
async fn termination_stops_rules_and_model() {
    let engine = rules(
        r#"
rules:
  - name: newsletters
    when: {sender: {contains: "newsletter"}}
    actions: {add: [fyi]}
    terminate: true
  - name: never-reached
    actions: {add: [VIP]}
"#,
    );
    let msg = message("m1", "newsletter@shop.com", "Deals");
    let h = Harness::new(vec![], engine, &[("newsletter@shop.com", Some("VIP"))], false);

    let outcome = h.processor.process(&msg).await.unwrap();
    assert_eq!(outcome.label_names(), vec!["fyi"]);
    assert_eq!(outcome.rule_hits.len(), 1);
    assert!(outcome.suggestion.is_none());
    assert!(!h.events().iter().any(|e| e.starts_with("classify")));
}

#[tokio::test]
async fn labels_already_present_are_not_reapplied() {
    let mut msg = message("m1", "a@b.com", "Hi");
    msg.existing_labels = vec!["fyi".into()];
    let h = Harness::new(vec![], RulesEngine::empty(), &[("a@b.com", Some("fyi"))], false);

    let outcome = h.processor.process(&msg).await.unwrap();
    assert_eq!(outcome.label_names(), vec!["fyi"]);
    assert_eq!(outcome.already_present, vec!["fyi"]);
    assert_eq!(h.events(), vec!["classify a@b.com"]);
}

#[tokio::test]
async fn dry_run_reports_without_applying() {
    let engine = rules(
        r#"
- name: vip
  when: {sender: {in: ["vip@x.com"]}}
  actions: {add: [VIP]}
"#,
    );
    let msgs = vec![message("m1", "vip@x.com", "Hello")];
    let h = Harness::new(msgs, engine, &[("vip@x.com", Some("fyi"))], true);

    let report = h.processor.run(5).await.unwrap();
    assert_eq!(report.succeeded, 1);
    let outcome = &report.outcomes[0];
    assert!(outcome.dry_run);
    assert_eq!(outcome.applied, vec!["VIP", "fyi"]);
    assert_eq!(outcome.source_of("fyi"), Some(&DecisionSource::Llm));
    assert!(!h.events().iter().any(|e| e.starts_with("apply")));
}

#[tokio::test]
async fn unknown_rule_label_fails_message_and_batch_continues() {
    let engine = rules(
        r#"
rules:
  - name: typo
    when: {sender: {in: ["a@x.com"]}}
    actions: {add: ["Reciepts"]}
"#,
    );
    let msgs = vec![message("m1", "a@x.com", "One"), message("m2", "b@x.com", "Two")];
    let h = Harness::new(msgs, engine, &[("b@x.com", Some("fyi"))], false);

    let report = h.processor.run(10).await.unwrap();
    assert_eq!((report.processed, report.succeeded, report.failed), (2, 1, 1));
    assert_eq!(h.events(), vec!["classify b@x.com", "apply m2 fyi"]);
}

#[tokio::test]
async fn provider_label_outside_catalog_is_accepted() {
    let engine = rules(
        r#"
rules:
  - name: receipts
    when: {subject: "receipt"}
    actions: {add: [Receipts]}
    terminate: true
"#,
    );
    let msg = message("m1", "shop@x.com", "Your receipt");
    let h = Harness::new(vec![], engine, &[], false);

    let outcome = h.processor.process(&msg).await.unwrap();
    assert_eq!(outcome.label_names(), vec!["Receipts"]);
    assert_eq!(h.events(), vec!["apply m1 Receipts"]);
}

#[tokio::test]
async fn recipient_rules_use_mailbox_identity() {
    let engine = rules(
        r#"
rules:
  - name: cc-only
    when: {recipients: {cc_me: true, to_me: false}}
    actions: {add: [fyi]}
    terminate: true
"#,
    );
    let mut msg = message("m1", "peer@corp.com", "FYI");
    msg.to = vec!["team@corp.com".into()];
    msg.cc = vec!["Alias@Corp.com".into()];
    let h = Harness::new(vec![], engine, &[], false);

    let outcome = h.processor.process(&msg).await.unwrap();
    assert_eq!(outcome.label_names(), vec!["fyi"]);
}

#[tokio::test]
async fn zero_limit_touches_nothing() {
    let msgs = vec![message("m1", "a@b.com", "x")];
    let h = Harness::new(msgs, RulesEngine::empty(), &[("a@b.com", Some("fyi"))], false);

    let report = h.processor.run(0).await.unwrap();
    assert_eq!(report.processed, 0);
    assert!(report.outcomes.is_empty());
    assert!(h.events().is_empty());
}
