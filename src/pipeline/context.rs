//! Per-message rule evaluation context.

use std::collections::HashSet;

use crate::pipeline::ledger::LabelLedger;
use crate::pipeline::types::{InboundMessage, MailboxIdentity, domain_of};

/// Normalized snapshot of one message, plus its label ledger.
///
/// Text fields and addresses are lower-cased once here so conditions can
/// compare without re-normalizing. Only `decisions` changes while rules run.
#[derive(Debug)]
pub struct RuleContext<'a> {
    pub sender: String,
    pub sender_display: String,
    pub subject: String,
    pub content: String,
    pub snippet: String,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    /// `to`, then `cc`, then `bcc`.
    pub all_recipients: Vec<String>,
    pub existing_labels: HashSet<String>,
    pub my_addresses: &'a HashSet<String>,
    pub primary_domain: String,
    pub decisions: LabelLedger<'a>,
}

impl<'a> RuleContext<'a> {
    pub fn new(
        message: &InboundMessage,
        identity: &'a MailboxIdentity,
        decisions: LabelLedger<'a>,
    ) -> Self {
        let to = lower_all(&message.to);
        let cc = lower_all(&message.cc);
        let bcc = lower_all(&message.bcc);
        let all_recipients = to.iter().chain(&cc).chain(&bcc).cloned().collect();

        Self {
            sender: message.sender.trim().to_lowercase(),
            sender_display: message.sender_display.clone(),
            subject: message.subject.to_lowercase(),
            content: message.content.to_lowercase(),
            snippet: message.snippet.to_lowercase(),
            to,
            cc,
            bcc,
            all_recipients,
            existing_labels: message.existing_labels.iter().cloned().collect(),
            my_addresses: identity.addresses(),
            primary_domain: identity.primary_domain().to_string(),
            decisions,
        }
    }

    /// Domain of the sender address, empty when it has none.
    pub fn sender_domain(&self) -> &str {
        domain_of(&self.sender)
    }

    pub fn is_me(&self, address: &str) -> bool {
        self.my_addresses.contains(address)
    }
}

fn lower_all(addresses: &[String]) -> Vec<String> {
    addresses
        .iter()
        .map(|a| a.trim().to_lowercase())
        .filter(|a| !a.is_empty())
        .collect()
}
