//! Inbox triage pipeline.
//!
//! Every candidate message flows through:
//! 1. `MailProvider::fetch_message()`: provider I/O
//! 2. `RulesEngine::run()`: deterministic conditions, no LLM
//! 3. `Classifier::classify()`: one label from the catalog, unless a rule terminated
//! 4. `LabelLedger`: last-write-wins decisions with provenance; excludes block the model
//!
//! Only labels the message does not already carry are applied.

pub mod condition;
pub mod context;
pub mod ledger;
pub mod loader;
pub mod processor;
pub mod rules;
pub mod types;
