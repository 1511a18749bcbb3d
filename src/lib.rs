//! Inbox triage: deterministic rules plus an LLM classifier, labeling mail.

pub mod channels;
pub mod config;
pub mod error;
pub mod llm;
pub mod logging;
pub mod pipeline;

pub use error::{Error, Result};
