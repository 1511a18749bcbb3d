//! Mail provider implementations.

pub mod gmail;
pub mod rfc822;

pub use gmail::{GmailClient, GmailConfig};
