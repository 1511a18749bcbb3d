//! RFC 822 decoding: addresses, readable text, and the parsed envelope.

use chrono::{DateTime, Utc};
use mail_parser::{Address, MessageParser};

use crate::error::MailError;

/// Subject used when the header is missing or blank.
pub const NO_SUBJECT: &str = "(No Subject)";

/// Headers and body pulled out of a raw message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedEmail {
    pub sender: String,
    pub sender_display: String,
    pub subject: String,
    pub content: String,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub date: Option<DateTime<Utc>>,
}

/// Parse raw RFC 822 bytes.
pub fn parse_message(id: &str, raw: &[u8]) -> Result<ParsedEmail, MailError> {
    let parsed = MessageParser::default()
        .parse(raw)
        .ok_or_else(|| MailError::InvalidMessage {
            id: id.to_string(),
            reason: "not an RFC 822 message".into(),
        })?;

    let (sender, sender_display) = extract_sender(parsed.from());
    let subject = parsed
        .subject()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(NO_SUBJECT)
        .to_string();

    Ok(ParsedEmail {
        sender,
        sender_display,
        subject,
        content: extract_text(&parsed),
        to: extract_addresses(parsed.to()),
        cc: extract_addresses(parsed.cc()),
        bcc: extract_addresses(parsed.bcc()),
        date: parsed
            .date()
            .and_then(|d| DateTime::from_timestamp(d.to_timestamp(), 0)),
    })
}

/// Sender address (lower-cased) and a display string (`Name <addr>`).
fn extract_sender(from: Option<&Address>) -> (String, String) {
    let Some(first) = from.and_then(|a| a.first()) else {
        return (String::new(), "Unknown".to_string());
    };
    let address = first
        .address
        .as_deref()
        .map(|a| a.trim().to_lowercase())
        .unwrap_or_default();
    let display = match first.name.as_deref().map(str::trim) {
        Some(name) if !name.is_empty() && !address.is_empty() => format!("{name} <{address}>"),
        Some(name) if !name.is_empty() => name.to_string(),
        _ => address.clone(),
    };
    (address, display)
}

/// Extract lower-cased email addresses from an optional address header.
///
/// Returns an empty vec if the header is missing.
pub fn extract_addresses(addr: Option<&Address>) -> Vec<String> {
    let Some(addr) = addr else {
        return Vec::new();
    };
    let lowered = |a: &mail_parser::Addr| {
        a.address
            .as_deref()
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
    };
    match addr {
        Address::List(addrs) => addrs.iter().filter_map(lowered).collect(),
        Address::Group(groups) => groups
            .iter()
            .flat_map(|g| g.addresses.iter().filter_map(lowered))
            .collect(),
    }
}

/// Plain-text body, falling back to the HTML body with tags stripped.
fn extract_text(parsed: &mail_parser::Message) -> String {
    if let Some(text) = parsed.body_text(0) {
        return text.trim().to_string();
    }
    if let Some(html) = parsed.body_html(0) {
        return strip_html(html.as_ref());
    }
    String::new()
}

/// Strip HTML tags from content (basic).
pub fn strip_html(html: &str) -> String {
    let mut result = String::new();
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => {
                in_tag = false;
                result.push(' ');
            }
            _ if !in_tag => result.push(ch),
            _ => {}
        }
    }
    result.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// First `max_chars` characters of `text`, for previews.
pub fn preview(text: &str, max_chars: usize) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .chars()
        .take(max_chars)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const PLAIN: &str = "From: Alice Smith <Alice@Example.com>\r\n\
To: me@corp.com, Team <team@corp.com>\r\n\
Cc: boss@corp.com\r\n\
Subject: Quarterly review\r\n\
Date: Mon, 2 Feb 2026 10:00:00 +0000\r\n\
Content-Type: text/plain; charset=utf-8\r\n\
\r\n\
Please review the attached numbers.\r\n";

    #[test]
    fn parses_plain_message() {
        let email = parse_message("m1", PLAIN.as_bytes()).unwrap();
        assert_eq!(email.sender, "alice@example.com");
        assert_eq!(email.sender_display, "Alice Smith <alice@example.com>");
        assert_eq!(email.subject, "Quarterly review");
        assert_eq!(email.to, vec!["me@corp.com", "team@corp.com"]);
        assert_eq!(email.cc, vec!["boss@corp.com"]);
        assert!(email.bcc.is_empty());
        assert_eq!(email.content, "Please review the attached numbers.");
        assert_eq!(
            email.date.unwrap().to_rfc3339(),
            "2026-02-02T10:00:00+00:00"
        );
    }

    #[test]
    fn missing_subject_gets_placeholder() {
        let raw = "From: a@b.com\r\nTo: me@corp.com\r\n\r\nHi\r\n";
        let email = parse_message("m2", raw.as_bytes()).unwrap();
        assert_eq!(email.subject, NO_SUBJECT);
        assert_eq!(email.sender_display, "a@b.com");
    }

    #[test]
    fn missing_from_is_unknown() {
        let raw = "Subject: x\r\n\r\nbody\r\n";
        let email = parse_message("m3", raw.as_bytes()).unwrap();
        assert_eq!(email.sender, "");
        assert_eq!(email.sender_display, "Unknown");
    }

    #[test]
    fn strip_html_basic() {
        assert_eq!(strip_html("<p>Hello <b>world</b></p>"), "Hello world");
    }

    #[test]
    fn strip_html_with_attributes() {
        assert_eq!(
            strip_html(r#"<a href="https://x.com">link</a><br/>next"#),
            "link next"
        );
    }

    #[test]
    fn strip_html_empty() {
        assert_eq!(strip_html(""), "");
    }

    #[test]
    fn extract_addresses_none() {
        assert!(extract_addresses(None).is_empty());
    }

    #[test]
    fn preview_collapses_whitespace() {
        assert_eq!(preview("a\n\n  b   c", 4), "a b ");
        assert_eq!(preview("short", 100), "short");
    }
}
