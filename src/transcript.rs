//! Chat export parsing.
//!
//! Two line formats start a message:
//!
//! ```text
//! [27/12/18, 12:31:08] Sender: Message     (bracketed, with seconds)
//! 9/9/24, 15:16 - Sender: Message           (dashed, without seconds)
//! ```
//!
//! Any other non-blank line continues the message being accumulated, unless
//! it starts with a bare date (a system notice such as "Messages are
//! encrypted", which is dropped) or no message has started yet.

use std::sync::OnceLock;

use regex::Regex;

/// How far into a document the timestamp sniffing looks.
const SNIFF_WINDOW: usize = 500;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptMessage {
    pub date: String,
    pub sender: String,
    pub body: String,
}

impl TranscriptMessage {
    /// The normalized form fed to the index.
    pub fn render(&self) -> String {
        format!("On {}, {} said: {}", self.date, self.sender, self.body)
    }
}

fn bracketed_line() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\[(\d{1,2}/\d{1,2}/\d{2,4}, \d{1,2}:\d{2}:\d{2})\] (.*?): (.*)")
            .expect("bracketed line pattern is valid")
    })
}

fn dashed_line() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(\d{1,2}/\d{1,2}/\d{2,4}, \d{1,2}:\d{2}) - (.*?): (.*)")
            .expect("dashed line pattern is valid")
    })
}

fn bare_date_prefix() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\[?\d{1,2}/\d{1,2}/\d{2,4}").expect("date prefix pattern is valid")
    })
}

fn timestamp_anywhere() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"\[\d{1,2}/\d{1,2}/\d{2,4}, \d{1,2}:\d{2}:\d{2}\]|\d{1,2}/\d{1,2}/\d{2,4}, \d{1,2}:\d{2} -",
        )
        .expect("timestamp pattern is valid")
    })
}

fn normalized_unit() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)^On (\d{1,2}/\d{1,2}/\d{2,4}, \d{1,2}:\d{2}(?::\d{2})?), (.*?) said: (.*)$")
            .expect("normalized unit pattern is valid")
    })
}

fn match_message_start(line: &str) -> Option<TranscriptMessage> {
    let caps = bracketed_line()
        .captures(line)
        .or_else(|| dashed_line().captures(line))?;
    Some(TranscriptMessage {
        date: caps[1].to_string(),
        sender: caps[2].to_string(),
        body: caps[3].to_string(),
    })
}

/// Split a raw export into messages, in order.
pub fn parse_messages(raw: &str) -> Vec<TranscriptMessage> {
    let mut messages = Vec::new();
    let mut current: Option<TranscriptMessage> = None;

    for line in raw.lines() {
        if let Some(started) = match_message_start(line) {
            if let Some(done) = current.replace(started) {
                messages.push(done);
            }
            continue;
        }

        if bare_date_prefix().is_match(line) || line.trim().is_empty() {
            continue;
        }
        if let Some(message) = current.as_mut() {
            message.body.push('\n');
            message.body.push_str(line);
        }
    }

    messages.extend(current);
    messages
}

/// Normalize a raw export: one `On {date}, {sender} said: {body}` unit per
/// message, separated by a blank line. Empty when no line carries a timestamp.
pub fn parse(raw: &str) -> String {
    let messages = parse_messages(raw);
    tracing::debug!(messages = messages.len(), "parsed transcript");
    messages
        .iter()
        .map(TranscriptMessage::render)
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Whether a timestamp prefix shows up near the start of `content`.
pub fn looks_like_transcript(content: &str) -> bool {
    let end = content
        .char_indices()
        .nth(SNIFF_WINDOW)
        .map_or(content.len(), |(idx, _)| idx);
    timestamp_anywhere().is_match(&content[..end])
}

/// Reverse of [`parse`]: recover messages from normalized text.
/// Returns `None` if any unit is not in normalized form.
pub fn split_normalized(text: &str) -> Option<Vec<TranscriptMessage>> {
    let units: Vec<&str> = text
        .split("\n\n")
        .filter(|unit| !unit.trim().is_empty())
        .collect();
    if units.is_empty() {
        return None;
    }
    units
        .into_iter()
        .map(|unit| {
            let caps = normalized_unit().captures(unit)?;
            Some(TranscriptMessage {
                date: caps[1].to_string(),
                sender: caps[2].to_string(),
                body: caps[3].to_string(),
            })
        })
        .collect()
}
