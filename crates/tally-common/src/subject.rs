//! Broker subjects and wildcard matching
//!
//! Subjects are dot-separated tokens. Patterns follow NATS rules: `*` matches
//! exactly one token, `>` matches one or more trailing tokens.

use crate::types::Event;

/// Root token of every event subject
pub const EVENTS_PREFIX: &str = "events";

/// Token reserved for the dead-letter namespace under [`EVENTS_PREFIX`]
pub const ERRORS_TOKEN: &str = "errors";

/// Pattern matching every key or subject
pub const MATCH_ALL: &str = ">";

/// Subject an accepted event is published under
pub fn event_subject(event: &Event) -> String {
    format!("{}.{}", EVENTS_PREFIX, event.key())
}

/// Subject a failed event is republished to
pub fn dead_letter_subject(event: &Event) -> String {
    format!("{}.{}.{}", EVENTS_PREFIX, ERRORS_TOKEN, event.key())
}

/// Consumer filter selecting all events of one type
pub fn event_type_filter(event_type: &str) -> String {
    format!("{}.{}.>", EVENTS_PREFIX, event_type)
}

/// Whether `s` is usable as a single subject / key token
pub fn is_token(s: &str) -> bool {
    !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Match a subject (or KV key) against a wildcard pattern
pub fn matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');

    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => continue,
            (Some(p), Some(s)) if p == s => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}
