//! Subject syntax and wildcard matching.
//!
//! Subjects are dot-separated tokens. Subscription patterns may use `*` to
//! match exactly one token and a trailing `>` to match one or more tokens.

use crate::transport::TransportError;

/// Whether `subject` is a valid concrete subject (no wildcards, no empty tokens).
pub fn is_valid_subject(subject: &str) -> bool {
    !subject.is_empty()
        && subject
            .split('.')
            .all(|t| !t.is_empty() && t != "*" && t != ">" && !t.contains(char::is_whitespace))
}

/// Reject anything but a concrete subject as a publish target.
pub fn ensure_subject(subject: &str) -> Result<(), TransportError> {
    if is_valid_subject(subject) {
        Ok(())
    } else {
        Err(TransportError::InvalidSubject(subject.to_string()))
    }
}

/// Whether `pattern` is a valid subscription pattern.
pub fn is_valid_pattern(pattern: &str) -> bool {
    if pattern.is_empty() {
        return false;
    }
    let tokens: Vec<&str> = pattern.split('.').collect();
    tokens.iter().enumerate().all(|(i, t)| {
        !t.is_empty()
            && !t.contains(char::is_whitespace)
            && (*t != ">" || i == tokens.len() - 1)
    })
}

/// Whether a concrete `subject` matches a subscription `pattern`.
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
