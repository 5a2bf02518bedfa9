//! Message header map and well-known header names.

use std::collections::BTreeMap;

/// Serialization format identifier.
pub const CONTENT_TYPE: &str = "content-type";
/// Schema identity of the payload.
pub const MESSAGE_TYPE: &str = "message-type";
/// Idempotency / deduplication key, forwarded unchanged across retries.
pub const MSG_ID: &str = "Msg-Id";
/// W3C trace context.
pub const TRACEPARENT: &str = "traceparent";
/// Set to `true` on the last chunk of a stream.
pub const STREAM_FINAL: &str = "stream-final";
/// Zero-based chunk sequence number.
pub const STREAM_SEQ: &str = "stream-seq";
/// Present on a chunk that terminates the stream with an error.
pub const STREAM_ERROR: &str = "stream-error";
/// Present on an empty end-of-stream marker.
pub const STREAM_END: &str = "stream-end";

/// String-keyed message headers.
///
/// Backed by a sorted map so iteration order, and therefore anything derived
/// from it, is stable.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(BTreeMap<String, String>);

impl Headers {
    /// Create an empty header map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a header, replacing any previous value.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.insert(name.into(), value.into());
    }

    /// Look up a header value.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    /// Remove a header, returning its value.
    pub fn remove(&mut self, name: &str) -> Option<String> {
        self.0.remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate headers in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Copy every header from `other`, overwriting on conflict.
    pub fn extend(&mut self, other: &Headers) {
        for (k, v) in other.iter() {
            self.insert(k, v);
        }
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut headers = Headers::new();
        for (k, v) in iter {
            headers.insert(k, v);
        }
        headers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_replaces() {
        let mut headers = Headers::new();
        headers.insert(MSG_ID, "a");
        headers.insert(MSG_ID, "b");
        assert_eq!(headers.get(MSG_ID), Some("b"));
        assert_eq!(headers.len(), 1);
    }

    #[test]
    fn test_iteration_is_sorted() {
        let headers: Headers = [("zeta", "1"), ("alpha", "2"), ("mid", "3")]
            .into_iter()
            .collect();
        let names: Vec<&str> = headers.iter().map(|(k, _)| k).collect();
        assert_eq!(names, vec!["alpha", "mid", "zeta"]);
    }
}
