//! Abstract message-bus interface.
//!
//! The gateway core consumes the bus through this trait only: an
//! at-least-once request/reply and topic-based publish/subscribe with
//! NATS-style subjects. The concrete NATS client and the in-process
//! [`mock::MockBus`] both implement it.

pub mod mock;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

pub use mock::{MockBus, MockRequest};

/// An inbound message on a subscribed subject.
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub subject: String,
    pub payload: Bytes,
}

/// Bus transport errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BusError {
    /// The request deadline elapsed before a reply arrived.
    #[error("request timed out")]
    Timeout,
    /// The connection is gone.
    #[error("bus connection closed")]
    Closed,
    #[error("bus error: {0}")]
    Other(String),
}

/// The capabilities the gateway needs from the message bus.
#[async_trait]
pub trait BusClient: Send + Sync {
    /// Send a request and await a single reply.
    async fn request(&self, subject: &str, payload: Bytes) -> Result<Bytes, BusError>;

    /// Subscribe to a subject pattern. The subscription ends when the
    /// returned stream is dropped.
    async fn subscribe(&self, pattern: &str) -> Result<BoxStream<'static, BusMessage>, BusError>;
}

/// Check if a subject pattern matches a concrete subject.
///
/// Pattern syntax:
/// - `*` matches exactly one segment
/// - `>` matches one or more segments (greedy, only at end)
/// - Literal segments match exactly
pub fn matches_subject(pattern: &str, subject: &str) -> bool {
    let pattern_parts: Vec<&str> = pattern.split('.').collect();
    let subject_parts: Vec<&str> = subject.split('.').collect();

    let mut pi = 0;
    let mut si = 0;

    while pi < pattern_parts.len() && si < subject_parts.len() {
        let p = pattern_parts[pi];

        if p == ">" {
            // Greedy match: consumes the rest of the subject.
            return si < subject_parts.len();
        } else if p == "*" || p == subject_parts[si] {
            pi += 1;
            si += 1;
        } else {
            return false;
        }
    }

    pi == pattern_parts.len() && si == subject_parts.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_match() {
        assert!(matches_subject("event.test.model.change", "event.test.model.change"));
        assert!(!matches_subject("event.test.model.change", "event.test.model.add"));
    }

    #[test]
    fn single_wildcard() {
        assert!(matches_subject("event.test.model.*", "event.test.model.change"));
        assert!(matches_subject("event.*.model.change", "event.test.model.change"));
        assert!(!matches_subject("event.test.model.*", "event.test.model.change.extra"));
    }

    #[test]
    fn greedy_wildcard() {
        assert!(matches_subject("event.>", "event.test.model.change"));
        assert!(matches_subject(">", "event.test"));
        assert!(!matches_subject("event.test.model.change.>", "event.test.model.change"));
    }

    #[test]
    fn mixed_wildcards() {
        assert!(matches_subject("event.*.>", "event.test.model.change"));
    }
}
