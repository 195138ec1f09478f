use bytes::Bytes;
use std::collections::BTreeMap;
use std::time::Duration;

/// Reserved header naming the schema version a payload was produced under.
pub const SCHEMA_VERSION_HEADER: &str = "schema_version_id";

/// Header carrying the arrival timestamp (epoch ms) of a joined record.
pub const ARRIVAL_MS_HEADER: &str = "arrival_ms";

/// Record identity: (stream, sequence). Ack/Nak/Term operate on this.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecordId {
    pub stream: String,
    pub sequence: u64,
}

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.stream, self.sequence)
    }
}

/// A delivered message: opaque payload plus delivery metadata.
#[derive(Debug, Clone)]
pub struct Record {
    pub id: RecordId,
    pub subject: String,
    pub payload: Bytes,
    pub headers: BTreeMap<String, String>,
    /// 1 on first delivery, incremented by the substrate on each redelivery.
    pub delivery_count: u32,
    /// Backend ack routing token (JetStream reply subject); None for
    /// backends that ack by identity alone.
    pub reply: Option<String>,
}

impl Record {
    pub fn schema_version(&self) -> Option<&str> {
        self.headers.get(SCHEMA_VERSION_HEADER).map(|s| s.as_str())
    }
}

/// How a consumer acknowledges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckPolicy {
    /// Each record acked individually.
    Explicit,
    /// Acking sequence K acks all <= K on the consumer.
    Cumulative,
}

/// Stream creation parameters.
#[derive(Debug, Clone)]
pub struct StreamSpec {
    pub name: String,
    pub subject: String,
    /// Age-based retention; None keeps records until deleted.
    pub ttl: Option<Duration>,
}

/// Durable consumer parameters.
#[derive(Debug, Clone)]
pub struct ConsumerSpec {
    pub stream: String,
    pub name: String,
    pub filter_subject: Option<String>,
    pub ack_policy: AckPolicy,
    /// Time the substrate waits for an ack before redelivering.
    pub ack_wait: Duration,
    /// Cap on total delivery attempts; 0 means unlimited.
    pub max_deliver: u32,
}

/// NATS-style subject match: `.`-separated tokens, `*` matches one token,
/// `>` matches the rest.
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pat = pattern.split('.');
    let mut sub = subject.split('.');
    loop {
        match (pat.next(), sub.next()) {
            (Some(">"), _) => return true,
            (Some("*"), Some(_)) => continue,
            (Some(p), Some(s)) if p == s => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subject_matching() {
        assert!(subject_matches("ingest.users", "ingest.users"));
        assert!(subject_matches("ingest.*", "ingest.users"));
        assert!(subject_matches("ingest.>", "ingest.users.v2"));
        assert!(!subject_matches("ingest.*", "ingest.users.v2"));
        assert!(!subject_matches("ingest.users", "ingest.orders"));
        assert!(!subject_matches("ingest.users.v2", "ingest.users"));
    }

    #[test]
    fn schema_version_header_lookup() {
        let mut headers = BTreeMap::new();
        headers.insert(SCHEMA_VERSION_HEADER.to_string(), "v2".to_string());
        let rec = Record {
            id: RecordId {
                stream: "users".into(),
                sequence: 1,
            },
            subject: "ingest.users".into(),
            payload: Bytes::new(),
            headers,
            delivery_count: 1,
            reply: None,
        };
        assert_eq!(rec.schema_version(), Some("v2"));
    }
}
