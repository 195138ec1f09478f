//! Dead-letter routing.
//!
//! Poison records are published to a dedicated DLQ stream so the pipeline
//! keeps moving. The original payload is carried verbatim as the DLQ
//! message body; diagnostics travel in headers. Losing a DLQ record would
//! silently drop data, so publishes retry indefinitely.

use crate::config::DlqConfig;
use crate::error::{EngineError, EngineResult, FailureKind};
use crate::metrics::PipelineMetrics;
use crate::substrate::{Backoff, Record, Substrate};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

pub const DLQ_STAGE_HEADER: &str = "dlq_stage";
pub const DLQ_REASON_KIND_HEADER: &str = "dlq_reason_kind";
pub const DLQ_REASON_MESSAGE_HEADER: &str = "dlq_reason_message";
pub const DLQ_ORIGINAL_SUBJECT_HEADER: &str = "dlq_original_subject";
pub const DLQ_ORIGINAL_STREAM_HEADER: &str = "dlq_original_stream";
pub const DLQ_ORIGINAL_SEQUENCE_HEADER: &str = "dlq_original_sequence";
pub const DLQ_DELIVERY_COUNT_HEADER: &str = "dlq_delivery_count";

/// Stage that gave up on the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Mapper,
    Join,
    Sink,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Mapper => "mapper",
            Stage::Join => "join",
            Stage::Sink => "sink",
        }
    }
}

#[derive(Clone)]
pub struct DlqRouter {
    substrate: Arc<dyn Substrate>,
    subject: String,
    metrics: PipelineMetrics,
}

impl DlqRouter {
    pub fn new(
        substrate: Arc<dyn Substrate>,
        config: &DlqConfig,
        metrics: PipelineMetrics,
    ) -> Self {
        Self {
            substrate,
            subject: config.subject.clone(),
            metrics,
        }
    }

    /// Publish the record to the DLQ stream. Retries forever with backoff;
    /// the only non-success exit is cancellation, which leaves the source
    /// record unacked for redelivery.
    pub async fn route(
        &self,
        record: &Record,
        stage: Stage,
        kind: FailureKind,
        message: &str,
        cancel: &CancellationToken,
    ) -> EngineResult<()> {
        let mut headers = BTreeMap::new();
        headers.insert(DLQ_STAGE_HEADER.to_string(), stage.as_str().to_string());
        headers.insert(DLQ_REASON_KIND_HEADER.to_string(), kind.as_str().to_string());
        headers.insert(DLQ_REASON_MESSAGE_HEADER.to_string(), message.to_string());
        headers.insert(
            DLQ_ORIGINAL_SUBJECT_HEADER.to_string(),
            record.subject.clone(),
        );
        headers.insert(
            DLQ_ORIGINAL_STREAM_HEADER.to_string(),
            record.id.stream.clone(),
        );
        headers.insert(
            DLQ_ORIGINAL_SEQUENCE_HEADER.to_string(),
            record.id.sequence.to_string(),
        );
        headers.insert(
            DLQ_DELIVERY_COUNT_HEADER.to_string(),
            record.delivery_count.to_string(),
        );

        let mut backoff = Backoff::dlq();
        loop {
            match self
                .substrate
                .publish(&self.subject, record.payload.clone(), &headers)
                .await
            {
                Ok(_) => {
                    self.metrics.inc_dlq(kind.as_str());
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        record = %record.id,
                        stage = stage.as_str(),
                        error = %e,
                        "DLQ publish failed, retrying"
                    );
                    // Unbounded policy: next_delay never runs dry.
                    let delay = backoff
                        .next_delay()
                        .unwrap_or_else(|| std::time::Duration::from_secs(30));
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::substrate::types::{RecordId, StreamSpec};
    use crate::substrate::{AckPolicy, ConsumerSpec, MemorySubstrate, SubstrateConsumer};
    use bytes::Bytes;
    use std::time::Duration;

    fn record(payload: &'static [u8]) -> Record {
        Record {
            id: RecordId {
                stream: "users".into(),
                sequence: 7,
            },
            subject: "ingest.users".into(),
            payload: Bytes::from_static(payload),
            headers: BTreeMap::new(),
            delivery_count: 3,
            reply: None,
        }
    }

    #[tokio::test]
    async fn routed_record_carries_payload_and_diagnostics() {
        let substrate = Arc::new(MemorySubstrate::new());
        substrate
            .create_stream(StreamSpec {
                name: "dlq".into(),
                subject: "dlq.pl-1".into(),
                ttl: None,
            })
            .await
            .unwrap();

        let config = DlqConfig {
            stream: "dlq".into(),
            subject: "dlq.pl-1".into(),
            max_deliver: 5,
        };
        let router = DlqRouter::new(
            substrate.clone(),
            &config,
            PipelineMetrics::new("pl-1"),
        );

        let cancel = CancellationToken::new();
        router
            .route(
                &record(b"{\"id\":\"oops\"}"),
                Stage::Mapper,
                FailureKind::SchemaCoercion,
                "'oops' is not a uuid",
                &cancel,
            )
            .await
            .unwrap();

        let mut consumer = substrate
            .create_consumer(ConsumerSpec {
                stream: "dlq".into(),
                name: "inspect".into(),
                filter_subject: None,
                ack_policy: AckPolicy::Explicit,
                ack_wait: Duration::from_secs(30),
                max_deliver: 0,
            })
            .await
            .unwrap();
        let records = consumer.fetch(10, Duration::from_millis(50)).await.unwrap();
        assert_eq!(records.len(), 1);

        let dlq = &records[0];
        // Payload is the original, verbatim.
        assert_eq!(dlq.payload.as_ref(), b"{\"id\":\"oops\"}");
        assert_eq!(dlq.headers[DLQ_REASON_KIND_HEADER], "SchemaCoercionError");
        assert_eq!(dlq.headers[DLQ_STAGE_HEADER], "mapper");
        assert_eq!(dlq.headers[DLQ_ORIGINAL_STREAM_HEADER], "users");
        assert_eq!(dlq.headers[DLQ_ORIGINAL_SEQUENCE_HEADER], "7");
        assert_eq!(dlq.headers[DLQ_DELIVERY_COUNT_HEADER], "3");
    }
}
