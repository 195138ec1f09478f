pub mod jetstream;
pub mod memory;
pub mod retry;
pub mod types;

pub use jetstream::JetStreamSubstrate;
pub use memory::MemorySubstrate;
pub use retry::Backoff;
pub use types::*;

use crate::error::EngineResult;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::time::Duration;

/// Durable, subject-addressed append-only log with pull-consumers.
///
/// Every stage boundary in the engine is one of these; tasks never hand
/// records to each other through in-process channels.
#[async_trait]
pub trait Substrate: Send + Sync {
    /// Idempotent: re-creating an existing stream with the same subject
    /// succeeds.
    async fn create_stream(&self, spec: StreamSpec) -> EngineResult<()>;

    async fn delete_stream(&self, name: &str) -> EngineResult<()>;

    /// Durably append; resolves with the assigned stream sequence only
    /// once the substrate has accepted the record.
    async fn publish(
        &self,
        subject: &str,
        payload: Bytes,
        headers: &BTreeMap<String, String>,
    ) -> EngineResult<u64>;

    /// Idempotent for an identical spec.
    async fn create_consumer(&self, spec: ConsumerSpec)
    -> EngineResult<Box<dyn SubstrateConsumer>>;
}

/// A named durable cursor over one stream.
#[async_trait]
pub trait SubstrateConsumer: Send {
    /// Block up to `max_wait` for up to `max_batch` records; may return an
    /// empty batch. Delivery is in ascending sequence order for fresh
    /// records; redeliveries may interleave.
    async fn fetch(&mut self, max_batch: usize, max_wait: Duration) -> EngineResult<Vec<Record>>;

    /// Under the cumulative policy this acks every sequence <= the record's.
    async fn ack(&mut self, record: &Record) -> EngineResult<()>;

    /// Negative-ack: schedule redelivery after `delay` (immediately when
    /// None).
    async fn nak(&mut self, record: &Record, delay: Option<Duration>) -> EngineResult<()>;

    /// Terminal: never redeliver.
    async fn term(&mut self, record: &Record) -> EngineResult<()>;

    /// Records on the stream not yet acked by this consumer.
    async fn lag(&mut self) -> EngineResult<u64>;
}
