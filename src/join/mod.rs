//! Temporal equi-join operator.
//!
//! Two side fetchers feed a single state-owner task; the owner holds
//! [`JoinState`] exclusively, which keeps eviction ordering deterministic
//! and needs no locking. Acks travel back to the fetcher that pulled the
//! record, so each consumer stays owned by one task.
//!
//! Output records are published durably to the join output subject before
//! the source record is acked; on restart, unacked records replay and
//! rebuild the (ephemeral) state.

pub mod state;

pub use state::{JoinEntry, JoinState, Side};

use crate::dlq::{DlqRouter, Stage};
use crate::error::{EngineError, EngineResult, FailureKind};
use crate::metrics::PipelineMetrics;
use crate::pipeline::PauseGate;
use crate::pipeline::health::HealthCounters;
use crate::substrate::retry::ack_with_retry;
use crate::substrate::types::{ARRIVAL_MS_HEADER, ConsumerSpec, Record};
use crate::substrate::{Backoff, Substrate, SubstrateConsumer};
use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// One input side: the stream it consumes, its join key, and how long its
/// records stay eligible to match.
#[derive(Debug, Clone)]
pub struct JoinSideSpec {
    pub stream: String,
    pub consumer: ConsumerSpec,
    pub key_field: String,
    /// Declared field names; these (and only these) appear in the output
    /// under `<stream>.<field>` keys.
    pub fields: Vec<String>,
    pub ttl: Duration,
}

pub struct JoinOperator {
    pub substrate: Arc<dyn Substrate>,
    pub dlq: DlqRouter,
    pub metrics: PipelineMetrics,
    pub counters: Arc<HealthCounters>,
    pub left: JoinSideSpec,
    pub right: JoinSideSpec,
    pub output_subject: String,
    pub fetch_batch: usize,
    pub fetch_wait: Duration,
    pub pause: PauseGate,
}

struct Arrived {
    side: Side,
    record: Record,
    /// Monotonic arrival, sampled once on entry; drives TTL eviction.
    arrival: Instant,
    wall_ms: i64,
}

impl JoinOperator {
    pub async fn run(self, cancel: CancellationToken) -> EngineResult<()> {
        // A child token lets a dying fetcher wind the whole operator down.
        let child = cancel.child_token();

        let left_consumer = self.substrate.create_consumer(self.left.consumer.clone()).await?;
        let right_consumer = self
            .substrate
            .create_consumer(self.right.consumer.clone())
            .await?;

        let (record_tx, mut record_rx) = mpsc::channel::<Arrived>(1024);
        let (left_ack_tx, left_ack_rx) = mpsc::unbounded_channel::<Record>();
        let (right_ack_tx, right_ack_rx) = mpsc::unbounded_channel::<Record>();

        let left_task = tokio::spawn(side_fetcher(
            left_consumer,
            Side::Left,
            record_tx.clone(),
            left_ack_rx,
            self.fetch_batch,
            self.fetch_wait,
            self.pause.clone(),
            child.clone(),
        ));
        let right_task = tokio::spawn(side_fetcher(
            right_consumer,
            Side::Right,
            record_tx,
            right_ack_rx,
            self.fetch_batch,
            self.fetch_wait,
            self.pause.clone(),
            child.clone(),
        ));

        // State owner. Runs until both fetchers dropped their senders and
        // the queue is drained, which covers graceful-shutdown draining.
        let mut state = JoinState::new(self.left.ttl, self.right.ttl);
        let mut fatal: Option<EngineError> = None;
        while let Some(arrived) = record_rx.recv().await {
            match self
                .process(&mut state, arrived, &left_ack_tx, &right_ack_tx, &child)
                .await
            {
                Ok(()) => {}
                Err(EngineError::Cancelled) => break,
                Err(e) => {
                    child.cancel();
                    fatal = Some(e);
                    break;
                }
            }
        }
        // Let the fetchers apply the remaining acks and exit.
        drop(left_ack_tx);
        drop(right_ack_tx);

        let left_res = left_task.await?;
        let right_res = right_task.await?;
        if let Some(e) = fatal {
            return Err(e);
        }
        left_res?;
        right_res?;
        debug!(state_empty = state.is_empty(), "join operator stopped");
        Ok(())
    }

    fn side_spec(&self, side: Side) -> &JoinSideSpec {
        match side {
            Side::Left => &self.left,
            Side::Right => &self.right,
        }
    }

    async fn process(
        &self,
        state: &mut JoinState,
        arrived: Arrived,
        left_ack: &mpsc::UnboundedSender<Record>,
        right_ack: &mpsc::UnboundedSender<Record>,
        cancel: &CancellationToken,
    ) -> EngineResult<()> {
        let Arrived {
            side,
            record,
            arrival,
            wall_ms,
        } = arrived;

        self.counters.add_records_in(1);
        self.metrics.inc_records_in("join", 1);
        if record.delivery_count > 1 {
            self.metrics.inc_redeliveries(1);
        }

        let spec = self.side_spec(side);
        let ack_tx = match side {
            Side::Left => left_ack,
            Side::Right => right_ack,
        };

        let payload: serde_json::Value = match serde_json::from_slice(&record.payload) {
            Ok(v @ serde_json::Value::Object(_)) => v,
            _ => {
                self.dead_letter(&record, "payload is not a JSON object", cancel)
                    .await?;
                let _ = ack_tx.send(record);
                return Ok(());
            }
        };

        let key = match payload.get(&spec.key_field) {
            Some(v) if !v.is_null() => json_key(v),
            _ => {
                self.dead_letter(
                    &record,
                    &format!("join key field '{}' missing", spec.key_field),
                    cancel,
                )
                .await?;
                let _ = ack_tx.send(record);
                return Ok(());
            }
        };

        // Expired entries must be gone before the probe reads them.
        state.evict(arrival);

        let left_spec = self.side_spec(Side::Left);
        let right_spec = self.side_spec(Side::Right);
        for entry in state.probe(side, &key) {
            let (left_payload, right_payload, entry_wall) = match side {
                Side::Left => (&payload, &entry.payload, entry.wall_ms),
                Side::Right => (&entry.payload, &payload, entry.wall_ms),
            };
            let output = joined_payload(left_spec, left_payload, right_spec, right_payload);

            let mut headers = BTreeMap::new();
            headers.insert(
                ARRIVAL_MS_HEADER.to_string(),
                wall_ms.max(entry_wall).to_string(),
            );

            match self
                .publish_joined(Bytes::from(output.to_string()), &headers, cancel)
                .await
            {
                Ok(_) => self.metrics.inc_join_emitted(1),
                Err(EngineError::Cancelled) => return Err(EngineError::Cancelled),
                Err(e) => {
                    // Retries exhausted: dead-letter both inputs so neither
                    // half of the pair vanishes, then move on.
                    warn!(record = %record.id, error = %e, "join publish exhausted retries");
                    let reason = e.to_string();
                    self.dlq
                        .route(&record, Stage::Join, FailureKind::JoinPublish, &reason, cancel)
                        .await?;
                    let partner = entry_as_record(entry);
                    self.dlq
                        .route(&partner, Stage::Join, FailureKind::JoinPublish, &reason, cancel)
                        .await?;
                    self.counters.add_dlq(2);
                    let _ = ack_tx.send(record);
                    return Ok(());
                }
            }
        }

        state.append(
            side,
            key,
            JoinEntry {
                arrival,
                wall_ms,
                raw: record.payload.clone(),
                payload,
                identity: record.id.clone(),
                subject: record.subject.clone(),
                delivery_count: record.delivery_count,
            },
        );
        let _ = ack_tx.send(record);
        Ok(())
    }

    async fn dead_letter(
        &self,
        record: &Record,
        reason: &str,
        cancel: &CancellationToken,
    ) -> EngineResult<()> {
        self.dlq
            .route(
                record,
                Stage::Join,
                FailureKind::SchemaCoercion,
                reason,
                cancel,
            )
            .await?;
        self.counters.add_dlq(1);
        Ok(())
    }

    async fn publish_joined(
        &self,
        payload: Bytes,
        headers: &BTreeMap<String, String>,
        cancel: &CancellationToken,
    ) -> EngineResult<u64> {
        let mut backoff = Backoff::transport();
        loop {
            match self
                .substrate
                .publish(&self.output_subject, payload.clone(), headers)
                .await
            {
                Ok(sequence) => return Ok(sequence),
                Err(e) => match backoff.next_delay() {
                    Some(delay) => {
                        warn!(error = %e, "join output publish failed, backing off");
                        tokio::select! {
                            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                    None => {
                        return Err(EngineError::RetryExhausted {
                            attempts: backoff.attempts(),
                            last_error: e.to_string(),
                        });
                    }
                },
            }
        }
    }
}

/// `{"<leftStream>.<field>": ..., "<rightStream>.<field>": ...}`, declared
/// fields only; fields absent from a payload stay absent in the output.
fn joined_payload(
    left: &JoinSideSpec,
    left_payload: &serde_json::Value,
    right: &JoinSideSpec,
    right_payload: &serde_json::Value,
) -> serde_json::Value {
    let mut out = serde_json::Map::new();
    for (spec, payload) in [(left, left_payload), (right, right_payload)] {
        for field in &spec.fields {
            if let Some(value) = payload.get(field) {
                out.insert(format!("{}.{}", spec.stream, field), value.clone());
            }
        }
    }
    serde_json::Value::Object(out)
}

/// Join keys compare by raw string for string values and by JSON rendering
/// otherwise, so `"1"` and `1` stay distinct keys.
fn json_key(v: &serde_json::Value) -> String {
    match v {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn entry_as_record(entry: &JoinEntry) -> Record {
    Record {
        id: entry.identity.clone(),
        subject: entry.subject.clone(),
        payload: entry.raw.clone(),
        headers: BTreeMap::new(),
        delivery_count: entry.delivery_count,
        reply: None,
    }
}

#[allow(clippy::too_many_arguments)]
async fn side_fetcher(
    consumer: Box<dyn SubstrateConsumer>,
    side: Side,
    record_tx: mpsc::Sender<Arrived>,
    ack_rx: mpsc::UnboundedReceiver<Record>,
    fetch_batch: usize,
    fetch_wait: Duration,
    pause: PauseGate,
    cancel: CancellationToken,
) -> EngineResult<()> {
    let res = side_fetcher_inner(
        consumer, side, record_tx, ack_rx, fetch_batch, fetch_wait, pause, &cancel,
    )
    .await;
    if res.is_err() {
        // Take the whole operator down rather than limping on one side.
        cancel.cancel();
    }
    res
}

#[allow(clippy::too_many_arguments)]
async fn side_fetcher_inner(
    mut consumer: Box<dyn SubstrateConsumer>,
    side: Side,
    record_tx: mpsc::Sender<Arrived>,
    mut ack_rx: mpsc::UnboundedReceiver<Record>,
    fetch_batch: usize,
    fetch_wait: Duration,
    mut pause: PauseGate,
    cancel: &CancellationToken,
) -> EngineResult<()> {
    let mut backoff = Backoff::transport();
    'fetching: while !cancel.is_cancelled() {
        // Acks queued by the owner are applied between fetches; ack_wait is
        // sized well above the fetch window, so this lag is harmless.
        while let Ok(record) = ack_rx.try_recv() {
            ack_with_retry(consumer.as_mut(), &record, cancel).await?;
        }

        // While paused, keep serving the owner's acks; only fetching stops.
        while pause.is_paused() {
            tokio::select! {
                _ = cancel.cancelled() => break 'fetching,
                _ = pause.changed() => {}
                maybe = ack_rx.recv() => match maybe {
                    Some(record) => {
                        ack_with_retry(consumer.as_mut(), &record, cancel).await?;
                    }
                    // Owner hung up; wind down.
                    None => break 'fetching,
                },
            }
        }

        match consumer.fetch(fetch_batch, fetch_wait).await {
            Ok(records) => {
                backoff.reset();
                for record in records {
                    let arrived = Arrived {
                        side,
                        arrival: Instant::now(),
                        wall_ms: chrono::Utc::now().timestamp_millis(),
                        record,
                    };
                    tokio::select! {
                        _ = cancel.cancelled() => break 'fetching,
                        res = record_tx.send(arrived) => {
                            if res.is_err() {
                                break 'fetching;
                            }
                        }
                    }
                }
            }
            Err(e) => match backoff.next_delay() {
                Some(delay) => {
                    warn!(side = side.as_str(), error = %e, "join fetch failed, backing off");
                    tokio::select! {
                        _ = cancel.cancelled() => break 'fetching,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                None => {
                    return Err(EngineError::RetryExhausted {
                        attempts: backoff.attempts(),
                        last_error: e.to_string(),
                    });
                }
            },
        }
    }

    // Stop producing, then serve acks until the owner hangs up.
    drop(record_tx);
    while let Some(record) = ack_rx.recv().await {
        ack_with_retry(consumer.as_mut(), &record, cancel).await?;
    }
    Ok(())
}
