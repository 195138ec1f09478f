//! Batcher / sink worker.
//!
//! Consumes the final stream, decodes each record through the schema
//! mapper, groups rows into a [`ColumnBatch`], and inserts into the
//! analytical DB. A batch closes when it reaches `max_batch_size` rows or
//! when `max_delay_time` has passed since its first record, whichever
//! fires first. After a committed insert the highest sequence in the batch
//! is acked cumulatively, which covers every contributing record.

use crate::dlq::{DlqRouter, Stage};
use crate::error::{EngineError, EngineResult, FailureKind};
use crate::metrics::PipelineMetrics;
use crate::pipeline::PauseGate;
use crate::pipeline::health::HealthCounters;
use crate::schema::mapper::SchemaMapper;
use crate::sink::backend::{ColumnBatch, SinkBackend, SinkError};
use crate::substrate::retry::{ack_with_retry, nak_with_retry, term_with_retry};
use crate::substrate::types::{ConsumerSpec, Record};
use crate::substrate::{Backoff, Substrate, SubstrateConsumer};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What happened to the batch a flush was asked to close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlushOutcome {
    /// Nothing to do.
    Empty,
    /// Committed and cumulatively acked.
    Committed,
    /// Non-retryable failure: every record dead-lettered, then acked.
    DeadLettered,
    /// Retryable failure: records nak'd with this redelivery delay,
    /// nothing acked.
    NakRetry(Duration),
}

pub struct SinkWorker {
    pub substrate: Arc<dyn Substrate>,
    pub backend: Arc<dyn SinkBackend>,
    pub mapper: SchemaMapper,
    pub dlq: DlqRouter,
    pub metrics: PipelineMetrics,
    pub counters: Arc<HealthCounters>,
    pub consumer: ConsumerSpec,
    /// Stream the sink consumes (source stream, or the join output).
    pub stream: String,
    pub max_batch_size: usize,
    pub max_delay_time: Duration,
    /// From the DLQ config; records at their final delivery attempt are
    /// dead-lettered instead of nak'd when an insert keeps failing.
    pub max_deliver: u32,
    /// True when this worker is the pipeline ingress (no join upstream),
    /// so it owns the records-in counter.
    pub primary_ingress: bool,
    pub fetch_wait: Duration,
    pub pause: PauseGate,
}

impl SinkWorker {
    pub async fn run(self, cancel: CancellationToken) -> EngineResult<()> {
        let mut consumer = self.substrate.create_consumer(self.consumer.clone()).await?;

        // Fail fast on an unreachable or missing table.
        let columns = self.describe_with_retry(&cancel).await?;
        info!(
            stream = %self.stream,
            columns = columns.len(),
            "sink worker started"
        );

        let projection: Arc<[_]> = Arc::from(self.mapper.projection().to_vec());
        let mut batch = ColumnBatch::new(projection);
        let mut records: Vec<Record> = Vec::new();
        let mut insert_backoff = Backoff::transport();
        let mut fetch_backoff = Backoff::transport();
        let mut pause = self.pause.clone();

        loop {
            // Age-based close: max_delay_time since the first record.
            let deadline = batch.opened_at().map(|t| t + self.max_delay_time);
            if deadline.is_some_and(|d| Instant::now() >= d) {
                self.flush(&mut batch, &mut records, consumer.as_mut(), &mut insert_backoff, &cancel)
                    .await?;
                continue;
            }

            if cancel.is_cancelled() {
                break;
            }

            // Paused: flush what we hold, then idle without fetching.
            if pause.is_paused() {
                self.flush(&mut batch, &mut records, consumer.as_mut(), &mut insert_backoff, &cancel)
                    .await?;
                if pause.wait_ready(&cancel).await.is_err() {
                    break;
                }
                continue;
            }

            let remaining = self.max_batch_size - batch.len();
            let wait = match deadline {
                Some(d) => d
                    .saturating_duration_since(Instant::now())
                    .min(self.fetch_wait),
                None => self.fetch_wait,
            };

            // Single in-flight fetch, capped at what the open batch can
            // still take, keeps memory bounded.
            let fetched = match consumer.fetch(remaining, wait).await {
                Ok(fetched) => {
                    fetch_backoff.reset();
                    fetched
                }
                Err(e) => {
                    match fetch_backoff.next_delay() {
                        Some(delay) => {
                            warn!(error = %e, "sink fetch failed, backing off");
                            tokio::select! {
                                _ = cancel.cancelled() => break,
                                _ = tokio::time::sleep(delay) => {}
                            }
                            continue;
                        }
                        None => {
                            return Err(EngineError::RetryExhausted {
                                attempts: fetch_backoff.attempts(),
                                last_error: e.to_string(),
                            });
                        }
                    }
                }
            };

            if fetched.is_empty() {
                self.update_lag(consumer.as_mut()).await;
                continue;
            }

            for record in fetched {
                if self.primary_ingress {
                    self.counters.add_records_in(1);
                }
                self.metrics.inc_records_in("sink", 1);
                if record.delivery_count > 1 {
                    self.metrics.inc_redeliveries(1);
                }

                match self.mapper.map(&self.stream, &record.payload, &record.headers) {
                    Ok(row) => {
                        batch.push(&row, record.id.clone())?;
                        records.push(record);
                    }
                    Err(e) if e.failure_kind().is_some() => {
                        // Poison record. Flush what came before it first:
                        // the cumulative ack below must never cover rows
                        // that are not yet in the DB.
                        let outcome = self
                            .flush(
                                &mut batch,
                                &mut records,
                                consumer.as_mut(),
                                &mut insert_backoff,
                                &cancel,
                            )
                            .await?;
                        if let FlushOutcome::NakRetry(delay) = outcome {
                            // The batch went back for redelivery; acking the
                            // poison record now would cumulatively ack those
                            // uninserted rows too. Same delivery policy as
                            // the batch: dead-letter once attempts are
                            // spent, otherwise follow it back with the same
                            // backoff delay.
                            let exhausted_deliveries = self.max_deliver != 0
                                && record.delivery_count >= self.max_deliver;
                            if exhausted_deliveries {
                                self.dlq
                                    .route(
                                        &record,
                                        Stage::Mapper,
                                        FailureKind::MaxDeliverExceeded,
                                        &e.to_string(),
                                        &cancel,
                                    )
                                    .await?;
                                self.counters.add_dlq(1);
                                // Terminal per-record resolve; a cumulative
                                // ack would cover the nak'd rows.
                                term_with_retry(consumer.as_mut(), &record, &cancel).await?;
                            } else {
                                nak_with_retry(
                                    consumer.as_mut(),
                                    &record,
                                    Some(delay),
                                    &cancel,
                                )
                                .await?;
                            }
                            continue;
                        }

                        let kind = e
                            .failure_kind()
                            .unwrap_or(FailureKind::SchemaCoercion);
                        self.dlq
                            .route(&record, Stage::Mapper, kind, &e.to_string(), &cancel)
                            .await?;
                        self.counters.add_dlq(1);
                        ack_with_retry(consumer.as_mut(), &record, &cancel).await?;
                    }
                    Err(e) => return Err(e),
                }
            }

            if batch.len() >= self.max_batch_size {
                self.flush(&mut batch, &mut records, consumer.as_mut(), &mut insert_backoff, &cancel)
                    .await?;
            }
        }

        // Graceful stop: close the current batch immediately, flush, exit.
        // A forced stop aborts the task instead and leaves records unacked.
        if !batch.is_empty() {
            debug!(rows = batch.len(), "draining final batch");
            self.flush(&mut batch, &mut records, consumer.as_mut(), &mut insert_backoff, &cancel)
                .await?;
        }
        Ok(())
    }

    async fn flush(
        &self,
        batch: &mut ColumnBatch,
        records: &mut Vec<Record>,
        consumer: &mut dyn SubstrateConsumer,
        insert_backoff: &mut Backoff,
        cancel: &CancellationToken,
    ) -> EngineResult<FlushOutcome> {
        // Empty batch at delay expiry: no DB call, no ack.
        if batch.is_empty() {
            return Ok(FlushOutcome::Empty);
        }
        if let Some(opened) = batch.opened_at() {
            self.metrics.observe_flush_delay(opened.elapsed().as_secs_f64());
        }

        let t0 = Instant::now();
        let mut insert = self.backend.open_batch().await?;
        for idx in 0..batch.len() {
            let values = batch.row(idx);
            insert.append_row(&values, batch.identities()[idx].sequence)?;
        }

        match insert.commit().await {
            Ok(()) => {
                // Commit is durable; cumulative-ack the highest sequence.
                let last = records
                    .last()
                    .cloned()
                    .ok_or_else(|| EngineError::Internal("flush of batch with no records".into()))?;
                ack_with_retry(consumer, &last, cancel).await?;

                self.metrics.observe_insert_latency(t0.elapsed().as_secs_f64());
                self.metrics.inc_batches_out();
                self.metrics.add_rows_written(batch.len() as u64);
                self.metrics.observe_rows_per_batch(batch.len() as f64);
                self.counters.inc_batches_out();
                self.counters.add_rows_written(batch.len() as u64);

                insert_backoff.reset();
                batch.clear();
                records.clear();
                self.update_lag(consumer).await;
                Ok(FlushOutcome::Committed)
            }
            Err(SinkError::NonRetryable(msg)) => {
                // One bad row poisons the whole batch at the DB layer.
                // Replaying row-by-row on the DLQ stream lets operators
                // find the culprit.
                warn!(rows = batch.len(), error = %msg, "non-retryable insert failure, dead-lettering batch");
                for record in records.iter() {
                    self.dlq
                        .route(record, Stage::Sink, FailureKind::SinkInsert, &msg, cancel)
                        .await?;
                }
                self.counters.add_dlq(records.len() as u64);

                let last = records
                    .last()
                    .cloned()
                    .ok_or_else(|| EngineError::Internal("flush of batch with no records".into()))?;
                ack_with_retry(consumer, &last, cancel).await?;

                insert_backoff.reset();
                batch.clear();
                records.clear();
                Ok(FlushOutcome::DeadLettered)
            }
            Err(SinkError::Retryable(msg)) => {
                // Nak would park records that are already on their final
                // delivery attempt; those go to the DLQ instead.
                let exhausted_deliveries = self.max_deliver != 0
                    && records
                        .iter()
                        .any(|r| r.delivery_count >= self.max_deliver);
                if exhausted_deliveries {
                    warn!(rows = batch.len(), error = %msg, "insert failing at max deliveries, dead-lettering batch");
                    for record in records.iter() {
                        self.dlq
                            .route(
                                record,
                                Stage::Sink,
                                FailureKind::MaxDeliverExceeded,
                                &msg,
                                cancel,
                            )
                            .await?;
                    }
                    self.counters.add_dlq(records.len() as u64);
                    let last = records.last().cloned().ok_or_else(|| {
                        EngineError::Internal("flush of batch with no records".into())
                    })?;
                    ack_with_retry(consumer, &last, cancel).await?;
                    insert_backoff.reset();
                    batch.clear();
                    records.clear();
                    return Ok(FlushOutcome::DeadLettered);
                }

                match insert_backoff.next_delay() {
                    Some(delay) => {
                        // Nak everything; the substrate redelivers in order
                        // and the batch is rebuilt identically.
                        warn!(rows = batch.len(), error = %msg, "retryable insert failure, nak'ing batch");
                        for record in records.iter() {
                            nak_with_retry(consumer, record, Some(delay), cancel).await?;
                        }
                        batch.clear();
                        records.clear();
                        Ok(FlushOutcome::NakRetry(delay))
                    }
                    None => Err(EngineError::RetryExhausted {
                        attempts: insert_backoff.attempts(),
                        last_error: msg,
                    }),
                }
            }
        }
    }

    async fn describe_with_retry(&self, cancel: &CancellationToken) -> EngineResult<Vec<String>> {
        let mut backoff = Backoff::transport();
        loop {
            match self.backend.describe_columns().await {
                Ok(columns) => return Ok(columns),
                Err(e) => match backoff.next_delay() {
                    Some(delay) => {
                        warn!(error = %e, "describe columns failed, backing off");
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

    async fn update_lag(&self, consumer: &mut dyn SubstrateConsumer) {
        if let Ok(lag) = consumer.lag().await {
            self.counters.set_lag(lag);
            self.metrics.set_lag(lag as f64);
        }
    }
}
