use crate::error::{EngineError, EngineResult};
use crate::substrate::types::Record;
use crate::substrate::SubstrateConsumer;
use rand::Rng;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Exponential backoff with jitter.
///
/// Bounded (`max_attempts`) for transient transport errors, where
/// exhaustion fails the pipeline. Unbounded for DLQ publishes, which must
/// never give up.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    max_attempts: Option<u32>,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration, max_attempts: Option<u32>) -> Self {
        Self {
            base,
            cap,
            max_attempts,
            attempt: 0,
        }
    }

    /// Policy for substrate/DB transport errors: 100ms doubling to 10s,
    /// eight attempts before the pipeline goes to Failed.
    pub fn transport() -> Self {
        Self::new(Duration::from_millis(100), Duration::from_secs(10), Some(8))
    }

    /// Policy for DLQ publishes: retried indefinitely.
    pub fn dlq() -> Self {
        Self::new(Duration::from_millis(100), Duration::from_secs(30), None)
    }

    /// Next delay to sleep before retrying, or None when attempts are
    /// exhausted. Jittered to half-to-full of the exponential step.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if let Some(max) = self.max_attempts
            && self.attempt >= max
        {
            return None;
        }
        let exp = self
            .base
            .saturating_mul(1u32 << self.attempt.min(20))
            .min(self.cap);
        self.attempt += 1;
        let jitter = rand::rng().random_range(0.5..=1.0);
        Some(exp.mul_f64(jitter))
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

enum ConsumerOp {
    Ack,
    Nak(Option<Duration>),
    Term,
}

/// Ack with transport-policy retries. Cancellation aborts between
/// attempts; the record is then simply redelivered later.
pub async fn ack_with_retry(
    consumer: &mut dyn SubstrateConsumer,
    record: &Record,
    cancel: &CancellationToken,
) -> EngineResult<()> {
    op_with_retry(consumer, record, ConsumerOp::Ack, cancel).await
}

/// Nak with transport-policy retries.
pub async fn nak_with_retry(
    consumer: &mut dyn SubstrateConsumer,
    record: &Record,
    delay: Option<Duration>,
    cancel: &CancellationToken,
) -> EngineResult<()> {
    op_with_retry(consumer, record, ConsumerOp::Nak(delay), cancel).await
}

/// Term with transport-policy retries. Terminal for the single record,
/// even on a cumulative-ack consumer.
pub async fn term_with_retry(
    consumer: &mut dyn SubstrateConsumer,
    record: &Record,
    cancel: &CancellationToken,
) -> EngineResult<()> {
    op_with_retry(consumer, record, ConsumerOp::Term, cancel).await
}

async fn op_with_retry(
    consumer: &mut dyn SubstrateConsumer,
    record: &Record,
    op: ConsumerOp,
    cancel: &CancellationToken,
) -> EngineResult<()> {
    let mut backoff = Backoff::transport();
    loop {
        let res = match op {
            ConsumerOp::Ack => consumer.ack(record).await,
            ConsumerOp::Nak(delay) => consumer.nak(record, delay).await,
            ConsumerOp::Term => consumer.term(record).await,
        };
        match res {
            Ok(()) => return Ok(()),
            Err(e) => match backoff.next_delay() {
                Some(delay) => {
                    warn!(record = %record.id, error = %e, "consumer op failed, backing off");
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
