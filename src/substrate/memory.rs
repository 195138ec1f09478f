//! Process-local substrate backend.
//!
//! Same contract as the JetStream backend: durable-within-process streams,
//! named pull-consumers with ack-wait redelivery, cumulative acks, and
//! max-deliver caps. Used by the test suite and by local development runs.

use crate::error::{EngineError, EngineResult};
use crate::substrate::types::{
    AckPolicy, ConsumerSpec, Record, RecordId, StreamSpec, subject_matches,
};
use crate::substrate::{Substrate, SubstrateConsumer};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::Notify;

#[derive(Clone, Default)]
pub struct MemorySubstrate {
    shared: Arc<Shared>,
}

#[derive(Default)]
struct Shared {
    state: Mutex<State>,
    /// Woken on publish, nak, and stream deletion.
    notify: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        // Lock poisoning only happens if a holder panicked; the state is
        // still consistent because every mutation completes under the lock.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[derive(Default)]
struct State {
    streams: HashMap<String, StreamState>,
}

struct StreamState {
    spec: StreamSpec,
    last_seq: u64,
    messages: VecDeque<StoredMessage>,
    consumers: HashMap<String, ConsumerState>,
}

struct StoredMessage {
    sequence: u64,
    subject: String,
    payload: Bytes,
    headers: BTreeMap<String, String>,
    published_at: Instant,
}

struct ConsumerState {
    spec: ConsumerSpec,
    /// Next fresh sequence to hand out.
    next_seq: u64,
    /// Delivered but unacked.
    pending: BTreeMap<u64, Pending>,
    /// Everything <= this is acked.
    acked_floor: u64,
    /// Explicit acks above the floor.
    acked_above: BTreeSet<u64>,
}

struct Pending {
    redeliver_at: Instant,
    delivery_count: u32,
}

impl StreamState {
    fn evict_expired(&mut self, now: Instant) {
        let Some(ttl) = self.spec.ttl else { return };
        while let Some(front) = self.messages.front() {
            if front.published_at + ttl <= now {
                let gone = front.sequence;
                self.messages.pop_front();
                for consumer in self.consumers.values_mut() {
                    consumer.pending.remove(&gone);
                }
            } else {
                break;
            }
        }
    }

    fn message(&self, sequence: u64) -> Option<&StoredMessage> {
        let first = self.messages.front()?.sequence;
        if sequence < first || sequence > self.last_seq {
            return None;
        }
        let idx = (sequence - first) as usize;
        self.messages.get(idx)
    }

    fn earliest_seq(&self) -> u64 {
        self.messages
            .front()
            .map(|m| m.sequence)
            .unwrap_or(self.last_seq + 1)
    }
}

impl MemorySubstrate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test/diagnostic helper: number of retained records on a stream.
    pub fn stream_len(&self, name: &str) -> usize {
        self.shared
            .lock()
            .streams
            .get(name)
            .map(|s| s.messages.len())
            .unwrap_or(0)
    }

    /// Test/diagnostic helper: retained payloads of a stream, in order.
    pub fn stream_payloads(&self, name: &str) -> Vec<Bytes> {
        self.shared
            .lock()
            .streams
            .get(name)
            .map(|s| s.messages.iter().map(|m| m.payload.clone()).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Substrate for MemorySubstrate {
    async fn create_stream(&self, spec: StreamSpec) -> EngineResult<()> {
        let mut state = self.shared.lock();
        if let Some(existing) = state.streams.get(&spec.name) {
            if existing.spec.subject != spec.subject {
                return Err(EngineError::Substrate(format!(
                    "stream '{}' already exists with subject '{}'",
                    spec.name, existing.spec.subject
                )));
            }
            return Ok(());
        }
        state.streams.insert(
            spec.name.clone(),
            StreamState {
                spec,
                last_seq: 0,
                messages: VecDeque::new(),
                consumers: HashMap::new(),
            },
        );
        Ok(())
    }

    async fn delete_stream(&self, name: &str) -> EngineResult<()> {
        let mut state = self.shared.lock();
        state
            .streams
            .remove(name)
            .ok_or_else(|| EngineError::StreamNotFound(name.to_string()))?;
        drop(state);
        self.shared.notify.notify_waiters();
        Ok(())
    }

    async fn publish(
        &self,
        subject: &str,
        payload: Bytes,
        headers: &BTreeMap<String, String>,
    ) -> EngineResult<u64> {
        let now = Instant::now();
        let sequence = {
            let mut state = self.shared.lock();
            let stream = state
                .streams
                .values_mut()
                .find(|s| subject_matches(&s.spec.subject, subject))
                .ok_or_else(|| {
                    EngineError::Substrate(format!("no stream bound to subject '{subject}'"))
                })?;

            stream.evict_expired(now);
            stream.last_seq += 1;
            stream.messages.push_back(StoredMessage {
                sequence: stream.last_seq,
                subject: subject.to_string(),
                payload,
                headers: headers.clone(),
                published_at: now,
            });
            stream.last_seq
        };
        self.shared.notify.notify_waiters();
        Ok(sequence)
    }

    async fn create_consumer(
        &self,
        spec: ConsumerSpec,
    ) -> EngineResult<Box<dyn SubstrateConsumer>> {
        let mut state = self.shared.lock();
        let stream = state
            .streams
            .get_mut(&spec.stream)
            .ok_or_else(|| EngineError::StreamNotFound(spec.stream.clone()))?;

        if !stream.consumers.contains_key(&spec.name) {
            let next_seq = stream.earliest_seq();
            stream.consumers.insert(
                spec.name.clone(),
                ConsumerState {
                    spec: spec.clone(),
                    next_seq,
                    pending: BTreeMap::new(),
                    acked_floor: next_seq.saturating_sub(1),
                    acked_above: BTreeSet::new(),
                },
            );
        }

        Ok(Box::new(MemoryConsumer {
            shared: self.shared.clone(),
            stream: spec.stream,
            name: spec.name,
        }))
    }
}

pub struct MemoryConsumer {
    shared: Arc<Shared>,
    stream: String,
    name: String,
}

enum Collected {
    Records(Vec<Record>),
    /// Nothing deliverable; earliest instant a redelivery comes due.
    Empty(Option<Instant>),
}

impl MemoryConsumer {
    fn with_consumer<T>(
        &self,
        f: impl FnOnce(&mut StreamState, &str) -> EngineResult<T>,
    ) -> EngineResult<T> {
        let mut state = self.shared.lock();
        let stream = state
            .streams
            .get_mut(&self.stream)
            .ok_or_else(|| EngineError::StreamNotFound(self.stream.clone()))?;
        if !stream.consumers.contains_key(&self.name) {
            return Err(EngineError::ConsumerNotFound(self.name.clone()));
        }
        f(stream, &self.name)
    }

    fn try_collect(&self, max_batch: usize, now: Instant) -> EngineResult<Collected> {
        self.with_consumer(|stream, name| {
            stream.evict_expired(now);

            let mut out: Vec<Record> = Vec::new();
            let mut next_wake: Option<Instant> = None;

            // Redeliveries first, ascending sequence.
            let consumer = stream
                .consumers
                .get(name)
                .ok_or_else(|| EngineError::ConsumerNotFound(name.to_string()))?;
            let ack_wait = consumer.spec.ack_wait;
            let max_deliver = consumer.spec.max_deliver;

            let due: Vec<u64> = consumer
                .pending
                .iter()
                .filter_map(|(seq, p)| {
                    if p.redeliver_at <= now {
                        // Exhausted records stay parked; the final delivery
                        // already carried delivery_count == max_deliver.
                        if max_deliver != 0 && p.delivery_count >= max_deliver {
                            None
                        } else {
                            Some(*seq)
                        }
                    } else {
                        next_wake = Some(match next_wake {
                            Some(w) => w.min(p.redeliver_at),
                            None => p.redeliver_at,
                        });
                        None
                    }
                })
                .collect();

            for seq in due {
                if out.len() >= max_batch {
                    break;
                }
                let Some(msg) = stream.message(seq) else {
                    // Evicted under the stream TTL while pending.
                    if let Some(c) = stream.consumers.get_mut(name) {
                        c.pending.remove(&seq);
                    }
                    continue;
                };
                let record_base = (msg.subject.clone(), msg.payload.clone(), msg.headers.clone());
                let consumer = stream
                    .consumers
                    .get_mut(name)
                    .ok_or_else(|| EngineError::ConsumerNotFound(name.to_string()))?;
                let pending = consumer
                    .pending
                    .get_mut(&seq)
                    .ok_or_else(|| EngineError::Internal("pending entry vanished".into()))?;
                pending.delivery_count += 1;
                pending.redeliver_at = now + ack_wait;
                out.push(Record {
                    id: RecordId {
                        stream: self.stream.clone(),
                        sequence: seq,
                    },
                    subject: record_base.0,
                    payload: record_base.1,
                    headers: record_base.2,
                    delivery_count: pending.delivery_count,
                    reply: None,
                });
            }

            // Fresh deliveries, ascending sequence.
            loop {
                let consumer = stream
                    .consumers
                    .get(name)
                    .ok_or_else(|| EngineError::ConsumerNotFound(name.to_string()))?;
                let seq = consumer.next_seq;
                if seq > stream.last_seq || out.len() >= max_batch {
                    break;
                }
                let filter = consumer.spec.filter_subject.clone();

                let deliverable = stream.message(seq).map(|msg| {
                    let matches = filter
                        .as_deref()
                        .map(|f| subject_matches(f, &msg.subject))
                        .unwrap_or(true);
                    (
                        matches,
                        msg.subject.clone(),
                        msg.payload.clone(),
                        msg.headers.clone(),
                    )
                });

                let consumer = stream
                    .consumers
                    .get_mut(name)
                    .ok_or_else(|| EngineError::ConsumerNotFound(name.to_string()))?;
                consumer.next_seq = seq + 1;

                match deliverable {
                    Some((true, subject, payload, headers)) => {
                        consumer.pending.insert(
                            seq,
                            Pending {
                                redeliver_at: now + ack_wait,
                                delivery_count: 1,
                            },
                        );
                        out.push(Record {
                            id: RecordId {
                                stream: self.stream.clone(),
                                sequence: seq,
                            },
                            subject,
                            payload,
                            headers,
                            delivery_count: 1,
                            reply: None,
                        });
                    }
                    // Filtered out or already evicted: skip without pending.
                    Some((false, ..)) | None => {}
                }
            }

            if out.is_empty() {
                Ok(Collected::Empty(next_wake))
            } else {
                Ok(Collected::Records(out))
            }
        })
    }
}

#[async_trait]
impl SubstrateConsumer for MemoryConsumer {
    async fn fetch(&mut self, max_batch: usize, max_wait: Duration) -> EngineResult<Vec<Record>> {
        let deadline = Instant::now() + max_wait;
        loop {
            // Register for wakeups before inspecting state so a publish
            // racing this check is not lost.
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            let _ = notified.as_mut().enable();

            let now = Instant::now();
            match self.try_collect(max_batch, now)? {
                Collected::Records(records) => return Ok(records),
                Collected::Empty(next_wake) => {
                    if now >= deadline {
                        return Ok(Vec::new());
                    }
                    let wake = next_wake.map(|w| w.min(deadline)).unwrap_or(deadline);
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(tokio::time::Instant::from_std(wake)) => {}
                    }
                }
            }
        }
    }

    async fn ack(&mut self, record: &Record) -> EngineResult<()> {
        let seq = record.id.sequence;
        self.with_consumer(|stream, name| {
            let consumer = stream
                .consumers
                .get_mut(name)
                .ok_or_else(|| EngineError::ConsumerNotFound(name.to_string()))?;
            match consumer.spec.ack_policy {
                AckPolicy::Explicit => {
                    consumer.pending.remove(&seq);
                    if seq > consumer.acked_floor {
                        consumer.acked_above.insert(seq);
                    }
                    // Compact the floor over contiguous explicit acks.
                    while consumer.acked_above.remove(&(consumer.acked_floor + 1)) {
                        consumer.acked_floor += 1;
                    }
                }
                AckPolicy::Cumulative => {
                    consumer.pending = consumer.pending.split_off(&(seq + 1));
                    consumer.acked_floor = consumer.acked_floor.max(seq);
                    consumer.acked_above.retain(|s| *s > seq);
                }
            }
            Ok(())
        })
    }

    async fn nak(&mut self, record: &Record, delay: Option<Duration>) -> EngineResult<()> {
        let seq = record.id.sequence;
        self.with_consumer(|stream, name| {
            let consumer = stream
                .consumers
                .get_mut(name)
                .ok_or_else(|| EngineError::ConsumerNotFound(name.to_string()))?;
            if let Some(pending) = consumer.pending.get_mut(&seq) {
                pending.redeliver_at = Instant::now() + delay.unwrap_or(Duration::ZERO);
            }
            Ok(())
        })?;
        self.shared.notify.notify_waiters();
        Ok(())
    }

    async fn term(&mut self, record: &Record) -> EngineResult<()> {
        let seq = record.id.sequence;
        self.with_consumer(|stream, name| {
            let consumer = stream
                .consumers
                .get_mut(name)
                .ok_or_else(|| EngineError::ConsumerNotFound(name.to_string()))?;
            consumer.pending.remove(&seq);
            if seq > consumer.acked_floor {
                consumer.acked_above.insert(seq);
                while consumer.acked_above.remove(&(consumer.acked_floor + 1)) {
                    consumer.acked_floor += 1;
                }
            }
            Ok(())
        })
    }

    async fn lag(&mut self) -> EngineResult<u64> {
        self.with_consumer(|stream, name| {
            let consumer = stream
                .consumers
                .get(name)
                .ok_or_else(|| EngineError::ConsumerNotFound(name.to_string()))?;
            let above = consumer.acked_above.len() as u64;
            Ok(stream
                .last_seq
                .saturating_sub(consumer.acked_floor)
                .saturating_sub(above))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(stream: &str, subject: &str) -> StreamSpec {
        StreamSpec {
            name: stream.into(),
            subject: subject.into(),
            ttl: None,
        }
    }

    fn consumer_spec(stream: &str, name: &str, ack_wait: Duration) -> ConsumerSpec {
        ConsumerSpec {
            stream: stream.into(),
            name: name.into(),
            filter_subject: None,
            ack_policy: AckPolicy::Explicit,
            ack_wait,
            max_deliver: 0,
        }
    }

    async fn publish_n(sub: &MemorySubstrate, subject: &str, n: usize) {
        for i in 0..n {
            sub.publish(subject, Bytes::from(format!("m{i}")), &BTreeMap::new())
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn delivers_in_sequence_order() {
        let sub = MemorySubstrate::new();
        sub.create_stream(spec("s", "t.a")).await.unwrap();
        publish_n(&sub, "t.a", 3).await;

        let mut c = sub
            .create_consumer(consumer_spec("s", "c1", Duration::from_secs(30)))
            .await
            .unwrap();
        let recs = c.fetch(10, Duration::from_millis(50)).await.unwrap();
        let seqs: Vec<u64> = recs.iter().map(|r| r.id.sequence).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert!(recs.iter().all(|r| r.delivery_count == 1));
    }

    #[tokio::test]
    async fn fetch_returns_empty_on_timeout() {
        let sub = MemorySubstrate::new();
        sub.create_stream(spec("s", "t.a")).await.unwrap();
        let mut c = sub
            .create_consumer(consumer_spec("s", "c1", Duration::from_secs(30)))
            .await
            .unwrap();
        let recs = c.fetch(10, Duration::from_millis(30)).await.unwrap();
        assert!(recs.is_empty());
    }

    #[tokio::test]
    async fn fetch_wakes_on_publish() {
        let sub = MemorySubstrate::new();
        sub.create_stream(spec("s", "t.a")).await.unwrap();
        let mut c = sub
            .create_consumer(consumer_spec("s", "c1", Duration::from_secs(30)))
            .await
            .unwrap();

        let pub_sub = sub.clone();
        let publisher = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            pub_sub
                .publish("t.a", Bytes::from_static(b"late"), &BTreeMap::new())
                .await
                .unwrap();
        });

        let recs = c.fetch(1, Duration::from_secs(2)).await.unwrap();
        assert_eq!(recs.len(), 1);
        publisher.await.unwrap();
    }

    #[tokio::test]
    async fn unacked_records_redeliver_with_incremented_count() {
        let sub = MemorySubstrate::new();
        sub.create_stream(spec("s", "t.a")).await.unwrap();
        publish_n(&sub, "t.a", 1).await;

        let mut c = sub
            .create_consumer(consumer_spec("s", "c1", Duration::from_millis(30)))
            .await
            .unwrap();
        let first = c.fetch(1, Duration::from_millis(20)).await.unwrap();
        assert_eq!(first[0].delivery_count, 1);

        // Past ack_wait: same record comes back, count bumped.
        let second = c.fetch(1, Duration::from_millis(200)).await.unwrap();
        assert_eq!(second[0].id.sequence, first[0].id.sequence);
        assert_eq!(second[0].delivery_count, 2);
    }

    #[tokio::test]
    async fn acked_records_stay_acked() {
        let sub = MemorySubstrate::new();
        sub.create_stream(spec("s", "t.a")).await.unwrap();
        publish_n(&sub, "t.a", 2).await;

        let mut c = sub
            .create_consumer(consumer_spec("s", "c1", Duration::from_millis(30)))
            .await
            .unwrap();
        let recs = c.fetch(2, Duration::from_millis(20)).await.unwrap();
        c.ack(&recs[0]).await.unwrap();
        c.ack(&recs[1]).await.unwrap();

        let again = c.fetch(2, Duration::from_millis(100)).await.unwrap();
        assert!(again.is_empty());
        assert_eq!(c.lag().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn cumulative_ack_covers_prior_sequences() {
        let sub = MemorySubstrate::new();
        sub.create_stream(spec("s", "t.a")).await.unwrap();
        publish_n(&sub, "t.a", 5).await;

        let mut cs = consumer_spec("s", "c1", Duration::from_millis(30));
        cs.ack_policy = AckPolicy::Cumulative;
        let mut c = sub.create_consumer(cs).await.unwrap();

        let recs = c.fetch(5, Duration::from_millis(20)).await.unwrap();
        assert_eq!(recs.len(), 5);
        // Ack only the last; all five are covered.
        c.ack(&recs[4]).await.unwrap();

        let again = c.fetch(5, Duration::from_millis(100)).await.unwrap();
        assert!(again.is_empty());
        assert_eq!(c.lag().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn nak_schedules_prompt_redelivery() {
        let sub = MemorySubstrate::new();
        sub.create_stream(spec("s", "t.a")).await.unwrap();
        publish_n(&sub, "t.a", 1).await;

        let mut c = sub
            .create_consumer(consumer_spec("s", "c1", Duration::from_secs(60)))
            .await
            .unwrap();
        let recs = c.fetch(1, Duration::from_millis(20)).await.unwrap();
        c.nak(&recs[0], None).await.unwrap();

        // Ack-wait is a minute, but the nak brings it back immediately.
        let again = c.fetch(1, Duration::from_millis(100)).await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].delivery_count, 2);
    }

    #[tokio::test]
    async fn term_is_terminal() {
        let sub = MemorySubstrate::new();
        sub.create_stream(spec("s", "t.a")).await.unwrap();
        publish_n(&sub, "t.a", 1).await;

        let mut c = sub
            .create_consumer(consumer_spec("s", "c1", Duration::from_millis(20)))
            .await
            .unwrap();
        let recs = c.fetch(1, Duration::from_millis(20)).await.unwrap();
        c.term(&recs[0]).await.unwrap();

        let again = c.fetch(1, Duration::from_millis(100)).await.unwrap();
        assert!(again.is_empty());
        assert_eq!(c.lag().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn max_deliver_stops_redelivery() {
        let sub = MemorySubstrate::new();
        sub.create_stream(spec("s", "t.a")).await.unwrap();
        publish_n(&sub, "t.a", 1).await;

        let mut cs = consumer_spec("s", "c1", Duration::from_millis(10));
        cs.max_deliver = 2;
        let mut c = sub.create_consumer(cs).await.unwrap();

        let first = c.fetch(1, Duration::from_millis(20)).await.unwrap();
        assert_eq!(first[0].delivery_count, 1);
        let second = c.fetch(1, Duration::from_millis(100)).await.unwrap();
        assert_eq!(second[0].delivery_count, 2);
        // Attempts exhausted: parked, not redelivered.
        let third = c.fetch(1, Duration::from_millis(100)).await.unwrap();
        assert!(third.is_empty());
    }

    #[tokio::test]
    async fn filter_subject_narrows_delivery() {
        let sub = MemorySubstrate::new();
        sub.create_stream(spec("s", "t.>")).await.unwrap();
        sub.publish("t.a", Bytes::from_static(b"a"), &BTreeMap::new())
            .await
            .unwrap();
        sub.publish("t.b", Bytes::from_static(b"b"), &BTreeMap::new())
            .await
            .unwrap();

        let mut cs = consumer_spec("s", "c1", Duration::from_secs(30));
        cs.filter_subject = Some("t.b".into());
        let mut c = sub.create_consumer(cs).await.unwrap();
        let recs = c.fetch(10, Duration::from_millis(30)).await.unwrap();
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].subject, "t.b");
    }

    #[tokio::test]
    async fn two_consumers_track_independent_cursors() {
        let sub = MemorySubstrate::new();
        sub.create_stream(spec("s", "t.a")).await.unwrap();
        publish_n(&sub, "t.a", 2).await;

        let mut c1 = sub
            .create_consumer(consumer_spec("s", "c1", Duration::from_secs(30)))
            .await
            .unwrap();
        let mut c2 = sub
            .create_consumer(consumer_spec("s", "c2", Duration::from_secs(30)))
            .await
            .unwrap();

        let r1 = c1.fetch(10, Duration::from_millis(20)).await.unwrap();
        c1.ack(&r1[0]).await.unwrap();
        c1.ack(&r1[1]).await.unwrap();

        // c2 still sees everything.
        let r2 = c2.fetch(10, Duration::from_millis(20)).await.unwrap();
        assert_eq!(r2.len(), 2);
    }

    #[tokio::test]
    async fn deleted_stream_rejects_traffic() {
        let sub = MemorySubstrate::new();
        sub.create_stream(spec("s", "t.a")).await.unwrap();
        let mut c = sub
            .create_consumer(consumer_spec("s", "c1", Duration::from_secs(30)))
            .await
            .unwrap();

        sub.delete_stream("s").await.unwrap();
        assert!(
            sub.publish("t.a", Bytes::from_static(b"x"), &BTreeMap::new())
                .await
                .is_err()
        );
        assert!(c.fetch(1, Duration::from_millis(10)).await.is_err());
        assert!(sub.delete_stream("s").await.is_err());
    }

    #[tokio::test]
    async fn stream_ttl_evicts_old_messages() {
        let sub = MemorySubstrate::new();
        sub.create_stream(StreamSpec {
            name: "s".into(),
            subject: "t.a".into(),
            ttl: Some(Duration::from_millis(30)),
        })
        .await
        .unwrap();
        publish_n(&sub, "t.a", 3).await;
        assert_eq!(sub.stream_len("s"), 3);

        tokio::time::sleep(Duration::from_millis(60)).await;
        // Eviction runs on the next publish or fetch.
        sub.publish("t.a", Bytes::from_static(b"new"), &BTreeMap::new())
            .await
            .unwrap();
        assert_eq!(sub.stream_len("s"), 1);
    }
}
