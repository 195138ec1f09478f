//! In-memory join state: per-side, per-key ordered arrivals.
//!
//! Exclusively owned by the join operator's state-owner task; rebuilt on
//! restart by replaying unacked records from the substrate.

use crate::substrate::types::RecordId;
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Left,
    Right,
}

impl Side {
    pub fn opposite(&self) -> Side {
        match self {
            Side::Left => Side::Right,
            Side::Right => Side::Left,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Left => "left",
            Side::Right => "right",
        }
    }

    fn index(&self) -> usize {
        match self {
            Side::Left => 0,
            Side::Right => 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct JoinEntry {
    /// Monotonic arrival, sampled once when the record entered the operator.
    pub arrival: Instant,
    /// Wall-clock arrival (epoch ms), carried on emitted records.
    pub wall_ms: i64,
    /// Original payload, verbatim (DLQ routing needs it).
    pub raw: Bytes,
    /// Parsed payload object.
    pub payload: serde_json::Value,
    pub identity: RecordId,
    pub subject: String,
    /// Delivery count at arrival, reported if the entry is dead-lettered.
    pub delivery_count: u32,
}

#[derive(Debug)]
struct SideState {
    ttl: Duration,
    entries: HashMap<String, VecDeque<JoinEntry>>,
}

impl SideState {
    fn evict(&mut self, now: Instant) {
        self.entries.retain(|_, deque| {
            // Arrival order within a key, so expired entries are a prefix.
            while let Some(front) = deque.front() {
                if front.arrival + self.ttl < now {
                    deque.pop_front();
                } else {
                    break;
                }
            }
            !deque.is_empty()
        });
    }
}

#[derive(Debug)]
pub struct JoinState {
    sides: [SideState; 2],
}

impl JoinState {
    pub fn new(left_ttl: Duration, right_ttl: Duration) -> Self {
        Self {
            sides: [
                SideState {
                    ttl: left_ttl,
                    entries: HashMap::new(),
                },
                SideState {
                    ttl: right_ttl,
                    entries: HashMap::new(),
                },
            ],
        }
    }

    /// Drop expired entries on both sides. Must run before every probe.
    pub fn evict(&mut self, now: Instant) {
        for side in &mut self.sides {
            side.evict(now);
        }
    }

    /// Surviving matches on the opposite side, ascending arrival order.
    pub fn probe(&self, side: Side, key: &str) -> impl Iterator<Item = &JoinEntry> {
        self.sides[side.opposite().index()]
            .entries
            .get(key)
            .into_iter()
            .flatten()
    }

    pub fn append(&mut self, side: Side, key: String, entry: JoinEntry) {
        self.sides[side.index()]
            .entries
            .entry(key)
            .or_default()
            .push_back(entry);
    }

    pub fn len(&self, side: Side) -> usize {
        self.sides[side.index()]
            .entries
            .values()
            .map(|d| d.len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len(Side::Left) == 0 && self.len(Side::Right) == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(arrival: Instant, seq: u64) -> JoinEntry {
        JoinEntry {
            arrival,
            wall_ms: 0,
            raw: Bytes::new(),
            payload: serde_json::json!({}),
            identity: RecordId {
                stream: "s".into(),
                sequence: seq,
            },
            subject: "t".into(),
            delivery_count: 1,
        }
    }

    #[test]
    fn eviction_respects_per_side_ttl() {
        let mut state = JoinState::new(Duration::from_secs(1), Duration::from_secs(10));
        let t0 = Instant::now();
        state.append(Side::Left, "k".into(), entry(t0, 1));
        state.append(Side::Right, "k".into(), entry(t0, 2));

        // Past the left TTL, inside the right TTL.
        state.evict(t0 + Duration::from_secs(2));
        assert_eq!(state.len(Side::Left), 0);
        assert_eq!(state.len(Side::Right), 1);
    }

    #[test]
    fn zero_ttl_keeps_only_same_instant_entries() {
        let mut state = JoinState::new(Duration::ZERO, Duration::ZERO);
        let t0 = Instant::now();
        state.append(Side::Left, "k".into(), entry(t0, 1));

        // Same instant: arrival + 0 < t0 is false, so it survives.
        state.evict(t0);
        assert_eq!(state.len(Side::Left), 1);

        state.evict(t0 + Duration::from_nanos(1));
        assert_eq!(state.len(Side::Left), 0);
    }

    #[test]
    fn probe_returns_ascending_arrival_order() {
        let mut state = JoinState::new(Duration::from_secs(10), Duration::from_secs(10));
        let t0 = Instant::now();
        state.append(Side::Right, "k".into(), entry(t0, 1));
        state.append(Side::Right, "k".into(), entry(t0 + Duration::from_millis(1), 2));
        state.append(Side::Right, "k".into(), entry(t0 + Duration::from_millis(2), 3));

        let seqs: Vec<u64> = state
            .probe(Side::Left, "k")
            .map(|e| e.identity.sequence)
            .collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[test]
    fn probe_misses_other_keys() {
        let mut state = JoinState::new(Duration::from_secs(10), Duration::from_secs(10));
        state.append(Side::Right, "a".into(), entry(Instant::now(), 1));
        assert_eq!(state.probe(Side::Left, "b").count(), 0);
    }
}
