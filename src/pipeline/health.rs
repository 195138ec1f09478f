//! Pipeline health: lifecycle state, shared counters, and the status
//! watcher's progressive poll schedule.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Externally-driven lifecycle. Only `Running` pipelines consume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Created,
    Running,
    Paused,
    Terminating,
    Stopped,
    Failed,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Created => "created",
            LifecycleState::Running => "running",
            LifecycleState::Paused => "paused",
            LifecycleState::Terminating => "terminating",
            LifecycleState::Stopped => "stopped",
            LifecycleState::Failed => "failed",
        }
    }

    /// Terminal states accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, LifecycleState::Stopped | LifecycleState::Failed)
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Counters shared between workers and the control surface.
#[derive(Debug, Default)]
pub struct HealthCounters {
    records_in: AtomicU64,
    batches_out: AtomicU64,
    rows_written: AtomicU64,
    dlq_count: AtomicU64,
    lag: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl HealthCounters {
    pub fn add_records_in(&self, n: u64) {
        self.records_in.fetch_add(n, Ordering::Relaxed);
    }

    pub fn inc_batches_out(&self) {
        self.batches_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_rows_written(&self, n: u64) {
        self.rows_written.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_dlq(&self, n: u64) {
        self.dlq_count.fetch_add(n, Ordering::Relaxed);
    }

    pub fn set_lag(&self, lag: u64) {
        self.lag.store(lag, Ordering::Relaxed);
    }

    pub fn set_last_error(&self, error: String) {
        let mut guard = self.last_error.lock().unwrap_or_else(|e| e.into_inner());
        *guard = Some(error);
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

/// Snapshot returned by `Engine::get_health`.
#[derive(Debug, Clone)]
pub struct HealthSnapshot {
    pub pipeline_id: String,
    pub state: LifecycleState,
    pub records_in: u64,
    pub batches_out: u64,
    pub rows_written: u64,
    pub dlq_count: u64,
    pub lag: u64,
    pub last_error: Option<String>,
}

impl HealthSnapshot {
    pub fn collect(
        pipeline_id: &str,
        state: LifecycleState,
        counters: &HealthCounters,
    ) -> Self {
        Self {
            pipeline_id: pipeline_id.to_string(),
            state,
            records_in: counters.records_in.load(Ordering::Relaxed),
            batches_out: counters.batches_out.load(Ordering::Relaxed),
            rows_written: counters.rows_written.load(Ordering::Relaxed),
            dlq_count: counters.dlq_count.load(Ordering::Relaxed),
            lag: counters.lag.load(Ordering::Relaxed),
            last_error: counters.last_error(),
        }
    }
}

/// Status watcher poll interval for a pipeline that has been in its current
/// state for `elapsed`: fast at first, settling to a slow steady state.
pub fn watch_interval(elapsed: Duration) -> Duration {
    let secs = elapsed.as_secs();
    let next = if secs < 60 {
        2
    } else if secs < 120 {
        5
    } else if secs < 180 {
        10
    } else if secs < 240 {
        15
    } else {
        30
    };
    Duration::from_secs(next)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watch_interval_thresholds() {
        assert_eq!(watch_interval(Duration::from_secs(0)), Duration::from_secs(2));
        assert_eq!(watch_interval(Duration::from_secs(59)), Duration::from_secs(2));
        assert_eq!(watch_interval(Duration::from_secs(60)), Duration::from_secs(5));
        assert_eq!(watch_interval(Duration::from_secs(119)), Duration::from_secs(5));
        assert_eq!(watch_interval(Duration::from_secs(120)), Duration::from_secs(10));
        assert_eq!(watch_interval(Duration::from_secs(180)), Duration::from_secs(15));
        assert_eq!(watch_interval(Duration::from_secs(240)), Duration::from_secs(30));
        assert_eq!(watch_interval(Duration::from_secs(3600)), Duration::from_secs(30));
    }

    #[test]
    fn snapshot_reads_counters() {
        let counters = HealthCounters::default();
        counters.add_records_in(10);
        counters.inc_batches_out();
        counters.add_dlq(2);
        counters.set_lag(5);
        counters.set_last_error("boom".into());

        let snap = HealthSnapshot::collect("pl-1", LifecycleState::Running, &counters);
        assert_eq!(snap.records_in, 10);
        assert_eq!(snap.batches_out, 1);
        assert_eq!(snap.dlq_count, 2);
        assert_eq!(snap.lag, 5);
        assert_eq!(snap.last_error.as_deref(), Some("boom"));
    }
}
