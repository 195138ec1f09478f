//! In-process sink backend.
//!
//! Captures committed batches in a shared table. Commits are atomic, and a
//! failure injector simulates retryable and non-retryable DB errors, which
//! the scenario suite leans on.

use crate::error::EngineResult;
use crate::schema::types::Value;
use crate::sink::backend::{BatchInsert, SinkBackend, SinkError};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Clone)]
pub struct MemorySink {
    shared: Arc<Shared>,
}

struct Shared {
    columns: Vec<String>,
    state: Mutex<TableState>,
}

#[derive(Default)]
struct TableState {
    rows: Vec<Vec<Value>>,
    sequences: Vec<u64>,
    fail_next: VecDeque<SinkError>,
}

impl MemorySink {
    /// `columns` is the table's column set, as `describe_columns` would
    /// report it (include [`super::backend::SEQ_COLUMN`] to exercise the
    /// implicit sequence column).
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            shared: Arc::new(Shared {
                columns,
                state: Mutex::new(TableState::default()),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TableState> {
        self.shared.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue an error for the next commit(s), in order.
    pub fn inject_failure(&self, error: SinkError) {
        self.lock().fail_next.push_back(error);
    }

    pub fn row_count(&self) -> usize {
        self.lock().rows.len()
    }

    pub fn rows(&self) -> Vec<Vec<Value>> {
        self.lock().rows.clone()
    }

    pub fn sequences(&self) -> Vec<u64> {
        self.lock().sequences.clone()
    }
}

#[async_trait]
impl SinkBackend for MemorySink {
    async fn describe_columns(&self) -> EngineResult<Vec<String>> {
        Ok(self.shared.columns.clone())
    }

    async fn open_batch(&self) -> EngineResult<Box<dyn BatchInsert>> {
        Ok(Box::new(MemoryBatch {
            sink: self.clone(),
            rows: Vec::new(),
            sequences: Vec::new(),
        }))
    }
}

struct MemoryBatch {
    sink: MemorySink,
    rows: Vec<Vec<Value>>,
    sequences: Vec<u64>,
}

#[async_trait]
impl BatchInsert for MemoryBatch {
    fn append_row(&mut self, values: &[&Value], sequence: u64) -> EngineResult<()> {
        self.rows.push(values.iter().map(|v| (*v).clone()).collect());
        self.sequences.push(sequence);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), SinkError> {
        let mut state = self.sink.lock();
        if let Some(error) = state.fail_next.pop_front() {
            return Err(error);
        }
        state.rows.extend(self.rows);
        state.sequences.extend(self.sequences);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn commit_is_all_or_nothing() {
        let sink = MemorySink::new(vec!["id".into()]);

        let mut batch = sink.open_batch().await.unwrap();
        batch.append_row(&[&Value::Int64(1)], 1).unwrap();
        batch.append_row(&[&Value::Int64(2)], 2).unwrap();

        sink.inject_failure(SinkError::Retryable("connection reset".into()));
        assert!(batch.commit().await.is_err());
        // Nothing landed.
        assert_eq!(sink.row_count(), 0);

        let mut batch = sink.open_batch().await.unwrap();
        batch.append_row(&[&Value::Int64(1)], 1).unwrap();
        batch.append_row(&[&Value::Int64(2)], 2).unwrap();
        batch.commit().await.unwrap();
        assert_eq!(sink.row_count(), 2);
        assert_eq!(sink.sequences(), vec![1, 2]);
    }
}
