//! Sink backend abstraction.
//!
//! Backends are polymorphic over the capability set
//! {describe-columns, open-batch, append-row, commit}; everything else in
//! the engine is monomorphic.

use crate::error::EngineResult;
use crate::schema::mapper::ProjectedColumn;
use crate::schema::types::{TypedRow, Value};
use crate::substrate::types::RecordId;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;

/// Implicit column receiving the substrate sequence of the source record
/// that produced the row, when present on the target table.
pub const SEQ_COLUMN: &str = "_gf_seq_num";

/// Why a commit failed, which decides the batch's fate: retryable errors
/// nak and rebuild, non-retryable errors dead-letter the whole batch.
#[derive(Debug, Clone)]
pub enum SinkError {
    Retryable(String),
    NonRetryable(String),
}

impl std::fmt::Display for SinkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SinkError::Retryable(m) => write!(f, "retryable: {m}"),
            SinkError::NonRetryable(m) => write!(f, "non-retryable: {m}"),
        }
    }
}

#[async_trait]
pub trait SinkBackend: Send + Sync {
    /// Column names on the target table, in table order.
    async fn describe_columns(&self) -> EngineResult<Vec<String>>;

    /// Start a batch insert. The batch is not visible until `commit`.
    async fn open_batch(&self) -> EngineResult<Box<dyn BatchInsert>>;
}

#[async_trait]
pub trait BatchInsert: Send {
    /// Append one row, values in projection order. `sequence` feeds the
    /// implicit sequence column when the table carries one.
    fn append_row(&mut self, values: &[&Value], sequence: u64) -> EngineResult<()>;

    /// Atomic: after an Ok every appended row is durable; after an Err none
    /// are.
    async fn commit(self: Box<Self>) -> Result<(), SinkError>;
}

/// Column-oriented buffer of mapped rows plus the source identities that
/// produced them, in source-stream order.
#[derive(Debug)]
pub struct ColumnBatch {
    projection: Arc<[ProjectedColumn]>,
    columns: Vec<Vec<Value>>,
    identities: Vec<RecordId>,
    /// Set when the first row lands; drives the age-based flush.
    opened_at: Option<Instant>,
}

impl ColumnBatch {
    pub fn new(projection: Arc<[ProjectedColumn]>) -> Self {
        let columns = projection.iter().map(|_| Vec::new()).collect();
        Self {
            projection,
            columns,
            identities: Vec::new(),
            opened_at: None,
        }
    }

    pub fn push(&mut self, row: &TypedRow, identity: RecordId) -> EngineResult<()> {
        // Gather first so a missing column leaves the batch untouched.
        let mut values = Vec::with_capacity(self.projection.len());
        for column in self.projection.iter() {
            let value = row.get(&column.column_name).ok_or_else(|| {
                crate::error::EngineError::Internal(format!(
                    "mapped row is missing projected column '{}'",
                    column.column_name
                ))
            })?;
            values.push(value.clone());
        }
        for (col_values, value) in self.columns.iter_mut().zip(values) {
            col_values.push(value);
        }
        self.identities.push(identity);
        if self.opened_at.is_none() {
            self.opened_at = Some(Instant::now());
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    pub fn opened_at(&self) -> Option<Instant> {
        self.opened_at
    }

    pub fn projection(&self) -> &[ProjectedColumn] {
        &self.projection
    }

    pub fn identities(&self) -> &[RecordId] {
        &self.identities
    }

    /// Highest source sequence in the batch; identities preserve source
    /// order, so this is the last one.
    pub fn last_identity(&self) -> Option<&RecordId> {
        self.identities.last()
    }

    /// Values of row `idx` across columns, in projection order.
    pub fn row(&self, idx: usize) -> Vec<&Value> {
        self.columns.iter().map(|c| &c[idx]).collect()
    }

    pub fn clear(&mut self) {
        for column in &mut self.columns {
            column.clear();
        }
        self.identities.clear();
        self.opened_at = None;
    }
}
