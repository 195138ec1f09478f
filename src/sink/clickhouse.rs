//! ClickHouse sink backend.
//!
//! Inserts are built as a single column-ordered `INSERT ... VALUES`
//! statement with one `?` placeholder per value and bound through the
//! client's parameterization, so a batch lands atomically or not at all
//! and no value is ever spliced into SQL text by hand. Identifier safety
//! (database/table/column names) is enforced at config validation time.

use crate::config::ConnectionConfig;
use crate::error::{EngineError, EngineResult};
use crate::schema::mapper::ProjectedColumn;
use crate::schema::types::{DateTimePrecision, FieldType, Value};
use crate::sink::backend::{BatchInsert, SEQ_COLUMN, SinkBackend, SinkError};
use async_trait::async_trait;
use clickhouse::Client;
use clickhouse::query::Query;
use std::sync::Arc;

pub struct ClickHouseSink {
    client: Client,
    database: String,
    table: String,
    projection: Arc<[ProjectedColumn]>,
    /// Whether the target table carries the implicit sequence column.
    with_seq_column: bool,
}

impl ClickHouseSink {
    pub async fn connect(
        connection: &ConnectionConfig,
        projection: Arc<[ProjectedColumn]>,
    ) -> EngineResult<Self> {
        let scheme = if connection.secure { "https" } else { "http" };
        let url = format!("{scheme}://{}:{}", connection.host, connection.port);
        let client = Client::default()
            .with_url(url)
            .with_user(&connection.username)
            .with_password(connection.password_plain()?)
            .with_database(&connection.database);

        let mut sink = Self {
            client,
            database: connection.database.clone(),
            table: connection.table.clone(),
            projection,
            with_seq_column: false,
        };
        let columns = sink.describe_columns().await?;
        sink.with_seq_column = columns.iter().any(|c| c == SEQ_COLUMN);
        Ok(sink)
    }

    /// `INSERT INTO db.table (cols) VALUES ` — identifiers only; config
    /// validation has already restricted them to `[A-Za-z0-9_]+`.
    fn insert_prefix(&self) -> String {
        let mut sql = format!("INSERT INTO `{}`.`{}` (", self.database, self.table);
        for (i, column) in self.projection.iter().enumerate() {
            if i > 0 {
                sql.push_str(", ");
            }
            sql.push('`');
            sql.push_str(&column.column_name);
            sql.push('`');
        }
        if self.with_seq_column {
            sql.push_str(", `");
            sql.push_str(SEQ_COLUMN);
            sql.push('`');
        }
        sql.push_str(") VALUES ");
        sql
    }

    /// One placeholder tuple per row. Datetime columns wrap their bound
    /// integer epoch in an explicit conversion so the server never guesses
    /// units or timezones; NULL binds propagate through the conversion.
    fn row_placeholders(&self) -> String {
        let mut out = String::from("(");
        for (i, column) in self.projection.iter().enumerate() {
            if i > 0 {
                out.push_str(", ");
            }
            out.push_str(placeholder(column.column_type.base));
        }
        if self.with_seq_column {
            out.push_str(", ?");
        }
        out.push(')');
        out
    }
}

fn placeholder(base: FieldType) -> &'static str {
    match base {
        FieldType::DateTime(DateTimePrecision::Seconds) => "toDateTime(?)",
        FieldType::DateTime(DateTimePrecision::Millis) => "fromUnixTimestamp64Milli(?)",
        FieldType::DateTime(DateTimePrecision::Micros) => "fromUnixTimestamp64Micro(?)",
        FieldType::DateTime(DateTimePrecision::Nanos) => "fromUnixTimestamp64Nano(?)",
        _ => "?",
    }
}

#[derive(clickhouse::Row, serde::Deserialize)]
struct ColumnRow {
    name: String,
}

#[async_trait]
impl SinkBackend for ClickHouseSink {
    async fn describe_columns(&self) -> EngineResult<Vec<String>> {
        let rows: Vec<ColumnRow> = self
            .client
            .query("SELECT name FROM system.columns WHERE database = ? AND table = ? ORDER BY position")
            .bind(&self.database)
            .bind(&self.table)
            .fetch_all()
            .await?;
        if rows.is_empty() {
            return Err(EngineError::SinkInsert(format!(
                "table {}.{} does not exist or has no columns",
                self.database, self.table
            )));
        }
        Ok(rows.into_iter().map(|r| r.name).collect())
    }

    async fn open_batch(&self) -> EngineResult<Box<dyn BatchInsert>> {
        Ok(Box::new(ClickHouseBatch {
            client: self.client.clone(),
            sql: self.insert_prefix(),
            row_placeholders: self.row_placeholders(),
            projection: self.projection.clone(),
            with_seq_column: self.with_seq_column,
            binds: Vec::new(),
            rows: 0,
        }))
    }
}

struct ClickHouseBatch {
    client: Client,
    sql: String,
    row_placeholders: String,
    projection: Arc<[ProjectedColumn]>,
    with_seq_column: bool,
    binds: Vec<BindValue>,
    rows: usize,
}

#[async_trait]
impl BatchInsert for ClickHouseBatch {
    fn append_row(&mut self, values: &[&Value], sequence: u64) -> EngineResult<()> {
        if values.len() != self.projection.len() {
            return Err(EngineError::Internal(format!(
                "row arity {} does not match projection {}",
                values.len(),
                self.projection.len()
            )));
        }
        if self.rows > 0 {
            self.sql.push_str(", ");
        }
        self.sql.push_str(&self.row_placeholders);
        for value in values {
            self.binds.push(BindValue::from_value(value));
        }
        if self.with_seq_column {
            self.binds.push(BindValue::U64(sequence));
        }
        self.rows += 1;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), SinkError> {
        if self.rows == 0 {
            return Ok(());
        }
        let mut query = self.client.query(&self.sql);
        for bind in self.binds {
            query = bind.apply(query);
        }
        query.execute().await.map_err(classify)
    }
}

/// Connection-level failures redeliver the batch; anything the server
/// rejected (schema mismatch, malformed value, constraint) will fail the
/// same way again and goes to the DLQ instead.
fn classify(e: clickhouse::error::Error) -> SinkError {
    use clickhouse::error::Error;
    match e {
        Error::Network(_) | Error::TimedOut => SinkError::Retryable(e.to_string()),
        other => SinkError::NonRetryable(other.to_string()),
    }
}

/// Owned form a typed value takes while waiting to be bound. Datetimes are
/// carried as integer epochs in their column's unit (the placeholder
/// supplies the matching conversion function).
#[derive(Debug, Clone, PartialEq)]
enum BindValue {
    I64(i64),
    U64(u64),
    F64(f64),
    Bool(bool),
    Text(String),
    Null,
}

impl BindValue {
    fn from_value(value: &Value) -> Self {
        match value {
            Value::Int8(v) => BindValue::I64(i64::from(*v)),
            Value::Int16(v) => BindValue::I64(i64::from(*v)),
            Value::Int32(v) => BindValue::I64(i64::from(*v)),
            Value::Int64(v) => BindValue::I64(*v),
            Value::UInt8(v) => BindValue::U64(u64::from(*v)),
            Value::UInt16(v) => BindValue::U64(u64::from(*v)),
            Value::UInt32(v) => BindValue::U64(u64::from(*v)),
            Value::UInt64(v) => BindValue::U64(*v),
            Value::Float32(v) => BindValue::F64(f64::from(*v)),
            Value::Float64(v) => BindValue::F64(*v),
            Value::Bool(v) => BindValue::Bool(*v),
            Value::String(v) => BindValue::Text(v.clone()),
            Value::Bytes(v) => BindValue::Text(String::from_utf8_lossy(v).into_owned()),
            Value::Uuid(v) => BindValue::Text(v.to_string()),
            Value::DateTime(dt, precision) => BindValue::I64(match precision {
                DateTimePrecision::Seconds => dt.timestamp(),
                DateTimePrecision::Millis => dt.timestamp_millis(),
                DateTimePrecision::Micros => dt.timestamp_micros(),
                DateTimePrecision::Nanos => dt.timestamp_nanos_opt().unwrap_or_default(),
            }),
            Value::Null => BindValue::Null,
        }
    }

    fn apply(self, query: Query) -> Query {
        match self {
            BindValue::I64(v) => query.bind(v),
            BindValue::U64(v) => query.bind(v),
            BindValue::F64(v) => query.bind(v),
            BindValue::Bool(v) => query.bind(v),
            BindValue::Text(v) => query.bind(v),
            BindValue::Null => query.bind(None::<&str>),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::types::ColumnType;
    use chrono::TimeZone;

    fn sink(columns: &[(&str, &str)], with_seq_column: bool) -> ClickHouseSink {
        let projection: Vec<ProjectedColumn> = columns
            .iter()
            .map(|(name, ty)| ProjectedColumn {
                column_name: (*name).to_string(),
                column_type: ColumnType::parse(ty).unwrap(),
                source_stream: "users".into(),
                source_field: (*name).to_string(),
            })
            .collect();
        ClickHouseSink {
            client: Client::default(),
            database: "analytics".into(),
            table: "user_events".into(),
            projection: Arc::from(projection),
            with_seq_column,
        }
    }

    #[test]
    fn prefix_lists_columns_in_projection_order() {
        let s = sink(&[("event_id", "UUID"), ("name", "String")], true);
        assert_eq!(
            s.insert_prefix(),
            "INSERT INTO `analytics`.`user_events` (`event_id`, `name`, `_gf_seq_num`) VALUES "
        );
    }

    #[test]
    fn placeholders_follow_column_types() {
        let s = sink(
            &[
                ("id", "UUID"),
                ("ts", "DateTime64(3)"),
                ("seen", "DateTime"),
                ("n", "Nullable(Int64)"),
            ],
            true,
        );
        assert_eq!(
            s.row_placeholders(),
            "(?, fromUnixTimestamp64Milli(?), toDateTime(?), ?, ?)"
        );
    }

    #[test]
    fn bind_values_map_typed_values() {
        assert_eq!(
            BindValue::from_value(&Value::Int8(-7)),
            BindValue::I64(-7)
        );
        assert_eq!(
            BindValue::from_value(&Value::UInt32(9)),
            BindValue::U64(9)
        );
        assert_eq!(
            BindValue::from_value(&Value::Uuid(uuid::Uuid::nil())),
            BindValue::Text("00000000-0000-0000-0000-000000000000".into())
        );
        assert_eq!(
            BindValue::from_value(&Value::String("it's".into())),
            BindValue::Text("it's".into())
        );
        assert_eq!(BindValue::from_value(&Value::Null), BindValue::Null);
    }

    #[test]
    fn datetime_binds_epoch_in_column_unit() {
        let dt = chrono::Utc.timestamp_millis_opt(1_700_000_000_123).unwrap();
        assert_eq!(
            BindValue::from_value(&Value::DateTime(dt, DateTimePrecision::Millis)),
            BindValue::I64(1_700_000_000_123)
        );
        assert_eq!(
            BindValue::from_value(&Value::DateTime(dt, DateTimePrecision::Seconds)),
            BindValue::I64(1_700_000_000)
        );

        // Before the epoch stays an exact integer, no decimal rendering.
        let neg = chrono::Utc.timestamp_millis_opt(-100).unwrap();
        assert_eq!(
            BindValue::from_value(&Value::DateTime(neg, DateTimePrecision::Millis)),
            BindValue::I64(-100)
        );
    }

    #[test]
    fn appended_rows_grow_placeholders_and_binds() {
        let s = sink(&[("id", "Int64"), ("name", "String")], false);
        let mut batch = ClickHouseBatch {
            client: Client::default(),
            sql: s.insert_prefix(),
            row_placeholders: s.row_placeholders(),
            projection: s.projection.clone(),
            with_seq_column: false,
            binds: Vec::new(),
            rows: 0,
        };

        batch
            .append_row(&[&Value::Int64(1), &Value::String("a".into())], 10)
            .unwrap();
        batch
            .append_row(&[&Value::Int64(2), &Value::String("b".into())], 11)
            .unwrap();

        assert_eq!(
            batch.sql,
            "INSERT INTO `analytics`.`user_events` (`id`, `name`) VALUES (?, ?), (?, ?)"
        );
        assert_eq!(batch.binds.len(), 4);
        assert_eq!(batch.binds[2], BindValue::I64(2));
    }
}
