use crate::error::{EngineError, EngineResult};
use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Sub-second resolution of a datetime column.
///
/// Integer epoch payloads are interpreted in this unit; RFC3339 output is
/// truncated to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DateTimePrecision {
    Seconds,
    Millis,
    Micros,
    Nanos,
}

impl DateTimePrecision {
    pub fn seconds_format(&self) -> SecondsFormat {
        match self {
            DateTimePrecision::Seconds => SecondsFormat::Secs,
            DateTimePrecision::Millis => SecondsFormat::Millis,
            DateTimePrecision::Micros => SecondsFormat::Micros,
            DateTimePrecision::Nanos => SecondsFormat::Nanos,
        }
    }

    /// Digits ClickHouse uses for the matching DateTime64 column.
    pub fn scale(&self) -> u8 {
        match self {
            DateTimePrecision::Seconds => 0,
            DateTimePrecision::Millis => 3,
            DateTimePrecision::Micros => 6,
            DateTimePrecision::Nanos => 9,
        }
    }

    pub fn epoch_to_datetime(&self, epoch: i64) -> Option<DateTime<Utc>> {
        match self {
            DateTimePrecision::Seconds => Utc.timestamp_opt(epoch, 0).single(),
            DateTimePrecision::Millis => Utc.timestamp_millis_opt(epoch).single(),
            DateTimePrecision::Micros => Utc.timestamp_micros(epoch).single(),
            DateTimePrecision::Nanos => Some(Utc.timestamp_nanos(epoch)),
        }
    }
}

/// The closed set of value types a mapped field can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldType {
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float32,
    Float64,
    Bool,
    String,
    Bytes,
    DateTime(DateTimePrecision),
    Uuid,
}

impl FieldType {
    /// Parse a type name. Accepts the lowercase field spellings ("int64",
    /// "datetime64(3)") and the ClickHouse spellings ("Int64",
    /// "DateTime64(3)") interchangeably.
    pub fn parse(s: &str) -> EngineResult<Self> {
        let t = s.trim();
        let lower = t.to_ascii_lowercase();
        let ty = match lower.as_str() {
            "int8" => FieldType::Int8,
            "int16" => FieldType::Int16,
            "int32" => FieldType::Int32,
            "int64" => FieldType::Int64,
            "uint8" => FieldType::UInt8,
            "uint16" => FieldType::UInt16,
            "uint32" => FieldType::UInt32,
            "uint64" => FieldType::UInt64,
            "float32" => FieldType::Float32,
            "float64" => FieldType::Float64,
            "bool" | "boolean" => FieldType::Bool,
            "string" => FieldType::String,
            "bytes" => FieldType::Bytes,
            "datetime" => FieldType::DateTime(DateTimePrecision::Seconds),
            "datetime64(3)" => FieldType::DateTime(DateTimePrecision::Millis),
            "datetime64(6)" => FieldType::DateTime(DateTimePrecision::Micros),
            "datetime64(9)" => FieldType::DateTime(DateTimePrecision::Nanos),
            "uuid" => FieldType::Uuid,
            _ => {
                return Err(EngineError::InvalidConfig(format!(
                    "unknown field type '{t}'"
                )));
            }
        };
        Ok(ty)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::Int8 => "int8",
            FieldType::Int16 => "int16",
            FieldType::Int32 => "int32",
            FieldType::Int64 => "int64",
            FieldType::UInt8 => "uint8",
            FieldType::UInt16 => "uint16",
            FieldType::UInt32 => "uint32",
            FieldType::UInt64 => "uint64",
            FieldType::Float32 => "float32",
            FieldType::Float64 => "float64",
            FieldType::Bool => "bool",
            FieldType::String => "string",
            FieldType::Bytes => "bytes",
            FieldType::DateTime(DateTimePrecision::Seconds) => "datetime",
            FieldType::DateTime(DateTimePrecision::Millis) => "datetime64(3)",
            FieldType::DateTime(DateTimePrecision::Micros) => "datetime64(6)",
            FieldType::DateTime(DateTimePrecision::Nanos) => "datetime64(9)",
            FieldType::Uuid => "uuid",
        }
    }
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed sink column type: base type plus the ClickHouse wrappers the
/// mapper and the insert encoder care about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnType {
    pub base: FieldType,
    pub nullable: bool,
    pub low_cardinality: bool,
}

impl ColumnType {
    /// Parse a ClickHouse column type string, peeling `Nullable(...)` and
    /// `LowCardinality(...)` wrappers in either nesting order.
    pub fn parse(s: &str) -> EngineResult<Self> {
        let mut t = s.trim();
        let mut nullable = false;
        let mut low_cardinality = false;

        loop {
            let lower = t.to_ascii_lowercase();
            if let Some(inner) = strip_wrapper(&lower, t, "nullable(") {
                nullable = true;
                t = inner;
            } else if let Some(inner) = strip_wrapper(&lower, t, "lowcardinality(") {
                low_cardinality = true;
                t = inner;
            } else {
                break;
            }
        }

        Ok(ColumnType {
            base: FieldType::parse(t)?,
            nullable,
            low_cardinality,
        })
    }
}

fn strip_wrapper<'a>(lower: &str, original: &'a str, prefix: &str) -> Option<&'a str> {
    if lower.starts_with(prefix) && lower.ends_with(')') {
        Some(original[prefix.len()..original.len() - 1].trim())
    } else {
        None
    }
}

/// A typed field value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    UInt8(u8),
    UInt16(u16),
    UInt32(u32),
    UInt64(u64),
    Float32(f32),
    Float64(f64),
    Bool(bool),
    String(String),
    Bytes(Bytes),
    DateTime(DateTime<Utc>, DateTimePrecision),
    Uuid(Uuid),
    Null,
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// JSON rendering used for join output records and for re-encoding rows.
    /// uuid → canonical string, datetime → RFC3339 at column precision,
    /// bytes → UTF-8 string (payload fields are JSON, so bytes fields only
    /// ever hold valid UTF-8 on this path).
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::{Number, Value as J};
        match self {
            Value::Int8(v) => J::from(*v),
            Value::Int16(v) => J::from(*v),
            Value::Int32(v) => J::from(*v),
            Value::Int64(v) => J::from(*v),
            Value::UInt8(v) => J::from(*v),
            Value::UInt16(v) => J::from(*v),
            Value::UInt32(v) => J::from(*v),
            Value::UInt64(v) => J::from(*v),
            Value::Float32(v) => Number::from_f64(*v as f64)
                .map(J::Number)
                .unwrap_or(J::Null),
            Value::Float64(v) => Number::from_f64(*v).map(J::Number).unwrap_or(J::Null),
            Value::Bool(v) => J::from(*v),
            Value::String(v) => J::from(v.clone()),
            Value::Bytes(v) => J::from(String::from_utf8_lossy(v).into_owned()),
            Value::DateTime(dt, prec) => J::from(dt.to_rfc3339_opts(prec.seconds_format(), true)),
            Value::Uuid(v) => J::from(v.to_string()),
            Value::Null => J::Null,
        }
    }
}

/// A decoded record: field name → typed value.
///
/// Every field named in the active projection is present; explicit Null is
/// only produced for nullable target columns.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TypedRow {
    fields: BTreeMap<String, Value>,
}

impl TypedRow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: Value) {
        self.fields.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.fields.iter()
    }

    /// Encode as a JSON object (join output wire shape, round-trip tests).
    pub fn to_json(&self) -> serde_json::Value {
        let mut obj = serde_json::Map::new();
        for (name, value) in &self.fields {
            obj.insert(name.clone(), value.to_json());
        }
        serde_json::Value::Object(obj)
    }
}
