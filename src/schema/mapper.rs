//! Decodes raw payloads into database-ready rows.
//!
//! Pure function over (config, payload): no substrate or DB access. Each
//! record is parsed JSON-first into a generic tree, then every projected
//! column is extracted and coerced into its column type.

use crate::config::PipelineConfig;
use crate::error::{EngineError, EngineResult};
use crate::schema::types::{ColumnType, DateTimePrecision, FieldType, TypedRow, Value};
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap, HashSet};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct ProjectedColumn {
    pub column_name: String,
    pub column_type: ColumnType,
    pub source_stream: String,
    pub source_field: String,
}

#[derive(Debug, Clone)]
struct StreamSchema {
    /// Fields of the latest version.
    latest: HashSet<String>,
    /// Version id → declared field names, including the latest under its id.
    versions: HashMap<String, HashSet<String>>,
}

/// Whether the mapped stream carries plain source records or join output
/// (whose keys are `<stream>.<field>`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PayloadShape {
    Source,
    Joined,
}

#[derive(Debug, Clone)]
pub struct SchemaMapper {
    streams: HashMap<String, StreamSchema>,
    projection: Vec<ProjectedColumn>,
    shape: PayloadShape,
}

impl SchemaMapper {
    pub fn from_config(config: &PipelineConfig) -> EngineResult<Self> {
        let mut streams = HashMap::new();
        for stream in &config.source.streams {
            let latest: HashSet<String> =
                stream.fields.iter().map(|f| f.name.clone()).collect();
            let mut versions = HashMap::new();
            if let Some(id) = &stream.schema_version_id {
                versions.insert(id.clone(), latest.clone());
            }
            for prev in &stream.previous_versions {
                versions.insert(
                    prev.schema_version_id.clone(),
                    prev.fields.iter().map(|f| f.name.clone()).collect(),
                );
            }
            streams.insert(stream.name.clone(), StreamSchema { latest, versions });
        }

        let mut projection = Vec::with_capacity(config.sink.mapping.len());
        for col in &config.sink.mapping {
            projection.push(ProjectedColumn {
                column_name: col.column_name.clone(),
                column_type: col.parsed_type()?,
                source_stream: col.source_stream.clone(),
                source_field: col.source_field.clone(),
            });
        }

        let shape = if config.join_enabled() {
            PayloadShape::Joined
        } else {
            PayloadShape::Source
        };

        Ok(Self {
            streams,
            projection,
            shape,
        })
    }

    pub fn projection(&self) -> &[ProjectedColumn] {
        &self.projection
    }

    /// Decode one payload into a row keyed by column name.
    ///
    /// `stream` is the stream the record was consumed from; `headers` may
    /// carry a schema version tag. Every projected column is present in the
    /// result (Null only for nullable columns).
    pub fn map(
        &self,
        stream: &str,
        payload: &Bytes,
        headers: &BTreeMap<String, String>,
    ) -> EngineResult<TypedRow> {
        let tree: serde_json::Value = serde_json::from_slice(payload).map_err(|e| {
            EngineError::SchemaCoercion {
                field: "$payload".into(),
                detail: format!("payload is not valid JSON: {e}"),
            }
        })?;
        let obj = tree.as_object().ok_or_else(|| EngineError::SchemaCoercion {
            field: "$payload".into(),
            detail: "payload is not a JSON object".into(),
        })?;

        // Version resolution only applies to plain source records; join
        // output was assembled from already-resolved sides.
        let declared = match self.shape {
            PayloadShape::Source => {
                let schema = self
                    .streams
                    .get(stream)
                    .ok_or_else(|| EngineError::StreamNotFound(stream.to_string()))?;
                Some(self.resolve_version(stream, schema, headers)?)
            }
            PayloadShape::Joined => None,
        };

        let mut row = TypedRow::new();
        for col in &self.projection {
            let key = match self.shape {
                PayloadShape::Source => col.source_field.clone(),
                PayloadShape::Joined => format!("{}.{}", col.source_stream, col.source_field),
            };

            // A field outside the active schema version is treated as absent
            // even if the payload happens to carry it.
            let in_schema = declared
                .as_ref()
                .map(|d| d.contains(col.source_field.as_str()))
                .unwrap_or(true);

            let raw = if in_schema { obj.get(&key) } else { None };
            let value = match raw {
                None | Some(serde_json::Value::Null) => {
                    if col.column_type.nullable {
                        Value::Null
                    } else {
                        return Err(EngineError::SchemaCoercion {
                            field: key,
                            detail: format!(
                                "missing value for non-nullable column '{}'",
                                col.column_name
                            ),
                        });
                    }
                }
                Some(raw) => coerce(raw, col.column_type.base).map_err(|detail| {
                    EngineError::SchemaCoercion { field: key, detail }
                })?,
            };
            row.insert(col.column_name.clone(), value);
        }
        Ok(row)
    }

    fn resolve_version<'a>(
        &self,
        stream: &str,
        schema: &'a StreamSchema,
        headers: &BTreeMap<String, String>,
    ) -> EngineResult<&'a HashSet<String>> {
        match headers.get(crate::substrate::types::SCHEMA_VERSION_HEADER) {
            Some(version) if !schema.versions.is_empty() => schema
                .versions
                .get(version)
                .ok_or_else(|| EngineError::SchemaVersion {
                    stream: stream.to_string(),
                    version: version.clone(),
                }),
            _ => Ok(&schema.latest),
        }
    }
}

/// Coerce a JSON value into the target type.
///
/// Order: exact type match, numeric widening, string parsing for
/// uuid/datetime/numeric targets. Anything else is a coercion failure.
fn coerce(raw: &serde_json::Value, target: FieldType) -> Result<Value, String> {
    use serde_json::Value as J;
    match target {
        FieldType::Int8 => int_value(raw, i8::MIN as i64, i8::MAX as i64)
            .map(|v| Value::Int8(v as i8)),
        FieldType::Int16 => int_value(raw, i16::MIN as i64, i16::MAX as i64)
            .map(|v| Value::Int16(v as i16)),
        FieldType::Int32 => int_value(raw, i32::MIN as i64, i32::MAX as i64)
            .map(|v| Value::Int32(v as i32)),
        FieldType::Int64 => int_value(raw, i64::MIN, i64::MAX).map(Value::Int64),
        FieldType::UInt8 => uint_value(raw, u8::MAX as u64).map(|v| Value::UInt8(v as u8)),
        FieldType::UInt16 => uint_value(raw, u16::MAX as u64).map(|v| Value::UInt16(v as u16)),
        FieldType::UInt32 => uint_value(raw, u32::MAX as u64).map(|v| Value::UInt32(v as u32)),
        FieldType::UInt64 => uint_value(raw, u64::MAX).map(Value::UInt64),
        FieldType::Float32 => float_value(raw).map(|v| Value::Float32(v as f32)),
        FieldType::Float64 => float_value(raw).map(Value::Float64),
        FieldType::Bool => match raw {
            J::Bool(b) => Ok(Value::Bool(*b)),
            other => Err(type_mismatch("bool", other)),
        },
        FieldType::String => match raw {
            J::String(s) => Ok(Value::String(s.clone())),
            other => Err(type_mismatch("string", other)),
        },
        FieldType::Bytes => match raw {
            J::String(s) => Ok(Value::Bytes(Bytes::from(s.clone().into_bytes()))),
            other => Err(type_mismatch("bytes", other)),
        },
        FieldType::DateTime(precision) => datetime_value(raw, precision),
        FieldType::Uuid => match raw {
            J::String(s) => parse_canonical_uuid(s).map(Value::Uuid),
            other => Err(type_mismatch("uuid", other)),
        },
    }
}

fn type_mismatch(expected: &str, got: &serde_json::Value) -> String {
    let kind = match got {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    };
    format!("expected {expected}, got {kind}")
}

fn int_value(raw: &serde_json::Value, min: i64, max: i64) -> Result<i64, String> {
    let n = match raw {
        serde_json::Value::Number(n) => n
            .as_i64()
            .ok_or_else(|| format!("number {n} is not an integer in range"))?,
        serde_json::Value::String(s) => s
            .parse::<i64>()
            .map_err(|_| format!("string '{s}' is not an integer"))?,
        other => return Err(type_mismatch("integer", other)),
    };
    if n < min || n > max {
        return Err(format!("integer {n} out of range [{min}, {max}]"));
    }
    Ok(n)
}

fn uint_value(raw: &serde_json::Value, max: u64) -> Result<u64, String> {
    let n = match raw {
        serde_json::Value::Number(n) => n
            .as_u64()
            .ok_or_else(|| format!("number {n} is not an unsigned integer"))?,
        serde_json::Value::String(s) => s
            .parse::<u64>()
            .map_err(|_| format!("string '{s}' is not an unsigned integer"))?,
        other => return Err(type_mismatch("unsigned integer", other)),
    };
    if n > max {
        return Err(format!("integer {n} out of range [0, {max}]"));
    }
    Ok(n)
}

fn float_value(raw: &serde_json::Value) -> Result<f64, String> {
    match raw {
        // Integers widen into floats.
        serde_json::Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| format!("number {n} is not representable as float")),
        serde_json::Value::String(s) => s
            .parse::<f64>()
            .map_err(|_| format!("string '{s}' is not a number")),
        other => Err(type_mismatch("float", other)),
    }
}

fn datetime_value(
    raw: &serde_json::Value,
    precision: DateTimePrecision,
) -> Result<Value, String> {
    match raw {
        // Integer epoch, unit inferred from the column precision.
        serde_json::Value::Number(n) => {
            let epoch = n
                .as_i64()
                .ok_or_else(|| format!("epoch {n} is not an integer"))?;
            let dt = precision
                .epoch_to_datetime(epoch)
                .ok_or_else(|| format!("epoch {epoch} out of datetime range"))?;
            Ok(Value::DateTime(dt, precision))
        }
        serde_json::Value::String(s) => {
            let dt = chrono::DateTime::parse_from_rfc3339(s)
                .map_err(|e| format!("'{s}' is not RFC3339: {e}"))?;
            Ok(Value::DateTime(dt.with_timezone(&chrono::Utc), precision))
        }
        other => Err(type_mismatch("datetime", other)),
    }
}

/// Canonical 8-4-4-4-12 hex only; braced/urn forms are rejected.
fn parse_canonical_uuid(s: &str) -> Result<Uuid, String> {
    let canonical = s.len() == 36
        && s.bytes().enumerate().all(|(i, b)| match i {
            8 | 13 | 18 | 23 => b == b'-',
            _ => b.is_ascii_hexdigit(),
        });
    if !canonical {
        return Err(format!("'{s}' is not a canonical uuid"));
    }
    Uuid::parse_str(s).map_err(|e| format!("'{s}' is not a uuid: {e}"))
}
