use crate::error::{EngineError, EngineResult};
use crate::schema::types::{ColumnType, FieldType};
use base64::Engine as _;
use serde::{Deserialize, Deserializer};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// Declarative pipeline document, deployed through the control surface.
///
/// Parsed from JSON; durations accept Go-style (`3s`, `1m`) and ISO-8601
/// (`PT3S`). Validation runs before the pipeline ever reaches `Running`.
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    pub pipeline_id: String,
    pub source: SourceConfig,
    #[serde(default)]
    pub join: Option<JoinConfig>,
    pub sink: SinkConfig,
    pub dlq: DlqConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    #[serde(rename = "type")]
    pub kind: String,
    pub streams: Vec<StreamConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamConfig {
    pub name: String,
    pub subject: String,
    #[serde(default)]
    pub schema_version_id: Option<String>,
    pub fields: Vec<FieldConfig>,
    #[serde(default)]
    pub join_key_field: Option<String>,
    /// Older schema versions still in flight. A record whose
    /// `schema_version_id` header names one of these decodes against it.
    #[serde(default)]
    pub previous_versions: Vec<SchemaVersionConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchemaVersionConfig {
    pub schema_version_id: String,
    pub fields: Vec<FieldConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FieldConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: String,
}

impl FieldConfig {
    pub fn parsed_type(&self) -> EngineResult<FieldType> {
        FieldType::parse(&self.field_type)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct JoinConfig {
    pub enabled: bool,
    #[serde(deserialize_with = "de_duration")]
    pub left_ttl: Duration,
    #[serde(deserialize_with = "de_duration")]
    pub right_ttl: Duration,
    pub output_stream: String,
    pub output_subject: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SinkConfig {
    #[serde(rename = "type")]
    pub kind: SinkKind,
    pub connection: ConnectionConfig,
    /// Stream the sink consumes (the source stream, or the join output).
    pub stream_id: String,
    pub nats_consumer_name: String,
    pub batch: BatchConfig,
    pub mapping: Vec<ColumnMapping>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    Clickhouse,
    /// In-process table; local runs and the test suite.
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    /// Base64-encoded at rest; decoded once at deploy time.
    pub password: String,
    pub table: String,
    #[serde(default)]
    pub secure: bool,
}

impl ConnectionConfig {
    pub fn password_plain(&self) -> EngineResult<String> {
        let raw = base64::engine::general_purpose::STANDARD
            .decode(&self.password)
            .map_err(|e| EngineError::InvalidConfig(format!("sink password is not base64: {e}")))?;
        String::from_utf8(raw)
            .map_err(|e| EngineError::InvalidConfig(format!("sink password is not UTF-8: {e}")))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatchConfig {
    pub max_batch_size: usize,
    #[serde(deserialize_with = "de_duration")]
    pub max_delay_time: Duration,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ColumnMapping {
    pub column_name: String,
    pub column_type: String,
    pub source_stream: String,
    pub source_field: String,
}

impl ColumnMapping {
    pub fn parsed_type(&self) -> EngineResult<ColumnType> {
        ColumnType::parse(&self.column_type)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DlqConfig {
    pub stream: String,
    pub subject: String,
    pub max_deliver: u32,
}

impl PipelineConfig {
    pub fn from_json_str(raw: &str) -> EngineResult<Self> {
        let cfg: Self = serde_json::from_str(raw)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> EngineResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> EngineResult<()> {
        // ---- Identity
        if self.pipeline_id.trim().is_empty() {
            return Err(EngineError::MissingConfig("pipeline_id"));
        }

        // ---- Source streams
        if self.source.streams.is_empty() {
            return Err(EngineError::InvalidConfig(
                "source.streams: must define at least one stream".into(),
            ));
        }

        let mut seen_names = HashSet::new();
        for (i, stream) in self.source.streams.iter().enumerate() {
            let prefix = format!("source.streams[{i}]");

            if stream.name.trim().is_empty() {
                return Err(EngineError::InvalidConfig(format!(
                    "{prefix}: name must not be empty"
                )));
            }
            if !seen_names.insert(stream.name.clone()) {
                return Err(EngineError::InvalidConfig(format!(
                    "{prefix}: duplicate stream name '{}'",
                    stream.name
                )));
            }
            if stream.subject.trim().is_empty() {
                return Err(EngineError::InvalidConfig(format!(
                    "{prefix}: subject must not be empty"
                )));
            }
            if stream.fields.is_empty() {
                return Err(EngineError::InvalidConfig(format!(
                    "{prefix}: must declare at least one field"
                )));
            }

            let mut seen_fields = HashSet::new();
            for field in &stream.fields {
                if !seen_fields.insert(field.name.as_str()) {
                    return Err(EngineError::InvalidConfig(format!(
                        "{prefix}: duplicate field '{}'",
                        field.name
                    )));
                }
                field.parsed_type().map_err(|e| {
                    EngineError::InvalidConfig(format!("{prefix}.fields['{}']: {e}", field.name))
                })?;
            }

            if let Some(key) = &stream.join_key_field
                && !seen_fields.contains(key.as_str())
            {
                return Err(EngineError::InvalidConfig(format!(
                    "{prefix}: join_key_field '{key}' is not a declared field"
                )));
            }

            let mut seen_versions = HashSet::new();
            if let Some(current) = &stream.schema_version_id {
                seen_versions.insert(current.as_str());
            }
            for version in &stream.previous_versions {
                if !seen_versions.insert(version.schema_version_id.as_str()) {
                    return Err(EngineError::InvalidConfig(format!(
                        "{prefix}: duplicate schema version '{}'",
                        version.schema_version_id
                    )));
                }
                for field in &version.fields {
                    field.parsed_type().map_err(|e| {
                        EngineError::InvalidConfig(format!(
                            "{prefix}.previous_versions['{}']: {e}",
                            version.schema_version_id
                        ))
                    })?;
                }
            }
        }

        // ---- Join
        if let Some(join) = &self.join
            && join.enabled
        {
            if self.source.streams.len() != 2 {
                return Err(EngineError::InvalidConfig(format!(
                    "join: requires exactly 2 source streams, got {}",
                    self.source.streams.len()
                )));
            }
            for stream in &self.source.streams {
                if stream.join_key_field.is_none() {
                    return Err(EngineError::InvalidConfig(format!(
                        "join: stream '{}' has no join_key_field",
                        stream.name
                    )));
                }
            }
            if join.output_stream.trim().is_empty() {
                return Err(EngineError::MissingConfig("join.output_stream"));
            }
            if join.output_subject.trim().is_empty() {
                return Err(EngineError::MissingConfig("join.output_subject"));
            }
        }

        // ---- Sink
        if self.sink.stream_id.trim().is_empty() {
            return Err(EngineError::MissingConfig("sink.stream_id"));
        }
        if self.join_enabled() {
            let output = self.join.as_ref().map(|j| j.output_stream.as_str());
            if Some(self.sink.stream_id.as_str()) != output {
                return Err(EngineError::InvalidConfig(format!(
                    "sink.stream_id '{}' must consume the join output stream",
                    self.sink.stream_id
                )));
            }
        } else if !self
            .source
            .streams
            .iter()
            .any(|s| s.name == self.sink.stream_id)
        {
            return Err(EngineError::InvalidConfig(format!(
                "sink.stream_id '{}' is not a source stream",
                self.sink.stream_id
            )));
        }
        if self.sink.nats_consumer_name.trim().is_empty() {
            return Err(EngineError::MissingConfig("sink.nats_consumer_name"));
        }
        if self.sink.batch.max_batch_size == 0 {
            return Err(EngineError::InvalidConfig(
                "sink.batch.max_batch_size must be >= 1".into(),
            ));
        }
        if self.sink.connection.table.trim().is_empty() {
            return Err(EngineError::MissingConfig("sink.connection.table"));
        }
        if self.sink.connection.database.trim().is_empty() {
            return Err(EngineError::MissingConfig("sink.connection.database"));
        }
        // These names end up inside INSERT/DESCRIBE statements; reject
        // anything outside the identifier charset instead of sanitizing
        // later.
        validate_identifier("sink.connection", "database", &self.sink.connection.database)?;
        validate_identifier("sink.connection", "table", &self.sink.connection.table)?;
        self.sink.connection.password_plain()?;

        if self.sink.mapping.is_empty() {
            return Err(EngineError::InvalidConfig(
                "sink.mapping: must project at least one column".into(),
            ));
        }
        let mut seen_columns = HashSet::new();
        for (i, col) in self.sink.mapping.iter().enumerate() {
            let prefix = format!("sink.mapping[{i}]");
            if !seen_columns.insert(col.column_name.as_str()) {
                return Err(EngineError::InvalidConfig(format!(
                    "{prefix}: duplicate column '{}'",
                    col.column_name
                )));
            }
            validate_identifier(&prefix, "column_name", &col.column_name)?;
            col.parsed_type()
                .map_err(|e| EngineError::InvalidConfig(format!("{prefix}: {e}")))?;

            let Some(stream) = self
                .source
                .streams
                .iter()
                .find(|s| s.name == col.source_stream)
            else {
                return Err(EngineError::InvalidConfig(format!(
                    "{prefix}: unknown source_stream '{}'",
                    col.source_stream
                )));
            };
            if !stream.fields.iter().any(|f| f.name == col.source_field) {
                return Err(EngineError::InvalidConfig(format!(
                    "{prefix}: source_field '{}' is not declared on stream '{}'",
                    col.source_field, col.source_stream
                )));
            }
        }

        // ---- DLQ
        if self.dlq.stream.trim().is_empty() {
            return Err(EngineError::MissingConfig("dlq.stream"));
        }
        if self.dlq.subject.trim().is_empty() {
            return Err(EngineError::MissingConfig("dlq.subject"));
        }
        if self.dlq.max_deliver == 0 {
            return Err(EngineError::InvalidConfig(
                "dlq.max_deliver must be >= 1".into(),
            ));
        }

        Ok(())
    }

    /// True when this pipeline runs the stream-join topology.
    pub fn join_enabled(&self) -> bool {
        self.join.as_ref().map(|j| j.enabled).unwrap_or(false)
    }
}

/// Database identifiers (database, table, column names) are restricted to
/// `[A-Za-z0-9_]+` at validate time; they are the only config strings that
/// reach SQL statements as anything but a bound parameter.
fn validate_identifier(prefix: &str, field: &str, value: &str) -> EngineResult<()> {
    let safe = !value.is_empty()
        && value
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_');
    if !safe {
        return Err(EngineError::InvalidConfig(format!(
            "{prefix}: {field} '{value}' must match [A-Za-z0-9_]+"
        )));
    }
    Ok(())
}

/// Parse a duration string: Go-style (`3s`, `1m30s`, `250ms`, bare `0`) or
/// ISO-8601 (`PT3S`, `PT1M30S`, `P1DT2H`).
pub fn parse_duration(s: &str) -> EngineResult<Duration> {
    let t = s.trim();
    if t == "0" {
        return Ok(Duration::ZERO);
    }
    if t.starts_with('P') || t.starts_with('p') {
        return parse_iso8601_duration(t);
    }
    humantime::parse_duration(t)
        .map_err(|e| EngineError::InvalidConfig(format!("invalid duration '{s}': {e}")))
}

fn parse_iso8601_duration(s: &str) -> EngineResult<Duration> {
    let bad = || EngineError::InvalidConfig(format!("invalid ISO-8601 duration '{s}'"));

    let body = &s[1..]; // past 'P'
    let (date_part, time_part) = match body.split_once(['T', 't']) {
        Some((d, t)) => (d, Some(t)),
        None => (body, None),
    };
    if date_part.is_empty() && time_part.is_none_or(str::is_empty) {
        return Err(bad());
    }

    let mut total = Duration::ZERO;

    let mut consume = |part: &str, units: &[(char, f64)]| -> EngineResult<()> {
        let mut rest = part;
        let mut unit_idx = 0;
        while !rest.is_empty() {
            let digits_end = rest
                .find(|c: char| !c.is_ascii_digit() && c != '.')
                .ok_or_else(|| bad())?;
            if digits_end == 0 {
                return Err(bad());
            }
            let number: f64 = rest[..digits_end].parse().map_err(|_| bad())?;
            let unit = rest[digits_end..].chars().next().ok_or_else(|| bad())?;
            let unit = unit.to_ascii_uppercase();

            // Units must appear in declaration order, each at most once.
            let pos = units[unit_idx..]
                .iter()
                .position(|(u, _)| *u == unit)
                .ok_or_else(|| bad())?;
            let secs_per_unit = units[unit_idx + pos].1;
            unit_idx += pos + 1;

            total += Duration::from_secs_f64(number * secs_per_unit);
            rest = &rest[digits_end + 1..];
        }
        Ok(())
    };

    consume(
        date_part,
        &[('W', 604_800.0), ('D', 86_400.0)],
    )?;
    if let Some(time_part) = time_part {
        consume(time_part, &[('H', 3_600.0), ('M', 60.0), ('S', 1.0)])?;
    }
    Ok(total)
}

fn de_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Seconds(u64),
    }
    match Raw::deserialize(deserializer)? {
        Raw::Text(s) => parse_duration(&s).map_err(serde::de::Error::custom),
        Raw::Seconds(n) => Ok(Duration::from_secs(n)),
    }
}
