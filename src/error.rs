use thiserror::Error;

/// Crate-wide result type.
pub type EngineResult<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    // =========
    // Config / deploy-time
    // =========
    #[error("Configuration file IO error: {0}")]
    ConfigIo(#[from] std::io::Error),

    #[error("Failed to parse TOML config: {0}")]
    ConfigToml(#[from] toml::de::Error),

    #[error("Missing configuration field: {0}")]
    MissingConfig(&'static str),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // =========
    // Serialization / deserialization
    // =========
    #[error("JSON serialization/deserialization error: {0}")]
    Json(#[from] serde_json::Error),

    // =========
    // Stream substrate
    // =========
    #[error("Substrate connect error: {0}")]
    SubstrateConnect(String),

    #[error("Substrate error: {0}")]
    Substrate(String),

    #[error("Stream not found: {0}")]
    StreamNotFound(String),

    #[error("Consumer not found: {0}")]
    ConsumerNotFound(String),

    /// Bounded retry gave up; the pipeline transitions to Failed.
    #[error("Retries exhausted after {attempts} attempts: {last_error}")]
    RetryExhausted { attempts: u32, last_error: String },

    // =========
    // Schema mapping
    // =========
    #[error("Schema coercion failed for field '{field}': {detail}")]
    SchemaCoercion { field: String, detail: String },

    #[error("Unknown schema version '{version}' for stream '{stream}'")]
    SchemaVersion { stream: String, version: String },

    // =========
    // Sink / DB
    // =========
    #[error("ClickHouse error: {0}")]
    ClickHouse(#[from] clickhouse::error::Error),

    #[error("Sink insert error: {0}")]
    SinkInsert(String),

    // =========
    // Pipeline lifecycle
    // =========
    #[error("Pipeline not found: {0}")]
    PipelineNotFound(String),

    #[error("Pipeline already exists: {0}")]
    PipelineAlreadyExists(String),

    #[error("Invalid lifecycle transition: {from} -> {to}")]
    InvalidTransition { from: &'static str, to: &'static str },

    #[error("Failed to spawn task: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),

    #[error("Shutdown requested")]
    Shutdown,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Stable per-record failure tag, carried on DLQ messages.
///
/// These names are part of the DLQ wire format; downstream tooling filters
/// on them, so they must not change casually.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    SchemaCoercion,
    SchemaVersion,
    JoinPublish,
    SinkInsert,
    MaxDeliverExceeded,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::SchemaCoercion => "SchemaCoercionError",
            FailureKind::SchemaVersion => "SchemaVersionError",
            FailureKind::JoinPublish => "JoinPublishError",
            FailureKind::SinkInsert => "SinkInsertError",
            FailureKind::MaxDeliverExceeded => "MaxDeliverExceeded",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl EngineError {
    /// Per-record failure classification for DLQ routing.
    ///
    /// Returns None for errors that are not per-record (fatal transport,
    /// config, lifecycle); those bubble to the supervisor instead.
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            EngineError::SchemaCoercion { .. } => Some(FailureKind::SchemaCoercion),
            EngineError::SchemaVersion { .. } => Some(FailureKind::SchemaVersion),
            EngineError::SinkInsert(_) => Some(FailureKind::SinkInsert),
            _ => None,
        }
    }
}
