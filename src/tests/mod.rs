//! In-crate integration suites: full pipelines over the in-memory
//! substrate and sink backends.

mod scenarios;

use crate::config::PipelineConfig;
use crate::error::EngineResult;
use crate::pipeline::Engine;
use crate::pipeline::supervisor::SinkFactory;
use crate::schema::mapper::ProjectedColumn;
use crate::sink::backend::{SEQ_COLUMN, SinkBackend};
use crate::sink::memory::MemorySink;
use crate::substrate::{MemorySubstrate, Substrate};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Sink factory that hands out in-memory tables and keeps a handle to each
/// so tests can inspect committed rows.
pub(crate) struct TestSinkFactory {
    with_seq_column: bool,
    created: Mutex<HashMap<String, MemorySink>>,
}

impl TestSinkFactory {
    fn new(with_seq_column: bool) -> Self {
        Self {
            with_seq_column,
            created: Mutex::new(HashMap::new()),
        }
    }

    fn sink(&self, pipeline_id: &str) -> MemorySink {
        self.created
            .lock()
            .unwrap()
            .get(pipeline_id)
            .expect("sink not created yet")
            .clone()
    }
}

#[async_trait]
impl SinkFactory for TestSinkFactory {
    async fn create(
        &self,
        config: &PipelineConfig,
        projection: Arc<[ProjectedColumn]>,
    ) -> EngineResult<Arc<dyn SinkBackend>> {
        let mut columns: Vec<String> =
            projection.iter().map(|c| c.column_name.clone()).collect();
        if self.with_seq_column {
            columns.push(SEQ_COLUMN.to_string());
        }
        let sink = MemorySink::new(columns);
        self.created
            .lock()
            .unwrap()
            .insert(config.pipeline_id.clone(), sink.clone());
        Ok(Arc::new(sink))
    }
}

pub(crate) struct TestRig {
    pub substrate: MemorySubstrate,
    pub sinks: Arc<TestSinkFactory>,
    pub engine: Engine,
}

impl TestRig {
    pub fn new() -> Self {
        Self::with_seq_column(false)
    }

    pub fn with_seq_column(with_seq_column: bool) -> Self {
        let substrate = MemorySubstrate::new();
        let sinks = Arc::new(TestSinkFactory::new(with_seq_column));
        let engine = Engine::new(
            Arc::new(substrate.clone()),
            sinks.clone(),
            Duration::from_secs(5),
        );
        Self {
            substrate,
            sinks,
            engine,
        }
    }

    pub async fn publish_json(&self, subject: &str, payload: serde_json::Value) -> u64 {
        self.publish_json_with_headers(subject, payload, BTreeMap::new())
            .await
    }

    pub async fn publish_json_with_headers(
        &self,
        subject: &str,
        payload: serde_json::Value,
        headers: BTreeMap<String, String>,
    ) -> u64 {
        self.substrate
            .publish(subject, Bytes::from(payload.to_string()), &headers)
            .await
            .expect("publish failed")
    }

    pub fn sink(&self, pipeline_id: &str) -> MemorySink {
        self.sinks.sink(pipeline_id)
    }
}

/// Poll a pipeline's health until `pred` holds or `timeout` expires.
pub(crate) async fn wait_health(
    engine: &Engine,
    pipeline_id: &str,
    timeout: Duration,
    pred: impl Fn(&crate::pipeline::HealthSnapshot) -> bool,
) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Ok(health) = engine.get_health(pipeline_id).await
            && pred(&health)
        {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Poll `cond` every 10ms until it holds or `timeout` expires.
pub(crate) async fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Pipeline over a single `users` stream with the event schema the simple
/// sink scenarios use.
pub(crate) fn users_pipeline(id: &str, max_batch_size: usize, max_delay: &str) -> PipelineConfig {
    let doc = serde_json::json!({
        "pipeline_id": id,
        "source": {
            "type": "stream",
            "streams": [{
                "name": "users",
                "subject": "ingest.users",
                "fields": [
                    {"name": "event_id", "type": "uuid"},
                    {"name": "name", "type": "string"},
                    {"name": "email", "type": "string"},
                    {"name": "timestamp", "type": "datetime"},
                    {"name": "action", "type": "string"}
                ]
            }]
        },
        "sink": {
            "type": "memory",
            "connection": {
                "host": "localhost", "port": 9000, "database": "analytics",
                "username": "default", "password": "c2VjcmV0", "table": "user_events"
            },
            "stream_id": "users",
            "nats_consumer_name": format!("{id}-sink"),
            "batch": {"max_batch_size": max_batch_size, "max_delay_time": max_delay},
            "mapping": [
                {"column_name": "event_id", "column_type": "UUID",
                 "source_stream": "users", "source_field": "event_id"},
                {"column_name": "name", "column_type": "String",
                 "source_stream": "users", "source_field": "name"},
                {"column_name": "email", "column_type": "String",
                 "source_stream": "users", "source_field": "email"},
                {"column_name": "timestamp", "column_type": "DateTime",
                 "source_stream": "users", "source_field": "timestamp"},
                {"column_name": "action", "column_type": "String",
                 "source_stream": "users", "source_field": "action"}
            ]
        },
        "dlq": {"stream": "dlq", "subject": format!("dlq.{id}"), "max_deliver": 5}
    });
    PipelineConfig::from_json_str(&doc.to_string()).expect("config invalid")
}

pub(crate) fn user_event(name: &str, email: &str, action: &str) -> serde_json::Value {
    serde_json::json!({
        "event_id": uuid::Uuid::new_v4().to_string(),
        "name": name,
        "email": email,
        "timestamp": "2024-05-01T10:00:00Z",
        "action": action
    })
}

/// Two-stream join pipeline: left `{id, name}`, right `{id, email}`,
/// joined on `id` into an `id, name, email` projection.
pub(crate) fn join_pipeline(id: &str, left_ttl: &str, right_ttl: &str) -> PipelineConfig {
    let doc = serde_json::json!({
        "pipeline_id": id,
        "source": {
            "type": "stream",
            "streams": [
                {
                    "name": "accounts",
                    "subject": "ingest.accounts",
                    "fields": [
                        {"name": "id", "type": "int64"},
                        {"name": "name", "type": "string"}
                    ],
                    "join_key_field": "id"
                },
                {
                    "name": "contacts",
                    "subject": "ingest.contacts",
                    "fields": [
                        {"name": "id", "type": "int64"},
                        {"name": "email", "type": "string"}
                    ],
                    "join_key_field": "id"
                }
            ]
        },
        "join": {
            "enabled": true,
            "left_ttl": left_ttl,
            "right_ttl": right_ttl,
            "output_stream": "joined",
            "output_subject": "joined.accounts"
        },
        "sink": {
            "type": "memory",
            "connection": {
                "host": "localhost", "port": 9000, "database": "analytics",
                "username": "default", "password": "c2VjcmV0", "table": "joined_accounts"
            },
            "stream_id": "joined",
            "nats_consumer_name": format!("{id}-sink"),
            "batch": {"max_batch_size": 1, "max_delay_time": "10s"},
            "mapping": [
                {"column_name": "id", "column_type": "Int64",
                 "source_stream": "accounts", "source_field": "id"},
                {"column_name": "name", "column_type": "String",
                 "source_stream": "accounts", "source_field": "name"},
                {"column_name": "email", "column_type": "String",
                 "source_stream": "contacts", "source_field": "email"}
            ]
        },
        "dlq": {"stream": "dlq", "subject": format!("dlq.{id}"), "max_deliver": 5}
    });
    PipelineConfig::from_json_str(&doc.to_string()).expect("config invalid")
}
