use crate::error::{EngineError, EngineResult};
use metrics::{counter, gauge, histogram};
use std::net::SocketAddr;

/// Install the Prometheus exporter with its built-in HTTP listener.
/// Call once at process start, before any pipeline is deployed.
pub fn install_prometheus_exporter(addr: SocketAddr) -> EngineResult<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| EngineError::Internal(format!("failed to install metrics exporter: {e}")))?;
    tracing::info!(%addr, "prometheus exporter listening");
    Ok(())
}

/// Per-pipeline handle over the metrics facade. Cheap to clone; every
/// series carries a `pipeline` label.
#[derive(Debug, Clone)]
pub struct PipelineMetrics {
    pipeline_id: String,
}

impl PipelineMetrics {
    pub fn new(pipeline_id: impl Into<String>) -> Self {
        Self {
            pipeline_id: pipeline_id.into(),
        }
    }

    pub fn inc_records_in(&self, stage: &'static str, n: u64) {
        counter!(
            "sluice_records_in_total",
            "pipeline" => self.pipeline_id.clone(),
            "stage" => stage,
        )
        .increment(n);
    }

    pub fn inc_batches_out(&self) {
        counter!("sluice_batches_out_total", "pipeline" => self.pipeline_id.clone()).increment(1);
    }

    pub fn add_rows_written(&self, n: u64) {
        counter!("sluice_rows_written_total", "pipeline" => self.pipeline_id.clone()).increment(n);
    }

    pub fn inc_dlq(&self, kind: &'static str) {
        counter!(
            "sluice_dlq_records_total",
            "pipeline" => self.pipeline_id.clone(),
            "kind" => kind,
        )
        .increment(1);
    }

    pub fn inc_join_emitted(&self, n: u64) {
        counter!("sluice_join_emitted_total", "pipeline" => self.pipeline_id.clone()).increment(n);
    }

    pub fn inc_redeliveries(&self, n: u64) {
        counter!("sluice_redeliveries_total", "pipeline" => self.pipeline_id.clone()).increment(n);
    }

    pub fn observe_flush_delay(&self, seconds: f64) {
        histogram!("sluice_batch_flush_delay_seconds", "pipeline" => self.pipeline_id.clone())
            .record(seconds);
    }

    pub fn observe_insert_latency(&self, seconds: f64) {
        histogram!("sluice_sink_insert_seconds", "pipeline" => self.pipeline_id.clone())
            .record(seconds);
    }

    pub fn observe_rows_per_batch(&self, rows: f64) {
        histogram!("sluice_rows_per_batch", "pipeline" => self.pipeline_id.clone()).record(rows);
    }

    pub fn set_lag(&self, lag: f64) {
        gauge!("sluice_consumer_lag", "pipeline" => self.pipeline_id.clone()).set(lag);
    }

    pub fn set_lifecycle(&self, state: &'static str) {
        // One gauge per state name; 1 for the active state, 0 clears the rest.
        for s in ["created", "running", "paused", "terminating", "stopped", "failed"] {
            gauge!(
                "sluice_pipeline_state",
                "pipeline" => self.pipeline_id.clone(),
                "state" => s,
            )
            .set(if s == state { 1.0 } else { 0.0 });
        }
    }
}
