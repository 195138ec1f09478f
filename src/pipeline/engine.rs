//! Process-wide engine: the registry of deployed pipelines and the
//! control surface callers drive lifecycle through.

use crate::appconfig::{EngineConfig, SubstrateKind};
use crate::config::PipelineConfig;
use crate::error::{EngineError, EngineResult};
use crate::pipeline::health::HealthSnapshot;
use crate::pipeline::supervisor::{DefaultSinkFactory, SinkFactory, SupervisorHandle};
use crate::substrate::{JetStreamSubstrate, MemorySubstrate, Substrate};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::info;

/// Owns the `pipeline_id -> SupervisorHandle` registry. Explicitly
/// constructed and passed around; there is no global instance.
pub struct Engine {
    substrate: Arc<dyn Substrate>,
    sinks: Arc<dyn SinkFactory>,
    grace: Duration,
    pipelines: Mutex<HashMap<String, Arc<SupervisorHandle>>>,
}

impl Engine {
    pub fn new(
        substrate: Arc<dyn Substrate>,
        sinks: Arc<dyn SinkFactory>,
        grace: Duration,
    ) -> Self {
        Self {
            substrate,
            sinks,
            grace,
            pipelines: Mutex::new(HashMap::new()),
        }
    }

    /// Build an engine from the process configuration: connects the
    /// substrate and wires the default sink factory.
    pub async fn connect(config: &EngineConfig) -> EngineResult<Self> {
        let substrate: Arc<dyn Substrate> = match config.substrate.kind {
            SubstrateKind::Jetstream => {
                let url = config
                    .substrate
                    .url
                    .as_deref()
                    .ok_or(EngineError::MissingConfig("substrate.url"))?;
                Arc::new(JetStreamSubstrate::connect(url).await?)
            }
            SubstrateKind::Memory => Arc::new(MemorySubstrate::new()),
        };
        Ok(Self::new(
            substrate,
            Arc::new(DefaultSinkFactory),
            config.shutdown.grace()?,
        ))
    }

    pub fn substrate(&self) -> Arc<dyn Substrate> {
        self.substrate.clone()
    }

    /// Validate and start a pipeline. A pipeline id can be reused only
    /// after its previous incarnation reached a terminal state.
    pub async fn deploy(&self, config: PipelineConfig) -> EngineResult<()> {
        config.validate()?;
        let mut pipelines = self.pipelines.lock().await;
        if let Some(existing) = pipelines.get(&config.pipeline_id)
            && !existing.state().is_terminal()
        {
            return Err(EngineError::PipelineAlreadyExists(
                config.pipeline_id.clone(),
            ));
        }
        let id = config.pipeline_id.clone();
        let handle = SupervisorHandle::deploy(
            config,
            self.substrate.clone(),
            self.sinks.as_ref(),
            self.grace,
        )
        .await?;
        pipelines.insert(id, handle);
        Ok(())
    }

    pub async fn pause(&self, pipeline_id: &str) -> EngineResult<()> {
        self.get(pipeline_id).await?.pause()
    }

    pub async fn resume(&self, pipeline_id: &str) -> EngineResult<()> {
        self.get(pipeline_id).await?.resume()
    }

    pub async fn terminate(&self, pipeline_id: &str, graceful: bool) -> EngineResult<()> {
        self.get(pipeline_id).await?.terminate(graceful).await
    }

    pub async fn get_health(&self, pipeline_id: &str) -> EngineResult<HealthSnapshot> {
        Ok(self.get(pipeline_id).await?.health())
    }

    pub async fn list_health(&self) -> Vec<HealthSnapshot> {
        let pipelines = self.pipelines.lock().await;
        pipelines.values().map(|h| h.health()).collect()
    }

    /// Gracefully terminate every registered pipeline.
    pub async fn shutdown(&self) -> EngineResult<()> {
        let handles: Vec<_> = {
            let pipelines = self.pipelines.lock().await;
            pipelines.values().cloned().collect()
        };
        for handle in handles {
            if !handle.state().is_terminal() {
                info!(pipeline = %handle.id(), "shutting down pipeline");
                handle.terminate(true).await?;
            }
        }
        Ok(())
    }

    async fn get(&self, pipeline_id: &str) -> EngineResult<Arc<SupervisorHandle>> {
        let pipelines = self.pipelines.lock().await;
        pipelines
            .get(pipeline_id)
            .cloned()
            .ok_or_else(|| EngineError::PipelineNotFound(pipeline_id.to_string()))
    }
}
