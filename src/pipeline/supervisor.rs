//! Per-pipeline supervision: stream provisioning, worker spawning,
//! lifecycle transitions, and the status watcher.

use crate::config::{PipelineConfig, SinkKind};
use crate::dlq::DlqRouter;
use crate::error::{EngineError, EngineResult};
use crate::join::{JoinOperator, JoinSideSpec};
use crate::metrics::PipelineMetrics;
use crate::pipeline::health::{HealthCounters, HealthSnapshot, LifecycleState, watch_interval};
use crate::pipeline::{PauseControl, PauseGate};
use crate::schema::mapper::{ProjectedColumn, SchemaMapper};
use crate::sink::backend::SinkBackend;
use crate::sink::batcher::SinkWorker;
use crate::sink::clickhouse::ClickHouseSink;
use crate::sink::memory::MemorySink;
use crate::substrate::types::{AckPolicy, ConsumerSpec, StreamSpec};
use crate::substrate::Substrate;
use arc_swap::ArcSwap;
use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

const DEFAULT_ACK_WAIT: Duration = Duration::from_secs(30);
const FETCH_WAIT: Duration = Duration::from_millis(500);
const JOIN_FETCH_BATCH: usize = 64;

/// Builds the sink backend for a deployed pipeline. Injected into the
/// engine so tests and embedders can supply in-process tables.
#[async_trait]
pub trait SinkFactory: Send + Sync {
    async fn create(
        &self,
        config: &PipelineConfig,
        projection: Arc<[ProjectedColumn]>,
    ) -> EngineResult<Arc<dyn SinkBackend>>;
}

pub struct DefaultSinkFactory;

#[async_trait]
impl SinkFactory for DefaultSinkFactory {
    async fn create(
        &self,
        config: &PipelineConfig,
        projection: Arc<[ProjectedColumn]>,
    ) -> EngineResult<Arc<dyn SinkBackend>> {
        match config.sink.kind {
            SinkKind::Clickhouse => Ok(Arc::new(
                ClickHouseSink::connect(&config.sink.connection, projection).await?,
            )),
            SinkKind::Memory => {
                let columns = projection.iter().map(|c| c.column_name.clone()).collect();
                Ok(Arc::new(MemorySink::new(columns)))
            }
        }
    }
}

struct StateCell {
    state: LifecycleState,
    changed_at: Instant,
}

pub struct SupervisorHandle {
    id: String,
    counters: Arc<HealthCounters>,
    metrics: PipelineMetrics,
    state: Mutex<StateCell>,
    pause: PauseControl,
    cancel: CancellationToken,
    tasks: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
    grace: Duration,
    /// Last snapshot published by the status watcher.
    last_health: ArcSwap<HealthSnapshot>,
}

impl SupervisorHandle {
    /// Provision streams, build the stage workers, and start running.
    pub async fn deploy(
        config: PipelineConfig,
        substrate: Arc<dyn Substrate>,
        sinks: &dyn SinkFactory,
        grace: Duration,
    ) -> EngineResult<Arc<Self>> {
        config.validate()?;
        let id = config.pipeline_id.clone();
        let metrics = PipelineMetrics::new(&id);
        let counters = Arc::new(HealthCounters::default());

        // Streams before consumers: sources, join output, DLQ.
        for stream in &config.source.streams {
            substrate
                .create_stream(StreamSpec {
                    name: stream.name.clone(),
                    subject: stream.subject.clone(),
                    ttl: None,
                })
                .await?;
        }
        if let Some(join) = &config.join
            && join.enabled
        {
            substrate
                .create_stream(StreamSpec {
                    name: join.output_stream.clone(),
                    subject: join.output_subject.clone(),
                    ttl: None,
                })
                .await?;
        }
        substrate
            .create_stream(StreamSpec {
                name: config.dlq.stream.clone(),
                subject: config.dlq.subject.clone(),
                ttl: None,
            })
            .await?;

        let mapper = SchemaMapper::from_config(&config)?;
        let projection: Arc<[ProjectedColumn]> = Arc::from(mapper.projection().to_vec());
        let backend = sinks.create(&config, projection).await?;
        let dlq = DlqRouter::new(substrate.clone(), &config.dlq, metrics.clone());

        let (pause, gate) = PauseControl::new();
        let cancel = CancellationToken::new();

        let handle = Arc::new(Self {
            id: id.clone(),
            counters: counters.clone(),
            metrics: metrics.clone(),
            state: Mutex::new(StateCell {
                state: LifecycleState::Created,
                changed_at: Instant::now(),
            }),
            pause,
            cancel: cancel.clone(),
            tasks: tokio::sync::Mutex::new(Vec::new()),
            grace,
            last_health: ArcSwap::from_pointee(HealthSnapshot::collect(
                &id,
                LifecycleState::Created,
                &counters,
            )),
        });

        let mut tasks = Vec::new();

        if config.join_enabled() {
            let join_operator =
                build_join_operator(&config, &substrate, &dlq, &metrics, &counters, &gate)?;
            tasks.push(handle.spawn_worker("join", join_operator.run(cancel.clone())));
        }

        let sink_worker = SinkWorker {
            substrate: substrate.clone(),
            backend,
            mapper,
            dlq,
            metrics: metrics.clone(),
            counters: counters.clone(),
            consumer: ConsumerSpec {
                stream: config.sink.stream_id.clone(),
                name: config.sink.nats_consumer_name.clone(),
                filter_subject: None,
                ack_policy: AckPolicy::Cumulative,
                ack_wait: DEFAULT_ACK_WAIT,
                max_deliver: config.dlq.max_deliver,
            },
            stream: config.sink.stream_id.clone(),
            max_batch_size: config.sink.batch.max_batch_size,
            max_delay_time: config.sink.batch.max_delay_time,
            max_deliver: config.dlq.max_deliver,
            primary_ingress: !config.join_enabled(),
            fetch_wait: FETCH_WAIT,
            pause: gate,
        };
        tasks.push(handle.spawn_worker("sink", sink_worker.run(cancel.clone())));

        tasks.push(tokio::spawn(status_watcher(
            handle.clone(),
            cancel.clone(),
        )));

        *handle.tasks.lock().await = tasks;
        handle.set_state(LifecycleState::Running);
        info!(pipeline = %id, "pipeline deployed");
        Ok(handle)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    fn lock_state(&self) -> MutexGuard<'_, StateCell> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> LifecycleState {
        self.lock_state().state
    }

    fn set_state(&self, next: LifecycleState) {
        let mut cell = self.lock_state();
        if cell.state == next {
            return;
        }
        info!(pipeline = %self.id, from = %cell.state, to = %next, "pipeline state change");
        cell.state = next;
        cell.changed_at = Instant::now();
        drop(cell);
        self.metrics.set_lifecycle(next.as_str());
    }

    fn spawn_worker(
        self: &Arc<Self>,
        worker: &'static str,
        fut: impl Future<Output = EngineResult<()>> + Send + 'static,
    ) -> JoinHandle<()> {
        let handle = self.clone();
        tokio::spawn(async move {
            match fut.await {
                Ok(()) => debug!(pipeline = %handle.id, worker, "worker exited"),
                Err(EngineError::Cancelled) | Err(EngineError::Shutdown) => {
                    debug!(pipeline = %handle.id, worker, "worker cancelled")
                }
                Err(e) => handle.fail(worker, e),
            }
        })
    }

    /// Fatal per-stage error: record it, fail the pipeline, stop everything.
    fn fail(&self, worker: &'static str, e: EngineError) {
        error!(pipeline = %self.id, worker, error = %e, "pipeline failed");
        self.counters.set_last_error(e.to_string());
        self.set_state(LifecycleState::Failed);
        self.cancel.cancel();
        // Health event for the watcher's subscribers.
        self.last_health.store(Arc::new(self.health()));
    }

    /// Stop fetching; workers stay hot. Idempotent.
    pub fn pause(&self) -> EngineResult<()> {
        match self.state() {
            LifecycleState::Paused => Ok(()),
            LifecycleState::Running => {
                self.pause.set_paused(true);
                self.set_state(LifecycleState::Paused);
                Ok(())
            }
            other => Err(EngineError::InvalidTransition {
                from: other.as_str(),
                to: "paused",
            }),
        }
    }

    /// Idempotent counterpart of [`SupervisorHandle::pause`].
    pub fn resume(&self) -> EngineResult<()> {
        match self.state() {
            LifecycleState::Running => Ok(()),
            LifecycleState::Paused => {
                self.pause.set_paused(false);
                self.set_state(LifecycleState::Running);
                Ok(())
            }
            other => Err(EngineError::InvalidTransition {
                from: other.as_str(),
                to: "running",
            }),
        }
    }

    /// Graceful: drain in-flight work, flush, exit within the grace period.
    /// Forced: abort immediately; unacked records redeliver on restart.
    pub async fn terminate(&self, graceful: bool) -> EngineResult<()> {
        {
            let mut cell = self.lock_state();
            if !cell.state.is_terminal() && cell.state != LifecycleState::Terminating {
                info!(pipeline = %self.id, from = %cell.state, to = "terminating", "pipeline state change");
                cell.state = LifecycleState::Terminating;
                cell.changed_at = Instant::now();
            }
        }
        self.cancel.cancel();

        let mut tasks = std::mem::take(&mut *self.tasks.lock().await);
        if graceful {
            let deadline = Instant::now() + self.grace;
            for task in &mut tasks {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if tokio::time::timeout(remaining, &mut *task).await.is_err() {
                    // Grace exhausted; from here on it is a forced stop.
                    task.abort();
                }
            }
        } else {
            for task in &tasks {
                task.abort();
            }
            for task in tasks {
                let _ = task.await;
            }
        }

        {
            let mut cell = self.lock_state();
            // A failure observed during draining stays Failed.
            if cell.state == LifecycleState::Terminating {
                cell.state = LifecycleState::Stopped;
                cell.changed_at = Instant::now();
            }
        }
        self.metrics.set_lifecycle(self.state().as_str());
        info!(pipeline = %self.id, state = %self.state(), "pipeline terminated");
        Ok(())
    }

    pub fn health(&self) -> HealthSnapshot {
        HealthSnapshot::collect(&self.id, self.state(), &self.counters)
    }

    /// Last snapshot the status watcher published.
    pub fn last_health(&self) -> Arc<HealthSnapshot> {
        self.last_health.load_full()
    }
}

fn build_join_operator(
    config: &PipelineConfig,
    substrate: &Arc<dyn Substrate>,
    dlq: &DlqRouter,
    metrics: &PipelineMetrics,
    counters: &Arc<HealthCounters>,
    gate: &PauseGate,
) -> EngineResult<JoinOperator> {
    let join = config
        .join
        .as_ref()
        .ok_or(EngineError::MissingConfig("join"))?;

    // First declared stream is the left side.
    let mut sides = Vec::with_capacity(2);
    for (stream, ttl) in config
        .source
        .streams
        .iter()
        .zip([join.left_ttl, join.right_ttl])
    {
        let key_field = stream
            .join_key_field
            .clone()
            .ok_or(EngineError::MissingConfig("join_key_field"))?;
        sides.push(JoinSideSpec {
            stream: stream.name.clone(),
            consumer: ConsumerSpec {
                stream: stream.name.clone(),
                name: format!("{}-join-{}", config.pipeline_id, stream.name),
                filter_subject: None,
                ack_policy: AckPolicy::Explicit,
                ack_wait: DEFAULT_ACK_WAIT,
                max_deliver: config.dlq.max_deliver,
            },
            key_field,
            fields: stream.fields.iter().map(|f| f.name.clone()).collect(),
            ttl,
        });
    }
    let right = sides.pop().ok_or(EngineError::MissingConfig("source.streams"))?;
    let left = sides.pop().ok_or(EngineError::MissingConfig("source.streams"))?;

    Ok(JoinOperator {
        substrate: substrate.clone(),
        dlq: dlq.clone(),
        metrics: metrics.clone(),
        counters: counters.clone(),
        left,
        right,
        output_subject: join.output_subject.clone(),
        fetch_batch: JOIN_FETCH_BATCH,
        fetch_wait: FETCH_WAIT,
        pause: gate.clone(),
    })
}

/// Periodic status publisher: fast polls right after a state change,
/// settling to a slow steady-state cadence.
async fn status_watcher(handle: Arc<SupervisorHandle>, cancel: CancellationToken) {
    loop {
        let since = {
            let cell = handle.lock_state();
            cell.changed_at
        };
        let interval = watch_interval(since.elapsed());
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }

        let state = handle.state();
        let snapshot = handle.health();
        debug!(
            pipeline = %snapshot.pipeline_id,
            state = %snapshot.state,
            records_in = snapshot.records_in,
            batches_out = snapshot.batches_out,
            dlq = snapshot.dlq_count,
            lag = snapshot.lag,
            "pipeline status"
        );
        handle.last_health.store(Arc::new(snapshot));

        if state.is_terminal() {
            break;
        }
    }
}
