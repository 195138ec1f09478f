use anyhow::Context;
use clap::Parser;
use sluice::appconfig::{self, EngineConfig};
use sluice::cli::Cli;
use sluice::config::PipelineConfig;
use sluice::pipeline::Engine;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(cli.workers)
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    runtime.block_on(run(cli))
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(&cli)?;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    if config.metrics.enabled {
        let addr = config
            .metrics
            .listen_addr
            .parse()
            .context("invalid metrics listen address")?;
        sluice::metrics::install_prometheus_exporter(addr)?;
    }

    let engine = Engine::connect(&config).await?;
    tracing::info!(substrate = ?config.substrate.kind, "engine started");

    for path in &cli.pipelines {
        let pipeline = PipelineConfig::from_json_file(path)
            .with_context(|| format!("loading pipeline {}", path.display()))?;
        let id = pipeline.pipeline_id.clone();
        engine.deploy(pipeline).await?;
        tracing::info!(pipeline = %id, "deployed from {}", path.display());
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    tracing::info!("shutdown signal received, draining pipelines");
    engine.shutdown().await?;

    for health in engine.list_health().await {
        tracing::info!(
            pipeline = %health.pipeline_id,
            state = %health.state,
            records_in = health.records_in,
            rows_written = health.rows_written,
            dlq = health.dlq_count,
            "final pipeline status"
        );
    }
    Ok(())
}

fn load_config(cli: &Cli) -> anyhow::Result<EngineConfig> {
    if let Some(path) = &cli.config {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        return Ok(toml::from_str(&raw)?);
    }
    match appconfig::load_engine_config() {
        Ok(config) => Ok(config),
        // No config file: run on in-process defaults.
        Err(sluice::EngineError::ConfigIo(_)) => Ok(EngineConfig::default()),
        Err(e) => Err(e.into()),
    }
}
