use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[command(name = "sluice", about)]
pub struct Cli {
    /// Pipeline documents (JSON) to deploy at startup
    #[arg(long = "pipeline", value_name = "FILE")]
    pub pipelines: Vec<PathBuf>,

    /// Override the engine config path (default: config/engine.toml,
    /// or the SLUICE_CONFIG environment variable)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Tokio worker threads
    #[arg(long, default_value_t = default_workers())]
    pub workers: usize,
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(2)
}
