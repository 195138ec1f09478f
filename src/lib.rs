//! Streaming ETL engine: moves records from a durable message log into a
//! columnar analytical database, optionally joining two input streams on
//! the way. At-least-once end to end; every stage boundary is a substrate
//! boundary, so crash recovery is a replay of unacked records.

pub mod appconfig;
pub mod cli;
pub mod config;
pub mod dlq;
pub mod error;
pub mod join;
pub mod metrics;
pub mod pipeline;
pub mod schema;
pub mod sink;
pub mod substrate;

pub use config::PipelineConfig;
pub use error::{EngineError, EngineResult};
pub use pipeline::Engine;

#[cfg(test)]
mod tests;
