use crate::config::parse_duration;
use crate::error::{EngineError, EngineResult};
use serde::Deserialize;
use std::fs;
use std::time::Duration;

/// Process-level engine configuration (TOML). Pipeline documents are
/// deployed separately through the control surface; this file only covers
/// the shared runtime: substrate connection, shutdown, logging, metrics.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    pub substrate: SubstrateConfig,
    #[serde(default)]
    pub shutdown: ShutdownConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubstrateConfig {
    pub kind: SubstrateKind,
    /// NATS server URL; required for `kind = "jetstream"`.
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubstrateKind {
    Jetstream,
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ShutdownConfig {
    /// How long workers get to drain before being aborted.
    #[serde(default = "default_grace_period")]
    pub grace_period: String,
}

impl ShutdownConfig {
    pub fn grace(&self) -> EngineResult<Duration> {
        parse_duration(&self.grace_period)
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            grace_period: default_grace_period(),
        }
    }
}

fn default_grace_period() -> String {
    "30s".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_addr")]
    pub listen_addr: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen_addr: default_metrics_addr(),
        }
    }
}

fn default_metrics_addr() -> String {
    "127.0.0.1:9464".to_string()
}

fn validate_config(cfg: &EngineConfig) -> EngineResult<()> {
    if cfg.substrate.kind == SubstrateKind::Jetstream
        && cfg.substrate.url.as_deref().unwrap_or("").trim().is_empty()
    {
        return Err(EngineError::MissingConfig("substrate.url"));
    }

    let grace = cfg.shutdown.grace()?;
    if grace.is_zero() {
        return Err(EngineError::InvalidConfig(
            "shutdown.grace_period must be > 0".into(),
        ));
    }

    if cfg.metrics.enabled {
        cfg.metrics
            .listen_addr
            .parse::<std::net::SocketAddr>()
            .map_err(|e| {
                EngineError::InvalidConfig(format!(
                    "metrics.listen_addr '{}': {e}",
                    cfg.metrics.listen_addr
                ))
            })?;
    }

    Ok(())
}

const ENGINE_CONFIG_PATH: &str = "config/engine.toml";

pub fn load_engine_config() -> EngineResult<EngineConfig> {
    let path =
        std::env::var("SLUICE_CONFIG").unwrap_or_else(|_| ENGINE_CONFIG_PATH.to_string());
    let contents = fs::read_to_string(&path)?; // EngineError::ConfigIo
    let config: EngineConfig = toml::from_str(&contents)?; // EngineError::ConfigToml
    validate_config(&config)?;
    Ok(config)
}

impl Default for EngineConfig {
    /// Local/dev defaults: in-memory substrate, no metrics listener.
    fn default() -> Self {
        Self {
            substrate: SubstrateConfig {
                kind: SubstrateKind::Memory,
                url: None,
            },
            shutdown: ShutdownConfig::default(),
            logging: LoggingConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jetstream_requires_url() {
        let cfg: EngineConfig = toml::from_str(
            r#"
            [substrate]
            kind = "jetstream"
            "#,
        )
        .unwrap();
        assert!(validate_config(&cfg).is_err());

        let cfg: EngineConfig = toml::from_str(
            r#"
            [substrate]
            kind = "jetstream"
            url = "nats://127.0.0.1:4222"
            "#,
        )
        .unwrap();
        validate_config(&cfg).unwrap();
    }

    #[test]
    fn defaults_are_valid() {
        let cfg = EngineConfig::default();
        validate_config(&cfg).unwrap();
        assert_eq!(cfg.shutdown.grace().unwrap(), Duration::from_secs(30));
    }

    #[test]
    fn bad_metrics_addr_rejected() {
        let cfg: EngineConfig = toml::from_str(
            r#"
            [substrate]
            kind = "memory"

            [metrics]
            enabled = true
            listen_addr = "not-an-addr"
            "#,
        )
        .unwrap();
        assert!(validate_config(&cfg).is_err());
    }
}
