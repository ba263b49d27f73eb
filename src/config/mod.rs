use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::domain::{AgentTraceError, Result};

/// Process-wide configuration. Everything is declared up front; there is no
/// dynamic discovery at runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub config_store: StoreConfig,
    pub telemetry_store: StoreConfig,
    pub job_queue: StoreConfig,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,

    #[serde(default)]
    pub ingest: IngestConfig,

    #[serde(default)]
    pub worker: WorkerConfig,

    #[serde(default)]
    pub anomaly: AnomalyConfig,

    pub webhook: WebhookConfig,

    #[serde(default)]
    pub llm: Option<LlmConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Connection URL, e.g. `sqlite://agenttrace-config.db` or
    /// `sqlite::memory:`.
    pub url: String,

    #[serde(default = "default_pool_size")]
    pub max_connections: u32,

    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 3080,
            request_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_prometheus_addr")]
    pub prometheus_addr: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            prometheus_addr: default_prometheus_addr(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Rows buffered per destination table before a flush is forced.
    #[serde(default = "default_max_batch_rows")]
    pub max_batch_rows: usize,

    /// Age of the oldest buffered row before a flush is forced.
    #[serde(default = "default_max_batch_delay_ms")]
    pub max_batch_delay_ms: u64,

    /// Total buffered rows across tables above which ingest returns
    /// backpressure.
    #[serde(default = "default_high_water_rows")]
    pub high_water_rows: usize,

    /// Largest accepted event body in bytes.
    #[serde(default = "default_max_event_bytes")]
    pub max_event_bytes: usize,

    /// Largest accepted batch envelope.
    #[serde(default = "default_max_batch_events")]
    pub max_batch_events: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_batch_rows: default_max_batch_rows(),
            max_batch_delay_ms: default_max_batch_delay_ms(),
            high_water_rows: default_high_water_rows(),
            max_event_bytes: default_max_event_bytes(),
            max_batch_events: default_max_batch_events(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Poll interval when the queue is empty.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Grace period for in-flight jobs on shutdown.
    #[serde(default = "default_grace_period_secs")]
    pub grace_period_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            grace_period_secs: default_grace_period_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyConfig {
    /// Interval between scheduled anomaly scans.
    #[serde(default = "default_scan_interval_secs")]
    pub scan_interval_secs: u64,

    /// Concurrent baseline computations allowed per scan.
    #[serde(default = "default_baseline_concurrency")]
    pub baseline_concurrency: usize,
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            scan_interval_secs: default_scan_interval_secs(),
            baseline_concurrency: default_baseline_concurrency(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// HMAC key for the `X-AgentTrace-Signature` header.
    pub signing_secret: String,

    #[serde(default = "default_webhook_timeout_secs")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Chat-completions style endpoint for LLM-as-judge evaluators.
    pub endpoint: String,
    pub api_key: String,
    pub model: String,

    #[serde(default = "default_llm_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_pool_size() -> u32 {
    10
}

fn default_connection_timeout() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_prometheus_addr() -> String {
    "0.0.0.0:9464".to_string()
}

fn default_max_batch_rows() -> usize {
    1000
}

fn default_max_batch_delay_ms() -> u64 {
    500
}

fn default_high_water_rows() -> usize {
    50_000
}

fn default_max_event_bytes() -> usize {
    256 * 1024
}

fn default_max_batch_events() -> usize {
    500
}

fn default_poll_interval_ms() -> u64 {
    200
}

fn default_grace_period_secs() -> u64 {
    30
}

fn default_scan_interval_secs() -> u64 {
    60
}

fn default_baseline_concurrency() -> usize {
    4
}

fn default_webhook_timeout_secs() -> u64 {
    10
}

fn default_llm_timeout_secs() -> u64 {
    60
}

impl AppConfig {
    /// Load from a TOML file, with `AGENTTRACE_*` environment overrides
    /// (`AGENTTRACE_SERVER__PORT=8080` style).
    pub fn load(path: &Path) -> Result<Self> {
        let config: AppConfig = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("AGENTTRACE_").split("__"))
            .extract()
            .map_err(|e| AgentTraceError::config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// In-memory configuration used by tests and local smoke runs.
    pub fn in_memory() -> Self {
        Self {
            config_store: StoreConfig::memory(),
            telemetry_store: StoreConfig::memory(),
            job_queue: StoreConfig::memory(),
            server: ServerConfig::default(),
            logging: LoggingConfig::default(),
            metrics: MetricsConfig {
                enabled: false,
                ..MetricsConfig::default()
            },
            ingest: IngestConfig::default(),
            worker: WorkerConfig::default(),
            anomaly: AnomalyConfig::default(),
            webhook: WebhookConfig {
                signing_secret: "test-signing-secret".to_string(),
                request_timeout_secs: default_webhook_timeout_secs(),
            },
            llm: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        for (name, store) in [
            ("config_store", &self.config_store),
            ("telemetry_store", &self.telemetry_store),
            ("job_queue", &self.job_queue),
        ] {
            if store.url.is_empty() {
                return Err(AgentTraceError::config(format!("{name}.url must be set")));
            }
            if store.max_connections == 0 {
                return Err(AgentTraceError::config(format!(
                    "{name}.max_connections must be greater than 0"
                )));
            }
        }
        if self.webhook.signing_secret.is_empty() {
            return Err(AgentTraceError::config("webhook.signing_secret must be set"));
        }
        if self.ingest.max_batch_rows == 0 {
            return Err(AgentTraceError::config("ingest.max_batch_rows must be > 0"));
        }
        if self.ingest.high_water_rows < self.ingest.max_batch_rows {
            return Err(AgentTraceError::config(
                "ingest.high_water_rows must be at least max_batch_rows",
            ));
        }
        Ok(())
    }
}

impl StoreConfig {
    pub fn memory() -> Self {
        Self {
            url: "sqlite::memory:".to_string(),
            max_connections: default_pool_size(),
            connection_timeout_secs: default_connection_timeout(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_memory_config_valid() {
        let config = AppConfig::in_memory();
        assert!(config.validate().is_ok());
        assert_eq!(config.ingest.max_batch_rows, 1000);
        assert_eq!(config.ingest.max_batch_delay_ms, 500);
    }

    #[test]
    fn test_empty_url_rejected() {
        let mut config = AppConfig::in_memory();
        config.telemetry_store.url = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_high_water_below_batch_rejected() {
        let mut config = AppConfig::in_memory();
        config.ingest.high_water_rows = 10;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_signing_secret_rejected() {
        let mut config = AppConfig::in_memory();
        config.webhook.signing_secret = String::new();
        assert!(config.validate().is_err());
    }
}
