// Process-wide tracing and metrics initialization. Called once at startup;
// components receive everything else by injection.

use std::net::SocketAddr;

use metrics_exporter_prometheus::PrometheusBuilder;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{LoggingConfig, MetricsConfig};
use crate::domain::{AgentTraceError, Result};

/// Install the global tracing subscriber. `RUST_LOG` overrides the
/// configured level.
pub fn init_tracing(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("agenttrace={},info", config.level)));

    if config.json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

/// Install the Prometheus exporter on its own listener.
pub fn init_metrics(config: &MetricsConfig) -> Result<()> {
    if !config.enabled {
        tracing::info!("Metrics exporter disabled");
        return Ok(());
    }

    let addr: SocketAddr = config
        .prometheus_addr
        .parse()
        .map_err(|e| AgentTraceError::config(format!("invalid prometheus address: {e}")))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| AgentTraceError::config(format!("failed to install metrics exporter: {e}")))?;

    tracing::info!(%addr, "Prometheus metrics exporter listening");
    metrics::counter!("agenttrace_build_info", 1);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_metrics_is_noop() {
        let config = MetricsConfig {
            enabled: false,
            prometheus_addr: "not-an-addr".into(),
        };
        assert!(init_metrics(&config).is_ok());
    }

    #[test]
    fn test_bad_address_rejected() {
        let config = MetricsConfig {
            enabled: true,
            prometheus_addr: "not-an-addr".into(),
        };
        assert!(init_metrics(&config).is_err());
    }
}
