use std::sync::Arc;

use crate::config::AppConfig;
use crate::ingest::batcher::IngestBatcher;
use crate::ingest::ratelimit::ProjectRateLimiter;
use crate::queue::JobQueue;
use crate::storage::{ConfigStore, TelemetryStore};

/// Shared state injected into every handler. All components are built once
/// at startup; nothing is discovered ambiently.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub config_store: ConfigStore,
    pub telemetry: TelemetryStore,
    pub queue: Arc<dyn JobQueue>,
    pub batcher: IngestBatcher,
    pub limiter: Arc<ProjectRateLimiter>,
}
