// Component wiring: builds the stores, queue, batcher, worker pool and API
// state from one config struct.

use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::anomaly::AnomalyScanHandler;
use crate::api::AppState;
use crate::config::AppConfig;
use crate::cost::{CostCalculateHandler, CostRecomputeHandler, PriceResolver};
use crate::domain::Result;
use crate::evals::{
    DisabledLlmClient, EvaluationRunHandler, HttpLlmClient, LlmClient, TraceCompleteHandler,
};
use crate::ingest::batcher::{IngestBatcher, TelemetryFlushHandler};
use crate::ingest::ratelimit::ProjectRateLimiter;
use crate::queue::{EnqueueOptions, JobKind, JobQueue, QueueClass, SqlJobQueue};
use crate::retention::{RetentionSweepHandler, SWEEP_UNIQUE_KEY};
use crate::storage::{connect, ConfigStore, StoreKind, TelemetryStore};
use crate::webhook::WebhookDeliverHandler;
use crate::worker::{HandlerOptions, WorkerPool};

pub struct App {
    pub state: AppState,
    pub worker_pool: WorkerPool,
}

/// Build every component. Fails fast on unreachable stores or bad config;
/// the process exits non-zero in that case.
pub async fn build(config: AppConfig) -> Result<App> {
    config.validate()?;
    let config = Arc::new(config);

    let config_pool = connect(StoreKind::Config, &config.config_store).await?;
    let telemetry_pool = connect(StoreKind::Telemetry, &config.telemetry_store).await?;
    let queue_pool = connect(StoreKind::Queue, &config.job_queue).await?;

    let config_store = ConfigStore::new(config_pool);
    let telemetry = TelemetryStore::new(telemetry_pool);
    let queue: Arc<dyn JobQueue> = Arc::new(SqlJobQueue::new(queue_pool));

    let batcher = IngestBatcher::start(telemetry.clone(), Arc::clone(&queue), &config.ingest);
    let limiter = Arc::new(ProjectRateLimiter::new());

    let state = AppState {
        config: Arc::clone(&config),
        config_store: config_store.clone(),
        telemetry: telemetry.clone(),
        queue: Arc::clone(&queue),
        batcher: batcher.clone(),
        limiter,
    };

    let resolver = Arc::new(PriceResolver::new(config_store.clone()));
    let llm: Arc<dyn LlmClient> = match &config.llm {
        Some(llm_config) => Arc::new(HttpLlmClient::new(llm_config.clone())?),
        None => Arc::new(DisabledLlmClient),
    };

    let mut worker_pool = WorkerPool::new(Arc::clone(&queue))
        .with_poll_interval(Duration::from_millis(config.worker.poll_interval_ms))
        .with_grace_period(Duration::from_secs(config.worker.grace_period_secs));

    worker_pool.register(
        JobKind::TelemetryFlush,
        Arc::new(TelemetryFlushHandler::new(telemetry.clone())),
        HandlerOptions {
            max_concurrency: 2,
            timeout: Duration::from_secs(60),
        },
    );
    worker_pool.register(
        JobKind::CostCalculate,
        Arc::new(CostCalculateHandler::new(
            telemetry.clone(),
            config_store.clone(),
            Arc::clone(&resolver),
        )),
        HandlerOptions {
            max_concurrency: 8,
            timeout: Duration::from_secs(600),
        },
    );
    worker_pool.register(
        JobKind::CostRecompute,
        Arc::new(CostRecomputeHandler::new(
            telemetry.clone(),
            Arc::clone(&queue),
        )),
        HandlerOptions {
            max_concurrency: 1,
            timeout: Duration::from_secs(600),
        },
    );
    worker_pool.register(
        JobKind::TraceComplete,
        Arc::new(TraceCompleteHandler::new(
            telemetry.clone(),
            config_store.clone(),
            Arc::clone(&queue),
        )),
        HandlerOptions {
            max_concurrency: 4,
            timeout: Duration::from_secs(600),
        },
    );
    worker_pool.register(
        JobKind::EvaluationRun,
        Arc::new(EvaluationRunHandler::new(
            telemetry.clone(),
            config_store.clone(),
            llm,
        )),
        HandlerOptions {
            max_concurrency: 4,
            timeout: Duration::from_secs(600),
        },
    );
    worker_pool.register(
        JobKind::AnomalyScan,
        Arc::new(AnomalyScanHandler::new(
            telemetry.clone(),
            config_store.clone(),
            Arc::clone(&queue),
            config.anomaly.baseline_concurrency,
            config.anomaly.scan_interval_secs,
        )),
        HandlerOptions {
            max_concurrency: 1,
            timeout: Duration::from_secs(300),
        },
    );
    worker_pool.register(
        JobKind::WebhookDeliver,
        Arc::new(WebhookDeliverHandler::new(
            config_store.clone(),
            config.webhook.signing_secret.clone(),
            Duration::from_secs(config.webhook.request_timeout_secs),
        )?),
        HandlerOptions {
            max_concurrency: 4,
            timeout: Duration::from_secs(60),
        },
    );
    worker_pool.register(
        JobKind::RetentionSweep,
        Arc::new(RetentionSweepHandler::new(
            config_store,
            telemetry,
            Arc::clone(&queue),
            24 * 3600,
        )),
        HandlerOptions {
            max_concurrency: 1,
            timeout: Duration::from_secs(600),
        },
    );

    seed_periodic_jobs(&queue, &config).await?;

    info!("Application components built");
    Ok(App { state, worker_pool })
}

/// Self-rescheduling jobs need a first instance; unique keys make this
/// idempotent across restarts.
async fn seed_periodic_jobs(queue: &Arc<dyn JobQueue>, config: &AppConfig) -> Result<()> {
    queue
        .enqueue(
            JobKind::RetentionSweep,
            serde_json::json!({}),
            EnqueueOptions::default()
                .queue(QueueClass::Low)
                .unique_key(SWEEP_UNIQUE_KEY),
        )
        .await?;
    if config.anomaly.scan_interval_secs > 0 {
        queue
            .enqueue(
                JobKind::AnomalyScan,
                serde_json::json!({}),
                EnqueueOptions::default()
                    .queue(QueueClass::Low)
                    .unique_key("anomaly-scan:periodic"),
            )
            .await?;
    }
    Ok(())
}

impl App {
    /// Run the API server and worker pool until interrupted, then drain.
    pub async fn run(self) -> Result<()> {
        let App { state, worker_pool } = self;

        let pool_shutdown = worker_pool.shutdown_handle();
        let worker_pool = Arc::new(worker_pool);
        let pool_task = {
            let pool = Arc::clone(&worker_pool);
            tokio::spawn(async move { pool.run().await })
        };

        let server = crate::api::ApiServer::new(state.config.server.clone(), state.clone());
        let shutdown = async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        };
        let serve_result = server.run(shutdown).await;

        // drain order: stop intake, flush buffers, stop workers
        state.batcher.shutdown().await;
        let _ = pool_shutdown.send(true);
        let _ = pool_task.await;

        serve_result
    }
}
