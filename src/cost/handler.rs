// Cost attribution handlers: per-observation calculation and retroactive
// recomputation.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::queue::{EnqueueOptions, Job, JobKind, JobQueue, QueueClass};
use crate::storage::{ConfigStore, TelemetryStore};
use crate::worker::{TaskContext, TaskError, TaskHandler, TaskResult};

use super::resolver::PriceResolver;

#[derive(Debug, Serialize, Deserialize)]
pub struct CostCalculatePayload {
    pub project_id: String,
    pub observation_id: String,
    /// Recompute even when a cost is already recorded.
    #[serde(default)]
    pub force: bool,
}

pub struct CostCalculateHandler {
    telemetry: TelemetryStore,
    config_store: ConfigStore,
    resolver: Arc<PriceResolver>,
}

impl CostCalculateHandler {
    pub fn new(
        telemetry: TelemetryStore,
        config_store: ConfigStore,
        resolver: Arc<PriceResolver>,
    ) -> Self {
        Self {
            telemetry,
            config_store,
            resolver,
        }
    }
}

#[async_trait]
impl TaskHandler for CostCalculateHandler {
    async fn run(&self, job: &Job, _ctx: &TaskContext) -> TaskResult {
        let payload: CostCalculatePayload = serde_json::from_value(job.payload.clone())
            .map_err(|e| TaskError::Permanent(format!("corrupt cost payload: {e}")))?;

        let observation = self
            .telemetry
            .get_observation(&payload.project_id, &payload.observation_id)
            .await
            .map_err(TaskError::from)?;
        let Some(observation) = observation else {
            // never arrived or already swept; nothing to price
            return Err(TaskError::Permanent(format!(
                "observation {} not found",
                payload.observation_id
            )));
        };

        if observation.cost_calculated && !payload.force {
            return Ok(());
        }

        // Skip observations whose partition the retention sweep is about to
        // drop; pricing them would race the delete.
        if let Some(project) = self
            .config_store
            .get_project(&payload.project_id)
            .await
            .map_err(TaskError::from)?
        {
            let horizon = Utc::now() - Duration::days(project.retention_days as i64);
            if observation.start_time < horizon {
                debug!(
                    observation_id = %observation.id,
                    "Observation beyond retention horizon; skipping cost calculation"
                );
                return Ok(());
            }
        }

        if !observation.has_billable_tokens() {
            self.telemetry
                .set_observation_cost(
                    &payload.project_id,
                    &payload.observation_id,
                    Decimal::ZERO,
                    Utc::now(),
                )
                .await
                .map_err(TaskError::from)?;
            return Ok(());
        }

        let provider = observation.provider.as_deref().unwrap_or("unknown");
        let Some(model) = observation.model.as_deref() else {
            return Err(TaskError::Permanent(format!(
                "observation {} has billable tokens but no model",
                observation.id
            )));
        };

        let price = self
            .resolver
            .resolve(provider, model, observation.start_time)
            .await
            .map_err(TaskError::from)?;
        let Some(price) = price else {
            metrics::counter!(
                "agenttrace_unknown_model_total",
                1,
                "provider" => provider.to_string(),
                "model" => model.to_string()
            );
            warn!(provider, model, "No price row matched; manual pricing required");
            // leaves cost_calculated=false; remediation is a pricing row
            return Err(TaskError::Permanent(format!(
                "no price for provider={provider} model={model}"
            )));
        };

        let cost = price.cost_for(
            observation.input_tokens,
            observation.output_tokens,
            observation.cache_read_tokens,
        );
        self.telemetry
            .set_observation_cost(&payload.project_id, &payload.observation_id, cost, Utc::now())
            .await
            .map_err(TaskError::from)?;

        debug!(
            observation_id = %observation.id,
            provider,
            model,
            %cost,
            "Observation cost calculated"
        );
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CostRecomputePayload {
    pub project_id: String,
    pub since: DateTime<Utc>,
}

const RECOMPUTE_PAGE: u32 = 500;

/// Re-enqueues per-observation cost jobs for everything at or after `since`.
pub struct CostRecomputeHandler {
    telemetry: TelemetryStore,
    queue: Arc<dyn JobQueue>,
}

impl CostRecomputeHandler {
    pub fn new(telemetry: TelemetryStore, queue: Arc<dyn JobQueue>) -> Self {
        Self { telemetry, queue }
    }
}

#[async_trait]
impl TaskHandler for CostRecomputeHandler {
    async fn run(&self, job: &Job, ctx: &TaskContext) -> TaskResult {
        let payload: CostRecomputePayload = serde_json::from_value(job.payload.clone())
            .map_err(|e| TaskError::Permanent(format!("corrupt recompute payload: {e}")))?;

        let mut since = payload.since;
        let mut scheduled = 0u64;
        loop {
            if ctx.is_cancelled() {
                return Err(TaskError::Retryable("shutdown".into()));
            }
            let page = self
                .telemetry
                .observations_for_recompute(&payload.project_id, since, RECOMPUTE_PAGE)
                .await
                .map_err(TaskError::from)?;
            if page.is_empty() {
                break;
            }
            let last_start = page.last().map(|o| o.start_time);

            for observation in &page {
                self.queue
                    .enqueue(
                        JobKind::CostCalculate,
                        serde_json::to_value(CostCalculatePayload {
                            project_id: payload.project_id.clone(),
                            observation_id: observation.id.clone(),
                            force: true,
                        })
                        .map_err(|e| TaskError::Permanent(e.to_string()))?,
                        EnqueueOptions::default()
                            .queue(QueueClass::Low)
                            .timeout_secs(600)
                            .unique_key(format!(
                                "cost:{}:{}",
                                payload.project_id, observation.id
                            )),
                    )
                    .await
                    .map_err(TaskError::from)?;
                scheduled += 1;
            }

            if (page.len() as u32) < RECOMPUTE_PAGE {
                break;
            }
            // same-timestamp pages would otherwise refetch forever
            match last_start {
                Some(last) if last > since => since = last,
                Some(last) => since = last + Duration::milliseconds(1),
                None => break,
            }
        }

        info!(
            project_id = %payload.project_id,
            scheduled,
            "Cost recompute scheduled"
        );
        Ok(())
    }
}
