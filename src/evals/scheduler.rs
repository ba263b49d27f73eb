// Evaluator scheduling on trace completion: filter, deterministic sampling,
// evaluation job fan-out.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::queue::{EnqueueOptions, Job, JobKind, JobQueue, QueueClass};
use crate::storage::{ConfigStore, TelemetryStore};
use crate::worker::{TaskContext, TaskError, TaskHandler, TaskResult};

#[derive(Debug, Serialize, Deserialize)]
pub struct TraceCompletePayload {
    pub project_id: String,
    pub trace_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EvaluationRunPayload {
    pub project_id: String,
    pub trace_id: String,
    pub evaluator_id: Uuid,
}

/// Deterministic sampling fraction in [0, 1) for an
/// `(evaluator, trace)` pair. Stable across re-enqueues so a retried
/// completion never flips the decision.
pub fn sample_fraction(evaluator_id: Uuid, trace_id: &str) -> f64 {
    let mut hasher = Sha256::new();
    hasher.update(evaluator_id.as_bytes());
    hasher.update(b":");
    hasher.update(trace_id.as_bytes());
    let digest = hasher.finalize();
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(prefix) % 1_000_000) as f64 / 1_000_000.0
}

pub fn should_sample(evaluator_id: Uuid, trace_id: &str, sampling_rate: f64) -> bool {
    sampling_rate > 0.0 && sample_fraction(evaluator_id, trace_id) < sampling_rate
}

pub struct TraceCompleteHandler {
    telemetry: TelemetryStore,
    config_store: ConfigStore,
    queue: Arc<dyn JobQueue>,
}

impl TraceCompleteHandler {
    pub fn new(
        telemetry: TelemetryStore,
        config_store: ConfigStore,
        queue: Arc<dyn JobQueue>,
    ) -> Self {
        Self {
            telemetry,
            config_store,
            queue,
        }
    }
}

#[async_trait]
impl TaskHandler for TraceCompleteHandler {
    async fn run(&self, job: &Job, _ctx: &TaskContext) -> TaskResult {
        let payload: TraceCompletePayload = serde_json::from_value(job.payload.clone())
            .map_err(|e| TaskError::Permanent(format!("corrupt trace-complete payload: {e}")))?;

        let trace = self
            .telemetry
            .get_trace(&payload.project_id, &payload.trace_id)
            .await
            .map_err(TaskError::from)?;
        let Some(trace) = trace else {
            // the row may still be riding a batcher flush
            return Err(TaskError::Retryable(format!(
                "trace {} not yet visible",
                payload.trace_id
            )));
        };

        let evaluators = self
            .config_store
            .list_enabled_evaluators(&payload.project_id)
            .await
            .map_err(TaskError::from)?;

        let mut scheduled = 0u32;
        for evaluator in &evaluators {
            if !evaluator.target_filter.matches(&trace) {
                continue;
            }
            if !should_sample(evaluator.id, &trace.id, evaluator.sampling_rate) {
                debug!(
                    evaluator_id = %evaluator.id,
                    trace_id = %trace.id,
                    rate = evaluator.sampling_rate,
                    "Trace not sampled for evaluation"
                );
                continue;
            }

            self.queue
                .enqueue(
                    JobKind::EvaluationRun,
                    serde_json::to_value(EvaluationRunPayload {
                        project_id: payload.project_id.clone(),
                        trace_id: trace.id.clone(),
                        evaluator_id: evaluator.id,
                    })
                    .map_err(|e| TaskError::Permanent(e.to_string()))?,
                    EnqueueOptions::default()
                        .queue(QueueClass::Default)
                        .timeout_secs(600)
                        .unique_key(format!("eval:{}:{}", evaluator.id, trace.id)),
                )
                .await
                .map_err(TaskError::from)?;
            scheduled += 1;
        }

        // completion also feeds the metric-level detectors
        self.queue
            .enqueue(
                JobKind::AnomalyScan,
                serde_json::json!({ "project_id": payload.project_id }),
                EnqueueOptions::default()
                    .queue(QueueClass::Low)
                    .unique_key(format!("anomaly-scan:{}", payload.project_id)),
            )
            .await
            .map_err(TaskError::from)?;

        info!(
            trace_id = %trace.id,
            evaluators = evaluators.len(),
            scheduled,
            "Trace completion processed"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sampling_is_deterministic() {
        let evaluator = Uuid::new_v4();
        for trace in ["t1", "t2", "t3"] {
            assert_eq!(
                sample_fraction(evaluator, trace),
                sample_fraction(evaluator, trace)
            );
        }
    }

    #[test]
    fn test_sampling_boundary_rates() {
        let evaluator = Uuid::new_v4();
        for i in 0..100 {
            let trace = format!("trace-{i}");
            assert!(!should_sample(evaluator, &trace, 0.0));
            assert!(should_sample(evaluator, &trace, 1.0));
        }
    }

    #[test]
    fn test_sampling_rate_roughly_honored() {
        let evaluator = Uuid::new_v4();
        let sampled = (0..2000)
            .filter(|i| should_sample(evaluator, &format!("trace-{i}"), 0.5))
            .count();
        // deterministic hash over many ids lands near the configured rate
        assert!((800..1200).contains(&sampled), "sampled {sampled} of 2000");
    }

    #[test]
    fn test_different_evaluators_decide_independently() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let differs = (0..200).any(|i| {
            let trace = format!("trace-{i}");
            should_sample(a, &trace, 0.5) != should_sample(b, &trace, 0.5)
        });
        assert!(differs);
    }
}
