// Anomaly scan handler: materializes metric baselines, classifies the
// newest sample, and drives the alert lifecycle.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::domain::{Alert, AlertStatus, AnomalyRule};
use crate::queue::{EnqueueOptions, Job, JobKind, JobQueue, QueueClass};
use crate::storage::{ConfigStore, RaiseOutcome, TelemetryStore};
use crate::worker::{TaskContext, TaskError, TaskHandler, TaskResult};

use super::methods::{evaluate, trailing_in_band, MethodOutcome};

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct AnomalyScanPayload {
    /// Restrict the scan to one project; a periodic scan covers all.
    #[serde(default)]
    pub project_id: Option<String>,
}

/// Event payload fanned out to webhooks when an alert is raised.
#[derive(Debug, Serialize, Deserialize)]
pub struct AlertEvent {
    pub event: String,
    pub alert: Alert,
    pub rule_name: String,
    pub metric: String,
}

pub struct AnomalyScanHandler {
    telemetry: TelemetryStore,
    config_store: ConfigStore,
    queue: Arc<dyn JobQueue>,
    baseline_concurrency: usize,
    rescan_interval_secs: u64,
}

impl AnomalyScanHandler {
    pub fn new(
        telemetry: TelemetryStore,
        config_store: ConfigStore,
        queue: Arc<dyn JobQueue>,
        baseline_concurrency: usize,
        rescan_interval_secs: u64,
    ) -> Self {
        Self {
            telemetry,
            config_store,
            queue,
            baseline_concurrency: baseline_concurrency.max(1),
            rescan_interval_secs,
        }
    }

    async fn scan_rule(&self, rule: &AnomalyRule) -> crate::domain::Result<()> {
        let now = Utc::now();
        let from = now - Duration::minutes(rule.lookback_minutes as i64);
        let window = self
            .telemetry
            .metric_window(&rule.project_id, rule.metric, from, now)
            .await?;

        if window.len() < 2 {
            debug!(rule_id = %rule.id, points = window.len(), "Window too small; deferring");
            return Ok(());
        }

        let values: Vec<f64> = window.iter().map(|p| p.value).collect();
        let (baseline, x) = values.split_at(values.len() - 1);
        let x = x[0];

        match evaluate(&rule.method, baseline, x) {
            MethodOutcome::InsufficientData => {
                debug!(rule_id = %rule.id, "Insufficient data; deferring");
            }
            MethodOutcome::Normal => {
                self.maybe_auto_resolve(rule, &values).await?;
            }
            MethodOutcome::Anomaly { score } => {
                metrics::counter!(
                    "agenttrace_anomalies_detected_total",
                    1,
                    "metric" => rule.metric.as_str()
                );
                match self.config_store.raise_or_increment_alert(rule, score, now).await? {
                    RaiseOutcome::Raised(alert) => {
                        info!(
                            rule_id = %rule.id,
                            alert_id = %alert.id,
                            score,
                            "Alert raised"
                        );
                        self.fan_out(rule, &alert).await?;
                    }
                    RaiseOutcome::Suppressed(alert) => {
                        debug!(
                            rule_id = %rule.id,
                            alert_id = %alert.id,
                            hits = alert.hit_count,
                            "Detection suppressed within cooldown"
                        );
                    }
                }
            }
        }
        Ok(())
    }

    /// Resolve the active alert once enough consecutive samples returned to
    /// the baseline band.
    async fn maybe_auto_resolve(
        &self,
        rule: &AnomalyRule,
        values: &[f64],
    ) -> crate::domain::Result<()> {
        if rule.auto_resolve_samples == 0 {
            return Ok(());
        }
        let Some(alert) = self.config_store.latest_alert_for_rule(rule.id).await? else {
            return Ok(());
        };
        if alert.status != AlertStatus::Active {
            return Ok(());
        }
        if trailing_in_band(&rule.method, values) >= rule.auto_resolve_samples as usize {
            let resolved = self
                .config_store
                .transition_alert(
                    alert.id,
                    AlertStatus::Resolved,
                    Some("auto-resolved: metric back in band".to_string()),
                    true,
                )
                .await?;
            info!(rule_id = %rule.id, alert_id = %resolved.id, "Alert auto-resolved");
        }
        Ok(())
    }

    async fn fan_out(&self, rule: &AnomalyRule, alert: &Alert) -> crate::domain::Result<()> {
        for webhook_id in &rule.alert_webhook_ids {
            let event = AlertEvent {
                event: "anomaly.alert.raised".to_string(),
                alert: alert.clone(),
                rule_name: rule.name.clone(),
                metric: rule.metric.as_str().to_string(),
            };
            self.queue
                .enqueue(
                    JobKind::WebhookDeliver,
                    serde_json::json!({
                        "webhook_id": webhook_id,
                        "event": event,
                    }),
                    EnqueueOptions::default()
                        .queue(QueueClass::Default)
                        .max_retry(5)
                        .timeout_secs(60),
                )
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl TaskHandler for AnomalyScanHandler {
    async fn run(&self, job: &Job, ctx: &TaskContext) -> TaskResult {
        let payload: AnomalyScanPayload = serde_json::from_value(job.payload.clone())
            .unwrap_or_default();

        let rules = self
            .config_store
            .list_enabled_anomaly_rules()
            .await
            .map_err(TaskError::from)?;
        let rules: Vec<AnomalyRule> = rules
            .into_iter()
            .filter(|rule| {
                payload
                    .project_id
                    .as_deref()
                    .map(|p| rule.project_id == p)
                    .unwrap_or(true)
            })
            .collect();

        // Baseline computations are bounded to avoid a window-read stampede.
        let results: Vec<_> = stream::iter(rules.clone())
            .map(|rule| async move {
                if ctx.is_cancelled() {
                    return Ok(());
                }
                self.scan_rule(&rule).await
            })
            .buffer_unordered(self.baseline_concurrency)
            .collect()
            .await;

        for result in results {
            if let Err(e) = result {
                warn!(error = %e, "Rule scan failed");
            }
        }

        // periodic scans reschedule themselves
        if payload.project_id.is_none() && self.rescan_interval_secs > 0 {
            self.queue
                .enqueue(
                    JobKind::AnomalyScan,
                    serde_json::json!({}),
                    EnqueueOptions::default()
                        .queue(QueueClass::Low)
                        .unique_key("anomaly-scan:periodic")
                        .scheduled_at(Utc::now() + Duration::seconds(self.rescan_interval_secs as i64)),
                )
                .await
                .map_err(TaskError::from)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::domain::{
        AlertSeverity, DetectionMethod, MetricKind, Observation, ObservationType, Organization,
        Project,
    };
    use crate::queue::{JobStatus, QueueClass, SqlJobQueue};
    use crate::storage::database::{connect, StoreKind};
    use crate::storage::TelemetryWrite;
    use uuid::Uuid;

    struct Fixture {
        telemetry: TelemetryStore,
        config_store: ConfigStore,
        queue: Arc<SqlJobQueue>,
        handler: AnomalyScanHandler,
        project: Project,
    }

    async fn fixture() -> Fixture {
        let telemetry = TelemetryStore::new(
            connect(StoreKind::Telemetry, &StoreConfig::memory())
                .await
                .unwrap(),
        );
        let config_store = ConfigStore::new(
            connect(StoreKind::Config, &StoreConfig::memory())
                .await
                .unwrap(),
        );
        let queue = Arc::new(SqlJobQueue::new(
            connect(StoreKind::Queue, &StoreConfig::memory())
                .await
                .unwrap(),
        ));

        let org = Organization {
            id: Uuid::new_v4(),
            name: "acme".into(),
            created_at: Utc::now(),
        };
        config_store.create_organization(&org).await.unwrap();
        let project = Project::new(org.id, "acme", "Acme");
        config_store.create_project(&project).await.unwrap();

        let handler = AnomalyScanHandler::new(
            telemetry.clone(),
            config_store.clone(),
            queue.clone() as Arc<dyn JobQueue>,
            2,
            0, // no self-rescheduling in tests
        );
        Fixture {
            telemetry,
            config_store,
            queue,
            handler,
            project,
        }
    }

    fn ctx() -> TaskContext {
        let (tx, rx) = tokio::sync::watch::channel(false);
        std::mem::forget(tx);
        TaskContext::new(rx)
    }

    fn scan_job(project_id: &str) -> Job {
        Job {
            id: "scan".into(),
            kind: JobKind::AnomalyScan,
            queue: QueueClass::Low,
            payload: serde_json::json!({ "project_id": project_id }),
            status: JobStatus::Active,
            attempts: 1,
            max_retry: 3,
            timeout_secs: 300,
            backoff_base_ms: 2000,
            unique_key: None,
            scheduled_at: Utc::now(),
            visible_at: Utc::now(),
            last_error: None,
            created_at: Utc::now(),
        }
    }

    /// Seed per-minute token metrics: one observation per minute.
    async fn seed_token_series(fixture: &Fixture, values: &[u64]) {
        let start = Utc::now() - Duration::minutes(values.len() as i64 + 1);
        let mut writes = Vec::new();
        for (i, tokens) in values.iter().enumerate() {
            let mut obs = Observation::new(
                format!("o{i:05}"),
                "t1".into(),
                fixture.project.id.clone(),
                ObservationType::Generation,
                start + Duration::minutes(i as i64),
            );
            obs.input_tokens = *tokens;
            writes.push(TelemetryWrite::Observation(obs));
        }
        fixture.telemetry.insert_batch(&writes).await.unwrap();
    }

    fn token_rule(fixture: &Fixture) -> AnomalyRule {
        AnomalyRule::new(
            fixture.project.id.clone(),
            "token-spike",
            MetricKind::Tokens,
            DetectionMethod::ZScore {
                threshold: 3.0,
                min_samples: 20,
            },
        )
        .with_cooldown_minutes(30)
        .with_severity(AlertSeverity::High)
    }

    #[tokio::test]
    async fn test_spike_raises_single_alert_with_cooldown() {
        let fixture = fixture().await;
        let rule = token_rule(&fixture);
        fixture.config_store.create_anomaly_rule(&rule).await.unwrap();

        // stable baseline then a spike as the newest sample
        let mut series: Vec<u64> = (0..40).map(|i| 100 + (i % 10)).collect();
        series.push(1000);
        seed_token_series(&fixture, &series).await;

        fixture
            .handler
            .run(&scan_job(&fixture.project.id), &ctx())
            .await
            .unwrap();

        let alerts = fixture
            .config_store
            .list_alerts(&fixture.project.id, None)
            .await
            .unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].status, AlertStatus::Active);
        assert_eq!(alerts[0].hit_count, 1);

        // second detection within cooldown only increments the hit count
        fixture
            .handler
            .run(&scan_job(&fixture.project.id), &ctx())
            .await
            .unwrap();
        let alerts = fixture
            .config_store
            .list_alerts(&fixture.project.id, None)
            .await
            .unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].hit_count, 2);
    }

    #[tokio::test]
    async fn test_insufficient_data_defers() {
        let fixture = fixture().await;
        let rule = token_rule(&fixture);
        fixture.config_store.create_anomaly_rule(&rule).await.unwrap();

        seed_token_series(&fixture, &[100, 110, 1000]).await;

        fixture
            .handler
            .run(&scan_job(&fixture.project.id), &ctx())
            .await
            .unwrap();

        let alerts = fixture
            .config_store
            .list_alerts(&fixture.project.id, None)
            .await
            .unwrap();
        assert!(alerts.is_empty());
    }

    #[tokio::test]
    async fn test_alert_raise_fans_out_to_webhooks() {
        let fixture = fixture().await;
        let webhook =
            crate::domain::webhook::WebhookEndpoint::new(fixture.project.id.clone(), "https://example.com/hook");
        fixture.config_store.create_webhook(&webhook).await.unwrap();

        let mut rule = token_rule(&fixture);
        rule.alert_webhook_ids = vec![webhook.id];
        fixture.config_store.create_anomaly_rule(&rule).await.unwrap();

        let mut series: Vec<u64> = (0..40).map(|i| 100 + (i % 10)).collect();
        series.push(1000);
        seed_token_series(&fixture, &series).await;

        fixture
            .handler
            .run(&scan_job(&fixture.project.id), &ctx())
            .await
            .unwrap();

        let lease = fixture
            .queue
            .dequeue(&[QueueClass::Default])
            .await
            .unwrap()
            .expect("webhook job enqueued");
        assert_eq!(lease.job.kind, JobKind::WebhookDeliver);
    }

    #[tokio::test]
    async fn test_auto_resolve_after_recovery() {
        let fixture = fixture().await;
        let mut rule = token_rule(&fixture);
        rule.auto_resolve_samples = 3;
        fixture.config_store.create_anomaly_rule(&rule).await.unwrap();

        // raise directly, then feed a calm series
        let outcome = fixture
            .config_store
            .raise_or_increment_alert(&rule, 5.0, Utc::now() - Duration::minutes(40))
            .await
            .unwrap();
        let alert = match outcome {
            RaiseOutcome::Raised(alert) => alert,
            _ => unreachable!(),
        };

        let series: Vec<u64> = (0..40).map(|i| 100 + (i % 10)).collect();
        seed_token_series(&fixture, &series).await;

        fixture
            .handler
            .run(&scan_job(&fixture.project.id), &ctx())
            .await
            .unwrap();

        let resolved = fixture
            .config_store
            .get_alert(alert.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(resolved.status, AlertStatus::Resolved);
        assert!(resolved.auto_resolved);
    }
}
