// Retention sweep: drops telemetry partitions older than each project's
// retention window, then reschedules itself.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use std::sync::Arc;
use tracing::{info, warn};

use crate::queue::{EnqueueOptions, Job, JobKind, JobQueue, QueueClass};
use crate::storage::{ConfigStore, TelemetryStore};
use crate::worker::{TaskContext, TaskError, TaskHandler, TaskResult};

pub const SWEEP_UNIQUE_KEY: &str = "retention-sweep";

pub struct RetentionSweepHandler {
    config_store: ConfigStore,
    telemetry: TelemetryStore,
    queue: Arc<dyn JobQueue>,
    interval_secs: u64,
}

impl RetentionSweepHandler {
    pub fn new(
        config_store: ConfigStore,
        telemetry: TelemetryStore,
        queue: Arc<dyn JobQueue>,
        interval_secs: u64,
    ) -> Self {
        Self {
            config_store,
            telemetry,
            queue,
            interval_secs,
        }
    }

    /// One pass over every project, dropping partitions past each retention
    /// window. Also driven directly by the `sweep-retention` CLI command.
    pub async fn sweep_once(&self, ctx: &TaskContext) -> crate::domain::Result<u64> {
        let projects = self.config_store.list_projects().await?;

        let mut total_dropped = 0u64;
        for project in &projects {
            if ctx.is_cancelled() {
                return Err(crate::domain::AgentTraceError::transient("shutdown"));
            }
            let cutoff = (Utc::now() - Duration::days(project.retention_days as i64)).date_naive();
            match self
                .telemetry
                .drop_partitions_before(&project.id, cutoff)
                .await
            {
                Ok(dropped) => total_dropped += dropped,
                Err(e) => {
                    // one project's failure must not block the others
                    warn!(project_id = %project.id, error = %e, "Partition drop failed");
                }
            }
        }

        metrics::counter!("agenttrace_retention_rows_dropped_total", total_dropped);
        info!(projects = projects.len(), rows = total_dropped, "Retention sweep completed");
        Ok(total_dropped)
    }
}

#[async_trait]
impl TaskHandler for RetentionSweepHandler {
    async fn run(&self, _job: &Job, ctx: &TaskContext) -> TaskResult {
        self.sweep_once(ctx).await.map_err(TaskError::from)?;

        if self.interval_secs > 0 {
            self.queue
                .enqueue(
                    JobKind::RetentionSweep,
                    serde_json::json!({}),
                    EnqueueOptions::default()
                        .queue(QueueClass::Low)
                        .unique_key(SWEEP_UNIQUE_KEY)
                        .scheduled_at(Utc::now() + Duration::seconds(self.interval_secs as i64)),
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
    use crate::domain::{Organization, Project, Trace};
    use crate::queue::{JobStatus, QueueClass, SqlJobQueue};
    use crate::storage::database::{connect, StoreKind};
    use crate::storage::TelemetryWrite;
    use uuid::Uuid;

    fn ctx() -> TaskContext {
        let (tx, rx) = tokio::sync::watch::channel(false);
        std::mem::forget(tx);
        TaskContext::new(rx)
    }

    fn sweep_job() -> Job {
        Job {
            id: "sweep".into(),
            kind: JobKind::RetentionSweep,
            queue: QueueClass::Low,
            payload: serde_json::json!({}),
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

    #[tokio::test]
    async fn test_sweep_drops_only_expired_partitions() {
        let config_store = ConfigStore::new(
            connect(StoreKind::Config, &StoreConfig::memory())
                .await
                .unwrap(),
        );
        let telemetry = TelemetryStore::new(
            connect(StoreKind::Telemetry, &StoreConfig::memory())
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
        let project = Project::new(org.id, "acme", "Acme").with_retention_days(7);
        config_store.create_project(&project).await.unwrap();

        let mut old = Trace::new("told".into(), project.id.clone(), Utc::now());
        old.start_time = Utc::now() - Duration::days(30);
        let fresh = Trace::new("tnew".into(), project.id.clone(), Utc::now());
        telemetry
            .insert_batch(&[TelemetryWrite::Trace(old), TelemetryWrite::Trace(fresh)])
            .await
            .unwrap();

        let handler = RetentionSweepHandler::new(
            config_store.clone(),
            telemetry.clone(),
            queue.clone() as Arc<dyn JobQueue>,
            3600,
        );
        handler.run(&sweep_job(), &ctx()).await.unwrap();

        assert!(telemetry.get_trace(&project.id, "told").await.unwrap().is_none());
        assert!(telemetry.get_trace(&project.id, "tnew").await.unwrap().is_some());

        // the sweep rescheduled itself
        assert_eq!(queue.pending_count().await.unwrap(), 1);
    }
}
