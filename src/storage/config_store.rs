// Relational store for identity, configuration and alert state.

use chrono::{DateTime, Utc};
use sqlx::{Pool, Sqlite};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::domain::project::hash_secret;
use crate::domain::webhook::{WebhookDelivery, WebhookEndpoint};
use crate::domain::{
    AgentTraceError, Alert, AlertStatus, AnomalyRule, ApiKey, Evaluator, ModelPrice, Organization,
    Project, Result,
};

use super::models::{
    AlertRow, AnomalyRuleRow, ApiKeyRow, EvaluatorRow, ModelPriceRow, ProjectRow, WebhookRow,
};

/// Outcome of an atomic alert raise attempt.
#[derive(Debug)]
pub enum RaiseOutcome {
    /// No alert existed for this cooldown bucket; a new one was created.
    Raised(Alert),
    /// An alert already covers this bucket; its hit count was incremented.
    Suppressed(Alert),
}

#[derive(Clone)]
pub struct ConfigStore {
    pool: Pool<Sqlite>,
}

impl ConfigStore {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    // ---- organizations & projects ----

    pub async fn create_organization(&self, org: &Organization) -> Result<()> {
        sqlx::query("INSERT INTO organizations (id, name, created_at) VALUES (?, ?, ?)")
            .bind(org.id.to_string())
            .bind(&org.name)
            .bind(org.created_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn create_project(&self, project: &Project) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO projects
                (id, org_id, slug, name, retention_days, rate_limit_per_minute, disabled, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&project.id)
        .bind(project.org_id.to_string())
        .bind(&project.slug)
        .bind(&project.name)
        .bind(project.retention_days as i64)
        .bind(project.rate_limit_per_minute as i64)
        .bind(project.disabled as i64)
        .bind(project.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_project(&self, id: &str) -> Result<Option<Project>> {
        let row = sqlx::query_as::<_, ProjectRow>("SELECT * FROM projects WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Project::try_from).transpose()
    }

    pub async fn list_projects(&self) -> Result<Vec<Project>> {
        let rows = sqlx::query_as::<_, ProjectRow>("SELECT * FROM projects ORDER BY created_at")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Project::try_from).collect()
    }

    pub async fn set_project_disabled(&self, id: &str, disabled: bool) -> Result<()> {
        sqlx::query("UPDATE projects SET disabled = ? WHERE id = ?")
            .bind(disabled as i64)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ---- api keys ----

    pub async fn create_api_key(&self, key: &ApiKey) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO api_keys
                (id, project_id, public_key, secret_hash, scopes, revoked_at, last_used_at, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(key.id.to_string())
        .bind(&key.project_id)
        .bind(&key.public_key)
        .bind(&key.secret_hash)
        .bind(serde_json::to_string(&key.scopes)?)
        .bind(key.revoked_at)
        .bind(key.last_used_at)
        .bind(key.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn find_api_key_by_public_key(&self, public_key: &str) -> Result<Option<ApiKey>> {
        let row = sqlx::query_as::<_, ApiKeyRow>("SELECT * FROM api_keys WHERE public_key = ?")
            .bind(public_key)
            .fetch_optional(&self.pool)
            .await?;
        row.map(ApiKey::try_from).transpose()
    }

    /// Bearer lookups carry only the secret; match on its hash.
    pub async fn find_api_key_by_secret(&self, secret: &str) -> Result<Option<ApiKey>> {
        let hash = hash_secret(secret);
        let row = sqlx::query_as::<_, ApiKeyRow>("SELECT * FROM api_keys WHERE secret_hash = ?")
            .bind(&hash)
            .fetch_optional(&self.pool)
            .await?;
        row.map(ApiKey::try_from).transpose()
    }

    /// Opportunistic update; callers ignore the error.
    pub async fn touch_api_key(&self, id: Uuid) -> Result<()> {
        sqlx::query("UPDATE api_keys SET last_used_at = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn revoke_api_key(&self, id: Uuid) -> Result<()> {
        sqlx::query("UPDATE api_keys SET revoked_at = ? WHERE id = ? AND revoked_at IS NULL")
            .bind(Utc::now())
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ---- model prices ----

    pub async fn insert_price(&self, price: &ModelPrice) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO model_prices
                (id, provider, model_name, model_regex, input_per_1m, output_per_1m,
                 cache_read_per_1m, effective_date, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(price.id.to_string())
        .bind(&price.provider)
        .bind(&price.model_name)
        .bind(&price.model_regex)
        .bind(price.input_per_1m.to_string())
        .bind(price.output_per_1m.to_string())
        .bind(price.cache_read_per_1m.map(|d| d.to_string()))
        .bind(price.effective_date)
        .bind(price.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Exact-name resolution: the row with the greatest effective date not
    /// after `at`.
    pub async fn resolve_price(
        &self,
        provider: &str,
        model_name: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<ModelPrice>> {
        let row = sqlx::query_as::<_, ModelPriceRow>(
            r#"
            SELECT * FROM model_prices
            WHERE provider = ? AND model_name = ? AND model_regex IS NULL
              AND effective_date <= ?
            ORDER BY effective_date DESC
            LIMIT 1
            "#,
        )
        .bind(provider)
        .bind(model_name)
        .bind(at)
        .fetch_optional(&self.pool)
        .await?;
        row.map(ModelPrice::try_from).transpose()
    }

    /// Regex candidate rows for a provider, newest effective date first.
    pub async fn regex_prices(
        &self,
        provider: &str,
        at: DateTime<Utc>,
    ) -> Result<Vec<ModelPrice>> {
        let rows = sqlx::query_as::<_, ModelPriceRow>(
            r#"
            SELECT * FROM model_prices
            WHERE provider = ? AND model_regex IS NOT NULL AND effective_date <= ?
            ORDER BY effective_date DESC
            "#,
        )
        .bind(provider)
        .bind(at)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(ModelPrice::try_from).collect()
    }

    // ---- evaluators ----

    pub async fn create_evaluator(&self, evaluator: &Evaluator) -> Result<()> {
        evaluator.validate()?;
        sqlx::query(
            r#"
            INSERT INTO evaluators
                (id, project_id, evaluator_type, prompt_template, variables, rule,
                 target_filter, sampling_rate, score_name, score_data_type, enabled,
                 created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(evaluator.id.to_string())
        .bind(&evaluator.project_id)
        .bind(evaluator.evaluator_type.as_str())
        .bind(&evaluator.prompt_template)
        .bind(serde_json::to_string(&evaluator.variables)?)
        .bind(
            evaluator
                .rule
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
        )
        .bind(serde_json::to_string(&evaluator.target_filter)?)
        .bind(evaluator.sampling_rate)
        .bind(&evaluator.score_name)
        .bind(evaluator.score_data_type.as_str())
        .bind(evaluator.enabled as i64)
        .bind(evaluator.created_at)
        .bind(evaluator.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_evaluator(&self, id: Uuid) -> Result<Option<Evaluator>> {
        let row = sqlx::query_as::<_, EvaluatorRow>("SELECT * FROM evaluators WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(Evaluator::try_from).transpose()
    }

    pub async fn list_enabled_evaluators(&self, project_id: &str) -> Result<Vec<Evaluator>> {
        let rows = sqlx::query_as::<_, EvaluatorRow>(
            "SELECT * FROM evaluators WHERE project_id = ? AND enabled = 1",
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Evaluator::try_from).collect()
    }

    pub async fn set_evaluator_enabled(&self, id: Uuid, enabled: bool) -> Result<()> {
        sqlx::query("UPDATE evaluators SET enabled = ?, updated_at = ? WHERE id = ?")
            .bind(enabled as i64)
            .bind(Utc::now())
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ---- anomaly rules & alerts ----

    pub async fn create_anomaly_rule(&self, rule: &AnomalyRule) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO anomaly_rules
                (id, project_id, name, metric, method, lookback_minutes, auto_resolve_samples,
                 severity, cooldown_minutes, alert_webhook_ids, enabled, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(rule.id.to_string())
        .bind(&rule.project_id)
        .bind(&rule.name)
        .bind(rule.metric.as_str())
        .bind(serde_json::to_string(&rule.method)?)
        .bind(rule.lookback_minutes as i64)
        .bind(rule.auto_resolve_samples as i64)
        .bind(rule.severity.as_str())
        .bind(rule.cooldown_minutes as i64)
        .bind(serde_json::to_string(&rule.alert_webhook_ids)?)
        .bind(rule.enabled as i64)
        .bind(rule.created_at)
        .bind(rule.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_anomaly_rule(&self, id: Uuid) -> Result<Option<AnomalyRule>> {
        let row = sqlx::query_as::<_, AnomalyRuleRow>("SELECT * FROM anomaly_rules WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(AnomalyRule::try_from).transpose()
    }

    pub async fn list_enabled_anomaly_rules(&self) -> Result<Vec<AnomalyRule>> {
        let rows =
            sqlx::query_as::<_, AnomalyRuleRow>("SELECT * FROM anomaly_rules WHERE enabled = 1")
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter().map(AnomalyRule::try_from).collect()
    }

    pub async fn set_anomaly_rule_enabled(&self, id: Uuid, enabled: bool) -> Result<()> {
        sqlx::query("UPDATE anomaly_rules SET enabled = ?, updated_at = ? WHERE id = ?")
            .bind(enabled as i64)
            .bind(Utc::now())
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Atomic raise-or-suppress keyed on `(rule_id, cooldown_bucket)`. A new
    /// row means an alert was raised; a conflict increments the hit count of
    /// the existing alert.
    pub async fn raise_or_increment_alert(
        &self,
        rule: &AnomalyRule,
        anomaly_score: f64,
        at: DateTime<Utc>,
    ) -> Result<RaiseOutcome> {
        let new_id = Uuid::new_v4();
        let bucket = rule.cooldown_bucket(at);
        let row = sqlx::query_as::<_, AlertRow>(
            r#"
            INSERT INTO alerts
                (id, rule_id, project_id, status, anomaly_score, severity, cooldown_bucket,
                 hit_count, raised_at, resolved_at, auto_resolved, notes)
            VALUES (?, ?, ?, 'active', ?, ?, ?, 1, ?, NULL, 0, '[]')
            ON CONFLICT(rule_id, cooldown_bucket)
                DO UPDATE SET hit_count = hit_count + 1
            RETURNING *
            "#,
        )
        .bind(new_id.to_string())
        .bind(rule.id.to_string())
        .bind(&rule.project_id)
        .bind(anomaly_score)
        .bind(rule.severity.as_str())
        .bind(bucket)
        .bind(at)
        .fetch_one(&self.pool)
        .await?;

        let alert = Alert::try_from(row)?;
        if alert.id == new_id {
            debug!(rule_id = %rule.id, alert_id = %alert.id, "Alert raised");
            Ok(RaiseOutcome::Raised(alert))
        } else {
            debug!(rule_id = %rule.id, alert_id = %alert.id, hits = alert.hit_count, "Alert suppressed within cooldown");
            Ok(RaiseOutcome::Suppressed(alert))
        }
    }

    pub async fn get_alert(&self, id: Uuid) -> Result<Option<Alert>> {
        let row = sqlx::query_as::<_, AlertRow>("SELECT * FROM alerts WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(Alert::try_from).transpose()
    }

    pub async fn list_alerts(
        &self,
        project_id: &str,
        status: Option<AlertStatus>,
    ) -> Result<Vec<Alert>> {
        let rows = match status {
            Some(status) => {
                sqlx::query_as::<_, AlertRow>(
                    "SELECT * FROM alerts WHERE project_id = ? AND status = ? ORDER BY raised_at DESC",
                )
                .bind(project_id)
                .bind(status.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, AlertRow>(
                    "SELECT * FROM alerts WHERE project_id = ? ORDER BY raised_at DESC",
                )
                .bind(project_id)
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.into_iter().map(Alert::try_from).collect()
    }

    pub async fn latest_alert_for_rule(&self, rule_id: Uuid) -> Result<Option<Alert>> {
        let row = sqlx::query_as::<_, AlertRow>(
            "SELECT * FROM alerts WHERE rule_id = ? ORDER BY raised_at DESC LIMIT 1",
        )
        .bind(rule_id.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.map(Alert::try_from).transpose()
    }

    /// Apply a user or detector transition, enforcing the lifecycle state
    /// machine. Stale transitions surface as conflicts.
    pub async fn transition_alert(
        &self,
        id: Uuid,
        next: AlertStatus,
        note: Option<String>,
        auto: bool,
    ) -> Result<Alert> {
        let mut alert = self
            .get_alert(id)
            .await?
            .ok_or_else(|| AgentTraceError::NotFound(format!("alert {id}")))?;

        if !alert.status.can_transition_to(next) {
            return Err(AgentTraceError::Conflict(format!(
                "alert {} cannot move from {} to {}",
                id,
                alert.status.as_str(),
                next.as_str()
            )));
        }

        if let Some(note) = note {
            alert.notes.push(note);
        }
        let resolved_at = if next == AlertStatus::Resolved {
            Some(Utc::now())
        } else {
            alert.resolved_at
        };

        let result = sqlx::query(
            r#"
            UPDATE alerts
            SET status = ?, resolved_at = ?, auto_resolved = ?, notes = ?
            WHERE id = ? AND status = ?
            "#,
        )
        .bind(next.as_str())
        .bind(resolved_at)
        .bind((auto && next == AlertStatus::Resolved) as i64)
        .bind(serde_json::to_string(&alert.notes)?)
        .bind(id.to_string())
        .bind(alert.status.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AgentTraceError::Conflict(format!(
                "alert {id} changed concurrently"
            )));
        }

        alert.status = next;
        alert.resolved_at = resolved_at;
        alert.auto_resolved = auto && next == AlertStatus::Resolved;
        Ok(alert)
    }

    // ---- webhooks ----

    pub async fn create_webhook(&self, webhook: &WebhookEndpoint) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO webhooks (id, project_id, url, rate_limit_per_hour, enabled, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(webhook.id.to_string())
        .bind(&webhook.project_id)
        .bind(&webhook.url)
        .bind(webhook.rate_limit_per_hour as i64)
        .bind(webhook.enabled as i64)
        .bind(webhook.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_webhook(&self, id: Uuid) -> Result<Option<WebhookEndpoint>> {
        let row = sqlx::query_as::<_, WebhookRow>("SELECT * FROM webhooks WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(WebhookEndpoint::try_from).transpose()
    }

    /// Increment-and-check in a single statement; returns the count for this
    /// hour bucket after the increment.
    pub async fn increment_webhook_bucket(&self, webhook_id: Uuid, hour_bucket: i64) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO webhook_rate_buckets (webhook_id, hour_bucket, count)
            VALUES (?, ?, 1)
            ON CONFLICT(webhook_id, hour_bucket) DO UPDATE SET count = count + 1
            RETURNING count
            "#,
        )
        .bind(webhook_id.to_string())
        .bind(hour_bucket)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    pub async fn record_delivery(&self, delivery: &WebhookDelivery) -> Result<()> {
        if let Err(e) = sqlx::query(
            r#"
            INSERT INTO webhook_deliveries
                (id, webhook_id, event, status_code, latency_ms, attempt, error, delivered_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(delivery.id.to_string())
        .bind(delivery.webhook_id.to_string())
        .bind(&delivery.event)
        .bind(delivery.status_code.map(|c| c as i64))
        .bind(delivery.latency_ms as i64)
        .bind(delivery.attempt as i64)
        .bind(&delivery.error)
        .bind(delivery.delivered_at)
        .execute(&self.pool)
        .await
        {
            // The audit trail must not fail the delivery itself.
            warn!(error = %e, webhook_id = %delivery.webhook_id, "Failed to record webhook delivery");
        }
        Ok(())
    }

    pub async fn count_deliveries(&self, webhook_id: Uuid) -> Result<i64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM webhook_deliveries WHERE webhook_id = ?")
                .bind(webhook_id.to_string())
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::domain::{AlertSeverity, DetectionMethod, MetricKind};
    use crate::storage::database::{connect, StoreKind};

    async fn store() -> ConfigStore {
        let pool = connect(StoreKind::Config, &StoreConfig::memory())
            .await
            .unwrap();
        ConfigStore::new(pool)
    }

    async fn seed_project(store: &ConfigStore) -> Project {
        let org = Organization {
            id: Uuid::new_v4(),
            name: "acme".into(),
            created_at: Utc::now(),
        };
        store.create_organization(&org).await.unwrap();
        let project = Project::new(org.id, "acme-agents", "Acme Agents");
        store.create_project(&project).await.unwrap();
        project
    }

    #[tokio::test]
    async fn test_project_round_trip() {
        let store = store().await;
        let project = seed_project(&store).await;

        let loaded = store.get_project(&project.id).await.unwrap().unwrap();
        assert_eq!(loaded.slug, "acme-agents");
        assert_eq!(loaded.retention_days, 90);
        assert!(!loaded.disabled);
    }

    #[tokio::test]
    async fn test_api_key_lookup_and_touch() {
        let store = store().await;
        let project = seed_project(&store).await;

        let generated = ApiKey::generate(project.id.clone(), vec!["ingest".into()]);
        store.create_api_key(&generated.key).await.unwrap();

        let by_public = store
            .find_api_key_by_public_key(&generated.key.public_key)
            .await
            .unwrap()
            .unwrap();
        assert!(by_public.verify_secret(&generated.secret_key).is_ok());
        assert!(by_public.last_used_at.is_none());

        let by_secret = store
            .find_api_key_by_secret(&generated.secret_key)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(by_secret.id, generated.key.id);

        store.touch_api_key(generated.key.id).await.unwrap();
        let touched = store
            .find_api_key_by_public_key(&generated.key.public_key)
            .await
            .unwrap()
            .unwrap();
        assert!(touched.last_used_at.is_some());
    }

    #[tokio::test]
    async fn test_price_resolution_picks_latest_effective() {
        use rust_decimal_macros::dec;
        let store = store().await;

        let old = ModelPrice::new("openai", "gpt-4o", dec!(5.00), dec!(15.00))
            .with_effective_date("2023-01-01T00:00:00Z".parse().unwrap());
        let new = ModelPrice::new("openai", "gpt-4o", dec!(2.50), dec!(10.00))
            .with_effective_date("2024-01-01T00:00:00Z".parse().unwrap());
        let future = ModelPrice::new("openai", "gpt-4o", dec!(1.00), dec!(4.00))
            .with_effective_date("2030-01-01T00:00:00Z".parse().unwrap());
        for price in [&old, &new, &future] {
            store.insert_price(price).await.unwrap();
        }

        let at = "2024-03-01T00:00:00Z".parse().unwrap();
        let resolved = store
            .resolve_price("openai", "gpt-4o", at)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(resolved.input_per_1m, dec!(2.50));

        let before_any = "2022-01-01T00:00:00Z".parse().unwrap();
        assert!(store
            .resolve_price("openai", "gpt-4o", before_any)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_alert_raise_then_suppress() {
        let store = store().await;
        let project = seed_project(&store).await;

        let rule = AnomalyRule::new(
            project.id.clone(),
            "latency-spike",
            MetricKind::Latency,
            DetectionMethod::ZScore { threshold: 3.0, min_samples: 10 },
        )
        .with_cooldown_minutes(30)
        .with_severity(AlertSeverity::High);
        store.create_anomaly_rule(&rule).await.unwrap();

        let t0: DateTime<Utc> = "2024-03-01T00:00:00Z".parse().unwrap();
        let first = store.raise_or_increment_alert(&rule, 4.2, t0).await.unwrap();
        let alert = match first {
            RaiseOutcome::Raised(alert) => alert,
            RaiseOutcome::Suppressed(_) => panic!("expected a new alert"),
        };
        assert_eq!(alert.hit_count, 1);
        assert_eq!(alert.status, AlertStatus::Active);

        let t5 = t0 + chrono::Duration::minutes(5);
        let second = store.raise_or_increment_alert(&rule, 4.5, t5).await.unwrap();
        match second {
            RaiseOutcome::Suppressed(suppressed) => {
                assert_eq!(suppressed.id, alert.id);
                assert_eq!(suppressed.hit_count, 2);
            }
            RaiseOutcome::Raised(_) => panic!("expected suppression within cooldown"),
        }

        let t40 = t0 + chrono::Duration::minutes(40);
        let third = store.raise_or_increment_alert(&rule, 3.9, t40).await.unwrap();
        assert!(matches!(third, RaiseOutcome::Raised(_)));
    }

    #[tokio::test]
    async fn test_alert_transitions_enforced() {
        let store = store().await;
        let project = seed_project(&store).await;

        let rule = AnomalyRule::new(
            project.id.clone(),
            "cost-spike",
            MetricKind::Cost,
            DetectionMethod::Threshold { min: None, max: Some(100.0) },
        );
        store.create_anomaly_rule(&rule).await.unwrap();

        let outcome = store
            .raise_or_increment_alert(&rule, 1.0, Utc::now())
            .await
            .unwrap();
        let alert = match outcome {
            RaiseOutcome::Raised(a) => a,
            _ => unreachable!(),
        };

        let acked = store
            .transition_alert(alert.id, AlertStatus::Acknowledged, None, false)
            .await
            .unwrap();
        assert_eq!(acked.status, AlertStatus::Acknowledged);

        // acknowledged -> suppressed is not a legal move
        assert!(store
            .transition_alert(alert.id, AlertStatus::Suppressed, None, false)
            .await
            .is_err());

        let resolved = store
            .transition_alert(alert.id, AlertStatus::Resolved, Some("fixed".into()), false)
            .await
            .unwrap();
        assert_eq!(resolved.status, AlertStatus::Resolved);
        assert!(resolved.resolved_at.is_some());
        assert_eq!(resolved.notes, vec!["fixed".to_string()]);
    }

    #[tokio::test]
    async fn test_webhook_bucket_increments() {
        let store = store().await;
        let project = seed_project(&store).await;

        let webhook = WebhookEndpoint::new(project.id.clone(), "https://example.com/hook");
        store.create_webhook(&webhook).await.unwrap();

        assert_eq!(store.increment_webhook_bucket(webhook.id, 100).await.unwrap(), 1);
        assert_eq!(store.increment_webhook_bucket(webhook.id, 100).await.unwrap(), 2);
        assert_eq!(store.increment_webhook_bucket(webhook.id, 101).await.unwrap(), 1);
    }
}
