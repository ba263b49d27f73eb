// Row types bridging SQLite rows and domain models.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::FromRow;
use std::str::FromStr;
use uuid::Uuid;

use crate::domain::{
    AgentArtifact, AgentTraceError, Alert, AlertSeverity, AlertStatus, AnomalyRule, ApiKey,
    ArtifactKind, DetectionMethod, Evaluator, EvaluatorType, MetricKind, ModelPrice, Observation,
    ObservationType, Project, Result, Score, ScoreDataType, ScoreSource, ScoreValue, Trace,
    TraceLevel,
};
use crate::domain::webhook::WebhookEndpoint;

fn parse_uuid(s: &str, field: &str) -> Result<Uuid> {
    Uuid::from_str(s)
        .map_err(|_| AgentTraceError::internal(format!("corrupt {field} uuid: {s}")))
}

fn parse_decimal(s: &str, field: &str) -> Result<Decimal> {
    Decimal::from_str(s)
        .map_err(|_| AgentTraceError::internal(format!("corrupt {field} decimal: {s}")))
}

fn parse_json(s: &str, field: &str) -> Result<serde_json::Value> {
    serde_json::from_str(s)
        .map_err(|_| AgentTraceError::internal(format!("corrupt {field} json")))
}

#[derive(Debug, FromRow)]
pub struct ProjectRow {
    pub id: String,
    pub org_id: String,
    pub slug: String,
    pub name: String,
    pub retention_days: i64,
    pub rate_limit_per_minute: i64,
    pub disabled: i64,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<ProjectRow> for Project {
    type Error = AgentTraceError;

    fn try_from(row: ProjectRow) -> Result<Self> {
        Ok(Project {
            id: row.id,
            org_id: parse_uuid(&row.org_id, "org_id")?,
            slug: row.slug,
            name: row.name,
            retention_days: row.retention_days as u32,
            rate_limit_per_minute: row.rate_limit_per_minute as u32,
            disabled: row.disabled != 0,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, FromRow)]
pub struct ApiKeyRow {
    pub id: String,
    pub project_id: String,
    pub public_key: String,
    pub secret_hash: String,
    pub scopes: String,
    pub revoked_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<ApiKeyRow> for ApiKey {
    type Error = AgentTraceError;

    fn try_from(row: ApiKeyRow) -> Result<Self> {
        Ok(ApiKey {
            id: parse_uuid(&row.id, "api_key.id")?,
            project_id: row.project_id,
            public_key: row.public_key,
            secret_hash: row.secret_hash,
            scopes: serde_json::from_str(&row.scopes).unwrap_or_default(),
            revoked_at: row.revoked_at,
            last_used_at: row.last_used_at,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, FromRow)]
pub struct ModelPriceRow {
    pub id: String,
    pub provider: String,
    pub model_name: String,
    pub model_regex: Option<String>,
    pub input_per_1m: String,
    pub output_per_1m: String,
    pub cache_read_per_1m: Option<String>,
    pub effective_date: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<ModelPriceRow> for ModelPrice {
    type Error = AgentTraceError;

    fn try_from(row: ModelPriceRow) -> Result<Self> {
        Ok(ModelPrice {
            id: parse_uuid(&row.id, "model_price.id")?,
            provider: row.provider,
            model_name: row.model_name,
            model_regex: row.model_regex,
            input_per_1m: parse_decimal(&row.input_per_1m, "input_per_1m")?,
            output_per_1m: parse_decimal(&row.output_per_1m, "output_per_1m")?,
            cache_read_per_1m: row
                .cache_read_per_1m
                .as_deref()
                .map(|s| parse_decimal(s, "cache_read_per_1m"))
                .transpose()?,
            effective_date: row.effective_date,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, FromRow)]
pub struct EvaluatorRow {
    pub id: String,
    pub project_id: String,
    pub evaluator_type: String,
    pub prompt_template: Option<String>,
    pub variables: String,
    pub rule: Option<String>,
    pub target_filter: String,
    pub sampling_rate: f64,
    pub score_name: String,
    pub score_data_type: String,
    pub enabled: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<EvaluatorRow> for Evaluator {
    type Error = AgentTraceError;

    fn try_from(row: EvaluatorRow) -> Result<Self> {
        Ok(Evaluator {
            id: parse_uuid(&row.id, "evaluator.id")?,
            project_id: row.project_id,
            evaluator_type: EvaluatorType::parse(&row.evaluator_type)?,
            prompt_template: row.prompt_template,
            variables: serde_json::from_str(&row.variables).unwrap_or_default(),
            rule: row
                .rule
                .as_deref()
                .map(|s| serde_json::from_str(s))
                .transpose()?,
            target_filter: serde_json::from_str(&row.target_filter).unwrap_or_default(),
            sampling_rate: row.sampling_rate,
            score_name: row.score_name,
            score_data_type: ScoreDataType::parse(&row.score_data_type)?,
            enabled: row.enabled != 0,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
pub struct AnomalyRuleRow {
    pub id: String,
    pub project_id: String,
    pub name: String,
    pub metric: String,
    pub method: String,
    pub lookback_minutes: i64,
    pub auto_resolve_samples: i64,
    pub severity: String,
    pub cooldown_minutes: i64,
    pub alert_webhook_ids: String,
    pub enabled: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<AnomalyRuleRow> for AnomalyRule {
    type Error = AgentTraceError;

    fn try_from(row: AnomalyRuleRow) -> Result<Self> {
        let method: DetectionMethod = serde_json::from_str(&row.method)?;
        Ok(AnomalyRule {
            id: parse_uuid(&row.id, "anomaly_rule.id")?,
            project_id: row.project_id,
            name: row.name,
            metric: MetricKind::parse(&row.metric)?,
            method,
            lookback_minutes: row.lookback_minutes as u32,
            auto_resolve_samples: row.auto_resolve_samples as u32,
            severity: AlertSeverity::parse(&row.severity),
            cooldown_minutes: row.cooldown_minutes as u32,
            alert_webhook_ids: serde_json::from_str(&row.alert_webhook_ids).unwrap_or_default(),
            enabled: row.enabled != 0,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
pub struct AlertRow {
    pub id: String,
    pub rule_id: String,
    pub project_id: String,
    pub status: String,
    pub anomaly_score: f64,
    pub severity: String,
    pub cooldown_bucket: i64,
    pub hit_count: i64,
    pub raised_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub auto_resolved: i64,
    pub notes: String,
}

impl TryFrom<AlertRow> for Alert {
    type Error = AgentTraceError;

    fn try_from(row: AlertRow) -> Result<Self> {
        Ok(Alert {
            id: parse_uuid(&row.id, "alert.id")?,
            rule_id: parse_uuid(&row.rule_id, "alert.rule_id")?,
            project_id: row.project_id,
            status: AlertStatus::parse(&row.status)?,
            anomaly_score: row.anomaly_score,
            severity: AlertSeverity::parse(&row.severity),
            cooldown_bucket: row.cooldown_bucket,
            hit_count: row.hit_count as u32,
            raised_at: row.raised_at,
            resolved_at: row.resolved_at,
            auto_resolved: row.auto_resolved != 0,
            notes: serde_json::from_str(&row.notes).unwrap_or_default(),
        })
    }
}

#[derive(Debug, FromRow)]
pub struct WebhookRow {
    pub id: String,
    pub project_id: String,
    pub url: String,
    pub rate_limit_per_hour: i64,
    pub enabled: i64,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<WebhookRow> for WebhookEndpoint {
    type Error = AgentTraceError;

    fn try_from(row: WebhookRow) -> Result<Self> {
        Ok(WebhookEndpoint {
            id: parse_uuid(&row.id, "webhook.id")?,
            project_id: row.project_id,
            url: row.url,
            rate_limit_per_hour: row.rate_limit_per_hour as u32,
            enabled: row.enabled != 0,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, FromRow)]
pub struct TraceRow {
    pub project_id: String,
    pub id: String,
    pub name: Option<String>,
    pub session_id: Option<String>,
    pub user_id: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub input: Option<String>,
    pub output: Option<String>,
    pub tags: String,
    pub metadata: String,
    pub level: String,
    pub received_at: DateTime<Utc>,
}

impl TryFrom<TraceRow> for Trace {
    type Error = AgentTraceError;

    fn try_from(row: TraceRow) -> Result<Self> {
        Ok(Trace {
            id: row.id,
            project_id: row.project_id,
            name: row.name,
            session_id: row.session_id,
            user_id: row.user_id,
            start_time: row.start_time,
            end_time: row.end_time,
            input: row
                .input
                .as_deref()
                .map(|s| parse_json(s, "trace.input"))
                .transpose()?,
            output: row
                .output
                .as_deref()
                .map(|s| parse_json(s, "trace.output"))
                .transpose()?,
            tags: serde_json::from_str(&row.tags).unwrap_or_default(),
            metadata: parse_json(&row.metadata, "trace.metadata")?,
            level: TraceLevel::parse(&row.level),
            received_at: row.received_at,
        })
    }
}

#[derive(Debug, FromRow)]
pub struct ObservationRow {
    pub project_id: String,
    pub id: String,
    pub trace_id: String,
    pub parent_id: Option<String>,
    pub observation_type: String,
    pub name: Option<String>,
    pub model: Option<String>,
    pub provider: Option<String>,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cache_read_tokens: i64,
    pub cost: Option<String>,
    pub cost_calculated: i64,
    pub last_calculated_at: Option<DateTime<Utc>>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub input: Option<String>,
    pub output: Option<String>,
    pub metadata: String,
    pub received_at: DateTime<Utc>,
}

impl TryFrom<ObservationRow> for Observation {
    type Error = AgentTraceError;

    fn try_from(row: ObservationRow) -> Result<Self> {
        Ok(Observation {
            id: row.id,
            trace_id: row.trace_id,
            project_id: row.project_id,
            parent_id: row.parent_id,
            observation_type: ObservationType::parse(&row.observation_type)?,
            name: row.name,
            model: row.model,
            provider: row.provider,
            input_tokens: row.input_tokens as u64,
            output_tokens: row.output_tokens as u64,
            cache_read_tokens: row.cache_read_tokens as u64,
            cost: row
                .cost
                .as_deref()
                .map(|s| parse_decimal(s, "observation.cost"))
                .transpose()?,
            cost_calculated: row.cost_calculated != 0,
            last_calculated_at: row.last_calculated_at,
            start_time: row.start_time,
            end_time: row.end_time,
            input: row
                .input
                .as_deref()
                .map(|s| parse_json(s, "observation.input"))
                .transpose()?,
            output: row
                .output
                .as_deref()
                .map(|s| parse_json(s, "observation.output"))
                .transpose()?,
            metadata: parse_json(&row.metadata, "observation.metadata")?,
            received_at: row.received_at,
        })
    }
}

#[derive(Debug, FromRow)]
pub struct ScoreRow {
    pub id: String,
    pub project_id: String,
    pub trace_id: String,
    pub observation_id: Option<String>,
    pub name: String,
    pub value: String,
    pub data_type: String,
    pub source: String,
    pub comment: Option<String>,
    pub evaluator_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<ScoreRow> for Score {
    type Error = AgentTraceError;

    fn try_from(row: ScoreRow) -> Result<Self> {
        let data_type = ScoreDataType::parse(&row.data_type)?;
        let value: ScoreValue = match data_type {
            ScoreDataType::Numeric => ScoreValue::Numeric(
                row.value
                    .parse()
                    .map_err(|_| AgentTraceError::internal("corrupt numeric score value"))?,
            ),
            ScoreDataType::Boolean => ScoreValue::Boolean(row.value == "true"),
            ScoreDataType::Categorical => ScoreValue::Categorical(row.value.clone()),
        };
        Ok(Score {
            id: row.id,
            trace_id: row.trace_id,
            project_id: row.project_id,
            observation_id: row.observation_id,
            name: row.name,
            value,
            data_type,
            source: ScoreSource::parse(&row.source)?,
            comment: row.comment,
            evaluator_id: row.evaluator_id,
            created_at: row.created_at,
        })
    }
}

/// Wire encoding of a score value in the `scores.value` column.
pub fn encode_score_value(value: &ScoreValue) -> String {
    match value {
        ScoreValue::Numeric(v) => v.to_string(),
        ScoreValue::Boolean(b) => b.to_string(),
        ScoreValue::Categorical(s) => s.clone(),
    }
}

#[derive(Debug, FromRow)]
pub struct ArtifactRow {
    pub id: String,
    pub project_id: String,
    pub trace_id: String,
    pub observation_id: Option<String>,
    pub kind: String,
    pub payload: String,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<ArtifactRow> for AgentArtifact {
    type Error = AgentTraceError;

    fn try_from(row: ArtifactRow) -> Result<Self> {
        Ok(AgentArtifact {
            id: row.id,
            trace_id: row.trace_id,
            project_id: row.project_id,
            observation_id: row.observation_id,
            kind: ArtifactKind::parse(&row.kind)?,
            payload: parse_json(&row.payload, "artifact.payload")?,
            created_at: row.created_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_score_value() {
        assert_eq!(encode_score_value(&ScoreValue::Numeric(0.5)), "0.5");
        assert_eq!(encode_score_value(&ScoreValue::Boolean(true)), "true");
        assert_eq!(
            encode_score_value(&ScoreValue::Categorical("good".into())),
            "good"
        );
    }

    #[test]
    fn test_decimal_parse_errors_surface() {
        assert!(parse_decimal("not-a-number", "x").is_err());
        assert!(parse_decimal("2.50", "x").is_ok());
    }
}
