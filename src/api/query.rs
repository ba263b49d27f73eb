// Read surface over the telemetry store, plus score creation, trace
// completion and the anomaly rule/alert endpoints.

use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
    routing::{get, post},
    Extension, Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::{
    AgentArtifact, Alert, AlertSeverity, AlertStatus, AnomalyRule, DetectionMethod, MetricKind,
    Observation, Score, Trace, TraceLevel,
};
use crate::ingest::event::{EventBody, ScoreCreateBody};
use crate::storage::{AggregateBucket, TelemetryWrite, TraceFilter};

use super::auth::AuthContext;
use super::cursor::{decode_cursor, encode_cursor};
use super::error::{ApiError, ApiResult};
use super::state::AppState;

const DEFAULT_PAGE_SIZE: u32 = 50;
const MAX_PAGE_SIZE: u32 = 200;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/v1/traces", get(list_traces))
        .route("/v1/traces/:id", get(get_trace))
        .route("/v1/traces/:id/complete", post(complete_trace))
        .route("/v1/observations/:id", get(get_observation))
        .route("/v1/scores", post(create_score))
        .route("/v1/metrics/aggregate", get(aggregate_metrics))
        .route("/v1/anomaly/rules", post(create_anomaly_rule))
        .route("/v1/anomaly/alerts", get(list_alerts))
        .route("/v1/anomaly/alerts/:id/acknowledge", post(acknowledge_alert))
        .route("/v1/anomaly/alerts/:id/resolve", post(resolve_alert))
        .route("/v1/anomaly/alerts/:id/suppress", post(suppress_alert))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListTracesQuery {
    name: Option<String>,
    /// Comma-separated tag set; all must match.
    tags: Option<String>,
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
    level: Option<String>,
    user_id: Option<String>,
    session_id: Option<String>,
    min_cost: Option<f64>,
    max_cost: Option<f64>,
    min_latency_ms: Option<i64>,
    max_latency_ms: Option<i64>,
    cursor: Option<String>,
    limit: Option<u32>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Page<T> {
    data: Vec<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    next_cursor: Option<String>,
}

async fn list_traces(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Query(query): Query<ListTracesQuery>,
) -> ApiResult<impl IntoResponse> {
    let filter = TraceFilter {
        name: query.name,
        tags: query
            .tags
            .map(|t| t.split(',').map(|s| s.trim().to_string()).collect())
            .unwrap_or_default(),
        from: query.from,
        to: query.to,
        level: query.level.as_deref().map(TraceLevel::parse),
        user_id: query.user_id,
        session_id: query.session_id,
        min_cost: query.min_cost,
        max_cost: query.max_cost,
        min_latency_ms: query.min_latency_ms,
        max_latency_ms: query.max_latency_ms,
    };

    let cursor = query
        .cursor
        .as_deref()
        .map(decode_cursor)
        .transpose()
        .map_err(ApiError::from)?;
    let limit = query.limit.unwrap_or(DEFAULT_PAGE_SIZE).min(MAX_PAGE_SIZE);

    let traces = state
        .telemetry
        .list_traces(auth.project_id(), &filter, cursor.as_ref(), limit)
        .await
        .map_err(ApiError::from)?;

    let next_cursor = if traces.len() as u32 == limit {
        traces.last().map(|last| {
            encode_cursor(&crate::storage::CursorPosition {
                id: last.id.clone(),
                ts: last.start_time,
            })
        })
    } else {
        None
    };

    Ok(Json(Page {
        data: traces,
        next_cursor,
    }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TraceDetail {
    #[serde(flatten)]
    trace: Trace,
    observations: Vec<Observation>,
    scores: Vec<Score>,
    artifacts: Vec<AgentArtifact>,
}

async fn get_trace(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let project_id = auth.project_id();
    let trace = state
        .telemetry
        .get_trace(project_id, &id)
        .await
        .map_err(ApiError::from)?
        .ok_or_else(|| ApiError::NotFound(format!("trace {id}")))?;

    // batched loaders: one round trip per child table
    let ids = vec![trace.id.clone()];
    let mut observations = state
        .telemetry
        .observations_for_traces(project_id, &ids)
        .await
        .map_err(ApiError::from)?;
    let mut scores = state
        .telemetry
        .scores_for_traces(project_id, &ids)
        .await
        .map_err(ApiError::from)?;
    let mut artifacts = state
        .telemetry
        .artifacts_for_traces(project_id, &ids)
        .await
        .map_err(ApiError::from)?;

    Ok(Json(TraceDetail {
        observations: observations.remove(&trace.id).unwrap_or_default(),
        scores: scores.remove(&trace.id).unwrap_or_default(),
        artifacts: artifacts.remove(&trace.id).unwrap_or_default(),
        trace,
    }))
}

async fn get_observation(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let observation = state
        .telemetry
        .get_observation(auth.project_id(), &id)
        .await
        .map_err(ApiError::from)?
        .ok_or_else(|| ApiError::NotFound(format!("observation {id}")))?;
    Ok(Json(observation))
}

async fn complete_trace(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let project_id = auth.project_id();
    let updated = state
        .telemetry
        .complete_trace(project_id, &id, Utc::now())
        .await
        .map_err(ApiError::from)?;
    if !updated {
        return Err(ApiError::NotFound(format!("trace {id}")));
    }

    crate::ingest::api::schedule_effect(
        &state,
        project_id,
        &crate::ingest::event::SideEffect::TraceComplete { trace_id: id.clone() },
    )
    .await
    .map_err(ApiError::from)?;

    Ok(Json(serde_json::json!({ "id": id, "completed": true })))
}

async fn create_score(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Json(body): Json<ScoreCreateBody>,
) -> ApiResult<impl IntoResponse> {
    let (write, _) = EventBody::ScoreCreate(body)
        .into_write(auth.project_id(), Utc::now())
        .map_err(ApiError::from)?;
    let TelemetryWrite::Score(score) = write else {
        return Err(ApiError::Internal("unexpected write kind".into()));
    };
    state
        .telemetry
        .insert_score(&score)
        .await
        .map_err(ApiError::from)?;
    Ok(Json(score))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AggregateQuery {
    metric: String,
    bucket_secs: Option<i64>,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct AggregateResponse {
    metric: String,
    bucket_secs: i64,
    buckets: Vec<AggregateBucket>,
}

async fn aggregate_metrics(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Query(query): Query<AggregateQuery>,
) -> ApiResult<impl IntoResponse> {
    let metric = MetricKind::parse(&query.metric).map_err(ApiError::from)?;
    let bucket_secs = query.bucket_secs.unwrap_or(3600).max(60);
    let buckets = state
        .telemetry
        .aggregate_metric(auth.project_id(), metric, bucket_secs, query.from, query.to)
        .await
        .map_err(ApiError::from)?;
    Ok(Json(AggregateResponse {
        metric: query.metric,
        bucket_secs,
        buckets,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateRuleRequest {
    name: String,
    metric: String,
    method: DetectionMethod,
    lookback_minutes: Option<u32>,
    auto_resolve_samples: Option<u32>,
    severity: Option<String>,
    cooldown_minutes: Option<u32>,
    #[serde(default)]
    alert_webhook_ids: Vec<Uuid>,
}

async fn create_anomaly_rule(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Json(body): Json<CreateRuleRequest>,
) -> ApiResult<impl IntoResponse> {
    let metric = MetricKind::parse(&body.metric).map_err(ApiError::from)?;
    let mut rule = AnomalyRule::new(
        auth.project_id().to_string(),
        body.name,
        metric,
        body.method,
    );
    if let Some(lookback) = body.lookback_minutes {
        rule.lookback_minutes = lookback;
    }
    if let Some(samples) = body.auto_resolve_samples {
        rule.auto_resolve_samples = samples;
    }
    if let Some(severity) = body.severity.as_deref() {
        rule.severity = AlertSeverity::parse(severity);
    }
    if let Some(cooldown) = body.cooldown_minutes {
        rule.cooldown_minutes = cooldown;
    }
    rule.alert_webhook_ids = body.alert_webhook_ids;

    state
        .config_store
        .create_anomaly_rule(&rule)
        .await
        .map_err(ApiError::from)?;
    Ok(Json(rule))
}

#[derive(Debug, Deserialize)]
struct ListAlertsQuery {
    status: Option<String>,
}

async fn list_alerts(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Query(query): Query<ListAlertsQuery>,
) -> ApiResult<impl IntoResponse> {
    let status = query
        .status
        .as_deref()
        .map(AlertStatus::parse)
        .transpose()
        .map_err(ApiError::from)?;
    let alerts = state
        .config_store
        .list_alerts(auth.project_id(), status)
        .await
        .map_err(ApiError::from)?;
    Ok(Json(Page {
        data: alerts,
        next_cursor: None,
    }))
}

#[derive(Debug, Default, Deserialize)]
struct AlertActionBody {
    note: Option<String>,
}

async fn transition(
    state: &AppState,
    auth: &AuthContext,
    id: Uuid,
    next: AlertStatus,
    note: Option<String>,
) -> ApiResult<Json<Alert>> {
    let alert = state
        .config_store
        .get_alert(id)
        .await
        .map_err(ApiError::from)?
        .ok_or_else(|| ApiError::NotFound(format!("alert {id}")))?;
    if alert.project_id != auth.project_id() {
        return Err(ApiError::NotFound(format!("alert {id}")));
    }
    let updated = state
        .config_store
        .transition_alert(id, next, note, false)
        .await
        .map_err(ApiError::from)?;
    Ok(Json(updated))
}

async fn acknowledge_alert(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<Uuid>,
    body: Option<Json<AlertActionBody>>,
) -> ApiResult<impl IntoResponse> {
    let note = body.and_then(|b| b.0.note);
    transition(&state, &auth, id, AlertStatus::Acknowledged, note).await
}

async fn resolve_alert(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<Uuid>,
    body: Option<Json<AlertActionBody>>,
) -> ApiResult<impl IntoResponse> {
    let note = body.and_then(|b| b.0.note);
    transition(&state, &auth, id, AlertStatus::Resolved, note).await
}

async fn suppress_alert(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<Uuid>,
    body: Option<Json<AlertActionBody>>,
) -> ApiResult<impl IntoResponse> {
    let note = body.and_then(|b| b.0.note);
    transition(&state, &auth, id, AlertStatus::Suppressed, note).await
}
