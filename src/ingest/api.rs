// Authenticated ingest surface: batch and single event acceptance.
//
// The pipeline per request is explicit: auth (middleware) -> rate limit ->
// validation -> batcher hand-off -> job scheduling. Acks mean "queued for
// persistence", not read-after-write.

use axum::{
    extract::{Request, State},
    response::IntoResponse,
    routing::post,
    Extension, Json, Router,
};
use chrono::{Duration, Utc};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::api::auth::AuthContext;
use crate::api::error::{ApiError, ApiResult};
use crate::api::state::AppState;
use crate::domain::AgentTraceError;
use crate::ingest::ratelimit::RateDecision;
use crate::queue::{EnqueueOptions, JobKind, JobQueue, QueueClass};

use super::event::{EventAck, EventBody, IngestEnvelope, IngestResponse, SideEffect};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/ingest/events", post(ingest_batch))
        .route("/ingest/event", post(ingest_single))
}

#[derive(Debug, Deserialize)]
struct SingleEvent {
    #[serde(default)]
    event_id: Option<String>,
    #[serde(flatten)]
    event: EventBody,
}

async fn ingest_batch(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    request: Request,
) -> ApiResult<impl IntoResponse> {
    let body_limit = state.config.ingest.max_event_bytes
        * state.config.ingest.max_batch_events.saturating_add(1);
    let envelopes: Vec<IngestEnvelope> = deserialize_body(request, body_limit).await?;

    check_rate_limit(&state, &auth.project.id, auth.project.rate_limit_per_minute)?;

    // refuse whole batches while the buffer sits above the high-water mark
    if state.batcher.buffered_rows() >= state.config.ingest.high_water_rows {
        metrics::counter!("agenttrace_ingest_backpressure_total", 1);
        return Err(AgentTraceError::Backpressure.into());
    }

    let max_events = state.config.ingest.max_batch_events;
    if envelopes.len() > max_events {
        return Err(ApiError::BadRequest(format!(
            "batch of {} events exceeds limit of {max_events}",
            envelopes.len()
        )));
    }

    let mut results = Vec::with_capacity(envelopes.len());
    for envelope in envelopes {
        let ack = process_event(&state, auth.project_id(), envelope).await;
        results.push(ack);
    }

    let accepted = results.iter().filter(|r| r.ok).count();
    metrics::counter!("agenttrace_ingest_events_accepted_total", accepted as u64);
    metrics::counter!(
        "agenttrace_ingest_events_rejected_total",
        (results.len() - accepted) as u64
    );
    debug!(
        project_id = auth.project_id(),
        accepted,
        rejected = results.len() - accepted,
        "Ingest batch processed"
    );

    Ok(Json(IngestResponse { results }))
}

async fn ingest_single(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    request: Request,
) -> ApiResult<impl IntoResponse> {
    let body_limit = state.config.ingest.max_event_bytes.saturating_mul(2);
    let single: SingleEvent = deserialize_body(request, body_limit).await?;

    check_rate_limit(&state, &auth.project.id, auth.project.rate_limit_per_minute)?;

    let envelope = IngestEnvelope {
        event_id: single
            .event_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string()),
        event: single.event,
    };
    let ack = process_event(&state, auth.project_id(), envelope).await;
    Ok(Json(ack))
}

/// Body extraction with an upper bound applied before parsing.
async fn deserialize_body<T: serde::de::DeserializeOwned>(
    request: Request,
    limit: usize,
) -> ApiResult<T> {
    let bytes = axum::body::to_bytes(request.into_body(), limit)
        .await
        .map_err(|e| ApiError::BadRequest(format!("unreadable or oversized body: {e}")))?;
    serde_json::from_slice(&bytes).map_err(|e| ApiError::BadRequest(format!("invalid JSON: {e}")))
}

fn check_rate_limit(state: &AppState, project_id: &str, per_minute: u32) -> ApiResult<()> {
    match state.limiter.check(project_id, per_minute) {
        RateDecision::Allowed => Ok(()),
        RateDecision::Limited { retry_after_secs } => {
            metrics::counter!("agenttrace_ingest_rate_limited_total", 1);
            Err(ApiError::TooManyRequests {
                message: format!("project {project_id} exceeded its ingest rate"),
                retry_after_secs,
            })
        }
    }
}

async fn process_event(state: &AppState, project_id: &str, envelope: IngestEnvelope) -> EventAck {
    let event_id = envelope.event_id;
    let received_at = Utc::now();

    // events are applied in declared order within an envelope; order across
    // envelopes is not guaranteed
    let approx_size = serde_json::to_vec(&envelope.event).map(|b| b.len()).unwrap_or(0);
    let limit = state.config.ingest.max_event_bytes;
    if approx_size > limit {
        return EventAck::err(
            event_id,
            AgentTraceError::PayloadTooLarge {
                actual: approx_size,
                limit,
            }
            .to_string(),
        );
    }

    let (write, effects) = match envelope.event.into_write(project_id, received_at) {
        Ok(converted) => converted,
        Err(e) => return EventAck::err(event_id, e.to_string()),
    };

    if let Err(e) = state.batcher.submit(write).await {
        return EventAck::err(event_id, e.to_string());
    }

    for effect in effects {
        if let Err(e) = schedule_effect(state, project_id, &effect).await {
            // the row is queued for persistence; enrichment is best-effort
            // here and re-derivable via recompute jobs
            warn!(project_id, error = %e, "Failed to schedule downstream job");
        }
    }

    EventAck::ok(event_id)
}

pub(crate) async fn schedule_effect(
    state: &AppState,
    project_id: &str,
    effect: &SideEffect,
) -> crate::domain::Result<()> {
    // defer past the batcher so the row is flushed before the handler loads it
    let flush_lag = Duration::milliseconds(state.config.ingest.max_batch_delay_ms as i64 * 2);
    match effect {
        SideEffect::CostCalculate { observation_id } => {
            state
                .queue
                .enqueue(
                    JobKind::CostCalculate,
                    serde_json::json!({
                        "project_id": project_id,
                        "observation_id": observation_id,
                    }),
                    EnqueueOptions::default()
                        .queue(QueueClass::Default)
                        .timeout_secs(600)
                        .unique_key(format!("cost:{project_id}:{observation_id}"))
                        .scheduled_at(Utc::now() + flush_lag),
                )
                .await?;
        }
        SideEffect::TraceComplete { trace_id } => {
            state
                .queue
                .enqueue(
                    JobKind::TraceComplete,
                    serde_json::json!({
                        "project_id": project_id,
                        "trace_id": trace_id,
                    }),
                    EnqueueOptions::default()
                        .queue(QueueClass::Default)
                        .timeout_secs(600)
                        .unique_key(format!("trace-complete:{project_id}:{trace_id}"))
                        .scheduled_at(Utc::now() + flush_lag),
                )
                .await?;
        }
    }
    Ok(())
}
