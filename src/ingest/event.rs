// Wire envelopes accepted by the ingest surface. Bodies are tagged
// variants over the known event types; user-extensible fields ride in the
// opaque metadata map.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::domain::trace::{
    new_observation_id, new_trace_id, validate_id, MAX_OBSERVATION_ID_LEN, MAX_TRACE_ID_LEN,
};
use crate::domain::{
    AgentArtifact, AgentTraceError, ArtifactKind, Observation, ObservationType, Result, Score,
    ScoreDataType, ScoreSource, ScoreValue, Trace, TraceLevel,
};
use crate::storage::TelemetryWrite;

/// One event inside a batch envelope. `event_id` is client-supplied and used
/// for idempotency and per-event acknowledgement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestEnvelope {
    pub event_id: String,
    #[serde(flatten)]
    pub event: EventBody,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "body", rename_all = "kebab-case")]
pub enum EventBody {
    TraceCreate(TraceCreateBody),
    TraceUpdate(TraceUpdateBody),
    ObservationCreate(ObservationBody),
    ObservationUpdate(ObservationBody),
    ScoreCreate(ScoreCreateBody),
    ArtifactCreate(ArtifactCreateBody),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase", default)]
pub struct TraceCreateBody {
    pub id: Option<String>,
    #[validate(length(max = 500))]
    pub name: Option<String>,
    #[validate(length(max = 200))]
    pub session_id: Option<String>,
    #[validate(length(max = 200))]
    pub user_id: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub input: Option<serde_json::Value>,
    pub output: Option<serde_json::Value>,
    pub tags: Vec<String>,
    pub metadata: Option<serde_json::Value>,
    pub level: Option<TraceLevel>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct TraceUpdateBody {
    pub id: String,
    #[serde(default)]
    #[validate(length(max = 500))]
    pub name: Option<String>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub output: Option<serde_json::Value>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub level: Option<TraceLevel>,
    /// Marks the trace complete even when the client omits end_time.
    #[serde(default)]
    pub completed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ObservationBody {
    #[serde(default)]
    pub id: Option<String>,
    pub trace_id: String,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(rename = "type", default = "default_observation_type")]
    pub observation_type: ObservationType,
    #[serde(default)]
    #[validate(length(max = 500))]
    pub name: Option<String>,
    #[serde(default)]
    #[validate(length(max = 200))]
    pub model: Option<String>,
    #[serde(default)]
    #[validate(length(max = 100))]
    pub provider: Option<String>,
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_read_tokens: u64,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub input: Option<serde_json::Value>,
    #[serde(default)]
    pub output: Option<serde_json::Value>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

fn default_observation_type() -> ObservationType {
    ObservationType::Span
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ScoreCreateBody {
    #[serde(default)]
    pub id: Option<String>,
    pub trace_id: String,
    #[serde(default)]
    pub observation_id: Option<String>,
    #[validate(length(min = 1, max = 200))]
    pub name: String,
    pub value: serde_json::Value,
    #[serde(default)]
    pub data_type: Option<ScoreDataType>,
    #[serde(default)]
    #[validate(length(max = 2000))]
    pub comment: Option<String>,
    /// Client-side creation time; scores order by it.
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactCreateBody {
    #[serde(default)]
    pub id: Option<String>,
    pub trace_id: String,
    #[serde(default)]
    pub observation_id: Option<String>,
    pub kind: ArtifactKind,
    pub payload: serde_json::Value,
}

/// Downstream job scheduling derived from an accepted event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SideEffect {
    /// Observation carries a model and billable tokens.
    CostCalculate { observation_id: String },
    /// Trace end was signalled; evaluation and anomaly checks follow.
    TraceComplete { trace_id: String },
}

/// Per-event acknowledgement for the 207-style batch response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventAck {
    pub event_id: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl EventAck {
    pub fn ok(event_id: String) -> Self {
        Self {
            event_id,
            ok: true,
            error: None,
        }
    }

    pub fn err(event_id: String, error: impl Into<String>) -> Self {
        Self {
            event_id,
            ok: false,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestResponse {
    pub results: Vec<EventAck>,
}

fn score_value_from_json(
    value: &serde_json::Value,
    declared: Option<ScoreDataType>,
) -> Result<ScoreValue> {
    let parsed = match value {
        serde_json::Value::Number(n) => ScoreValue::Numeric(
            n.as_f64()
                .ok_or_else(|| AgentTraceError::validation("score value out of range"))?,
        ),
        serde_json::Value::Bool(b) => ScoreValue::Boolean(*b),
        serde_json::Value::String(s) => ScoreValue::Categorical(s.clone()),
        _ => {
            return Err(AgentTraceError::validation(
                "score value must be a number, boolean or string",
            ))
        }
    };
    if let Some(declared) = declared {
        if parsed.data_type() != declared {
            return Err(AgentTraceError::validation(format!(
                "score value does not match declared data type {}",
                declared.as_str()
            )));
        }
    }
    Ok(parsed)
}

impl EventBody {
    /// Validate the body and materialize the telemetry write plus any job
    /// side effects. Timestamps are normalized to UTC by the envelope types;
    /// the server stamps project scope and `received_at`.
    pub fn into_write(
        self,
        project_id: &str,
        received_at: DateTime<Utc>,
    ) -> Result<(TelemetryWrite, Vec<SideEffect>)> {
        match self {
            EventBody::TraceCreate(body) => {
                body.validate()
                    .map_err(|e| AgentTraceError::validation(e.to_string()))?;
                let id = body.id.unwrap_or_else(new_trace_id);
                validate_id(&id, MAX_TRACE_ID_LEN, "trace id")?;
                let mut trace =
                    Trace::new(id, project_id.to_string(), body.start_time.unwrap_or(received_at));
                trace.name = body.name;
                trace.session_id = body.session_id;
                trace.user_id = body.user_id;
                trace.input = body.input;
                trace.output = body.output;
                trace.tags = body.tags;
                trace.metadata = body.metadata.unwrap_or(serde_json::Value::Null);
                trace.level = body.level.unwrap_or_default();
                trace.received_at = received_at;
                trace.validate()?;
                Ok((TelemetryWrite::Trace(trace), Vec::new()))
            }
            EventBody::TraceUpdate(body) => {
                body.validate()
                    .map_err(|e| AgentTraceError::validation(e.to_string()))?;
                validate_id(&body.id, MAX_TRACE_ID_LEN, "trace id")?;
                let completes = body.completed || body.end_time.is_some();
                let end_time = if completes {
                    Some(body.end_time.unwrap_or(received_at))
                } else {
                    None
                };
                // Updates are merged into the existing row; absent fields
                // keep their stored values.
                let mut trace = Trace::new(body.id.clone(), project_id.to_string(), received_at);
                trace.name = body.name;
                trace.end_time = end_time;
                trace.output = body.output;
                trace.metadata = body.metadata.unwrap_or(serde_json::Value::Null);
                trace.tags = body.tags;
                trace.level = body.level.unwrap_or_default();
                trace.received_at = received_at;

                let effects = if completes {
                    vec![SideEffect::TraceComplete {
                        trace_id: body.id,
                    }]
                } else {
                    Vec::new()
                };
                Ok((TelemetryWrite::Trace(trace), effects))
            }
            EventBody::ObservationCreate(body) | EventBody::ObservationUpdate(body) => {
                body.validate()
                    .map_err(|e| AgentTraceError::validation(e.to_string()))?;
                let id = body.id.unwrap_or_else(new_observation_id);
                validate_id(&id, MAX_OBSERVATION_ID_LEN, "observation id")?;
                validate_id(&body.trace_id, MAX_TRACE_ID_LEN, "trace id")?;

                let mut obs = Observation::new(
                    id.clone(),
                    body.trace_id,
                    project_id.to_string(),
                    body.observation_type,
                    body.start_time.unwrap_or(received_at),
                );
                obs.parent_id = body.parent_id;
                obs.name = body.name;
                obs.model = body.model;
                obs.provider = body.provider;
                obs.input_tokens = body.input_tokens;
                obs.output_tokens = body.output_tokens;
                obs.cache_read_tokens = body.cache_read_tokens;
                obs.end_time = body.end_time;
                obs.input = body.input;
                obs.output = body.output;
                obs.metadata = body.metadata.unwrap_or(serde_json::Value::Null);
                obs.received_at = received_at;
                obs.validate()?;

                let effects = if obs.model.is_some() && obs.has_billable_tokens() {
                    vec![SideEffect::CostCalculate {
                        observation_id: id,
                    }]
                } else {
                    Vec::new()
                };
                Ok((TelemetryWrite::Observation(obs), effects))
            }
            EventBody::ScoreCreate(body) => {
                body.validate()
                    .map_err(|e| AgentTraceError::validation(e.to_string()))?;
                validate_id(&body.trace_id, MAX_TRACE_ID_LEN, "trace id")?;
                let value = score_value_from_json(&body.value, body.data_type)?;
                let id = body
                    .id
                    .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());
                let mut score = Score::new(
                    id,
                    body.trace_id,
                    project_id.to_string(),
                    body.name,
                    value,
                    ScoreSource::Api,
                );
                score.observation_id = body.observation_id;
                score.comment = body.comment;
                score.created_at = body.timestamp.unwrap_or(received_at);
                score.validate()?;
                Ok((TelemetryWrite::Score(score), Vec::new()))
            }
            EventBody::ArtifactCreate(body) => {
                validate_id(&body.trace_id, MAX_TRACE_ID_LEN, "trace id")?;
                let artifact = AgentArtifact {
                    id: body
                        .id
                        .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string()),
                    trace_id: body.trace_id,
                    project_id: project_id.to_string(),
                    observation_id: body.observation_id,
                    kind: body.kind,
                    payload: body.payload,
                    created_at: received_at,
                };
                Ok((TelemetryWrite::Artifact(artifact), Vec::new()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn received() -> DateTime<Utc> {
        "2024-03-01T00:00:00Z".parse().unwrap()
    }

    #[test]
    fn test_envelope_wire_shape() {
        let json = serde_json::json!({
            "event_id": "e1",
            "type": "observation-create",
            "body": {
                "traceId": "t1",
                "type": "generation",
                "model": "gpt-4o",
                "provider": "openai",
                "inputTokens": 1000,
                "outputTokens": 500,
                "startTime": "2024-03-01T00:00:00Z"
            }
        });
        let envelope: IngestEnvelope = serde_json::from_value(json).unwrap();
        assert_eq!(envelope.event_id, "e1");
        assert!(matches!(envelope.event, EventBody::ObservationCreate(_)));
    }

    #[test]
    fn test_observation_with_model_and_tokens_schedules_cost() {
        let body = EventBody::ObservationCreate(ObservationBody {
            id: Some("obs1".into()),
            trace_id: "t1".into(),
            parent_id: None,
            observation_type: ObservationType::Generation,
            name: None,
            model: Some("gpt-4o".into()),
            provider: Some("openai".into()),
            input_tokens: 1000,
            output_tokens: 500,
            cache_read_tokens: 0,
            start_time: None,
            end_time: None,
            input: None,
            output: None,
            metadata: None,
        });
        let (write, effects) = body.into_write("p1", received()).unwrap();
        assert!(matches!(write, TelemetryWrite::Observation(_)));
        assert_eq!(
            effects,
            vec![SideEffect::CostCalculate {
                observation_id: "obs1".into()
            }]
        );
    }

    #[test]
    fn test_observation_without_tokens_no_cost_job() {
        let body = EventBody::ObservationCreate(ObservationBody {
            id: Some("obs1".into()),
            trace_id: "t1".into(),
            parent_id: None,
            observation_type: ObservationType::Span,
            name: None,
            model: Some("gpt-4o".into()),
            provider: None,
            input_tokens: 0,
            output_tokens: 0,
            cache_read_tokens: 0,
            start_time: None,
            end_time: None,
            input: None,
            output: None,
            metadata: None,
        });
        let (_, effects) = body.into_write("p1", received()).unwrap();
        assert!(effects.is_empty());
    }

    #[test]
    fn test_trace_update_with_end_time_completes() {
        let body = EventBody::TraceUpdate(TraceUpdateBody {
            id: "t1".into(),
            name: None,
            end_time: Some(received()),
            output: None,
            metadata: None,
            tags: vec![],
            level: None,
            completed: false,
        });
        let (_, effects) = body.into_write("p1", received()).unwrap();
        assert_eq!(
            effects,
            vec![SideEffect::TraceComplete {
                trace_id: "t1".into()
            }]
        );
    }

    #[test]
    fn test_missing_trace_id_is_validation_error() {
        let json = serde_json::json!({
            "event_id": "e2",
            "type": "observation-create",
            "body": { "type": "span" }
        });
        assert!(serde_json::from_value::<IngestEnvelope>(json).is_err());
    }

    #[test]
    fn test_score_value_type_inference() {
        let body = EventBody::ScoreCreate(ScoreCreateBody {
            id: None,
            trace_id: "t1".into(),
            observation_id: None,
            name: "quality".into(),
            value: serde_json::json!(0.9),
            data_type: None,
            comment: None,
            timestamp: None,
        });
        let (write, _) = body.into_write("p1", received()).unwrap();
        match write {
            TelemetryWrite::Score(score) => {
                assert_eq!(score.data_type, ScoreDataType::Numeric);
                assert_eq!(score.source, ScoreSource::Api);
            }
            _ => panic!("expected score write"),
        }
    }

    #[test]
    fn test_score_malformed_value_rejected() {
        let body = EventBody::ScoreCreate(ScoreCreateBody {
            id: None,
            trace_id: "t1".into(),
            observation_id: None,
            name: "quality".into(),
            value: serde_json::json!({"nested": true}),
            data_type: None,
            comment: None,
            timestamp: None,
        });
        assert!(body.into_write("p1", received()).is_err());
    }

    #[test]
    fn test_score_declared_type_mismatch_rejected() {
        let body = EventBody::ScoreCreate(ScoreCreateBody {
            id: None,
            trace_id: "t1".into(),
            observation_id: None,
            name: "passed".into(),
            value: serde_json::json!("yes"),
            data_type: Some(ScoreDataType::Boolean),
            comment: None,
            timestamp: None,
        });
        assert!(body.into_write("p1", received()).is_err());
    }

    #[test]
    fn test_oversized_id_rejected() {
        let body = EventBody::TraceCreate(TraceCreateBody {
            id: Some("x".repeat(40)),
            ..Default::default()
        });
        assert!(body.into_write("p1", received()).is_err());
    }
}
