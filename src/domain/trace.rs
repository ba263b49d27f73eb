use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::{AgentTraceError, Result};

pub const MAX_TRACE_ID_LEN: usize = 32;
pub const MAX_OBSERVATION_ID_LEN: usize = 16;

/// Severity level attached to a trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TraceLevel {
    Debug,
    #[default]
    Default,
    Warning,
    Error,
}

impl TraceLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            TraceLevel::Debug => "debug",
            TraceLevel::Default => "default",
            TraceLevel::Warning => "warning",
            TraceLevel::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "debug" => TraceLevel::Debug,
            "warning" => TraceLevel::Warning,
            "error" => TraceLevel::Error,
            _ => TraceLevel::Default,
        }
    }
}

/// Top-level unit of an agent task's execution. Groups observations and
/// scores; mutable until completed, then append-only except score additions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trace {
    pub id: String,
    pub project_id: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,

    pub start_time: DateTime<Utc>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<serde_json::Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,

    #[serde(default)]
    pub tags: Vec<String>,

    #[serde(default)]
    pub metadata: serde_json::Value,

    #[serde(default)]
    pub level: TraceLevel,

    pub received_at: DateTime<Utc>,
}

/// Kind of child event within a trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObservationType {
    Span,
    Generation,
    Event,
}

impl ObservationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObservationType::Span => "span",
            ObservationType::Generation => "generation",
            ObservationType::Event => "event",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "span" => Ok(ObservationType::Span),
            "generation" => Ok(ObservationType::Generation),
            "event" => Ok(ObservationType::Event),
            other => Err(AgentTraceError::validation(format!(
                "unknown observation type: {other}"
            ))),
        }
    }
}

/// Child event within a trace: an LLM generation, a timed span, or a point
/// event. Cost starts unset and is filled in by the cost pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Observation {
    pub id: String,
    pub trace_id: String,
    pub project_id: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,

    #[serde(rename = "type")]
    pub observation_type: ObservationType,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,

    #[serde(default)]
    pub input_tokens: u64,

    #[serde(default)]
    pub output_tokens: u64,

    #[serde(default)]
    pub cache_read_tokens: u64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost: Option<rust_decimal::Decimal>,

    #[serde(default)]
    pub cost_calculated: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_calculated_at: Option<DateTime<Utc>>,

    pub start_time: DateTime<Utc>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<serde_json::Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,

    #[serde(default)]
    pub metadata: serde_json::Value,

    pub received_at: DateTime<Utc>,
}

/// Agent-specific artifact linked to a trace: a checkpoint, a git link, a
/// file operation or a terminal command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Checkpoint,
    GitLink,
    FileOp,
    TerminalCmd,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::Checkpoint => "checkpoint",
            ArtifactKind::GitLink => "git_link",
            ArtifactKind::FileOp => "file_op",
            ArtifactKind::TerminalCmd => "terminal_cmd",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "checkpoint" => Ok(ArtifactKind::Checkpoint),
            "git_link" => Ok(ArtifactKind::GitLink),
            "file_op" => Ok(ArtifactKind::FileOp),
            "terminal_cmd" => Ok(ArtifactKind::TerminalCmd),
            other => Err(AgentTraceError::validation(format!(
                "unknown artifact kind: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentArtifact {
    pub id: String,
    pub trace_id: String,
    pub project_id: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub observation_id: Option<String>,

    pub kind: ArtifactKind,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Generate a server-side trace id: 32 lowercase hex chars.
pub fn new_trace_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Generate a server-side observation id: 16 lowercase hex chars.
pub fn new_observation_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    id[..MAX_OBSERVATION_ID_LEN].to_string()
}

fn is_valid_id_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || c == '_'
}

/// Validate a client-supplied id against length and charset constraints.
pub fn validate_id(id: &str, max_len: usize, field: &str) -> Result<()> {
    if id.is_empty() {
        return Err(AgentTraceError::validation(format!("{field} must not be empty")));
    }
    if id.len() > max_len {
        return Err(AgentTraceError::validation(format!(
            "{field} exceeds {max_len} characters"
        )));
    }
    if !id.chars().all(is_valid_id_char) {
        return Err(AgentTraceError::validation(format!(
            "{field} contains invalid characters"
        )));
    }
    Ok(())
}

impl Trace {
    pub fn new(id: String, project_id: String, start_time: DateTime<Utc>) -> Self {
        Self {
            id,
            project_id,
            name: None,
            session_id: None,
            user_id: None,
            start_time,
            end_time: None,
            input: None,
            output: None,
            tags: Vec::new(),
            metadata: serde_json::Value::Null,
            level: TraceLevel::Default,
            received_at: Utc::now(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.end_time.is_some()
    }

    pub fn validate(&self) -> Result<()> {
        validate_id(&self.id, MAX_TRACE_ID_LEN, "trace id")?;
        if let Some(end) = self.end_time {
            if end < self.start_time {
                return Err(AgentTraceError::validation(
                    "trace end_time precedes start_time",
                ));
            }
        }
        Ok(())
    }
}

impl Observation {
    pub fn new(
        id: String,
        trace_id: String,
        project_id: String,
        observation_type: ObservationType,
        start_time: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            trace_id,
            project_id,
            parent_id: None,
            observation_type,
            name: None,
            model: None,
            provider: None,
            input_tokens: 0,
            output_tokens: 0,
            cache_read_tokens: 0,
            cost: None,
            cost_calculated: false,
            last_calculated_at: None,
            start_time,
            end_time: None,
            input: None,
            output: None,
            metadata: serde_json::Value::Null,
            received_at: Utc::now(),
        }
    }

    /// Whether this observation carries billable token counts.
    pub fn has_billable_tokens(&self) -> bool {
        self.input_tokens > 0 || self.output_tokens > 0 || self.cache_read_tokens > 0
    }

    /// Whether ingesting this observation should schedule cost attribution.
    pub fn needs_cost_calculation(&self) -> bool {
        !self.cost_calculated && self.model.is_some()
    }

    pub fn validate(&self) -> Result<()> {
        validate_id(&self.id, MAX_OBSERVATION_ID_LEN, "observation id")?;
        validate_id(&self.trace_id, MAX_TRACE_ID_LEN, "trace id")?;
        if let Some(end) = self.end_time {
            if end < self.start_time {
                return Err(AgentTraceError::validation(
                    "observation end_time precedes start_time",
                ));
            }
        }
        Ok(())
    }

    pub fn latency_ms(&self) -> Option<i64> {
        self.end_time
            .map(|end| (end - self.start_time).num_milliseconds())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_generation_lengths() {
        assert_eq!(new_trace_id().len(), 32);
        assert_eq!(new_observation_id().len(), 16);
    }

    #[test]
    fn test_validate_id() {
        assert!(validate_id("trace-1_ok", 32, "trace id").is_ok());
        assert!(validate_id("", 32, "trace id").is_err());
        assert!(validate_id(&"x".repeat(33), 32, "trace id").is_err());
        assert!(validate_id("bad id!", 32, "trace id").is_err());
    }

    #[test]
    fn test_trace_end_before_start_rejected() {
        let start = Utc::now();
        let mut trace = Trace::new("t1".into(), "p1".into(), start);
        assert!(trace.validate().is_ok());
        assert!(!trace.is_complete());

        trace.end_time = Some(start - chrono::Duration::seconds(1));
        assert!(trace.validate().is_err());
    }

    #[test]
    fn test_observation_billable_tokens() {
        let mut obs = Observation::new(
            "obs1".into(),
            "t1".into(),
            "p1".into(),
            ObservationType::Generation,
            Utc::now(),
        );
        assert!(!obs.has_billable_tokens());

        obs.input_tokens = 1000;
        obs.model = Some("gpt-4o".into());
        assert!(obs.has_billable_tokens());
        assert!(obs.needs_cost_calculation());

        obs.cost_calculated = true;
        assert!(!obs.needs_cost_calculation());
    }

    #[test]
    fn test_observation_latency() {
        let start = Utc::now();
        let mut obs = Observation::new(
            "obs1".into(),
            "t1".into(),
            "p1".into(),
            ObservationType::Span,
            start,
        );
        assert_eq!(obs.latency_ms(), None);

        obs.end_time = Some(start + chrono::Duration::milliseconds(250));
        assert_eq!(obs.latency_ms(), Some(250));
    }

    #[test]
    fn test_level_round_trip() {
        for level in ["debug", "default", "warning", "error"] {
            assert_eq!(TraceLevel::parse(level).as_str(), level);
        }
    }
}
