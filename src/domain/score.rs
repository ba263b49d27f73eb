use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::{AgentTraceError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScoreDataType {
    Numeric,
    Boolean,
    Categorical,
}

impl ScoreDataType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScoreDataType::Numeric => "numeric",
            ScoreDataType::Boolean => "boolean",
            ScoreDataType::Categorical => "categorical",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "numeric" => Ok(ScoreDataType::Numeric),
            "boolean" => Ok(ScoreDataType::Boolean),
            "categorical" => Ok(ScoreDataType::Categorical),
            other => Err(AgentTraceError::validation(format!(
                "unknown score data type: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScoreSource {
    Api,
    Eval,
    Annotation,
}

impl ScoreSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScoreSource::Api => "api",
            ScoreSource::Eval => "eval",
            ScoreSource::Annotation => "annotation",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "api" => Ok(ScoreSource::Api),
            "eval" => Ok(ScoreSource::Eval),
            "annotation" => Ok(ScoreSource::Annotation),
            other => Err(AgentTraceError::validation(format!(
                "unknown score source: {other}"
            ))),
        }
    }
}

/// Scalar score value; the variant must agree with the declared data type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScoreValue {
    Numeric(f64),
    Boolean(bool),
    Categorical(String),
}

impl ScoreValue {
    pub fn data_type(&self) -> ScoreDataType {
        match self {
            ScoreValue::Numeric(_) => ScoreDataType::Numeric,
            ScoreValue::Boolean(_) => ScoreDataType::Boolean,
            ScoreValue::Categorical(_) => ScoreDataType::Categorical,
        }
    }

    /// Numeric projection used by aggregation queries. Booleans map to 0/1;
    /// categorical values have no numeric form.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ScoreValue::Numeric(v) => Some(*v),
            ScoreValue::Boolean(b) => Some(if *b { 1.0 } else { 0.0 }),
            ScoreValue::Categorical(_) => None,
        }
    }
}

/// Evaluation result attached to a trace or observation. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Score {
    pub id: String,
    pub trace_id: String,
    pub project_id: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub observation_id: Option<String>,

    pub name: String,
    pub value: ScoreValue,
    pub data_type: ScoreDataType,
    pub source: ScoreSource,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub evaluator_id: Option<String>,

    pub created_at: DateTime<Utc>,
}

impl Score {
    pub fn new(
        id: String,
        trace_id: String,
        project_id: String,
        name: String,
        value: ScoreValue,
        source: ScoreSource,
    ) -> Self {
        let data_type = value.data_type();
        Self {
            id,
            trace_id,
            project_id,
            observation_id: None,
            name,
            value,
            data_type,
            source,
            comment: None,
            evaluator_id: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_observation(mut self, observation_id: String) -> Self {
        self.observation_id = Some(observation_id);
        self
    }

    pub fn with_comment(mut self, comment: String) -> Self {
        self.comment = Some(comment);
        self
    }

    pub fn with_evaluator(mut self, evaluator_id: String) -> Self {
        self.evaluator_id = Some(evaluator_id);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(AgentTraceError::validation("score name must not be empty"));
        }
        if self.value.data_type() != self.data_type {
            return Err(AgentTraceError::validation(format!(
                "score value does not match declared data type {}",
                self.data_type.as_str()
            )));
        }
        if let ScoreValue::Numeric(v) = &self.value {
            if !v.is_finite() {
                return Err(AgentTraceError::validation("numeric score must be finite"));
            }
        }
        Ok(())
    }
}
