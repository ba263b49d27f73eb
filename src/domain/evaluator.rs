use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::{AgentTraceError, Result};
use super::score::ScoreDataType;
use super::trace::Trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvaluatorType {
    Llm,
    Rule,
    Custom,
}

impl EvaluatorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvaluatorType::Llm => "llm",
            EvaluatorType::Rule => "rule",
            EvaluatorType::Custom => "custom",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "llm" => Ok(EvaluatorType::Llm),
            "rule" => Ok(EvaluatorType::Rule),
            "custom" => Ok(EvaluatorType::Custom),
            other => Err(AgentTraceError::validation(format!(
                "unknown evaluator type: {other}"
            ))),
        }
    }
}

/// Predicate restricting which traces an evaluator applies to.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetFilter {
    /// Glob over the trace name (`*` wildcard), e.g. `chat-*`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name_glob: Option<String>,

    /// Tags that must all be present on the trace.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required_tags: Vec<String>,

    /// Metadata keys that must equal the given values.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata_equals: serde_json::Map<String, serde_json::Value>,
}

fn glob_matches(pattern: &str, value: &str) -> bool {
    // Segment-wise matching on `*`; no character classes.
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == value;
    }
    let mut rest = value;
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        if i == 0 {
            match rest.strip_prefix(part) {
                Some(r) => rest = r,
                None => return false,
            }
        } else if i == parts.len() - 1 {
            return rest.ends_with(part);
        } else {
            match rest.find(part) {
                Some(idx) => rest = &rest[idx + part.len()..],
                None => return false,
            }
        }
    }
    true
}

impl TargetFilter {
    pub fn matches(&self, trace: &Trace) -> bool {
        if let Some(glob) = &self.name_glob {
            let name = trace.name.as_deref().unwrap_or("");
            if !glob_matches(glob, name) {
                return false;
            }
        }
        for tag in &self.required_tags {
            if !trace.tags.contains(tag) {
                return false;
            }
        }
        if !self.metadata_equals.is_empty() {
            let meta = match trace.metadata.as_object() {
                Some(m) => m,
                None => return false,
            };
            for (key, expected) in &self.metadata_equals {
                if meta.get(key) != Some(expected) {
                    return false;
                }
            }
        }
        true
    }
}

/// Rule predicate evaluated against a trace without calling an LLM.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum RuleSpec {
    /// Output contains the given substring.
    OutputContains { needle: String },
    /// Trace completed below the given latency.
    LatencyBelowMs { threshold: i64 },
    /// Trace level is not `error`.
    NoError,
}

/// Configured scoring function applied by the backend on trace completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Evaluator {
    pub id: Uuid,
    pub project_id: String,
    pub evaluator_type: EvaluatorType,

    /// LLM-as-judge prompt; `{{var}}` and `{var}` placeholders are filled
    /// from trace fields.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_template: Option<String>,

    #[serde(default)]
    pub variables: Vec<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule: Option<RuleSpec>,

    #[serde(default)]
    pub target_filter: TargetFilter,

    /// Fraction of matching traces to evaluate, in [0, 1].
    pub sampling_rate: f64,

    pub score_name: String,
    pub score_data_type: ScoreDataType,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Evaluator {
    pub fn llm(
        project_id: String,
        prompt_template: String,
        score_name: String,
        score_data_type: ScoreDataType,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            project_id,
            evaluator_type: EvaluatorType::Llm,
            prompt_template: Some(prompt_template),
            variables: Vec::new(),
            rule: None,
            target_filter: TargetFilter::default(),
            sampling_rate: 1.0,
            score_name,
            score_data_type,
            enabled: true,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn rule(project_id: String, rule: RuleSpec, score_name: String) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            project_id,
            evaluator_type: EvaluatorType::Rule,
            prompt_template: None,
            variables: Vec::new(),
            rule: Some(rule),
            target_filter: TargetFilter::default(),
            sampling_rate: 1.0,
            score_name,
            score_data_type: ScoreDataType::Boolean,
            enabled: true,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_sampling_rate(mut self, rate: f64) -> Self {
        self.sampling_rate = rate.clamp(0.0, 1.0);
        self
    }

    pub fn with_filter(mut self, filter: TargetFilter) -> Self {
        self.target_filter = filter;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.sampling_rate) {
            return Err(AgentTraceError::validation(
                "sampling_rate must be within [0, 1]",
            ));
        }
        match self.evaluator_type {
            EvaluatorType::Llm if self.prompt_template.is_none() => Err(
                AgentTraceError::validation("llm evaluator requires a prompt template"),
            ),
            EvaluatorType::Rule if self.rule.is_none() => Err(AgentTraceError::validation(
                "rule evaluator requires a rule spec",
            )),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::trace::Trace;

    fn trace_named(name: &str) -> Trace {
        let mut t = Trace::new("t1".into(), "p1".into(), Utc::now());
        t.name = Some(name.to_string());
        t
    }

    #[test]
    fn test_glob_matching() {
        assert!(glob_matches("chat-*", "chat-completion"));
        assert!(glob_matches("*", "anything"));
        assert!(glob_matches("exact", "exact"));
        assert!(glob_matches("*-v2", "agent-run-v2"));
        assert!(glob_matches("a*b*c", "a-x-b-y-c"));
        assert!(!glob_matches("chat-*", "agent-run"));
        assert!(!glob_matches("exact", "exactly"));
    }

    #[test]
    fn test_target_filter_name() {
        let filter = TargetFilter {
            name_glob: Some("chat-*".into()),
            ..Default::default()
        };
        assert!(filter.matches(&trace_named("chat-session")));
        assert!(!filter.matches(&trace_named("batch-job")));
    }

    #[test]
    fn test_target_filter_metadata() {
        let mut filter = TargetFilter::default();
        filter
            .metadata_equals
            .insert("env".into(), serde_json::json!("prod"));

        let mut t = trace_named("run");
        assert!(!filter.matches(&t));

        t.metadata = serde_json::json!({"env": "prod"});
        assert!(filter.matches(&t));

        t.metadata = serde_json::json!({"env": "dev"});
        assert!(!filter.matches(&t));
    }

    #[test]
    fn test_target_filter_tags() {
        let filter = TargetFilter {
            required_tags: vec!["production".into()],
            ..Default::default()
        };
        let mut t = trace_named("run");
        assert!(!filter.matches(&t));
        t.tags.push("production".into());
        assert!(filter.matches(&t));
    }

    #[test]
    fn test_evaluator_validation() {
        let eval = Evaluator::llm(
            "p1".into(),
            "Rate: {{output}}".into(),
            "quality".into(),
            ScoreDataType::Numeric,
        );
        assert!(eval.validate().is_ok());

        let mut broken = eval.clone();
        broken.prompt_template = None;
        assert!(broken.validate().is_err());
    }

    #[test]
    fn test_sampling_rate_clamped() {
        let eval = Evaluator::rule(
            "p1".into(),
            RuleSpec::NoError,
            "ok".into(),
        )
        .with_sampling_rate(1.5);
        assert_eq!(eval.sampling_rate, 1.0);
    }
}
