// Evaluation execution: render the judge prompt, call the adapter (or run
// the declared rule) and persist the resulting score.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::domain::{
    Evaluator, EvaluatorType, RuleSpec, Score, ScoreDataType, ScoreSource, ScoreValue, Trace,
};
use crate::queue::Job;
use crate::storage::{ConfigStore, TelemetryStore};
use crate::worker::{TaskContext, TaskError, TaskHandler, TaskResult};

use super::llm::LlmClient;
use super::scheduler::EvaluationRunPayload;

/// Substitute `{{name}}` and `{name}` placeholders from trace fields.
pub fn render_template(template: &str, vars: &HashMap<String, String>) -> String {
    let mut rendered = template.to_string();
    for (key, value) in vars {
        rendered = rendered.replace(&format!("{{{{{key}}}}}"), value);
        rendered = rendered.replace(&format!("{{{key}}}"), value);
    }
    rendered
}

fn stringify(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Variables exposed to judge prompts.
pub fn template_vars(trace: &Trace) -> HashMap<String, String> {
    let mut vars = HashMap::new();
    vars.insert("trace_id".to_string(), trace.id.clone());
    vars.insert(
        "name".to_string(),
        trace.name.clone().unwrap_or_default(),
    );
    vars.insert(
        "input".to_string(),
        trace.input.as_ref().map(stringify).unwrap_or_default(),
    );
    vars.insert(
        "output".to_string(),
        trace.output.as_ref().map(stringify).unwrap_or_default(),
    );
    vars.insert("metadata".to_string(), trace.metadata.to_string());
    if let Some(expected) = trace.metadata.get("expected") {
        vars.insert("expected".to_string(), stringify(expected));
    }
    vars
}

/// Pull the first JSON object out of a model response; judges often wrap
/// the verdict in prose or code fences.
pub fn extract_json(response: &str) -> Option<serde_json::Value> {
    let start = response.find('{')?;
    let end = response.rfind('}')?;
    if end < start {
        return None;
    }
    serde_json::from_str(&response[start..=end]).ok()
}

/// Coerce the judge's `score` field into the evaluator's declared type.
pub fn coerce_score(value: &serde_json::Value, data_type: ScoreDataType) -> Option<ScoreValue> {
    match data_type {
        ScoreDataType::Numeric => match value {
            serde_json::Value::Number(n) => n.as_f64().map(ScoreValue::Numeric),
            serde_json::Value::String(s) => s.trim().parse().ok().map(ScoreValue::Numeric),
            serde_json::Value::Bool(b) => {
                Some(ScoreValue::Numeric(if *b { 1.0 } else { 0.0 }))
            }
            _ => None,
        },
        ScoreDataType::Boolean => match value {
            serde_json::Value::Bool(b) => Some(ScoreValue::Boolean(*b)),
            serde_json::Value::Number(n) => n.as_f64().map(|v| ScoreValue::Boolean(v >= 0.5)),
            serde_json::Value::String(s) => match s.trim().to_lowercase().as_str() {
                "true" | "yes" | "pass" => Some(ScoreValue::Boolean(true)),
                "false" | "no" | "fail" => Some(ScoreValue::Boolean(false)),
                _ => None,
            },
            _ => None,
        },
        ScoreDataType::Categorical => match value {
            serde_json::Value::String(s) => Some(ScoreValue::Categorical(s.clone())),
            other => Some(ScoreValue::Categorical(other.to_string())),
        },
    }
}

/// Evaluate a declared rule against the trace.
pub fn run_rule(rule: &RuleSpec, trace: &Trace) -> bool {
    match rule {
        RuleSpec::OutputContains { needle } => trace
            .output
            .as_ref()
            .map(|output| stringify(output).contains(needle))
            .unwrap_or(false),
        RuleSpec::LatencyBelowMs { threshold } => match (trace.start_time, trace.end_time) {
            (start, Some(end)) => (end - start).num_milliseconds() < *threshold,
            _ => false,
        },
        RuleSpec::NoError => trace.level != crate::domain::TraceLevel::Error,
    }
}

pub struct EvaluationRunHandler {
    telemetry: TelemetryStore,
    config_store: ConfigStore,
    llm: Arc<dyn LlmClient>,
}

impl EvaluationRunHandler {
    pub fn new(
        telemetry: TelemetryStore,
        config_store: ConfigStore,
        llm: Arc<dyn LlmClient>,
    ) -> Self {
        Self {
            telemetry,
            config_store,
            llm,
        }
    }

    async fn judge(
        &self,
        evaluator: &Evaluator,
        trace: &Trace,
    ) -> std::result::Result<(ScoreValue, Option<String>), TaskError> {
        let template = evaluator.prompt_template.as_deref().ok_or_else(|| {
            TaskError::Permanent(format!("evaluator {} has no prompt template", evaluator.id))
        })?;
        let prompt = render_template(template, &template_vars(trace));

        let response = self.llm.complete(&prompt).await.map_err(TaskError::from)?;

        let parsed = extract_json(&response).ok_or_else(|| {
            // malformed judge output is worth a few more attempts
            TaskError::Retryable("LLM response contained no JSON object".to_string())
        })?;
        let raw_score = parsed
            .get("score")
            .ok_or_else(|| TaskError::Retryable("LLM response missing score field".to_string()))?;
        let value = coerce_score(raw_score, evaluator.score_data_type).ok_or_else(|| {
            TaskError::Retryable(format!(
                "LLM score not coercible to {}",
                evaluator.score_data_type.as_str()
            ))
        })?;
        let comment = parsed
            .get("reasoning")
            .and_then(|r| r.as_str())
            .map(|r| r.to_string());
        Ok((value, comment))
    }
}

#[async_trait]
impl TaskHandler for EvaluationRunHandler {
    async fn run(&self, job: &Job, _ctx: &TaskContext) -> TaskResult {
        let payload: EvaluationRunPayload = serde_json::from_value(job.payload.clone())
            .map_err(|e| TaskError::Permanent(format!("corrupt evaluation payload: {e}")))?;

        let evaluator = self
            .config_store
            .get_evaluator(payload.evaluator_id)
            .await
            .map_err(TaskError::from)?
            .ok_or_else(|| {
                TaskError::Permanent(format!("evaluator {} not found", payload.evaluator_id))
            })?;
        if !evaluator.enabled {
            debug!(evaluator_id = %evaluator.id, "Evaluator disabled after scheduling; skipping");
            return Ok(());
        }

        let trace = self
            .telemetry
            .get_trace(&payload.project_id, &payload.trace_id)
            .await
            .map_err(TaskError::from)?
            .ok_or_else(|| {
                TaskError::Retryable(format!("trace {} not yet visible", payload.trace_id))
            })?;

        let (value, comment) = match evaluator.evaluator_type {
            EvaluatorType::Llm => self.judge(&evaluator, &trace).await?,
            EvaluatorType::Rule => {
                let rule = evaluator.rule.as_ref().ok_or_else(|| {
                    TaskError::Permanent(format!("evaluator {} has no rule", evaluator.id))
                })?;
                (ScoreValue::Boolean(run_rule(rule, &trace)), None)
            }
            EvaluatorType::Custom => {
                return Err(TaskError::Permanent(
                    "custom evaluators are executed by external runners".to_string(),
                ))
            }
        };

        // deterministic id: a re-executed evaluation overwrites its own
        // score instead of appending a duplicate
        let score_id = format!("eval:{}:{}", evaluator.id, trace.id);
        let mut score = Score::new(
            score_id,
            trace.id.clone(),
            payload.project_id.clone(),
            evaluator.score_name.clone(),
            value,
            ScoreSource::Eval,
        )
        .with_evaluator(evaluator.id.to_string());
        score.comment = comment;
        score.created_at = Utc::now();
        score.validate().map_err(TaskError::from)?;

        self.telemetry
            .insert_score(&score)
            .await
            .map_err(TaskError::from)?;

        metrics::counter!("agenttrace_evaluations_total", 1, "type" => evaluator.evaluator_type.as_str());
        info!(
            evaluator_id = %evaluator.id,
            trace_id = %trace.id,
            score_name = %evaluator.score_name,
            "Evaluation score emitted"
        );
        Ok(())
    }
}
