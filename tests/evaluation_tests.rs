// Evaluation scheduling and execution: deterministic sampling, idempotent
// re-runs, rule and LLM evaluators.

mod common;

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use axum::http::StatusCode;
use common::spawn_app;

use agenttrace::domain::{Evaluator, RuleSpec, ScoreSource};
use agenttrace::evals::{should_sample, EvaluationRunHandler, LlmClient};
use agenttrace::worker::TaskContext;

fn completed_trace_events(trace_id: &str) -> serde_json::Value {
    serde_json::json!([
        {
            "event_id": format!("create-{trace_id}"),
            "type": "trace-create",
            "body": { "id": trace_id, "name": "chat-run", "output": "all done" }
        },
        {
            "event_id": format!("complete-{trace_id}"),
            "type": "trace-update",
            "body": { "id": trace_id, "completed": true }
        },
    ])
}

async fn eval_scored_traces(app: &common::TestApp, trace_ids: &[String]) -> BTreeSet<String> {
    let mut scored = BTreeSet::new();
    for trace_id in trace_ids {
        let scores = app
            .state
            .telemetry
            .scores_for_trace(&app.project.id, trace_id)
            .await
            .unwrap();
        if scores.iter().any(|s| s.source == ScoreSource::Eval) {
            scored.insert(trace_id.clone());
        }
    }
    scored
}

#[tokio::test]
async fn test_sampled_scheduling_is_deterministic() {
    let app = spawn_app().await;

    let evaluator = Evaluator::rule(
        app.project.id.clone(),
        RuleSpec::OutputContains { needle: "done".into() },
        "completed-cleanly".into(),
    )
    .with_sampling_rate(0.5);
    app.state.config_store.create_evaluator(&evaluator).await.unwrap();

    let trace_ids: Vec<String> = (1..=10).map(|i| format!("t{i}")).collect();
    for trace_id in &trace_ids {
        let (status, _) = app
            .post_json("/ingest/events", completed_trace_events(trace_id))
            .await;
        assert_eq!(status, StatusCode::OK);
    }
    app.drain().await;

    let scored = eval_scored_traces(&app, &trace_ids).await;

    // the subset matches the deterministic hash decision exactly
    let expected: BTreeSet<String> = trace_ids
        .iter()
        .filter(|id| should_sample(evaluator.id, id, 0.5))
        .cloned()
        .collect();
    assert_eq!(scored, expected);

    // re-submitting a completion changes nothing: same decision, no
    // duplicate score
    let resubmit = trace_ids[0].clone();
    let (status, _) = app
        .post_json("/ingest/events", completed_trace_events(&resubmit))
        .await;
    assert_eq!(status, StatusCode::OK);
    app.drain().await;

    let rescored = eval_scored_traces(&app, &trace_ids).await;
    assert_eq!(rescored, scored);
    let scores = app
        .state
        .telemetry
        .scores_for_trace(&app.project.id, &resubmit)
        .await
        .unwrap();
    assert!(scores.iter().filter(|s| s.source == ScoreSource::Eval).count() <= 1);

    app.shutdown().await;
}

#[tokio::test]
async fn test_zero_rate_never_schedules_full_rate_always() {
    let app = spawn_app().await;

    let never = Evaluator::rule(
        app.project.id.clone(),
        RuleSpec::NoError,
        "never-scored".into(),
    )
    .with_sampling_rate(0.0);
    let always = Evaluator::rule(
        app.project.id.clone(),
        RuleSpec::NoError,
        "always-scored".into(),
    )
    .with_sampling_rate(1.0);
    app.state.config_store.create_evaluator(&never).await.unwrap();
    app.state.config_store.create_evaluator(&always).await.unwrap();

    let trace_ids: Vec<String> = (1..=5).map(|i| format!("s{i}")).collect();
    for trace_id in &trace_ids {
        app.post_json("/ingest/events", completed_trace_events(trace_id))
            .await;
    }
    app.drain().await;

    for trace_id in &trace_ids {
        let scores = app
            .state
            .telemetry
            .scores_for_trace(&app.project.id, trace_id)
            .await
            .unwrap();
        let names: Vec<&str> = scores.iter().map(|s| s.name.as_str()).collect();
        assert!(names.contains(&"always-scored"), "missing score on {trace_id}");
        assert!(!names.contains(&"never-scored"));
    }

    app.shutdown().await;
}

#[tokio::test]
async fn test_target_filter_restricts_scheduling() {
    let app = spawn_app().await;

    let mut evaluator = Evaluator::rule(
        app.project.id.clone(),
        RuleSpec::NoError,
        "batch-only".into(),
    );
    evaluator.target_filter.name_glob = Some("batch-*".into());
    app.state.config_store.create_evaluator(&evaluator).await.unwrap();

    // name "chat-run" does not match "batch-*"
    app.post_json("/ingest/events", completed_trace_events("t-filtered"))
        .await;
    app.drain().await;

    let scores = app
        .state
        .telemetry
        .scores_for_trace(&app.project.id, "t-filtered")
        .await
        .unwrap();
    assert!(scores.is_empty());

    app.shutdown().await;
}

struct CannedJudge {
    response: String,
}

#[async_trait]
impl LlmClient for CannedJudge {
    async fn complete(&self, _prompt: &str) -> agenttrace::Result<String> {
        Ok(self.response.clone())
    }
}

#[tokio::test]
async fn test_llm_evaluator_emits_numeric_score() {
    let app = spawn_app().await;

    let evaluator = Evaluator::llm(
        app.project.id.clone(),
        "Rate this response from 0 to 1: {{output}}".into(),
        "quality".into(),
        agenttrace::ScoreDataType::Numeric,
    );
    app.state.config_store.create_evaluator(&evaluator).await.unwrap();

    app.post_json("/ingest/events", completed_trace_events("llm-t1"))
        .await;
    app.drain().await;

    // run the evaluation directly with a canned judge
    let handler = EvaluationRunHandler::new(
        app.state.telemetry.clone(),
        app.state.config_store.clone(),
        Arc::new(CannedJudge {
            response: "Verdict: {\"score\": 0.85, \"reasoning\": \"clear and complete\"}".into(),
        }),
    );
    let job = agenttrace::Job {
        id: "eval-job".into(),
        kind: agenttrace::JobKind::EvaluationRun,
        queue: agenttrace::QueueClass::Default,
        payload: serde_json::json!({
            "project_id": app.project.id,
            "trace_id": "llm-t1",
            "evaluator_id": evaluator.id,
        }),
        status: agenttrace::queue::JobStatus::Active,
        attempts: 1,
        max_retry: 3,
        timeout_secs: 600,
        backoff_base_ms: 2000,
        unique_key: None,
        scheduled_at: chrono::Utc::now(),
        visible_at: chrono::Utc::now(),
        last_error: None,
        created_at: chrono::Utc::now(),
    };
    let (tx, rx) = tokio::sync::watch::channel(false);
    agenttrace::TaskHandler::run(&handler, &job, &TaskContext::new(rx))
        .await
        .unwrap();
    drop(tx);

    let scores = app
        .state
        .telemetry
        .scores_for_trace(&app.project.id, "llm-t1")
        .await
        .unwrap();
    let quality = scores.iter().find(|s| s.name == "quality").unwrap();
    assert_eq!(quality.source, ScoreSource::Eval);
    assert_eq!(quality.value, agenttrace::ScoreValue::Numeric(0.85));
    assert_eq!(quality.comment.as_deref(), Some("clear and complete"));
    assert_eq!(quality.evaluator_id.as_deref(), Some(evaluator.id.to_string().as_str()));

    // re-running overwrites rather than duplicating
    let (tx2, rx2) = tokio::sync::watch::channel(false);
    agenttrace::TaskHandler::run(&handler, &job, &TaskContext::new(rx2))
        .await
        .unwrap();
    drop(tx2);
    let scores = app
        .state
        .telemetry
        .scores_for_trace(&app.project.id, "llm-t1")
        .await
        .unwrap();
    assert_eq!(scores.iter().filter(|s| s.name == "quality").count(), 1);

    app.shutdown().await;
}
