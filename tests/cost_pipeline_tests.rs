// End-to-end cost attribution: ingest-then-cost, unknown models, zero-token
// boundaries and retroactive recomputation.

mod common;

use axum::http::StatusCode;
use common::spawn_app;
use rust_decimal_macros::dec;

use agenttrace::domain::ModelPrice;
use agenttrace::queue::{EnqueueOptions, JobKind, JobQueue, QueueClass};

async fn seed_gpt4o_price(app: &common::TestApp) {
    let price = ModelPrice::new("openai", "gpt-4o", dec!(2.50), dec!(10.00))
        .with_effective_date("2024-01-01T00:00:00Z".parse().unwrap());
    app.state.config_store.insert_price(&price).await.unwrap();
}

fn observation_event(event_id: &str, obs_id: &str, model: &str) -> serde_json::Value {
    serde_json::json!({
        "event_id": event_id,
        "type": "observation-create",
        "body": {
            "id": obs_id,
            "traceId": "trace-1",
            "type": "generation",
            "model": model,
            "provider": "openai",
            "inputTokens": 1000,
            "outputTokens": 500,
            "startTime": "2024-03-01T00:00:00Z"
        }
    })
}

#[tokio::test]
async fn test_ingest_then_cost() {
    let app = spawn_app().await;
    seed_gpt4o_price(&app).await;

    let (status, body) = app
        .post_json(
            "/ingest/events",
            serde_json::json!([observation_event("e1", "obs-1", "gpt-4o")]),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["results"][0]["ok"], true);

    app.drain().await;

    let obs = app
        .state
        .telemetry
        .get_observation(&app.project.id, "obs-1")
        .await
        .unwrap()
        .unwrap();
    assert!(obs.cost_calculated);
    // 1000/1e6 * 2.50 + 500/1e6 * 10.00
    assert_eq!(obs.cost, Some(dec!(0.0075)));

    app.shutdown().await;
}

#[tokio::test]
async fn test_unknown_model_dead_letters_without_retry_storm() {
    let app = spawn_app().await;

    let (status, body) = app
        .post_json(
            "/ingest/events",
            serde_json::json!([observation_event("e1", "obs-1", "mystery-7b")]),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["results"][0]["ok"], true);

    app.drain().await;

    let obs = app
        .state
        .telemetry
        .get_observation(&app.project.id, "obs-1")
        .await
        .unwrap()
        .unwrap();
    assert!(!obs.cost_calculated);
    assert!(obs.cost.is_none());

    // permanent failure: exactly one attempt, parked for inspection
    let dead = app.state.queue.dead_letters().await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].kind, JobKind::CostCalculate);
    assert_eq!(dead[0].attempts, 1);
    assert!(dead[0]
        .last_error
        .as_deref()
        .unwrap_or_default()
        .contains("mystery-7b"));

    app.shutdown().await;
}

#[tokio::test]
async fn test_zero_token_observation_costs_zero_via_recompute() {
    let app = spawn_app().await;

    let event = serde_json::json!({
        "event_id": "e1",
        "type": "observation-create",
        "body": {
            "id": "obs-zero",
            "traceId": "trace-1",
            "type": "generation",
            "model": "mystery-7b",
            "provider": "openai",
            "startTime": "2024-03-01T00:00:00Z"
        }
    });
    let (status, _) = app.post_json("/ingest/events", serde_json::json!([event])).await;
    assert_eq!(status, StatusCode::OK);
    app.drain().await;

    // no billable tokens means ingest itself schedules nothing
    assert!(app.state.queue.dead_letters().await.unwrap().is_empty());

    app.state
        .queue
        .enqueue(
            JobKind::CostRecompute,
            serde_json::json!({
                "project_id": app.project.id,
                "since": "2024-01-01T00:00:00Z",
            }),
            EnqueueOptions::default().queue(QueueClass::Low),
        )
        .await
        .unwrap();
    app.drain().await;

    let obs = app
        .state
        .telemetry
        .get_observation(&app.project.id, "obs-zero")
        .await
        .unwrap()
        .unwrap();
    assert!(obs.cost_calculated);
    assert_eq!(obs.cost, Some(dec!(0)));
    // the unknown model was never consulted for a zero-token observation
    assert!(app.state.queue.dead_letters().await.unwrap().is_empty());

    app.shutdown().await;
}

#[tokio::test]
async fn test_recompute_after_price_fix() {
    let app = spawn_app().await;

    // ingest with no price row: dead-letters
    let (status, _) = app
        .post_json(
            "/ingest/events",
            serde_json::json!([observation_event("e1", "obs-1", "gpt-4o")]),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    app.drain().await;
    assert_eq!(app.state.queue.dead_letters().await.unwrap().len(), 1);

    // operator adds the price, then triggers recomputation
    seed_gpt4o_price(&app).await;
    app.state
        .queue
        .enqueue(
            JobKind::CostRecompute,
            serde_json::json!({
                "project_id": app.project.id,
                "since": "2024-01-01T00:00:00Z",
            }),
            EnqueueOptions::default().queue(QueueClass::Low),
        )
        .await
        .unwrap();
    app.drain().await;

    let obs = app
        .state
        .telemetry
        .get_observation(&app.project.id, "obs-1")
        .await
        .unwrap()
        .unwrap();
    assert!(obs.cost_calculated);
    assert_eq!(obs.cost, Some(dec!(0.0075)));

    app.shutdown().await;
}

#[tokio::test]
async fn test_cost_job_redelivery_is_idempotent() {
    let app = spawn_app().await;
    seed_gpt4o_price(&app).await;

    let (status, _) = app
        .post_json(
            "/ingest/events",
            serde_json::json!([observation_event("e1", "obs-1", "gpt-4o")]),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    app.drain().await;

    let first = app
        .state
        .telemetry
        .get_observation(&app.project.id, "obs-1")
        .await
        .unwrap()
        .unwrap();

    // re-deliver the same work item manually
    let job_id = app
        .state
        .queue
        .enqueue(
            JobKind::CostCalculate,
            serde_json::json!({
                "project_id": app.project.id,
                "observation_id": "obs-1",
            }),
            EnqueueOptions::default(),
        )
        .await
        .unwrap();
    app.drain().await;

    let second = app
        .state
        .telemetry
        .get_observation(&app.project.id, "obs-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.cost, second.cost);
    assert_eq!(first.last_calculated_at, second.last_calculated_at);
    assert!(!job_id.is_empty());

    app.shutdown().await;
}

#[tokio::test]
async fn test_unique_key_returns_same_job_while_pending() {
    let app = spawn_app().await;

    let opts = EnqueueOptions::default()
        .unique_key("cost:p:o")
        .scheduled_at(chrono::Utc::now() + chrono::Duration::hours(1));
    let first = app
        .state
        .queue
        .enqueue(JobKind::CostCalculate, serde_json::json!({}), opts.clone())
        .await
        .unwrap();
    let second = app
        .state
        .queue
        .enqueue(JobKind::CostCalculate, serde_json::json!({}), opts)
        .await
        .unwrap();
    assert_eq!(first, second);

    app.shutdown().await;
}
