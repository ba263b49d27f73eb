// Retention sweep: expired partitions disappear, config rows survive.

mod common;

use std::sync::Arc;

use axum::http::StatusCode;
use chrono::Utc;
use common::spawn_app;

use agenttrace::retention::RetentionSweepHandler;
use agenttrace::worker::{TaskContext, TaskHandler};

#[tokio::test]
async fn test_sweep_removes_expired_trace_and_scores() {
    let app = spawn_app().await;

    // project keeps one week of telemetry
    let project = {
        let project =
            agenttrace::domain::Project::new(app.project.org_id, "short-lived", "Short Lived")
                .with_retention_days(7);
        app.state.config_store.create_project(&project).await.unwrap();
        project
    };
    let generated =
        agenttrace::domain::ApiKey::generate(project.id.clone(), vec!["ingest".into()]);
    app.state
        .config_store
        .create_api_key(&generated.key)
        .await
        .unwrap();

    // a trace dated 30 days ago, with an attached score in the same
    // partition
    let old_start = (Utc::now() - chrono::Duration::days(30)).to_rfc3339();
    use base64::{engine::general_purpose::STANDARD, Engine};
    let auth = format!(
        "Basic {}",
        STANDARD.encode(format!("{}:{}", generated.key.public_key, generated.secret_key))
    );
    use tower::ServiceExt;
    let batch = serde_json::json!([
        {
            "event_id": "e1",
            "type": "trace-create",
            "body": { "id": "ancient", "name": "old-run", "startTime": old_start }
        },
        {
            "event_id": "e2",
            "type": "score-create",
            "body": {
                "id": "ancient-score",
                "traceId": "ancient",
                "name": "quality",
                "value": 1.0,
                "timestamp": old_start
            }
        },
    ]);
    let response = app
        .router
        .clone()
        .oneshot(
            axum::http::Request::builder()
                .method("POST")
                .uri("/ingest/events")
                .header("authorization", &auth)
                .header("content-type", "application/json")
                .body(axum::body::Body::from(serde_json::to_vec(&batch).unwrap()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    app.drain().await;

    assert!(app
        .state
        .telemetry
        .get_trace(&project.id, "ancient")
        .await
        .unwrap()
        .is_some());

    // the score landed in the trace's partition, not today's
    let handler = RetentionSweepHandler::new(
        app.state.config_store.clone(),
        app.state.telemetry.clone(),
        Arc::clone(&app.state.queue),
        0,
    );
    let job = agenttrace::Job {
        id: "sweep".into(),
        kind: agenttrace::JobKind::RetentionSweep,
        queue: agenttrace::QueueClass::Low,
        payload: serde_json::json!({}),
        status: agenttrace::queue::JobStatus::Active,
        attempts: 1,
        max_retry: 3,
        timeout_secs: 600,
        backoff_base_ms: 2000,
        unique_key: None,
        scheduled_at: Utc::now(),
        visible_at: Utc::now(),
        last_error: None,
        created_at: Utc::now(),
    };
    let (tx, rx) = tokio::sync::watch::channel(false);
    handler.run(&job, &TaskContext::new(rx)).await.unwrap();
    drop(tx);

    assert!(app
        .state
        .telemetry
        .get_trace(&project.id, "ancient")
        .await
        .unwrap()
        .is_none());
    assert!(app
        .state
        .telemetry
        .scores_for_trace(&project.id, "ancient")
        .await
        .unwrap()
        .is_empty());

    // config store rows for the project are untouched
    let loaded = app
        .state
        .config_store
        .get_project(&project.id)
        .await
        .unwrap();
    assert!(loaded.is_some());
    assert!(app
        .state
        .config_store
        .find_api_key_by_public_key(&generated.key.public_key)
        .await
        .unwrap()
        .is_some());

    app.shutdown().await;
}
