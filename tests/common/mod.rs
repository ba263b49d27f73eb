// Shared test harness: an in-memory application with a running worker pool
// and a seeded project/API key.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::response::Response;
use axum::Router;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tower::ServiceExt;
use uuid::Uuid;

use agenttrace::api::create_router;
use agenttrace::config::AppConfig;
use agenttrace::domain::{ApiKey, Organization, Project};
use agenttrace::queue::JobQueue;
use agenttrace::AppState;

pub struct TestApp {
    pub state: AppState,
    pub router: Router,
    pub project: Project,
    pub public_key: String,
    pub secret_key: String,
    pool_shutdown: watch::Sender<bool>,
    pool_task: JoinHandle<()>,
}

pub fn fast_config() -> AppConfig {
    let mut config = AppConfig::in_memory();
    config.ingest.max_batch_delay_ms = 25;
    config.worker.poll_interval_ms = 10;
    // periodic scans are exercised explicitly in tests
    config.anomaly.scan_interval_secs = 0;
    config
}

pub async fn spawn_app() -> TestApp {
    spawn_app_with(fast_config()).await
}

pub async fn spawn_app_with(config: AppConfig) -> TestApp {
    let app = agenttrace::app::build(config).await.expect("app builds");
    let agenttrace::app::App { state, worker_pool } = app;

    let pool_shutdown = worker_pool.shutdown_handle();
    let pool = Arc::new(worker_pool);
    let pool_task = tokio::spawn({
        let pool = Arc::clone(&pool);
        async move { pool.run().await }
    });

    let org = Organization {
        id: Uuid::new_v4(),
        name: "test-org".into(),
        created_at: Utc::now(),
    };
    state.config_store.create_organization(&org).await.unwrap();
    let project = Project::new(org.id, "test-project", "Test Project");
    state.config_store.create_project(&project).await.unwrap();

    let generated = ApiKey::generate(project.id.clone(), vec!["ingest".into(), "read".into()]);
    state.config_store.create_api_key(&generated.key).await.unwrap();

    let router = create_router(state.clone());

    TestApp {
        state,
        router,
        project,
        public_key: generated.key.public_key.clone(),
        secret_key: generated.secret_key,
        pool_shutdown,
        pool_task,
    }
}

impl TestApp {
    pub fn basic_auth(&self) -> String {
        format!(
            "Basic {}",
            STANDARD.encode(format!("{}:{}", self.public_key, self.secret_key))
        )
    }

    pub async fn request(
        &self,
        method: &str,
        uri: &str,
        body: Option<serde_json::Value>,
    ) -> Response {
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::AUTHORIZATION, self.basic_auth());
        let body = match body {
            Some(json) => {
                builder = builder.header(header::CONTENT_TYPE, "application/json");
                Body::from(serde_json::to_vec(&json).unwrap())
            }
            None => Body::empty(),
        };
        self.router
            .clone()
            .oneshot(builder.body(body).unwrap())
            .await
            .unwrap()
    }

    pub async fn post_json(&self, uri: &str, body: serde_json::Value) -> (StatusCode, serde_json::Value) {
        let response = self.request("POST", uri, Some(body)).await;
        let status = response.status();
        (status, read_json(response).await)
    }

    pub async fn get_json(&self, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = self.request("GET", uri, None).await;
        let status = response.status();
        (status, read_json(response).await)
    }

    /// Wait until the batcher and the queue have no more work due now.
    pub async fn drain(&self) {
        // ingest defers enrichment jobs past the batcher flush window
        tokio::time::sleep(Duration::from_millis(200)).await;
        let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
        let mut settled = 0;
        loop {
            let buffered = self.state.batcher.buffered_rows();
            let due = self.state.queue.due_count().await.unwrap_or(1);
            if buffered == 0 && due == 0 {
                settled += 1;
                if settled >= 3 {
                    return;
                }
            } else {
                settled = 0;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "drain timed out: buffered={buffered} due={due}"
            );
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    pub async fn shutdown(self) {
        self.state.batcher.shutdown().await;
        let _ = self.pool_shutdown.send(true);
        let _ = self.pool_task.await;
    }
}

pub async fn read_json(response: Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), 10 * 1024 * 1024)
        .await
        .unwrap();
    if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    }
}
