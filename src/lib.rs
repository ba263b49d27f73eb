//! AgentTrace - observability backend for AI coding agents and LLM
//! applications.
//!
//! Ingests trace/observation/score events from distributed SDKs, persists
//! them across a relational config store and an append-oriented telemetry
//! store, and enriches them asynchronously: model-cost attribution,
//! LLM/rule evaluation, anomaly detection and webhook fan-out.

pub mod anomaly;
pub mod api;
pub mod app;
pub mod config;
pub mod cost;
pub mod domain;
pub mod evals;
pub mod ingest;
pub mod observability;
pub mod queue;
pub mod retention;
pub mod storage;
pub mod webhook;
pub mod worker;

// Re-export commonly used types
pub use domain::{
    AgentTraceError, Alert, AlertStatus, AnomalyRule, ApiKey, DetectionMethod, Evaluator,
    MetricKind, ModelPrice, Observation, ObservationType, Project, Result, Score, ScoreDataType,
    ScoreSource, ScoreValue, Trace, TraceLevel,
};

pub use api::{ApiServer, AppState};
pub use app::{build, App};
pub use config::AppConfig;
pub use cost::{CostCalculateHandler, CostRecomputeHandler, PriceResolver};
pub use ingest::{IngestBatcher, IngestEnvelope, IngestResponse, ProjectRateLimiter};
pub use queue::{EnqueueOptions, Job, JobKind, JobQueue, QueueClass, SqlJobQueue};
pub use storage::{ConfigStore, TelemetryStore, TelemetryWrite, TraceFilter};
pub use worker::{HandlerOptions, TaskContext, TaskError, TaskHandler, WorkerPool};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
