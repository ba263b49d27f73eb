use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{AgentTraceError, Result};

/// Background task kinds dispatched through the worker pool. The registry
/// in the pool maps each kind to its handler at process init.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    TelemetryFlush,
    CostCalculate,
    CostRecompute,
    TraceComplete,
    EvaluationRun,
    AnomalyScan,
    WebhookDeliver,
    RetentionSweep,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::TelemetryFlush => "telemetry_flush",
            JobKind::CostCalculate => "cost_calculate",
            JobKind::CostRecompute => "cost_recompute",
            JobKind::TraceComplete => "trace_complete",
            JobKind::EvaluationRun => "evaluation_run",
            JobKind::AnomalyScan => "anomaly_scan",
            JobKind::WebhookDeliver => "webhook_deliver",
            JobKind::RetentionSweep => "retention_sweep",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "telemetry_flush" => Ok(JobKind::TelemetryFlush),
            "cost_calculate" => Ok(JobKind::CostCalculate),
            "cost_recompute" => Ok(JobKind::CostRecompute),
            "trace_complete" => Ok(JobKind::TraceComplete),
            "evaluation_run" => Ok(JobKind::EvaluationRun),
            "anomaly_scan" => Ok(JobKind::AnomalyScan),
            "webhook_deliver" => Ok(JobKind::WebhookDeliver),
            "retention_sweep" => Ok(JobKind::RetentionSweep),
            other => Err(AgentTraceError::internal(format!("unknown job kind: {other}"))),
        }
    }

    pub const ALL: [JobKind; 8] = [
        JobKind::TelemetryFlush,
        JobKind::CostCalculate,
        JobKind::CostRecompute,
        JobKind::TraceComplete,
        JobKind::EvaluationRun,
        JobKind::AnomalyScan,
        JobKind::WebhookDeliver,
        JobKind::RetentionSweep,
    ];
}

/// Priority class. Dequeue weights classes 6:3:1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum QueueClass {
    Critical,
    #[default]
    Default,
    Low,
}

impl QueueClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueClass::Critical => "critical",
            QueueClass::Default => "default",
            QueueClass::Low => "low",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "critical" => QueueClass::Critical,
            "low" => QueueClass::Low,
            _ => QueueClass::Default,
        }
    }

    pub fn weight(&self) -> u32 {
        match self {
            QueueClass::Critical => 6,
            QueueClass::Default => 3,
            QueueClass::Low => 1,
        }
    }

    pub const ALL: [QueueClass; 3] = [QueueClass::Critical, QueueClass::Default, QueueClass::Low];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Active,
    Succeeded,
    DeadLetter,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Active => "active",
            JobStatus::Succeeded => "succeeded",
            JobStatus::DeadLetter => "dead_letter",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "active" => JobStatus::Active,
            "succeeded" => JobStatus::Succeeded,
            "dead_letter" => JobStatus::DeadLetter,
            _ => JobStatus::Pending,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::DeadLetter)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub kind: JobKind,
    pub queue: QueueClass,
    pub payload: serde_json::Value,
    pub status: JobStatus,
    pub attempts: u32,
    pub max_retry: u32,
    pub timeout_secs: u64,
    pub backoff_base_ms: u64,
    pub unique_key: Option<String>,
    pub scheduled_at: DateTime<Utc>,
    pub visible_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Job {
    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.timeout_secs)
    }
}

/// Enqueue parameters; defaults match the default queue class.
#[derive(Debug, Clone)]
pub struct EnqueueOptions {
    pub queue: QueueClass,
    pub max_retry: u32,
    pub timeout_secs: u64,
    pub backoff_base_ms: u64,
    pub unique_key: Option<String>,
    pub scheduled_at: Option<DateTime<Utc>>,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            queue: QueueClass::Default,
            max_retry: 3,
            timeout_secs: 300,
            backoff_base_ms: 2000,
            unique_key: None,
            scheduled_at: None,
        }
    }
}

impl EnqueueOptions {
    pub fn queue(mut self, queue: QueueClass) -> Self {
        self.queue = queue;
        self
    }

    pub fn max_retry(mut self, max_retry: u32) -> Self {
        self.max_retry = max_retry;
        self
    }

    pub fn timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn backoff_base_ms(mut self, ms: u64) -> Self {
        self.backoff_base_ms = ms;
        self
    }

    pub fn unique_key(mut self, key: impl Into<String>) -> Self {
        self.unique_key = Some(key.into());
        self
    }

    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }
}

/// Claim handed to a worker; the token fences acks against lease expiry.
#[derive(Debug, Clone)]
pub struct Lease {
    pub job: Job,
    pub token: String,
}
