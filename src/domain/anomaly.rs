use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::{AgentTraceError, Result};

/// Metric a rule watches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Latency,
    Cost,
    ErrorRate,
    Tokens,
}

impl MetricKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Latency => "latency",
            MetricKind::Cost => "cost",
            MetricKind::ErrorRate => "error_rate",
            MetricKind::Tokens => "tokens",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "latency" => Ok(MetricKind::Latency),
            "cost" => Ok(MetricKind::Cost),
            "error_rate" => Ok(MetricKind::ErrorRate),
            "tokens" => Ok(MetricKind::Tokens),
            other => Err(AgentTraceError::validation(format!(
                "unknown metric kind: {other}"
            ))),
        }
    }
}

/// Detection method with its tuning parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DetectionMethod {
    ZScore {
        threshold: f64,
        min_samples: usize,
    },
    Iqr {
        k: f64,
        min_samples: usize,
    },
    Mad {
        threshold: f64,
        min_samples: usize,
    },
    MovingAverage {
        window_size: usize,
        deviation: f64,
    },
    ExponentialEma {
        alpha: f64,
        deviation: f64,
        min_samples: usize,
    },
    Threshold {
        min: Option<f64>,
        max: Option<f64>,
    },
}

impl DetectionMethod {
    pub fn name(&self) -> &'static str {
        match self {
            DetectionMethod::ZScore { .. } => "z_score",
            DetectionMethod::Iqr { .. } => "iqr",
            DetectionMethod::Mad { .. } => "mad",
            DetectionMethod::MovingAverage { .. } => "moving_average",
            DetectionMethod::ExponentialEma { .. } => "exponential_ema",
            DetectionMethod::Threshold { .. } => "threshold",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::Low => "low",
            AlertSeverity::Medium => "medium",
            AlertSeverity::High => "high",
            AlertSeverity::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "low" => AlertSeverity::Low,
            "high" => AlertSeverity::High,
            "critical" => AlertSeverity::Critical,
            _ => AlertSeverity::Medium,
        }
    }
}

/// Detector specification for a project metric.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnomalyRule {
    pub id: Uuid,
    pub project_id: String,
    pub name: String,
    pub metric: MetricKind,

    /// Primary method; governs when several are configured upstream.
    pub method: DetectionMethod,

    /// Lookback window materialized from the telemetry store.
    pub lookback_minutes: u32,

    /// Consecutive in-band samples before an active alert auto-resolves.
    pub auto_resolve_samples: u32,

    pub severity: AlertSeverity,
    pub cooldown_minutes: u32,

    #[serde(default)]
    pub alert_webhook_ids: Vec<Uuid>,

    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AnomalyRule {
    pub fn new(
        project_id: String,
        name: impl Into<String>,
        metric: MetricKind,
        method: DetectionMethod,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            project_id,
            name: name.into(),
            metric,
            method,
            lookback_minutes: 60,
            auto_resolve_samples: 5,
            severity: AlertSeverity::Medium,
            cooldown_minutes: 30,
            alert_webhook_ids: Vec::new(),
            enabled: true,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_cooldown_minutes(mut self, minutes: u32) -> Self {
        self.cooldown_minutes = minutes;
        self
    }

    pub fn with_severity(mut self, severity: AlertSeverity) -> Self {
        self.severity = severity;
        self
    }

    /// Cooldown bucket index for a given instant. At most one active alert
    /// may exist per `(rule_id, bucket)`.
    pub fn cooldown_bucket(&self, at: DateTime<Utc>) -> i64 {
        let minutes = self.cooldown_minutes.max(1) as i64;
        at.timestamp() / 60 / minutes
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    Active,
    Acknowledged,
    Resolved,
    Suppressed,
}

impl AlertStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertStatus::Active => "active",
            AlertStatus::Acknowledged => "acknowledged",
            AlertStatus::Resolved => "resolved",
            AlertStatus::Suppressed => "suppressed",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(AlertStatus::Active),
            "acknowledged" => Ok(AlertStatus::Acknowledged),
            "resolved" => Ok(AlertStatus::Resolved),
            "suppressed" => Ok(AlertStatus::Suppressed),
            other => Err(AgentTraceError::validation(format!(
                "unknown alert status: {other}"
            ))),
        }
    }

    /// Legal lifecycle transitions: active→acknowledged→resolved, or
    /// active→suppressed; resolve is allowed from any non-terminal state.
    pub fn can_transition_to(&self, next: AlertStatus) -> bool {
        matches!(
            (self, next),
            (AlertStatus::Active, AlertStatus::Acknowledged)
                | (AlertStatus::Active, AlertStatus::Suppressed)
                | (AlertStatus::Active, AlertStatus::Resolved)
                | (AlertStatus::Acknowledged, AlertStatus::Resolved)
                | (AlertStatus::Suppressed, AlertStatus::Resolved)
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub id: Uuid,
    pub rule_id: Uuid,
    pub project_id: String,
    pub status: AlertStatus,
    pub anomaly_score: f64,
    pub severity: AlertSeverity,

    /// Cooldown bucket the alert was raised in; paired with `rule_id` this
    /// enforces at-most-one active alert per cooldown window.
    pub cooldown_bucket: i64,

    /// Detections observed while the alert was already open.
    pub hit_count: u32,

    pub raised_at: DateTime<Utc>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,

    pub auto_resolved: bool,

    #[serde(default)]
    pub notes: Vec<String>,
}
