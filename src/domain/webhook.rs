use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Outbound notification endpoint configured for a project.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookEndpoint {
    pub id: Uuid,
    pub project_id: String,
    pub url: String,

    /// Deliveries allowed per hour bucket.
    pub rate_limit_per_hour: u32,

    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

impl WebhookEndpoint {
    pub fn new(project_id: String, url: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            project_id,
            url: url.into(),
            rate_limit_per_hour: 100,
            enabled: true,
            created_at: Utc::now(),
        }
    }

    pub fn with_rate_limit_per_hour(mut self, limit: u32) -> Self {
        self.rate_limit_per_hour = limit;
        self
    }
}

/// Audit row for one delivery attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookDelivery {
    pub id: Uuid,
    pub webhook_id: Uuid,
    pub event: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,

    pub latency_ms: u64,
    pub attempt: u32,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    pub delivered_at: DateTime<Utc>,
}

/// Hour bucket used by the dispatcher's rate limit; derived from the
/// delivery timestamp.
pub fn hour_bucket(at: DateTime<Utc>) -> i64 {
    at.timestamp() / 3600
}
