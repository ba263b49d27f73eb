// Webhook fan-out with hourly rate limiting, HMAC signing and a delivery
// audit trail.

use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::domain::webhook::{hour_bucket, WebhookDelivery};
use crate::domain::Result;
use crate::queue::Job;
use crate::storage::ConfigStore;
use crate::worker::{TaskContext, TaskError, TaskHandler, TaskResult};

pub const SIGNATURE_HEADER: &str = "X-AgentTrace-Signature";

type HmacSha256 = Hmac<Sha256>;

/// HMAC-SHA256 signature over the raw payload, hex-encoded with the scheme
/// prefix receivers expect.
pub fn sign_payload(secret: &str, payload: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(payload);
    let digest = mac.finalize().into_bytes();
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    format!("sha256={hex}")
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WebhookDeliverPayload {
    pub webhook_id: Uuid,
    pub event: serde_json::Value,
}

pub struct WebhookDeliverHandler {
    config_store: ConfigStore,
    http: reqwest::Client,
    signing_secret: String,
}

impl WebhookDeliverHandler {
    pub fn new(
        config_store: ConfigStore,
        signing_secret: String,
        request_timeout: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(request_timeout).build()?;
        Ok(Self {
            config_store,
            http,
            signing_secret,
        })
    }
}

#[async_trait]
impl TaskHandler for WebhookDeliverHandler {
    async fn run(&self, job: &Job, _ctx: &TaskContext) -> TaskResult {
        let payload: WebhookDeliverPayload = serde_json::from_value(job.payload.clone())
            .map_err(|e| TaskError::Permanent(format!("corrupt webhook payload: {e}")))?;

        let webhook = self
            .config_store
            .get_webhook(payload.webhook_id)
            .await
            .map_err(TaskError::from)?
            .ok_or_else(|| {
                TaskError::Permanent(format!("webhook {} not found", payload.webhook_id))
            })?;
        if !webhook.enabled {
            debug!(webhook_id = %webhook.id, "Webhook disabled; dropping delivery");
            return Ok(());
        }

        // increment-and-check in one statement; attempts count toward the
        // hourly budget
        let now = Utc::now();
        let count = self
            .config_store
            .increment_webhook_bucket(webhook.id, hour_bucket(now))
            .await
            .map_err(TaskError::from)?;
        if count > webhook.rate_limit_per_hour as i64 {
            return Err(TaskError::Retryable(format!(
                "webhook {} over its hourly rate limit",
                webhook.id
            )));
        }

        let body = serde_json::to_vec(&payload.event)
            .map_err(|e| TaskError::Permanent(format!("unserializable event: {e}")))?;
        let signature = sign_payload(&self.signing_secret, &body);

        let started = Instant::now();
        let response = self
            .http
            .post(&webhook.url)
            .header("content-type", "application/json")
            .header(SIGNATURE_HEADER, signature)
            .body(body)
            .send()
            .await;
        let latency_ms = started.elapsed().as_millis() as u64;

        let (status_code, outcome) = match response {
            Ok(response) => {
                let status = response.status();
                let outcome = if status.is_success() {
                    Ok(())
                } else if status.is_server_error() {
                    Err(TaskError::Retryable(format!(
                        "webhook endpoint returned {status}"
                    )))
                } else {
                    // 4xx: the receiver rejected the payload for good
                    Err(TaskError::Permanent(format!(
                        "webhook endpoint returned {status}"
                    )))
                };
                (Some(status.as_u16()), outcome)
            }
            Err(e) => (
                None,
                Err(TaskError::Retryable(format!("webhook request failed: {e}"))),
            ),
        };

        let delivery = WebhookDelivery {
            id: Uuid::new_v4(),
            webhook_id: webhook.id,
            event: payload
                .event
                .get("event")
                .and_then(|e| e.as_str())
                .unwrap_or("unknown")
                .to_string(),
            status_code,
            latency_ms,
            attempt: job.attempts,
            error: outcome.as_ref().err().map(|e| e.message().to_string()),
            delivered_at: now,
        };
        self.config_store
            .record_delivery(&delivery)
            .await
            .map_err(TaskError::from)?;

        match &outcome {
            Ok(()) => {
                metrics::counter!("agenttrace_webhook_deliveries_total", 1, "outcome" => "success");
            }
            Err(e) => {
                metrics::counter!("agenttrace_webhook_deliveries_total", 1, "outcome" => "failure");
                warn!(
                    webhook_id = %webhook.id,
                    attempt = job.attempts,
                    error = e.message(),
                    "Webhook delivery failed"
                );
            }
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_is_deterministic() {
        let a = sign_payload("secret", b"{\"event\":\"x\"}");
        let b = sign_payload("secret", b"{\"event\":\"x\"}");
        assert_eq!(a, b);
        assert!(a.starts_with("sha256="));
    }

    #[test]
    fn test_signature_varies_with_secret_and_payload() {
        let base = sign_payload("secret", b"payload");
        assert_ne!(base, sign_payload("other", b"payload"));
        assert_ne!(base, sign_payload("secret", b"payload2"));
    }

    #[test]
    fn test_known_signature_vector() {
        // stable across releases: receivers verify against this format
        let sig = sign_payload("key", b"The quick brown fox jumps over the lazy dog");
        assert_eq!(
            sig,
            "sha256=f7bc83f430538424b13298e6aa6fb143ef4d59a14946175997479dbc2d1a3cd8"
        );
    }
}
