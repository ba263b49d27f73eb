use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::error::{AgentTraceError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Organization {
    pub id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// Tenant unit. All telemetry rows are scoped to a project; deleting a
/// project cascades to its keys, evaluators, rules and webhooks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: String,
    pub org_id: Uuid,
    pub slug: String,
    pub name: String,
    pub retention_days: u32,
    pub rate_limit_per_minute: u32,
    pub disabled: bool,
    pub created_at: DateTime<Utc>,
}

impl Project {
    pub fn new(org_id: Uuid, slug: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().simple().to_string(),
            org_id,
            slug: slug.into(),
            name: name.into(),
            retention_days: 90,
            rate_limit_per_minute: 1000,
            disabled: false,
            created_at: Utc::now(),
        }
    }

    pub fn with_retention_days(mut self, days: u32) -> Self {
        self.retention_days = days;
        self
    }

    pub fn with_rate_limit(mut self, per_minute: u32) -> Self {
        self.rate_limit_per_minute = per_minute;
        self
    }
}

pub const PUBLIC_KEY_PREFIX: &str = "at-pk-";
pub const SECRET_KEY_PREFIX: &str = "at-sk-";

/// API key pair for SDK authentication. The secret is shown exactly once at
/// creation; only its SHA-256 hash is persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiKey {
    pub id: Uuid,
    pub project_id: String,
    pub public_key: String,
    pub secret_hash: String,
    pub scopes: Vec<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub revoked_at: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
}

/// A freshly generated key pair, carrying the plaintext secret.
#[derive(Debug, Clone)]
pub struct GeneratedApiKey {
    pub key: ApiKey,
    pub secret_key: String,
}

fn random_token(len: usize) -> String {
    use rand::Rng;
    const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
        .collect()
}

pub fn hash_secret(secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hex_encode(&hasher.finalize())
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

impl ApiKey {
    /// Generate a new key pair for a project. The returned secret is not
    /// recoverable afterwards.
    pub fn generate(project_id: String, scopes: Vec<String>) -> GeneratedApiKey {
        let public_key = format!("{PUBLIC_KEY_PREFIX}{}", random_token(24));
        let secret_key = format!("{SECRET_KEY_PREFIX}{}", random_token(32));
        let key = ApiKey {
            id: Uuid::new_v4(),
            project_id,
            public_key,
            secret_hash: hash_secret(&secret_key),
            scopes,
            revoked_at: None,
            last_used_at: None,
            created_at: Utc::now(),
        };
        GeneratedApiKey { key, secret_key }
    }

    pub fn is_revoked(&self) -> bool {
        self.revoked_at.is_some()
    }

    /// Constant-time verification of a presented secret against the stored
    /// hash.
    pub fn verify_secret(&self, secret: &str) -> Result<()> {
        if self.is_revoked() {
            return Err(AgentTraceError::AuthFailed("API key revoked".into()));
        }
        let presented = hash_secret(secret);
        if constant_time_eq::constant_time_eq(presented.as_bytes(), self.secret_hash.as_bytes()) {
            Ok(())
        } else {
            Err(AgentTraceError::AuthFailed("invalid secret key".into()))
        }
    }

    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.iter().any(|s| s == scope || s == "*")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_and_verify() {
        let generated = ApiKey::generate("proj-1".into(), vec!["ingest".into()]);
        assert!(generated.key.public_key.starts_with(PUBLIC_KEY_PREFIX));
        assert!(generated.secret_key.starts_with(SECRET_KEY_PREFIX));
        assert!(generated.key.verify_secret(&generated.secret_key).is_ok());
        assert!(generated.key.verify_secret("at-sk-wrong").is_err());
    }

    #[test]
    fn test_revoked_key_rejected() {
        let mut generated = ApiKey::generate("proj-1".into(), vec!["*".into()]);
        generated.key.revoked_at = Some(Utc::now());
        assert!(generated.key.verify_secret(&generated.secret_key).is_err());
    }

    #[test]
    fn test_scopes() {
        let generated = ApiKey::generate("proj-1".into(), vec!["ingest".into()]);
        assert!(generated.key.has_scope("ingest"));
        assert!(!generated.key.has_scope("admin"));

        let wildcard = ApiKey::generate("proj-1".into(), vec!["*".into()]);
        assert!(wildcard.key.has_scope("admin"));
    }

    #[test]
    fn test_secret_hash_is_stable() {
        assert_eq!(hash_secret("abc"), hash_secret("abc"));
        assert_ne!(hash_secret("abc"), hash_secret("abd"));
    }
}
