use thiserror::Error;

pub type Result<T> = std::result::Result<T, AgentTraceError>;

#[derive(Error, Debug)]
pub enum AgentTraceError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("TOML deserialization error: {0}")]
    TomlDe(#[from] toml::de::Error),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    #[error("Rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Ingest buffer above high-water mark")]
    Backpressure,

    #[error("Project is disabled: {0}")]
    ProjectDisabled(String),

    #[error("Payload too large: {actual} bytes exceeds limit of {limit}")]
    PayloadTooLarge { actual: usize, limit: usize },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Price not found for provider={provider}, model={model}")]
    PriceNotFound { provider: String, model: String },

    #[error("Upstream transient failure: {0}")]
    UpstreamTransient(String),

    #[error("Upstream permanent failure: {0}")]
    UpstreamPermanent(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AgentTraceError {
    pub fn config<S: Into<String>>(msg: S) -> Self {
        AgentTraceError::Config(msg.into())
    }

    pub fn validation<S: Into<String>>(msg: S) -> Self {
        AgentTraceError::Validation(msg.into())
    }

    pub fn internal<S: Into<String>>(msg: S) -> Self {
        AgentTraceError::Internal(msg.into())
    }

    pub fn transient<S: Into<String>>(msg: S) -> Self {
        AgentTraceError::UpstreamTransient(msg.into())
    }

    pub fn permanent<S: Into<String>>(msg: S) -> Self {
        AgentTraceError::UpstreamPermanent(msg.into())
    }

    /// Whether a background handler should re-attempt after this error.
    ///
    /// Store and network failures are retried with backoff; everything that
    /// reflects bad input or missing reference data is terminal.
    pub fn is_retryable(&self) -> bool {
        match self {
            AgentTraceError::Database(sqlx::Error::RowNotFound) => false,
            AgentTraceError::Database(_)
            | AgentTraceError::Io(_)
            | AgentTraceError::Http(_)
            | AgentTraceError::RateLimited { .. }
            | AgentTraceError::Backpressure
            | AgentTraceError::UpstreamTransient(_) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(AgentTraceError::transient("store timeout").is_retryable());
        assert!(AgentTraceError::Backpressure.is_retryable());
        assert!(!AgentTraceError::validation("bad field").is_retryable());
        assert!(!AgentTraceError::permanent("unknown model").is_retryable());
        assert!(!AgentTraceError::NotFound("obs-1".into()).is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = AgentTraceError::PriceNotFound {
            provider: "openai".into(),
            model: "mystery-7b".into(),
        };
        assert!(err.to_string().contains("mystery-7b"));

        let err = AgentTraceError::RateLimited { retry_after_secs: 30 };
        assert!(err.to_string().contains("30"));
    }
}
