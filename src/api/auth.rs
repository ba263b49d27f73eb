// Authentication interceptor: Basic `public_key:secret_key` for SDK
// clients, bearer secret for the dashboard proxy.

use axum::{
    extract::{Request, State},
    http::HeaderMap,
    middleware::Next,
    response::Response,
};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use tracing::warn;

use crate::domain::{ApiKey, Project};

use super::error::ApiError;
use super::state::AppState;

/// Authenticated caller context, resolved from the API key.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub project: Project,
    pub key: ApiKey,
}

impl AuthContext {
    pub fn project_id(&self) -> &str {
        &self.project.id
    }
}

enum Credentials {
    Basic { public_key: String, secret: String },
    Bearer { secret: String },
}

fn extract_credentials(headers: &HeaderMap) -> Result<Credentials, ApiError> {
    let header = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::Unauthorized("missing authorization header".into()))?;

    if let Some(encoded) = header.strip_prefix("Basic ") {
        let decoded = STANDARD
            .decode(encoded.trim())
            .map_err(|_| ApiError::Unauthorized("malformed basic credentials".into()))?;
        let pair = String::from_utf8(decoded)
            .map_err(|_| ApiError::Unauthorized("malformed basic credentials".into()))?;
        let (public_key, secret) = pair
            .split_once(':')
            .ok_or_else(|| ApiError::Unauthorized("malformed basic credentials".into()))?;
        return Ok(Credentials::Basic {
            public_key: public_key.to_string(),
            secret: secret.to_string(),
        });
    }

    if let Some(secret) = header.strip_prefix("Bearer ") {
        return Ok(Credentials::Bearer {
            secret: secret.trim().to_string(),
        });
    }

    Err(ApiError::Unauthorized("unsupported authorization scheme".into()))
}

async fn resolve_key(state: &AppState, credentials: Credentials) -> Result<ApiKey, ApiError> {
    match credentials {
        Credentials::Basic { public_key, secret } => {
            let key = state
                .config_store
                .find_api_key_by_public_key(&public_key)
                .await
                .map_err(ApiError::from)?
                .ok_or_else(|| ApiError::Unauthorized("unknown public key".into()))?;
            key.verify_secret(&secret).map_err(ApiError::from)?;
            Ok(key)
        }
        Credentials::Bearer { secret } => {
            let key = state
                .config_store
                .find_api_key_by_secret(&secret)
                .await
                .map_err(ApiError::from)?
                .ok_or_else(|| ApiError::Unauthorized("unknown secret key".into()))?;
            if key.is_revoked() {
                return Err(ApiError::Unauthorized("API key revoked".into()));
            }
            Ok(key)
        }
    }
}

/// Resolve credentials to a project context and stash it in request
/// extensions. Runs before rate limiting and validation.
pub async fn auth_middleware(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let credentials = extract_credentials(&headers)?;
    let key = resolve_key(&state, credentials).await?;

    let project = state
        .config_store
        .get_project(&key.project_id)
        .await
        .map_err(ApiError::from)?
        .ok_or_else(|| ApiError::Unauthorized("project no longer exists".into()))?;

    if project.disabled {
        return Err(ApiError::Forbidden(format!(
            "project {} is disabled",
            project.id
        )));
    }

    // opportunistic; a failed touch never fails the request
    let store = state.config_store.clone();
    let key_id = key.id;
    tokio::spawn(async move {
        if let Err(e) = store.touch_api_key(key_id).await {
            warn!(error = %e, "Failed to update key last_used_at");
        }
    });

    request.extensions_mut().insert(AuthContext { project, key });
    Ok(next.run(request).await)
}
