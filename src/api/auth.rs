use crate::config::AuthConfig;
use axum::{
    body::Body,
    extract::Request,
    http::{header, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use subtle::ConstantTimeEq;

/// Configured API key digests. Keys are hashed once at startup; plaintext
/// keys never live past config load.
pub struct ApiKeys {
    keys: Vec<[u8; 32]>,
    admin: Vec<[u8; 32]>,
}

impl ApiKeys {
    pub fn from_config(config: &AuthConfig) -> Self {
        Self {
            keys: config.api_keys.iter().map(|k| digest_key(k)).collect(),
            admin: config.admin_keys.iter().map(|k| digest_key(k)).collect(),
        }
    }

    /// When no public keys are configured, public routes are open.
    pub fn auth_enabled(&self) -> bool {
        !self.keys.is_empty()
    }

    /// Check a presented key against the public set (admin keys also pass).
    pub fn check(&self, presented: &str) -> bool {
        let d = digest_key(presented);
        matches_any(&self.keys, &d) || matches_any(&self.admin, &d)
    }

    /// Check a presented key against the admin set only.
    pub fn check_admin(&self, presented: &str) -> bool {
        let d = digest_key(presented);
        matches_any(&self.admin, &d)
    }
}

fn digest_key(key: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hasher.finalize().into()
}

/// Constant-time membership test: every candidate is compared, results are
/// OR-folded so timing does not reveal which entry matched.
fn matches_any(candidates: &[[u8; 32]], presented: &[u8; 32]) -> bool {
    let mut matched = 0u8;
    for candidate in candidates {
        matched |= candidate.ct_eq(presented).unwrap_u8();
    }
    matched == 1
}

/// Short hex fingerprint of a key for log lines. Never logs the key itself.
pub fn key_fingerprint(key: &str) -> String {
    hex::encode(digest_key(key))[..8].to_string()
}

fn extract_bearer(req: &Request<Body>) -> Option<String> {
    let value = req.headers().get(header::AUTHORIZATION)?.to_str().ok()?;
    let token = value.strip_prefix("Bearer ")?;
    if token.is_empty() {
        return None;
    }
    Some(token.to_string())
}

fn unauthorized(msg: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        axum::Json(serde_json::json!({ "error": msg })),
    )
        .into_response()
}

fn keys_from_extensions(request: &Request<Body>) -> Result<Arc<ApiKeys>, Response> {
    request
        .extensions()
        .get::<Arc<ApiKeys>>()
        .cloned()
        .ok_or_else(|| {
            tracing::error!("auth: ApiKeys not configured in extensions");
            (StatusCode::INTERNAL_SERVER_ERROR, "auth not configured").into_response()
        })
}

/// Middleware for public routes: requires a valid API key when any are
/// configured, passes everything through otherwise.
pub async fn require_api_key(request: Request<Body>, next: Next) -> Result<Response, Response> {
    let keys = keys_from_extensions(&request)?;

    if !keys.auth_enabled() {
        return Ok(next.run(request).await);
    }

    let path = request.uri().path().to_string();
    let Some(presented) = extract_bearer(&request) else {
        tracing::warn!(path = %path, "auth rejected: missing bearer key");
        return Err(unauthorized("missing API key"));
    };

    if !keys.check(&presented) {
        tracing::warn!(
            path = %path,
            key_fingerprint = %key_fingerprint(&presented),
            "auth rejected: unknown API key"
        );
        return Err(unauthorized("invalid API key"));
    }

    Ok(next.run(request).await)
}

/// Middleware for admin routes: always requires a configured admin key.
pub async fn require_admin_key(request: Request<Body>, next: Next) -> Result<Response, Response> {
    let keys = keys_from_extensions(&request)?;
    let path = request.uri().path().to_string();

    let Some(presented) = extract_bearer(&request) else {
        tracing::warn!(path = %path, "admin auth rejected: missing bearer key");
        return Err(unauthorized("missing admin key"));
    };

    if !keys.check_admin(&presented) {
        tracing::warn!(
            path = %path,
            key_fingerprint = %key_fingerprint(&presented),
            "admin auth rejected: key lacks admin access"
        );
        return Err((
            StatusCode::FORBIDDEN,
            axum::Json(serde_json::json!({ "error": "admin key required" })),
        )
            .into_response());
    }

    Ok(next.run(request).await)
}
