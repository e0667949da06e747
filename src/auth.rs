use crate::config::ApiKeyConfig;
use crate::error::{AppError, AppResult};
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, StatusCode};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;

/// Identity of the caller behind an accepted key.
#[derive(Clone, Debug)]
pub struct AuthResult {
    pub key_id: u64,
    pub key_name: String,
}

/// Lookup table over the configured gateway keys.
#[derive(Clone, Default)]
pub struct AuthState {
    keys: Arc<HashMap<String, ApiKeyConfig>>,
}

fn unauthorized(code: &str, message: &str) -> AppError {
    AppError::new(StatusCode::UNAUTHORIZED, code, message).with_type("authentication_error")
}

impl AuthState {
    pub fn new(keys: &[ApiKeyConfig]) -> Self {
        let mut map = HashMap::new();
        for key in keys {
            map.entry(key.key.clone()).or_insert_with(|| key.clone());
        }
        Self {
            keys: Arc::new(map),
        }
    }

    /// Accepts `Authorization: Bearer <key>` or the bare key as the header value.
    pub fn authenticate(&self, headers: &HeaderMap) -> AppResult<AuthResult> {
        let raw = headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .unwrap_or_default();
        if raw.is_empty() {
            return Err(unauthorized("missing_api_key", "Missing API key"));
        }
        let token = match raw.split_once(' ') {
            Some((scheme, rest)) if scheme.eq_ignore_ascii_case("bearer") => rest.trim(),
            _ => raw,
        };
        self.authenticate_token(token, Utc::now())
    }

    pub fn authenticate_token(&self, token: &str, now: DateTime<Utc>) -> AppResult<AuthResult> {
        let key = self
            .keys
            .get(token)
            .filter(|key| key.is_active)
            .ok_or_else(|| unauthorized("invalid_api_key", "Invalid API key"))?;
        if key.expires_at.is_some_and(|expires_at| expires_at < now) {
            return Err(unauthorized("api_key_expired", "API key has expired"));
        }
        Ok(AuthResult {
            key_id: key.id,
            key_name: key.name.clone(),
        })
    }
}
