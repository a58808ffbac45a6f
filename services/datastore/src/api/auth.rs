//! Request validation hook for the HTTP surface.

use axum::{
    extract::{Request, State},
    http::{header, HeaderMap, Method, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use base64::{engine::general_purpose::STANDARD, Engine};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use crate::config::AuthConfig;
use crate::error::ErrorResponse;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    Forbidden(String),
}

impl AuthError {
    fn status(&self) -> StatusCode {
        match self {
            AuthError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AuthError::Forbidden(_) => StatusCode::FORBIDDEN,
        }
    }
}

/// Decides whether a request may proceed
pub trait RequestValidator: Send + Sync {
    fn validate(&self, method: &Method, path: &str, headers: &HeaderMap) -> Result<(), AuthError>;
}

/// Accepts a fixed set of bearer tokens, optionally also as basic credentials
pub struct TokenValidator {
    tokens: HashSet<String>,
    basic_enabled: bool,
    /// Path prefixes per token; tokens without rules may access everything
    authz: HashMap<String, Vec<String>>,
}

impl TokenValidator {
    pub fn new(config: &AuthConfig) -> Self {
        Self {
            tokens: config.tokens.iter().cloned().collect(),
            basic_enabled: config.basic_enabled,
            authz: config.authz.clone(),
        }
    }

    fn credential(&self, headers: &HeaderMap) -> Result<String, AuthError> {
        let value = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| AuthError::Unauthorized("missing Authorization header".into()))?;

        if let Some(token) = value.strip_prefix("Bearer ") {
            return Ok(token.trim().to_string());
        }
        if self.basic_enabled {
            if let Some(encoded) = value.strip_prefix("Basic ") {
                let decoded = STANDARD
                    .decode(encoded.trim())
                    .ok()
                    .and_then(|raw| String::from_utf8(raw).ok())
                    .ok_or_else(|| AuthError::Unauthorized("malformed basic credentials".into()))?;
                return Ok(decoded);
            }
        }
        Err(AuthError::Unauthorized("unsupported authorization scheme".into()))
    }
}

impl RequestValidator for TokenValidator {
    fn validate(&self, method: &Method, path: &str, headers: &HeaderMap) -> Result<(), AuthError> {
        let token = self.credential(headers)?;
        if !self.tokens.contains(&token) {
            return Err(AuthError::Unauthorized("invalid credentials".into()));
        }
        if let Some(prefixes) = self.authz.get(&token) {
            if !prefixes.iter().any(|p| path.starts_with(p.as_str())) {
                debug!(%method, path, "Request outside of token rules");
                return Err(AuthError::Forbidden(format!("access to {path} is not allowed")));
            }
        }
        Ok(())
    }
}

/// Middleware running the configured validator; `/health` is always open
pub async fn validate_request(
    State(validator): State<Arc<dyn RequestValidator>>,
    request: Request,
    next: Next,
) -> Response {
    if request.uri().path() != "/health" && request.method() != Method::OPTIONS {
        if let Err(e) = validator.validate(request.method(), request.uri().path(), request.headers()) {
            let body = ErrorResponse {
                code: e.status().as_u16(),
                message: e.to_string(),
            };
            return (e.status(), Json(body)).into_response();
        }
    }
    next.run(request).await
}
