use std::sync::Arc;

use axum::{
    extract::Request,
    http::header,
    middleware::Next,
    response::{IntoResponse, Response},
    Extension,
};

use crate::config::Config;
use crate::features::auth::jwt;
use crate::features::rest::error::ApiError;

/// Request-scoped identity derived from the bearer JWT or API key.
#[derive(Debug, Clone)]
pub struct AuthContext {
    /// Empty for anonymous and pure API-key callers.
    pub user_id: String,
    pub email: String,
    pub role: String,
    pub claims: serde_json::Value,
    pub bypass_rls: bool,
}

impl AuthContext {
    pub fn anonymous() -> Self {
        Self {
            user_id: String::new(),
            email: String::new(),
            role: "anon".to_string(),
            claims: serde_json::json!({}),
            bypass_rls: false,
        }
    }

    pub fn from_claims(claims: serde_json::Value) -> Self {
        let str_claim = |key: &str| {
            claims
                .get(key)
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string()
        };
        let role = {
            let r = str_claim("role");
            if r.is_empty() {
                "anon".to_string()
            } else {
                r
            }
        };
        Self {
            user_id: str_claim("sub"),
            email: str_claim("email"),
            bypass_rls: role == "service_role",
            role,
            claims,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        !self.user_id.is_empty()
    }

    pub fn session_id(&self) -> Option<&str> {
        self.claims.get("session_id").and_then(|v| v.as_str())
    }
}

/// Resolve the caller's identity and attach it as a request extension.
/// A present-but-invalid credential is rejected here; absent credentials
/// fall through as anonymous.
pub async fn auth_context_middleware(
    Extension(config): Extension<Arc<Config>>,
    mut request: Request,
    next: Next,
) -> Response {
    let bearer = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string);
    let apikey = request
        .headers()
        .get("apikey")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let token = bearer.or(apikey);
    let ctx = match token {
        Some(token) => match jwt::verify_token(&token, &config.jwt_secret) {
            Ok(claims) => AuthContext::from_claims(claims),
            Err(e) if matches!(e.kind(), jsonwebtoken::errors::ErrorKind::ExpiredSignature) => {
                return ApiError::token_expired().into_response();
            }
            Err(e) => {
                tracing::debug!(error = %e, "Rejected credential");
                return ApiError::invalid_token().into_response();
            }
        },
        None => AuthContext::anonymous(),
    };

    request.extensions_mut().insert(ctx);
    next.run(request).await
}

/// Gate for endpoints that act on a concrete user (e.g. `/auth/v1/user`).
pub async fn require_auth(
    Extension(ctx): Extension<AuthContext>,
    request: Request,
    next: Next,
) -> Response {
    if !ctx.is_authenticated() {
        return ApiError::unauthenticated().into_response();
    }
    next.run(request).await
}

/// Gate for the admin surface.
pub async fn require_service_role(
    Extension(ctx): Extension<AuthContext>,
    request: Request,
    next: Next,
) -> Response {
    if ctx.role != "service_role" {
        return ApiError::forbidden().into_response();
    }
    next.run(request).await
}
