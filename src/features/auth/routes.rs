use axum::{
    extract::{Query, State},
    http::StatusCode,
    routing::{get, post},
    Extension, Json, Router,
};
use serde_json::json;
use uuid::Uuid;
use validator::Validate;

use super::models::{
    MagicLinkRequest, SignupRequest, TokenQuery, TokenRequest, TokenResponse, UpdateUserRequest,
    User, VerifyRequest,
};
use super::service::{AuthError, AuthService};
use crate::middleware::auth::AuthContext;

pub fn public_auth_routes() -> Router<AuthService> {
    Router::new()
        .route("/signup", post(signup_handler))
        .route("/token", post(token_handler))
        .route("/verify", post(verify_handler))
        .route("/magiclink", post(magiclink_handler))
}

pub fn protected_auth_routes() -> Router<AuthService> {
    Router::new()
        .route("/user", get(get_user_handler).put(update_user_handler))
        .route("/logout", post(logout_handler))
}

#[axum::debug_handler]
async fn signup_handler(
    State(auth_service): State<AuthService>,
    Json(req): Json<SignupRequest>,
) -> Result<(StatusCode, Json<TokenResponse>), AuthError> {
    if let Err(e) = req.validate() {
        tracing::warn!(email = %req.email, "Signup validation failed: {}", e);
        return Err(AuthError::Validation(e.to_string()));
    }

    let response = auth_service.signup(req).await?;
    Ok((StatusCode::OK, Json(response)))
}

#[axum::debug_handler]
async fn token_handler(
    State(auth_service): State<AuthService>,
    Query(query): Query<TokenQuery>,
    Json(req): Json<TokenRequest>,
) -> Result<Json<TokenResponse>, AuthError> {
    match query.grant_type.as_str() {
        "password" => {
            let (email, password) = match (req.email, req.password) {
                (Some(e), Some(p)) => (e, p),
                _ => return Err(AuthError::InvalidCredentials),
            };
            let response = auth_service.token_password(&email, &password).await?;
            Ok(Json(response))
        }
        "refresh_token" => {
            let refresh = req.refresh_token.ok_or(AuthError::InvalidToken)?;
            let response = auth_service.token_refresh(&refresh).await?;
            Ok(Json(response))
        }
        other => Err(AuthError::Validation(format!(
            "Unsupported grant_type '{}'",
            other
        ))),
    }
}

#[axum::debug_handler]
async fn verify_handler(
    State(auth_service): State<AuthService>,
    Json(req): Json<VerifyRequest>,
) -> Result<Json<TokenResponse>, AuthError> {
    let response = auth_service.verify(req).await?;
    Ok(Json(response))
}

#[axum::debug_handler]
async fn magiclink_handler(
    State(auth_service): State<AuthService>,
    Json(req): Json<MagicLinkRequest>,
) -> Result<Json<serde_json::Value>, AuthError> {
    if let Err(e) = req.validate() {
        return Err(AuthError::Validation(e.to_string()));
    }

    // The raw token goes to the external mailer only; the response body is
    // identical whether or not the email matched a user.
    match auth_service.magiclink(&req.email).await? {
        Some(_token) => {
            tracing::info!(email = %req.email, "Magic link issued");
        }
        None => {
            tracing::debug!(email = %req.email, "Magic link requested for unknown email");
        }
    }
    Ok(Json(json!({})))
}

#[axum::debug_handler]
async fn get_user_handler(
    State(auth_service): State<AuthService>,
    Extension(ctx): Extension<AuthContext>,
) -> Result<Json<User>, AuthError> {
    let user_id = Uuid::parse_str(&ctx.user_id).map_err(|_| AuthError::InvalidToken)?;
    let user = auth_service.get_user(user_id).await?;
    Ok(Json(user))
}

#[axum::debug_handler]
async fn update_user_handler(
    State(auth_service): State<AuthService>,
    Extension(ctx): Extension<AuthContext>,
    Json(req): Json<UpdateUserRequest>,
) -> Result<Json<User>, AuthError> {
    if let Err(e) = req.validate() {
        return Err(AuthError::Validation(e.to_string()));
    }

    let user_id = Uuid::parse_str(&ctx.user_id).map_err(|_| AuthError::InvalidToken)?;
    let user = auth_service.update_user(user_id, req).await?;
    tracing::info!(user_id = %user.id, "User updated");
    Ok(Json(user))
}

#[axum::debug_handler]
async fn logout_handler(
    State(auth_service): State<AuthService>,
    Extension(ctx): Extension<AuthContext>,
) -> Result<StatusCode, AuthError> {
    let session_id = ctx
        .session_id()
        .and_then(|s| Uuid::parse_str(s).ok())
        .ok_or(AuthError::InvalidToken)?;
    auth_service.logout(session_id).await?;
    tracing::info!(session_id = %session_id, "Session revoked");
    Ok(StatusCode::NO_CONTENT)
}
