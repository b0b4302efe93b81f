use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{Duration, Utc};
use rand::{distributions::Alphanumeric, Rng};
use serde_json::{json, Value as JsonValue};
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use thiserror::Error;
use uuid::Uuid;

use super::jwt;
use super::models::{
    Session, SignupRequest, TokenResponse, UpdateUserRequest, User, VerificationToken,
    VerificationType, VerifyRequest,
};
use crate::config::Config;

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("A user with this email already exists")]
    DuplicateEmail,

    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Invalid or revoked token")]
    InvalidToken,

    #[error("Token has expired")]
    TokenExpired,

    #[error("Token has already been used")]
    TokenAlreadyUsed,

    #[error("User not found")]
    UserNotFound,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("JWT error: {0}")]
    Jwt(String),

    #[error("Password hash error: {0}")]
    Hash(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl AuthError {
    pub fn to_status_code(&self) -> StatusCode {
        match self {
            Self::DuplicateEmail => StatusCode::CONFLICT,
            Self::InvalidCredentials => StatusCode::BAD_REQUEST,
            Self::InvalidToken => StatusCode::UNAUTHORIZED,
            Self::TokenExpired => StatusCode::UNAUTHORIZED,
            Self::TokenAlreadyUsed => StatusCode::BAD_REQUEST,
            Self::UserNotFound => StatusCode::NOT_FOUND,
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Jwt(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Hash(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            Self::DuplicateEmail => "DuplicateEmail",
            Self::InvalidCredentials => "InvalidCredentials",
            Self::InvalidToken => "InvalidToken",
            Self::TokenExpired => "TokenExpired",
            Self::TokenAlreadyUsed => "TokenAlreadyUsed",
            Self::UserNotFound => "UserNotFound",
            Self::Validation(_) => "ValidationError",
            Self::Jwt(_) | Self::Hash(_) | Self::Database(_) => "StorageError",
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status = self.to_status_code();
        // Internal details go to logs, never to the client.
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self, "Auth internal error");
            "Internal error".to_string()
        } else {
            self.to_string()
        };
        (
            status,
            Json(json!({"error": {"code": self.code(), "message": message}})),
        )
            .into_response()
    }
}

const CONFIRMATION_TTL_HOURS: i64 = 24;
const SHORT_LIVED_TTL_HOURS: i64 = 1;

#[derive(Clone)]
pub struct AuthService {
    pool: SqlitePool,
    config: Config,
}

impl AuthService {
    pub fn new(pool: SqlitePool, config: Config) -> Self {
        Self { pool, config }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    // ==================== USER LIFECYCLE ====================

    pub async fn create_user(
        &self,
        email: &str,
        password: &str,
        user_metadata: JsonValue,
    ) -> Result<User, AuthError> {
        let email = normalize_email(email);
        self.ensure_email_free(&email).await?;

        let hash = bcrypt::hash(password, bcrypt::DEFAULT_COST)
            .map_err(|e| AuthError::Hash(e.to_string()))?;
        let user = User::new_email(&email, Some(hash), user_metadata);
        self.insert_user(&user).await?;
        Ok(user)
    }

    pub async fn create_oauth_user(
        &self,
        email: &str,
        provider: &str,
        user_metadata: JsonValue,
    ) -> Result<User, AuthError> {
        let email = normalize_email(email);
        self.ensure_email_free(&email).await?;

        let user = User::new_oauth(&email, provider, user_metadata);
        self.insert_user(&user).await?;
        Ok(user)
    }

    pub async fn create_anonymous_user(&self, user_metadata: JsonValue) -> Result<User, AuthError> {
        let user = User::new_anonymous(user_metadata);
        self.insert_user(&user).await?;
        Ok(user)
    }

    async fn ensure_email_free(&self, email: &str) -> Result<(), AuthError> {
        let exists: Option<i64> = sqlx::query_scalar(
            "SELECT 1 FROM auth_users WHERE email = ? AND deleted_at IS NULL",
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;
        if exists.is_some() {
            return Err(AuthError::DuplicateEmail);
        }
        Ok(())
    }

    async fn insert_user(&self, user: &User) -> Result<(), AuthError> {
        let result = sqlx::query(
            "INSERT INTO auth_users
                 (id, email, encrypted_password, role, app_metadata, user_metadata,
                  is_anonymous, email_confirmed_at, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(user.id.to_string())
        .bind(&user.email)
        .bind(&user.encrypted_password)
        .bind(&user.role)
        .bind(&user.app_metadata)
        .bind(&user.user_metadata)
        .bind(user.is_anonymous)
        .bind(user.email_confirmed_at)
        .bind(user.created_at)
        .bind(user.updated_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.message().contains("UNIQUE constraint failed") => {
                Err(AuthError::DuplicateEmail)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get_user(&self, user_id: Uuid) -> Result<User, AuthError> {
        sqlx::query_as::<_, User>("SELECT * FROM auth_users WHERE id = ? AND deleted_at IS NULL")
            .bind(user_id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or(AuthError::UserNotFound)
    }

    pub async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, AuthError> {
        let email = normalize_email(email);
        let user = sqlx::query_as::<_, User>(
            "SELECT * FROM auth_users WHERE email = ? AND deleted_at IS NULL",
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;
        Ok(user)
    }

    pub fn validate_password(&self, user: &User, password: &str) -> bool {
        match user.encrypted_password.as_deref() {
            Some(hash) => bcrypt::verify(password, hash).unwrap_or(false),
            None => false,
        }
    }

    pub async fn update_user(
        &self,
        user_id: Uuid,
        update: UpdateUserRequest,
    ) -> Result<User, AuthError> {
        let mut user = self.get_user(user_id).await?;

        if let Some(email) = update.email {
            let email = normalize_email(&email);
            if user.email.as_deref() != Some(email.as_str()) {
                self.ensure_email_free(&email).await?;
                user.email = Some(email);
                user.email_confirmed_at = None;
            }
        }
        if let Some(password) = update.password {
            let hash = bcrypt::hash(&password, bcrypt::DEFAULT_COST)
                .map_err(|e| AuthError::Hash(e.to_string()))?;
            user.encrypted_password = Some(hash);
        }
        if let Some(data) = update.data {
            user.user_metadata = data;
        }
        user.updated_at = Utc::now();

        sqlx::query(
            "UPDATE auth_users
             SET email = ?, encrypted_password = ?, user_metadata = ?,
                 email_confirmed_at = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(&user.email)
        .bind(&user.encrypted_password)
        .bind(&user.user_metadata)
        .bind(user.email_confirmed_at)
        .bind(user.updated_at)
        .bind(user.id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(user)
    }

    // ==================== SESSIONS ====================

    pub async fn create_session(&self, user: &User) -> Result<(Session, String), AuthError> {
        let session = Session {
            id: Uuid::new_v4(),
            user_id: user.id,
            aal: "aal1".to_string(),
            created_at: Utc::now(),
        };
        let refresh = jwt::generate_refresh_token();

        let mut tx = self.pool.begin().await?;
        sqlx::query("INSERT INTO auth_sessions (id, user_id, aal, created_at) VALUES (?, ?, ?, ?)")
            .bind(session.id.to_string())
            .bind(session.user_id.to_string())
            .bind(&session.aal)
            .bind(session.created_at)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "INSERT INTO auth_refresh_tokens (token, user_id, session_id, revoked, created_at)
             VALUES (?, ?, ?, 0, ?)",
        )
        .bind(&refresh)
        .bind(session.user_id.to_string())
        .bind(session.id.to_string())
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok((session, refresh))
    }

    /// Rotate a refresh token: the consumed token is revoked atomically
    /// with issuance of the replacement bound to the same session. A
    /// replayed (already revoked) token fails and issues nothing.
    pub async fn refresh_session(
        &self,
        refresh_token: &str,
    ) -> Result<(User, Session, String), AuthError> {
        let mut tx = self.pool.begin().await?;

        let consumed: Option<(Uuid, Uuid)> = sqlx::query_as(
            "UPDATE auth_refresh_tokens SET revoked = 1
             WHERE token = ? AND revoked = 0
             RETURNING user_id, session_id",
        )
        .bind(refresh_token)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((user_id, session_id)) = consumed else {
            return Err(AuthError::InvalidToken);
        };

        let new_refresh = jwt::generate_refresh_token();
        sqlx::query(
            "INSERT INTO auth_refresh_tokens (token, user_id, session_id, revoked, created_at)
             VALUES (?, ?, ?, 0, ?)",
        )
        .bind(&new_refresh)
        .bind(user_id.to_string())
        .bind(session_id.to_string())
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;

        let user = sqlx::query_as::<_, User>(
            "SELECT * FROM auth_users WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(user_id.to_string())
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(AuthError::InvalidToken)?;

        let session = sqlx::query_as::<_, Session>("SELECT * FROM auth_sessions WHERE id = ?")
            .bind(session_id.to_string())
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(AuthError::InvalidToken)?;

        tx.commit().await?;
        Ok((user, session, new_refresh))
    }

    pub async fn revoke_session(&self, session_id: Uuid) -> Result<(), AuthError> {
        sqlx::query("DELETE FROM auth_sessions WHERE id = ?")
            .bind(session_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn revoke_all_user_sessions(&self, user_id: Uuid) -> Result<(), AuthError> {
        sqlx::query("DELETE FROM auth_sessions WHERE user_id = ?")
            .bind(user_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn revoke_other_sessions(&self, user_id: Uuid, keep: Uuid) -> Result<(), AuthError> {
        sqlx::query("DELETE FROM auth_sessions WHERE user_id = ? AND id <> ?")
            .bind(user_id.to_string())
            .bind(keep.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ==================== VERIFICATION TOKENS ====================

    /// Issue a verification token. Only the SHA-256 digest is stored; the
    /// raw token goes out through the (external) mailer.
    pub async fn create_verification_token(
        &self,
        user_id: Uuid,
        token_type: VerificationType,
        email: &str,
    ) -> Result<(VerificationToken, String), AuthError> {
        let raw: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(32)
            .map(char::from)
            .collect();

        let ttl_hours = match token_type {
            VerificationType::Confirmation | VerificationType::Invite => CONFIRMATION_TTL_HOURS,
            _ => SHORT_LIVED_TTL_HOURS,
        };
        let now = Utc::now();
        let token = VerificationToken {
            id: Uuid::new_v4(),
            user_id,
            token_digest: digest(&raw),
            token_type: token_type.as_str().to_string(),
            email: normalize_email(email),
            expires_at: now + Duration::hours(ttl_hours),
            used_at: None,
            created_at: now,
        };

        sqlx::query(
            "INSERT INTO auth_verification_tokens
                 (id, user_id, token_digest, type, email, expires_at, used_at, created_at)
             VALUES (?, ?, ?, ?, ?, ?, NULL, ?)",
        )
        .bind(token.id.to_string())
        .bind(token.user_id.to_string())
        .bind(&token.token_digest)
        .bind(&token.token_type)
        .bind(&token.email)
        .bind(token.expires_at)
        .bind(token.created_at)
        .execute(&self.pool)
        .await?;

        Ok((token, raw))
    }

    /// Read-only validity check: type match, unused, unexpired.
    pub async fn validate_verification_token(
        &self,
        raw_token: &str,
        expected_type: VerificationType,
    ) -> Result<VerificationToken, AuthError> {
        let mut tx = self.pool.begin().await?;
        Self::validate_token_tx(&mut tx, raw_token, expected_type).await
    }

    pub async fn mark_token_used(&self, token_id: Uuid) -> Result<(), AuthError> {
        sqlx::query("UPDATE auth_verification_tokens SET used_at = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(token_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Validate and mark used in one transaction. A token is valid iff the
    /// type matches, it is unused and unexpired.
    pub async fn consume_verification_token(
        &self,
        raw_token: &str,
        expected_type: VerificationType,
    ) -> Result<VerificationToken, AuthError> {
        let mut tx = self.pool.begin().await?;
        let token = Self::validate_token_tx(&mut tx, raw_token, expected_type).await?;

        sqlx::query("UPDATE auth_verification_tokens SET used_at = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(token.id.to_string())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(token)
    }

    async fn validate_token_tx(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        raw_token: &str,
        expected_type: VerificationType,
    ) -> Result<VerificationToken, AuthError> {
        let token = sqlx::query_as::<_, VerificationToken>(
            "SELECT * FROM auth_verification_tokens WHERE token_digest = ?",
        )
        .bind(digest(raw_token))
        .fetch_optional(&mut **tx)
        .await?
        .ok_or(AuthError::InvalidToken)?;

        if token.token_type != expected_type.as_str() {
            return Err(AuthError::InvalidToken);
        }
        if token.used_at.is_some() {
            return Err(AuthError::TokenAlreadyUsed);
        }
        if token.expires_at <= Utc::now() {
            return Err(AuthError::TokenExpired);
        }
        Ok(token)
    }

    /// Validate a magic-link token, confirm the email if needed, mark the
    /// token used and open a session, all in one transaction.
    pub async fn verify_magic_link(
        &self,
        raw_token: &str,
    ) -> Result<(User, Session, String), AuthError> {
        let mut tx = self.pool.begin().await?;
        let token = Self::validate_token_tx(&mut tx, raw_token, VerificationType::Magiclink).await?;
        let now = Utc::now();

        sqlx::query("UPDATE auth_verification_tokens SET used_at = ? WHERE id = ?")
            .bind(now)
            .bind(token.id.to_string())
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            "UPDATE auth_users SET email_confirmed_at = ?, updated_at = ?
             WHERE id = ? AND email_confirmed_at IS NULL",
        )
        .bind(now)
        .bind(now)
        .bind(token.user_id.to_string())
        .execute(&mut *tx)
        .await?;

        let user = sqlx::query_as::<_, User>(
            "SELECT * FROM auth_users WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(token.user_id.to_string())
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(AuthError::UserNotFound)?;

        let session = Session {
            id: Uuid::new_v4(),
            user_id: user.id,
            aal: "aal1".to_string(),
            created_at: now,
        };
        let refresh = jwt::generate_refresh_token();
        sqlx::query("INSERT INTO auth_sessions (id, user_id, aal, created_at) VALUES (?, ?, ?, ?)")
            .bind(session.id.to_string())
            .bind(session.user_id.to_string())
            .bind(&session.aal)
            .bind(session.created_at)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "INSERT INTO auth_refresh_tokens (token, user_id, session_id, revoked, created_at)
             VALUES (?, ?, ?, 0, ?)",
        )
        .bind(&refresh)
        .bind(user.id.to_string())
        .bind(session.id.to_string())
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok((user, session, refresh))
    }

    // ==================== TOKEN FLOWS ====================

    fn token_response(
        &self,
        user: User,
        session: Session,
        refresh: String,
    ) -> Result<TokenResponse, AuthError> {
        let access_token = jwt::create_access_token(&user, session.id, &self.config)
            .map_err(|e| AuthError::Jwt(e.to_string()))?;
        Ok(TokenResponse {
            access_token,
            token_type: "bearer",
            expires_in: self.config.jwt_expiry,
            refresh_token: refresh,
            user,
            session,
        })
    }

    pub async fn signup(&self, req: SignupRequest) -> Result<TokenResponse, AuthError> {
        let user = self
            .create_user(&req.email, &req.password, req.data.unwrap_or_else(|| json!({})))
            .await?;

        // Delivery belongs to the external mailer; issuing the token here
        // keeps the lifecycle in one transaction boundary.
        let email = user.email.clone().unwrap_or_default();
        if let Err(e) = self
            .create_verification_token(user.id, VerificationType::Confirmation, &email)
            .await
        {
            tracing::warn!(error = %e, "Failed to issue confirmation token");
        }

        let (session, refresh) = self.create_session(&user).await?;
        tracing::info!(user_id = %user.id, "User signed up");
        self.token_response(user, session, refresh)
    }

    /// Password grant. Which field failed is never revealed.
    pub async fn token_password(&self, email: &str, password: &str) -> Result<TokenResponse, AuthError> {
        let user = self
            .find_user_by_email(email)
            .await?
            .ok_or(AuthError::InvalidCredentials)?;

        if !self.validate_password(&user, password) {
            return Err(AuthError::InvalidCredentials);
        }

        let (session, refresh) = self.create_session(&user).await?;
        tracing::info!(user_id = %user.id, "Password grant succeeded");
        self.token_response(user, session, refresh)
    }

    pub async fn token_refresh(&self, refresh_token: &str) -> Result<TokenResponse, AuthError> {
        let (user, session, new_refresh) = self.refresh_session(refresh_token).await?;
        self.token_response(user, session, new_refresh)
    }

    pub async fn verify(&self, req: VerifyRequest) -> Result<TokenResponse, AuthError> {
        let token_type = VerificationType::parse(&req.token_type)
            .ok_or_else(|| AuthError::Validation(format!("Unknown token type '{}'", req.token_type)))?;

        if token_type == VerificationType::Magiclink {
            let (user, session, refresh) = self.verify_magic_link(&req.token).await?;
            return self.token_response(user, session, refresh);
        }

        let token = self.consume_verification_token(&req.token, token_type).await?;
        let now = Utc::now();

        match token_type {
            VerificationType::Recovery => {
                let password = req
                    .password
                    .ok_or_else(|| AuthError::Validation("Password required".to_string()))?;
                if password.len() < 8 {
                    return Err(AuthError::Validation(
                        "Password must be at least 8 characters".to_string(),
                    ));
                }
                let hash = bcrypt::hash(&password, bcrypt::DEFAULT_COST)
                    .map_err(|e| AuthError::Hash(e.to_string()))?;
                sqlx::query(
                    "UPDATE auth_users SET encrypted_password = ?, updated_at = ? WHERE id = ?",
                )
                .bind(hash)
                .bind(now)
                .bind(token.user_id.to_string())
                .execute(&self.pool)
                .await?;
            }
            VerificationType::EmailChange => {
                sqlx::query(
                    "UPDATE auth_users SET email = ?, email_confirmed_at = ?, updated_at = ?
                     WHERE id = ?",
                )
                .bind(&token.email)
                .bind(now)
                .bind(now)
                .bind(token.user_id.to_string())
                .execute(&self.pool)
                .await?;
            }
            _ => {
                sqlx::query(
                    "UPDATE auth_users SET email_confirmed_at = ?, updated_at = ?
                     WHERE id = ? AND email_confirmed_at IS NULL",
                )
                .bind(now)
                .bind(now)
                .bind(token.user_id.to_string())
                .execute(&self.pool)
                .await?;
            }
        }

        let user = self.get_user(token.user_id).await?;
        let (session, refresh) = self.create_session(&user).await?;
        self.token_response(user, session, refresh)
    }

    /// Issue a magic-link token. The raw token is handed to the caller for
    /// the external mailer; the endpoint never echoes it.
    pub async fn magiclink(&self, email: &str) -> Result<Option<String>, AuthError> {
        let Some(user) = self.find_user_by_email(email).await? else {
            // No enumeration side channel.
            return Ok(None);
        };
        let (_, raw) = self
            .create_verification_token(user.id, VerificationType::Magiclink, email)
            .await?;
        Ok(Some(raw))
    }

    pub async fn logout(&self, session_id: Uuid) -> Result<(), AuthError> {
        self.revoke_session(session_id).await
    }

    // ==================== API KEYS ====================

    /// Sign and persist the anon / service-role API keys on first boot.
    pub async fn ensure_api_keys(&self) -> Result<(String, String), AuthError> {
        let mut keys = Vec::with_capacity(2);
        for role in ["anon", "service_role"] {
            let existing: Option<String> =
                sqlx::query_scalar("SELECT token FROM auth_api_keys WHERE role = ?")
                    .bind(role)
                    .fetch_optional(&self.pool)
                    .await?;
            let token = match existing {
                Some(token) => token,
                None => {
                    let token = jwt::create_api_key(role, &self.config.jwt_secret)
                        .map_err(|e| AuthError::Jwt(e.to_string()))?;
                    sqlx::query(
                        "INSERT INTO auth_api_keys (role, token, created_at) VALUES (?, ?, ?)",
                    )
                    .bind(role)
                    .bind(&token)
                    .bind(Utc::now())
                    .execute(&self.pool)
                    .await?;
                    tracing::info!(role = %role, token = %token, "Minted API key");
                    token
                }
            };
            keys.push(token);
        }
        let service = keys.pop().unwrap_or_default();
        let anon = keys.pop().unwrap_or_default();
        Ok((anon, service))
    }
}

fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

fn digest(raw: &str) -> String {
    hex::encode(Sha256::digest(raw.as_bytes()))
}
