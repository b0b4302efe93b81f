use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use sqlx::FromRow;
use uuid::Uuid;
use validator::Validate;

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub email: Option<String>,
    #[serde(skip_serializing)]
    pub encrypted_password: Option<String>,
    pub role: String,
    pub app_metadata: JsonValue,
    pub user_metadata: JsonValue,
    pub is_anonymous: bool,
    pub email_confirmed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    pub fn new_email(email: &str, encrypted_password: Option<String>, user_metadata: JsonValue) -> User {
        let now = Utc::now();
        User {
            id: Uuid::new_v4(),
            email: Some(email.to_string()),
            encrypted_password,
            role: "authenticated".to_string(),
            app_metadata: json!({"provider": "email", "providers": ["email"]}),
            user_metadata,
            is_anonymous: false,
            email_confirmed_at: None,
            deleted_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn new_oauth(email: &str, provider: &str, user_metadata: JsonValue) -> User {
        let now = Utc::now();
        User {
            id: Uuid::new_v4(),
            email: Some(email.to_string()),
            encrypted_password: None,
            role: "authenticated".to_string(),
            app_metadata: json!({"provider": provider, "providers": [provider]}),
            user_metadata,
            is_anonymous: false,
            email_confirmed_at: Some(now),
            deleted_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn new_anonymous(user_metadata: JsonValue) -> User {
        let now = Utc::now();
        User {
            id: Uuid::new_v4(),
            email: None,
            encrypted_password: None,
            role: "authenticated".to_string(),
            app_metadata: json!({}),
            user_metadata,
            is_anonymous: true,
            email_confirmed_at: None,
            deleted_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Session {
    pub id: Uuid,
    pub user_id: Uuid,
    pub aal: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct RefreshToken {
    pub token: String,
    pub user_id: Uuid,
    pub session_id: Uuid,
    pub revoked: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationType {
    Confirmation,
    Recovery,
    Magiclink,
    EmailChange,
    Invite,
}

impl VerificationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerificationType::Confirmation => "confirmation",
            VerificationType::Recovery => "recovery",
            VerificationType::Magiclink => "magiclink",
            VerificationType::EmailChange => "email_change",
            VerificationType::Invite => "invite",
        }
    }

    pub fn parse(s: &str) -> Option<VerificationType> {
        match s {
            "confirmation" | "signup" => Some(VerificationType::Confirmation),
            "recovery" => Some(VerificationType::Recovery),
            "magiclink" => Some(VerificationType::Magiclink),
            "email_change" => Some(VerificationType::EmailChange),
            "invite" => Some(VerificationType::Invite),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct VerificationToken {
    pub id: Uuid,
    pub user_id: Uuid,
    #[serde(skip_serializing)]
    pub token_digest: String,
    #[sqlx(rename = "type")]
    #[serde(rename = "type")]
    pub token_type: String,
    pub email: String,
    pub expires_at: DateTime<Utc>,
    pub used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

// ==================== REQUEST / RESPONSE BODIES ====================

#[derive(Debug, Deserialize, Validate, Clone)]
pub struct SignupRequest {
    #[validate(email(message = "Email must be valid"))]
    pub email: String,

    #[validate(length(min = 8, message = "Password must be at least 8 characters"))]
    pub password: String,

    pub data: Option<JsonValue>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TokenRequest {
    pub email: Option<String>,
    pub password: Option<String>,
    pub refresh_token: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TokenQuery {
    pub grant_type: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct UpdateUserRequest {
    #[validate(email(message = "Email must be valid"))]
    pub email: Option<String>,

    #[validate(length(min = 8, message = "Password must be at least 8 characters"))]
    pub password: Option<String>,

    pub data: Option<JsonValue>,
}

#[derive(Debug, Deserialize)]
pub struct VerifyRequest {
    pub token: String,
    #[serde(rename = "type")]
    pub token_type: String,
    pub password: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct MagicLinkRequest {
    #[validate(email(message = "Email must be valid"))]
    pub email: String,
}

#[derive(Debug, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: &'static str,
    pub expires_in: i64,
    pub refresh_token: String,
    pub user: User,
    pub session: Session,
}
