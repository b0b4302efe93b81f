use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::RngCore;
use serde_json::{json, Value};
use uuid::Uuid;

use super::models::User;
use crate::config::Config;

pub const TOKEN_ISSUER: &str = "sblite";

/// Sign an access token for a user session. HS256 only.
pub fn create_access_token(
    user: &User,
    session_id: Uuid,
    config: &Config,
) -> Result<String, jsonwebtoken::errors::Error> {
    let now = Utc::now().timestamp();
    let claims = json!({
        "aud": "authenticated",
        "exp": now + config.jwt_expiry,
        "iat": now,
        "iss": TOKEN_ISSUER,
        "sub": user.id,
        "email": user.email.clone().unwrap_or_default(),
        "phone": "",
        "role": user.role,
        "aal": "aal1",
        "session_id": session_id,
        "app_metadata": user.app_metadata,
        "user_metadata": user.user_metadata,
    });
    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(config.jwt_secret.as_bytes()),
    )
}

/// API keys are HS256 JWTs with a role claim and no expiration.
pub fn create_api_key(role: &str, secret: &str) -> Result<String, jsonwebtoken::errors::Error> {
    let claims = json!({
        "role": role,
        "iss": TOKEN_ISSUER,
        "iat": Utc::now().timestamp(),
    });
    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
}

/// Verify an access token or API key. Any algorithm other than HS256 is
/// rejected. Tokens carrying `exp` are checked against the clock; API
/// keys (no `exp`) are accepted without one.
pub fn verify_token(token: &str, secret: &str) -> Result<Value, jsonwebtoken::errors::Error> {
    let key = DecodingKey::from_secret(secret.as_bytes());

    let mut validation = Validation::new(Algorithm::HS256);
    validation.validate_aud = false;

    match decode::<Value>(token, &key, &validation) {
        Ok(data) => Ok(data.claims),
        Err(e)
            if matches!(
                e.kind(),
                jsonwebtoken::errors::ErrorKind::MissingRequiredClaim(claim) if claim.as_str() == "exp"
            ) =>
        {
            let mut validation = Validation::new(Algorithm::HS256);
            validation.validate_aud = false;
            validation.validate_exp = false;
            validation.required_spec_claims.clear();
            Ok(decode::<Value>(token, &key, &validation)?.claims)
        }
        Err(e) => Err(e),
    }
}

/// Opaque refresh token: `v1.` + base64url of 32 random bytes.
pub fn generate_refresh_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("v1.{}", base64::encode_config(bytes, base64::URL_SAFE_NO_PAD))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        Config {
            host: "127.0.0.1".to_string(),
            port: 8080,
            db_path: ":memory:".to_string(),
            jwt_secret: "0123456789abcdef0123456789abcdef".to_string(),
            jwt_expiry: 3600,
            refresh_token_expiry: 604_800,
            migrations_dir: "./migrations".to_string(),
            metrics_enabled: false,
            rate_limit_max: 10,
            rate_limit_window_secs: 60,
            log_mode: "console".to_string(),
            log_level: "info".to_string(),
            log_format: "text".to_string(),
            log_file: String::new(),
            log_max_size: 100,
            log_max_age: 30,
            log_max_backups: 5,
        }
    }

    fn test_user() -> User {
        User::new_email("a@x.io", Some("hash".to_string()), serde_json::json!({}))
    }

    #[test]
    fn access_token_round_trip() {
        let config = test_config();
        let session = Uuid::new_v4();
        let token = create_access_token(&test_user(), session, &config).unwrap();

        let claims = verify_token(&token, &config.jwt_secret).unwrap();
        assert_eq!(claims["aud"], "authenticated");
        assert_eq!(claims["role"], "authenticated");
        assert_eq!(claims["aal"], "aal1");
        assert_eq!(claims["session_id"], session.to_string());
        assert_eq!(claims["email"], "a@x.io");
    }

    #[test]
    fn api_key_has_no_expiry_and_still_verifies() {
        let secret = "0123456789abcdef0123456789abcdef";
        let key = create_api_key("service_role", secret).unwrap();
        let claims = verify_token(&key, secret).unwrap();
        assert_eq!(claims["role"], "service_role");
        assert_eq!(claims["iss"], TOKEN_ISSUER);
        assert!(claims.get("exp").is_none());
    }

    #[test]
    fn tampered_token_is_rejected() {
        let config = test_config();
        let token = create_access_token(&test_user(), Uuid::new_v4(), &config).unwrap();
        let mut tampered = token.clone();
        tampered.pop();
        tampered.push('A');
        assert!(verify_token(&tampered, &config.jwt_secret).is_err());
        assert!(verify_token(&token, "another-secret-another-secret-xx").is_err());
    }

    #[test]
    fn refresh_token_wire_shape() {
        let token = generate_refresh_token();
        assert!(token.starts_with("v1."));
        assert_eq!(token.len(), 3 + 43);
        let another = generate_refresh_token();
        assert_ne!(token, another);
    }
}
