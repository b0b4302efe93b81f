use serde_json::json;
use sqlx::SqlitePool;

use sblite::features::auth::models::{SignupRequest, VerificationType};
use sblite::features::auth::service::AuthError;

mod common;

#[sqlx::test]
async fn signup_then_refresh_rotates_exactly_once(pool: SqlitePool) {
    let services = common::setup_services(pool.clone()).await;

    let response = services
        .auth_service
        .signup(SignupRequest {
            email: "a@x.io".to_string(),
            password: "pw12345678".to_string(),
            data: None,
        })
        .await
        .expect("Signup failed");

    let original_refresh = response.refresh_token.clone();
    let original_session = response.session.id;

    // First refresh: new pair, same session.
    let rotated = services
        .auth_service
        .token_refresh(&original_refresh)
        .await
        .expect("First refresh failed");
    assert_ne!(rotated.refresh_token, original_refresh);
    assert_eq!(rotated.session.id, original_session);

    // Replay of the consumed token is rejected and issues nothing.
    let replay = services.auth_service.token_refresh(&original_refresh).await;
    assert!(matches!(replay, Err(AuthError::InvalidToken)));

    let live_tokens: i64 = sqlx::query_scalar(
        "SELECT count(*) FROM auth_refresh_tokens WHERE session_id = ? AND revoked = 0",
    )
    .bind(original_session.to_string())
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(live_tokens, 1);
}

#[sqlx::test]
async fn password_validation_round_trip(pool: SqlitePool) {
    let services = common::setup_services(pool).await;

    let user = services
        .auth_service
        .create_user("b@x.io", "correct-horse", json!({}))
        .await
        .unwrap();

    assert!(services.auth_service.validate_password(&user, "correct-horse"));
    assert!(!services.auth_service.validate_password(&user, "wrong-horse"));
    assert!(user.encrypted_password.as_deref().unwrap().starts_with("$2"));
}

#[sqlx::test]
async fn duplicate_email_is_conflict(pool: SqlitePool) {
    let services = common::setup_services(pool).await;

    services
        .auth_service
        .create_user("dup@x.io", "password1", json!({}))
        .await
        .unwrap();
    let second = services
        .auth_service
        .create_user("  DUP@X.IO ", "password2", json!({}))
        .await;
    assert!(matches!(second, Err(AuthError::DuplicateEmail)));
}

#[sqlx::test]
async fn wrong_credentials_are_generic(pool: SqlitePool) {
    let services = common::setup_services(pool).await;

    services
        .auth_service
        .create_user("c@x.io", "password1", json!({}))
        .await
        .unwrap();

    // Same error whether the email or the password is wrong.
    let bad_password = services.auth_service.token_password("c@x.io", "nope-nope").await;
    let bad_email = services.auth_service.token_password("ghost@x.io", "password1").await;
    assert!(matches!(bad_password, Err(AuthError::InvalidCredentials)));
    assert!(matches!(bad_email, Err(AuthError::InvalidCredentials)));
}

#[sqlx::test]
async fn oauth_users_arrive_confirmed_and_passwordless(pool: SqlitePool) {
    let services = common::setup_services(pool).await;

    let user = services
        .auth_service
        .create_oauth_user("o@x.io", "github", json!({"handle": "octo"}))
        .await
        .unwrap();
    assert!(user.encrypted_password.is_none());
    assert!(user.email_confirmed_at.is_some());
    assert_eq!(user.app_metadata["provider"], "github");
    assert_eq!(user.app_metadata["providers"][0], "github");

    // Passwordless users can never pass a password check.
    assert!(!services.auth_service.validate_password(&user, "anything"));
}

#[sqlx::test]
async fn anonymous_users_have_no_email(pool: SqlitePool) {
    let services = common::setup_services(pool).await;

    let user = services
        .auth_service
        .create_anonymous_user(json!({"seed": 1}))
        .await
        .unwrap();
    assert!(user.is_anonymous);
    assert!(user.email.is_none());
    assert_eq!(user.role, "authenticated");

    // A second anonymous user does not collide on the email index.
    services
        .auth_service
        .create_anonymous_user(json!({}))
        .await
        .unwrap();
}

#[sqlx::test]
async fn verification_token_lifecycle(pool: SqlitePool) {
    let services = common::setup_services(pool).await;

    let user = services
        .auth_service
        .create_user("v@x.io", "password1", json!({}))
        .await
        .unwrap();

    let (_, raw) = services
        .auth_service
        .create_verification_token(user.id, VerificationType::Recovery, "v@x.io")
        .await
        .unwrap();

    // A validity check alone does not consume the token.
    let peeked = services
        .auth_service
        .validate_verification_token(&raw, VerificationType::Recovery)
        .await
        .unwrap();
    assert!(peeked.used_at.is_none());

    // Wrong expected type is invalid, not "already used".
    let wrong_type = services
        .auth_service
        .consume_verification_token(&raw, VerificationType::Confirmation)
        .await;
    assert!(matches!(wrong_type, Err(AuthError::InvalidToken)));

    let consumed = services
        .auth_service
        .consume_verification_token(&raw, VerificationType::Recovery)
        .await
        .unwrap();
    assert_eq!(consumed.user_id, user.id);

    let replay = services
        .auth_service
        .consume_verification_token(&raw, VerificationType::Recovery)
        .await;
    assert!(matches!(replay, Err(AuthError::TokenAlreadyUsed)));
}

#[sqlx::test]
async fn magic_link_confirms_email_and_opens_session(pool: SqlitePool) {
    let services = common::setup_services(pool.clone()).await;

    services
        .auth_service
        .create_user("m@x.io", "password1", json!({}))
        .await
        .unwrap();

    let raw = services
        .auth_service
        .magiclink("m@x.io")
        .await
        .unwrap()
        .expect("token expected for existing user");

    let (user, session, refresh) = services
        .auth_service
        .verify_magic_link(&raw)
        .await
        .unwrap();
    assert!(user.email_confirmed_at.is_some());
    assert_eq!(session.user_id, user.id);
    assert!(refresh.starts_with("v1."));

    // The link is single-use.
    let replay = services.auth_service.verify_magic_link(&raw).await;
    assert!(matches!(replay, Err(AuthError::TokenAlreadyUsed)));

    // Unknown email: no token, no enumeration.
    let unknown = services.auth_service.magiclink("ghost@x.io").await.unwrap();
    assert!(unknown.is_none());
}

#[sqlx::test]
async fn revoke_other_sessions_keeps_one(pool: SqlitePool) {
    let services = common::setup_services(pool.clone()).await;

    let user = services
        .auth_service
        .create_user("s@x.io", "password1", json!({}))
        .await
        .unwrap();

    let (first, _) = services.auth_service.create_session(&user).await.unwrap();
    let (_second, _) = services.auth_service.create_session(&user).await.unwrap();
    let (_third, _) = services.auth_service.create_session(&user).await.unwrap();

    services
        .auth_service
        .revoke_other_sessions(user.id, first.id)
        .await
        .unwrap();

    let remaining: Vec<String> =
        sqlx::query_scalar("SELECT id FROM auth_sessions WHERE user_id = ?")
            .bind(user.id.to_string())
            .fetch_all(&pool)
            .await
            .unwrap();
    assert_eq!(remaining, vec![first.id.to_string()]);

    // Refresh tokens cascade with their session.
    let tokens: i64 = sqlx::query_scalar(
        "SELECT count(*) FROM auth_refresh_tokens WHERE user_id = ? AND session_id <> ?",
    )
    .bind(user.id.to_string())
    .bind(first.id.to_string())
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(tokens, 0);
}

#[sqlx::test]
async fn update_user_changes_password_and_metadata(pool: SqlitePool) {
    let services = common::setup_services(pool).await;

    let user = services
        .auth_service
        .create_user("u@x.io", "password1", json!({}))
        .await
        .unwrap();

    let updated = services
        .auth_service
        .update_user(
            user.id,
            sblite::features::auth::models::UpdateUserRequest {
                email: None,
                password: Some("password2!".to_string()),
                data: Some(json!({"theme": "dark"})),
            },
        )
        .await
        .unwrap();

    assert!(services.auth_service.validate_password(&updated, "password2!"));
    assert!(!services.auth_service.validate_password(&updated, "password1"));
    assert_eq!(updated.user_metadata["theme"], "dark");
}
