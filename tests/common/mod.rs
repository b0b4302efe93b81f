use std::sync::Arc;

use axum::body::Body;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::Router;
use serde_json::Value;
use sqlx::SqlitePool;
use tower::ServiceExt;

use sblite::config::Config;
use sblite::features::{
    admin::AdminService, auth::service::AuthService, meta::MetaService,
    migrate::MigrationService, rest::RestService, rls::RlsService,
};
use sblite::middleware;

#[allow(dead_code)]
pub struct TestServices {
    pub config: Config,
    pub auth_service: AuthService,
    pub meta_service: MetaService,
    pub rls_service: RlsService,
    pub rest_service: RestService,
    pub admin_service: AdminService,
    pub migration_service: MigrationService,
}

pub fn test_config() -> Config {
    Config {
        host: "127.0.0.1".to_string(),
        port: 0,
        db_path: ":memory:".to_string(),
        jwt_secret: "test-secret-test-secret-test-secret!".to_string(),
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

pub async fn setup_services(pool: SqlitePool) -> TestServices {
    let config = test_config();

    let meta_service = MetaService::new(pool.clone());
    let rls_service = RlsService::new(pool.clone());
    let auth_service = AuthService::new(pool.clone(), config.clone());
    let rest_service = RestService::new(pool.clone(), meta_service.clone(), rls_service.clone());
    let admin_service = AdminService::new(pool.clone(), meta_service.clone(), rls_service.clone());
    let migration_service = MigrationService::new(pool.clone(), meta_service.clone());

    TestServices {
        config,
        auth_service,
        meta_service,
        rls_service,
        rest_service,
        admin_service,
        migration_service,
    }
}

/// Router mirroring the production wiring, minus the per-IP rate limiter
/// and metrics (both need connection info).
#[allow(dead_code)]
pub fn build_app(services: &TestServices) -> Router {
    let auth_router = Router::new()
        .merge(sblite::features::auth::routes::public_auth_routes())
        .merge(
            sblite::features::auth::routes::protected_auth_routes()
                .layer(axum::middleware::from_fn(middleware::auth::require_auth)),
        )
        .with_state(services.auth_service.clone());

    Router::new()
        .nest("/auth/v1", auth_router)
        .nest(
            "/rest/v1",
            sblite::features::rest::rest_routes().with_state(services.rest_service.clone()),
        )
        .nest(
            "/admin/v1",
            sblite::features::admin::routes::admin_routes()
                .with_state(services.admin_service.clone())
                .layer(axum::middleware::from_fn(
                    middleware::auth::require_service_role,
                )),
        )
        .layer(axum::middleware::from_fn(
            middleware::auth::auth_context_middleware,
        ))
        .layer(axum::Extension(Arc::new(services.config.clone())))
}

#[allow(dead_code)]
pub fn service_key(config: &Config) -> String {
    sblite::features::auth::jwt::create_api_key("service_role", &config.jwt_secret)
        .expect("API key signing failed")
}

#[allow(dead_code)]
pub fn anon_key(config: &Config) -> String {
    sblite::features::auth::jwt::create_api_key("anon", &config.jwt_secret)
        .expect("API key signing failed")
}

/// Drive one request through the router and decode the JSON body (Null
/// when the body is empty).
#[allow(dead_code)]
pub async fn request(
    app: &Router,
    method: &str,
    uri: &str,
    headers: &[(&str, &str)],
    body: Option<Value>,
) -> (StatusCode, HeaderMap, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }

    let request = match body {
        Some(json) => builder
            .header("content-type", "application/json")
            .body(Body::from(json.to_string()))
            .expect("request build failed"),
        None => builder.body(Body::empty()).expect("request build failed"),
    };

    let response = app
        .clone()
        .oneshot(request)
        .await
        .expect("request failed");

    let status = response.status();
    let headers = response.headers().clone();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body read failed");
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };

    (status, headers, json)
}
